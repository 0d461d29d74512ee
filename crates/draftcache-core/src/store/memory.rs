//! In-process shared store.
//!
//! Used by tests and single-process deployments. Expiry is measured with
//! `tokio::time::Instant`, so paused-clock tests can fast-forward TTLs.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{not_an_integer, wrong_type, SharedStore, StoreCommand, StoreRead, StoreValue, ValueKind};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
enum Value {
    Hash(HashMap<String, String>),
    SortedSet(HashMap<String, f64>),
    List(VecDeque<String>),
}

impl Value {
    fn kind(&self) -> ValueKind {
        match self {
            Value::Hash(_) => ValueKind::Hash,
            Value::SortedSet(_) => ValueKind::SortedSet,
            Value::List(_) => ValueKind::List,
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Value::Hash(h) => h.is_empty(),
            Value::SortedSet(z) => z.is_empty(),
            Value::List(l) => l.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// Shared store held in process memory.
#[derive(Debug)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    pushed: Notify,
    available: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            pushed: Notify::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub async fn key_count(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        entries.values().filter(|e| !e.is_expired(now)).count()
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::store_unavailable("in-memory store marked unavailable"))
        }
    }

    /// Live entry for `key`, purging it first if it has expired.
    fn live<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        now: Instant,
    ) -> Option<&'a mut Entry> {
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }

    fn read_hash(
        entries: &mut HashMap<String, Entry>,
        key: &str,
        now: Instant,
    ) -> Result<HashMap<String, String>> {
        match Self::live(entries, key, now) {
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.clone()),
            Some(other) => Err(wrong_type(key, ValueKind::Hash, other.value.kind())),
            None => Ok(HashMap::new()),
        }
    }

    fn read_ranked(
        entries: &mut HashMap<String, Entry>,
        key: &str,
        now: Instant,
    ) -> Result<Vec<(String, f64)>> {
        let mut members: Vec<(String, f64)> = match Self::live(entries, key, now) {
            Some(Entry {
                value: Value::SortedSet(set),
                ..
            }) => set.iter().map(|(m, s)| (m.clone(), *s)).collect(),
            Some(other) => return Err(wrong_type(key, ValueKind::SortedSet, other.value.kind())),
            None => Vec::new(),
        };
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(members)
    }

    fn parse_int(hash: &HashMap<String, String>, key: &str, field: &str) -> Result<i64> {
        match hash.get(field) {
            Some(raw) => raw.parse::<i64>().map_err(|_| not_an_integer(key, field)),
            None => Ok(0),
        }
    }

    fn apply(slot: &mut Option<Entry>, command: StoreCommand, now: Instant) -> Result<bool> {
        let mut pushed = false;

        match command {
            StoreCommand::HSet { key, fields } => {
                let entry = slot.get_or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
                match &mut entry.value {
                    Value::Hash(hash) => hash.extend(fields),
                    other => return Err(wrong_type(&key, ValueKind::Hash, other.kind())),
                }
            }
            StoreCommand::HDel { key, fields } => {
                if let Some(entry) = slot.as_mut() {
                    match &mut entry.value {
                        Value::Hash(hash) => {
                            for field in &fields {
                                hash.remove(field);
                            }
                        }
                        other => return Err(wrong_type(&key, ValueKind::Hash, other.kind())),
                    }
                }
            }
            StoreCommand::HIncrBy { key, field, delta } => {
                let entry = slot.get_or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
                match &mut entry.value {
                    Value::Hash(hash) => {
                        let current = Self::parse_int(hash, &key, &field)?;
                        hash.insert(field, (current + delta).to_string());
                    }
                    other => return Err(wrong_type(&key, ValueKind::Hash, other.kind())),
                }
            }
            StoreCommand::ZAdd { key, members } => {
                let entry =
                    slot.get_or_insert_with(|| Entry::new(Value::SortedSet(HashMap::new())));
                match &mut entry.value {
                    Value::SortedSet(set) => set.extend(members),
                    other => return Err(wrong_type(&key, ValueKind::SortedSet, other.kind())),
                }
            }
            StoreCommand::ZRem { key, members } => {
                if let Some(entry) = slot.as_mut() {
                    match &mut entry.value {
                        Value::SortedSet(set) => {
                            for member in &members {
                                set.remove(member);
                            }
                        }
                        other => {
                            return Err(wrong_type(&key, ValueKind::SortedSet, other.kind()));
                        }
                    }
                }
            }
            StoreCommand::Del { .. } => {
                *slot = None;
            }
            StoreCommand::Expire { ttl, .. } => {
                if ttl.is_zero() {
                    *slot = None;
                } else if let Some(entry) = slot.as_mut() {
                    entry.expires_at = Some(now + ttl);
                }
            }
            StoreCommand::RPush { key, values } => {
                let entry = slot.get_or_insert_with(|| Entry::new(Value::List(VecDeque::new())));
                match &mut entry.value {
                    Value::List(list) => {
                        pushed = !values.is_empty();
                        list.extend(values);
                    }
                    other => return Err(wrong_type(&key, ValueKind::List, other.kind())),
                }
            }
            StoreCommand::HSetMax { key, field, value } => {
                let entry = slot.get_or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
                match &mut entry.value {
                    Value::Hash(hash) => {
                        let current = Self::parse_int(hash, &key, &field)?;
                        hash.insert(field, current.max(value).to_string());
                    }
                    other => return Err(wrong_type(&key, ValueKind::Hash, other.kind())),
                }
            }
            StoreCommand::RequireExists { key } => {
                if slot.is_none() {
                    return Err(Error::not_found("key", key));
                }
            }
        }

        if slot.as_ref().is_some_and(|e| e.value.is_empty()) {
            *slot = None;
        }

        Ok(pushed)
    }
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn ping(&self) -> Result<()> {
        self.check_available()
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        Ok(Self::live(&mut entries, key, Instant::now()).is_some())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        match Self::live(&mut entries, key, Instant::now()) {
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.get(field).cloned()),
            Some(other) => Err(wrong_type(key, ValueKind::Hash, other.value.kind())),
            None => Ok(None),
        }
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        Self::read_hash(&mut entries, key, Instant::now())
    }

    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, f64)>> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        Self::read_ranked(&mut entries, key, Instant::now())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        Ok(Self::live(&mut entries, key, now)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn read_all(&self, reads: Vec<StoreRead>) -> Result<Vec<StoreValue>> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        reads
            .iter()
            .map(|read| match read {
                StoreRead::Hash(key) => Self::read_hash(&mut entries, key, now).map(StoreValue::Hash),
                StoreRead::Ranked(key) => {
                    Self::read_ranked(&mut entries, key, now).map(StoreValue::Ranked)
                }
            })
            .collect()
    }

    async fn exec(&self, commands: Vec<StoreCommand>) -> Result<()> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        // Stage every touched key so a failing command leaves nothing behind.
        let mut staged: HashMap<String, Option<Entry>> = HashMap::new();
        for command in &commands {
            let key = command.key();
            if !staged.contains_key(key) {
                let current = Self::live(&mut entries, key, now).cloned();
                staged.insert(key.to_string(), current);
            }
        }

        let mut pushed = false;
        for command in commands {
            let slot = staged
                .get_mut(command.key())
                .ok_or_else(|| Error::invalid_input("unstaged key"))?;
            pushed |= Self::apply(slot, command, now)?;
        }

        for (key, entry) in staged {
            match entry {
                Some(entry) => {
                    entries.insert(key, entry);
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
        drop(entries);

        if pushed {
            self.pushed.notify_waiters();
        }
        Ok(())
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        match Self::live(&mut entries, key, Instant::now()) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(list.len()),
            Some(other) => Err(wrong_type(key, ValueKind::List, other.value.kind())),
            None => Ok(0),
        }
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        let popped = match Self::live(&mut entries, key, Instant::now()) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => list.pop_front(),
            Some(other) => return Err(wrong_type(key, ValueKind::List, other.value.kind())),
            None => None,
        };
        if entries.get(key).is_some_and(|e| e.value.is_empty()) {
            entries.remove(key);
        }
        Ok(popped)
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

        loop {
            // Register interest before checking so a push in between is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.lpop(key).await? {
                return Ok(Some(value));
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn hset(key: &str, field: &str, value: &str) -> StoreCommand {
        StoreCommand::HSet {
            key: key.into(),
            fields: vec![(field.into(), value.into())],
        }
    }

    #[tokio::test]
    async fn test_hash_set_and_get() {
        let store = InMemoryStore::new();
        assert_ok!(store.exec(vec![hset("h", "a", "1"), hset("h", "b", "2")]).await);

        assert_eq!(store.hget("h", "a").await.unwrap(), Some("1".into()));
        let all = store.hget_all("h").await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(store.exists("h").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_no_trace() {
        let store = InMemoryStore::new();
        store
            .exec(vec![StoreCommand::ZAdd {
                key: "z".into(),
                members: vec![("m".into(), 1.0)],
            }])
            .await
            .unwrap();

        // Second command hits a wrong type, so the first must not land either.
        let result = store
            .exec(vec![hset("h", "a", "1"), hset("z", "a", "1")])
            .await;
        assert_err!(result);
        assert!(!store.exists("h").await.unwrap());
        assert_eq!(store.zrange_with_scores("z").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_hincrby() {
        let store = InMemoryStore::new();
        let incr = || StoreCommand::HIncrBy {
            key: "h".into(),
            field: "version".into(),
            delta: 1,
        };
        store.exec(vec![incr(), incr()]).await.unwrap();
        assert_eq!(store.hget("h", "version").await.unwrap(), Some("2".into()));

        store.exec(vec![hset("h", "name", "x")]).await.unwrap();
        let bad = StoreCommand::HIncrBy {
            key: "h".into(),
            field: "name".into(),
            delta: 1,
        };
        assert_err!(store.exec(vec![bad]).await);
    }

    #[tokio::test]
    async fn test_hsetmax_never_lowers() {
        let store = InMemoryStore::new();
        let max = |value| StoreCommand::HSetMax {
            key: "h".into(),
            field: "linked".into(),
            value,
        };
        store.exec(vec![max(6)]).await.unwrap();
        store.exec(vec![max(5)]).await.unwrap();
        assert_eq!(store.hget("h", "linked").await.unwrap(), Some("6".into()));

        store.exec(vec![hset("h", "name", "x")]).await.unwrap();
        let bad = StoreCommand::HSetMax {
            key: "h".into(),
            field: "name".into(),
            value: 1,
        };
        assert_err!(store.exec(vec![bad]).await);
    }

    #[tokio::test]
    async fn test_require_exists_aborts_batch() {
        let store = InMemoryStore::new();
        let result = store
            .exec(vec![
                StoreCommand::RequireExists { key: "h".into() },
                hset("h", "a", "1"),
            ])
            .await;
        assert!(result.unwrap_err().is_not_found());
        assert!(!store.exists("h").await.unwrap());

        store.exec(vec![hset("h", "a", "1")]).await.unwrap();
        assert_ok!(
            store
                .exec(vec![
                    StoreCommand::RequireExists { key: "h".into() },
                    hset("h", "b", "2"),
                ])
                .await
        );
        assert_eq!(store.hget_all("h").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_read_all_in_request_order() {
        let store = InMemoryStore::new();
        store
            .exec(vec![
                hset("h", "a", "1"),
                StoreCommand::ZAdd {
                    key: "z".into(),
                    members: vec![("m".into(), 1.0)],
                },
            ])
            .await
            .unwrap();

        let values = store
            .read_all(vec![
                StoreRead::Ranked("z".into()),
                StoreRead::Hash("h".into()),
                StoreRead::Hash("missing".into()),
            ])
            .await
            .unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values[0], StoreValue::Ranked(vec![("m".into(), 1.0)]));
        assert_eq!(values[1].clone().into_hash().unwrap().len(), 1);
        assert_eq!(values[2], StoreValue::Hash(HashMap::new()));
        assert_err!(store.read_all(vec![StoreRead::Hash("z".into())]).await);
    }

    #[tokio::test]
    async fn test_zrange_orders_by_score_then_member() {
        let store = InMemoryStore::new();
        store
            .exec(vec![StoreCommand::ZAdd {
                key: "z".into(),
                members: vec![("c".into(), 2.0), ("b".into(), 1.0), ("a".into(), 1.0)],
            }])
            .await
            .unwrap();

        let members: Vec<String> = store
            .zrange_with_scores("z")
            .await
            .unwrap()
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        assert_eq!(members, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_emptied_collections_disappear() {
        let store = InMemoryStore::new();
        store.exec(vec![hset("h", "a", "1")]).await.unwrap();
        store
            .exec(vec![StoreCommand::HDel {
                key: "h".into(),
                fields: vec!["a".into()],
            }])
            .await
            .unwrap();
        assert!(!store.exists("h").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let store = InMemoryStore::new();
        store
            .exec(vec![
                hset("h", "a", "1"),
                StoreCommand::Expire {
                    key: "h".into(),
                    ttl: Duration::from_secs(10),
                },
                // Missing key: no-op
                StoreCommand::Expire {
                    key: "missing".into(),
                    ttl: Duration::from_secs(10),
                },
            ])
            .await
            .unwrap();

        assert_eq!(store.ttl("h").await.unwrap(), Some(Duration::from_secs(10)));
        assert!(!store.exists("missing").await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!store.exists("h").await.unwrap());
        assert_eq!(store.hget("h", "a").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_keep_existing_ttl() {
        let store = InMemoryStore::new();
        store
            .exec(vec![
                hset("h", "a", "1"),
                StoreCommand::Expire {
                    key: "h".into(),
                    ttl: Duration::from_secs(10),
                },
            ])
            .await
            .unwrap();
        store.exec(vec![hset("h", "b", "2")]).await.unwrap();
        assert!(store.ttl("h").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blpop_times_out() {
        let store = InMemoryStore::new();
        let popped = store.blpop("q", Duration::from_millis(50)).await.unwrap();
        assert!(popped.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blpop_wakes_on_push() {
        let store = Arc::new(InMemoryStore::new());

        let pusher = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            pusher
                .exec(vec![StoreCommand::RPush {
                    key: "q".into(),
                    values: vec!["first".into(), "second".into()],
                }])
                .await
                .unwrap();
        });

        let popped = store.blpop("q", Duration::ZERO).await.unwrap();
        assert_eq!(popped, Some("first".into()));
        assert_eq!(store.llen("q").await.unwrap(), 1);
        assert_eq!(store.lpop("q").await.unwrap(), Some("second".into()));
        assert_eq!(store.lpop("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let store = InMemoryStore::new();
        store.set_available(false);

        let err = store.ping().await.unwrap_err();
        assert!(err.is_retryable());
        assert!(store.hget_all("h").await.is_err());

        store.set_available(true);
        assert_ok!(store.ping().await);
    }
}
