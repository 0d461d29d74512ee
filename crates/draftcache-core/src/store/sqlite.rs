//! Durable shared store on SQLite.
//!
//! Keeps the same key/value semantics as the in-memory adapter but survives a
//! restart of the hosting process, so queued write-back tasks are not lost.
//! Blocking pops poll the table and are woken early by pushes made through the
//! same handle.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{not_an_integer, wrong_type, SharedStore, StoreCommand, StoreRead, StoreValue, ValueKind};
use crate::error::{Error, Result};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS kv_keys (
    key TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    expires_at INTEGER
);
CREATE TABLE IF NOT EXISTS kv_hash (
    key TEXT NOT NULL,
    field TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (key, field)
);
CREATE TABLE IF NOT EXISTS kv_zset (
    key TEXT NOT NULL,
    member TEXT NOT NULL,
    score REAL NOT NULL,
    PRIMARY KEY (key, member)
);
CREATE TABLE IF NOT EXISTS kv_list (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL,
    value TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_kv_list_key ON kv_list (key, seq);
";

/// How often a blocked pop re-checks the list for pushes from other processes.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shared store backed by a SQLite file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    pushed: Notify,
}

impl SqliteStore {
    /// Open (or create) a store at a specific path
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init(conn)
    }

    /// Open a private in-memory store
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(2))?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            pushed: Notify::new(),
        })
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Run `f` against the connection, reporting SQLite failures as an
    /// unavailable store.
    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        f(&mut conn).map_err(|e| match e {
            Error::Database(e) => Error::store_unavailable(e.to_string()),
            other => other,
        })
    }

    fn purge(conn: &Connection, key: &str) -> Result<()> {
        conn.execute("DELETE FROM kv_keys WHERE key = ?1", params![key])?;
        conn.execute("DELETE FROM kv_hash WHERE key = ?1", params![key])?;
        conn.execute("DELETE FROM kv_zset WHERE key = ?1", params![key])?;
        conn.execute("DELETE FROM kv_list WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Kind of the live value under `key`, purging it first if expired.
    fn live_kind(conn: &Connection, key: &str, now: i64) -> Result<Option<ValueKind>> {
        let row: Option<(String, Option<i64>)> = conn
            .query_row(
                "SELECT kind, expires_at FROM kv_keys WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((_, Some(expires_at))) if expires_at <= now => {
                Self::purge(conn, key)?;
                Ok(None)
            }
            Some((kind, _)) => ValueKind::from_str(&kind)
                .map(Some)
                .ok_or_else(|| Error::invalid_input(format!("unknown kind {kind} for {key}"))),
        }
    }

    fn ensure_kind(conn: &Connection, key: &str, kind: ValueKind, now: i64) -> Result<()> {
        match Self::live_kind(conn, key, now)? {
            None => {
                conn.execute(
                    "INSERT INTO kv_keys (key, kind, expires_at) VALUES (?1, ?2, NULL)",
                    params![key, kind.as_str()],
                )?;
                Ok(())
            }
            Some(found) if found == kind => Ok(()),
            Some(found) => Err(wrong_type(key, kind, found)),
        }
    }

    fn drop_if_empty(conn: &Connection, key: &str, kind: ValueKind) -> Result<()> {
        let table = match kind {
            ValueKind::Hash => "kv_hash",
            ValueKind::SortedSet => "kv_zset",
            ValueKind::List => "kv_list",
        };
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {table} WHERE key = ?1"),
            params![key],
            |row| row.get(0),
        )?;
        if count == 0 {
            conn.execute("DELETE FROM kv_keys WHERE key = ?1", params![key])?;
        }
        Ok(())
    }

    /// Read access guarded by a kind check. Returns `None` when absent.
    fn expect_kind(conn: &Connection, key: &str, kind: ValueKind, now: i64) -> Result<bool> {
        match Self::live_kind(conn, key, now)? {
            None => Ok(false),
            Some(found) if found == kind => Ok(true),
            Some(found) => Err(wrong_type(key, kind, found)),
        }
    }

    fn read_hash(conn: &Connection, key: &str, now: i64) -> Result<HashMap<String, String>> {
        if !Self::expect_kind(conn, key, ValueKind::Hash, now)? {
            return Ok(HashMap::new());
        }
        let mut stmt = conn.prepare("SELECT field, value FROM kv_hash WHERE key = ?1")?;
        let fields: HashMap<String, String> = stmt
            .query_map(params![key], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(fields)
    }

    fn read_ranked(conn: &Connection, key: &str, now: i64) -> Result<Vec<(String, f64)>> {
        if !Self::expect_kind(conn, key, ValueKind::SortedSet, now)? {
            return Ok(Vec::new());
        }
        let mut stmt = conn
            .prepare("SELECT member, score FROM kv_zset WHERE key = ?1 ORDER BY score, member")?;
        let members: Vec<(String, f64)> = stmt
            .query_map(params![key], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(members)
    }

    fn read_int(conn: &Connection, key: &str, field: &str) -> Result<i64> {
        let current: Option<String> = conn
            .query_row(
                "SELECT value FROM kv_hash WHERE key = ?1 AND field = ?2",
                params![key, field],
                |row| row.get(0),
            )
            .optional()?;
        match current {
            Some(raw) => raw.parse::<i64>().map_err(|_| not_an_integer(key, field)),
            None => Ok(0),
        }
    }

    fn write_field(conn: &Connection, key: &str, field: &str, value: &str) -> Result<()> {
        conn.execute(
            "INSERT INTO kv_hash (key, field, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(key, field) DO UPDATE SET value = excluded.value",
            params![key, field, value],
        )?;
        Ok(())
    }

    fn apply(conn: &Connection, command: StoreCommand, now: i64) -> Result<bool> {
        match command {
            StoreCommand::HSet { key, fields } => {
                Self::ensure_kind(conn, &key, ValueKind::Hash, now)?;
                for (field, value) in fields {
                    Self::write_field(conn, &key, &field, &value)?;
                }
            }
            StoreCommand::HDel { key, fields } => {
                if Self::expect_kind(conn, &key, ValueKind::Hash, now)? {
                    for field in fields {
                        conn.execute(
                            "DELETE FROM kv_hash WHERE key = ?1 AND field = ?2",
                            params![key, field],
                        )?;
                    }
                    Self::drop_if_empty(conn, &key, ValueKind::Hash)?;
                }
            }
            StoreCommand::HIncrBy { key, field, delta } => {
                Self::ensure_kind(conn, &key, ValueKind::Hash, now)?;
                let current = Self::read_int(conn, &key, &field)?;
                Self::write_field(conn, &key, &field, &(current + delta).to_string())?;
            }
            StoreCommand::HSetMax { key, field, value } => {
                Self::ensure_kind(conn, &key, ValueKind::Hash, now)?;
                let current = Self::read_int(conn, &key, &field)?;
                Self::write_field(conn, &key, &field, &current.max(value).to_string())?;
            }
            StoreCommand::RequireExists { key } => {
                if Self::live_kind(conn, &key, now)?.is_none() {
                    return Err(Error::not_found("key", key));
                }
            }
            StoreCommand::ZAdd { key, members } => {
                Self::ensure_kind(conn, &key, ValueKind::SortedSet, now)?;
                for (member, score) in members {
                    conn.execute(
                        "INSERT INTO kv_zset (key, member, score) VALUES (?1, ?2, ?3)
                         ON CONFLICT(key, member) DO UPDATE SET score = excluded.score",
                        params![key, member, score],
                    )?;
                }
            }
            StoreCommand::ZRem { key, members } => {
                if Self::expect_kind(conn, &key, ValueKind::SortedSet, now)? {
                    for member in members {
                        conn.execute(
                            "DELETE FROM kv_zset WHERE key = ?1 AND member = ?2",
                            params![key, member],
                        )?;
                    }
                    Self::drop_if_empty(conn, &key, ValueKind::SortedSet)?;
                }
            }
            StoreCommand::Del { key } => Self::purge(conn, &key)?,
            StoreCommand::Expire { key, ttl } => {
                if Self::live_kind(conn, &key, now)?.is_some() {
                    if ttl.is_zero() {
                        Self::purge(conn, &key)?;
                    } else {
                        conn.execute(
                            "UPDATE kv_keys SET expires_at = ?2 WHERE key = ?1",
                            params![key, now + ttl.as_millis() as i64],
                        )?;
                    }
                }
            }
            StoreCommand::RPush { key, values } => {
                Self::ensure_kind(conn, &key, ValueKind::List, now)?;
                let pushed = !values.is_empty();
                for value in values {
                    conn.execute(
                        "INSERT INTO kv_list (key, value) VALUES (?1, ?2)",
                        params![key, value],
                    )?;
                }
                if !pushed {
                    Self::drop_if_empty(conn, &key, ValueKind::List)?;
                }
                return Ok(pushed);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl SharedStore for SqliteStore {
    async fn ping(&self) -> Result<()> {
        self.with_conn(|conn| Ok(conn.execute_batch("SELECT 1")?))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.with_conn(|conn| Ok(Self::live_kind(conn, key, Self::now_ms())?.is_some()))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            if !Self::expect_kind(conn, key, ValueKind::Hash, Self::now_ms())? {
                return Ok(None);
            }
            Ok(conn
                .query_row(
                    "SELECT value FROM kv_hash WHERE key = ?1 AND field = ?2",
                    params![key, field],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>> {
        self.with_conn(|conn| Self::read_hash(conn, key, Self::now_ms()))
    }

    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, f64)>> {
        self.with_conn(|conn| Self::read_ranked(conn, key, Self::now_ms()))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.with_conn(|conn| {
            let now = Self::now_ms();
            if Self::live_kind(conn, key, now)?.is_none() {
                return Ok(None);
            }
            let expires_at: Option<i64> = conn.query_row(
                "SELECT expires_at FROM kv_keys WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )?;
            Ok(expires_at.map(|at| Duration::from_millis((at - now).max(0) as u64)))
        })
    }

    async fn read_all(&self, reads: Vec<StoreRead>) -> Result<Vec<StoreValue>> {
        self.with_conn(|conn| {
            let now = Self::now_ms();
            // One transaction so other processes' batches land before or after.
            let tx = conn.transaction()?;
            let values = reads
                .iter()
                .map(|read| match read {
                    StoreRead::Hash(key) => Self::read_hash(&tx, key, now).map(StoreValue::Hash),
                    StoreRead::Ranked(key) => {
                        Self::read_ranked(&tx, key, now).map(StoreValue::Ranked)
                    }
                })
                .collect::<Result<Vec<_>>>()?;
            tx.commit()?;
            Ok(values)
        })
    }

    async fn exec(&self, commands: Vec<StoreCommand>) -> Result<()> {
        let pushed = self.with_conn(|conn| {
            let now = Self::now_ms();
            let tx = conn.transaction()?;
            let mut pushed = false;
            for command in commands {
                pushed |= Self::apply(&tx, command, now)?;
            }
            tx.commit()?;
            Ok(pushed)
        })?;

        if pushed {
            self.pushed.notify_waiters();
        }
        Ok(())
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        self.with_conn(|conn| {
            if !Self::expect_kind(conn, key, ValueKind::List, Self::now_ms())? {
                return Ok(0);
            }
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM kv_list WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            if !Self::expect_kind(&tx, key, ValueKind::List, Self::now_ms())? {
                return Ok(None);
            }
            let head: Option<(i64, String)> = tx
                .query_row(
                    "SELECT seq, value FROM kv_list WHERE key = ?1 ORDER BY seq LIMIT 1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            if let Some((seq, _)) = &head {
                tx.execute("DELETE FROM kv_list WHERE seq = ?1", params![seq])?;
                Self::drop_if_empty(&tx, key, ValueKind::List)?;
            }
            tx.commit()?;
            Ok(head.map(|(_, value)| value))
        })
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.lpop(key).await? {
                return Ok(Some(value));
            }

            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                    remaining.min(POLL_INTERVAL)
                }
                None => POLL_INTERVAL,
            };
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio_test::assert_err;

    fn rpush(key: &str, value: &str) -> StoreCommand {
        StoreCommand::RPush {
            key: key.into(),
            values: vec![value.into()],
        }
    }

    #[tokio::test]
    async fn test_hash_and_zset_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .exec(vec![
                StoreCommand::HSet {
                    key: "h".into(),
                    fields: vec![("a".into(), "1".into())],
                },
                StoreCommand::ZAdd {
                    key: "z".into(),
                    members: vec![("y".into(), 2.0), ("x".into(), 1.0)],
                },
            ])
            .await
            .unwrap();

        assert_eq!(store.hget("h", "a").await.unwrap(), Some("1".into()));
        let members = store.zrange_with_scores("z").await.unwrap();
        assert_eq!(members, vec![("x".to_string(), 1.0), ("y".to_string(), 2.0)]);
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.exec(vec![rpush("q", "one")]).await.unwrap();

        let result = store
            .exec(vec![
                StoreCommand::HSet {
                    key: "h".into(),
                    fields: vec![("a".into(), "1".into())],
                },
                StoreCommand::HSet {
                    key: "q".into(),
                    fields: vec![("a".into(), "1".into())],
                },
            ])
            .await;
        assert_err!(result);
        assert!(!store.exists("h").await.unwrap());
        assert_eq!(store.llen("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expire_sets_ttl_on_existing_keys_only() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .exec(vec![
                StoreCommand::HSet {
                    key: "h".into(),
                    fields: vec![("a".into(), "1".into())],
                },
                StoreCommand::Expire {
                    key: "h".into(),
                    ttl: Duration::from_secs(60),
                },
                StoreCommand::Expire {
                    key: "missing".into(),
                    ttl: Duration::from_secs(60),
                },
            ])
            .await
            .unwrap();

        let ttl = store.ttl("h").await.unwrap().unwrap();
        assert!(ttl <= Duration::from_secs(60));
        assert!(ttl > Duration::from_secs(55));
        assert!(store.ttl("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_guards_and_max_inside_transaction() {
        let store = SqliteStore::open_in_memory().unwrap();
        let result = store
            .exec(vec![
                StoreCommand::RequireExists { key: "m".into() },
                StoreCommand::HSet {
                    key: "m".into(),
                    fields: vec![("a".into(), "1".into())],
                },
            ])
            .await;
        assert!(result.unwrap_err().is_not_found());
        assert!(!store.exists("m").await.unwrap());

        let max = |value| StoreCommand::HSetMax {
            key: "m".into(),
            field: "linked".into(),
            value,
        };
        store.exec(vec![max(6)]).await.unwrap();
        store
            .exec(vec![StoreCommand::RequireExists { key: "m".into() }, max(5)])
            .await
            .unwrap();
        assert_eq!(store.hget("m", "linked").await.unwrap(), Some("6".into()));
    }

    #[tokio::test]
    async fn test_read_all_matches_single_reads() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .exec(vec![
                StoreCommand::HSet {
                    key: "h".into(),
                    fields: vec![("a".into(), "1".into())],
                },
                StoreCommand::ZAdd {
                    key: "z".into(),
                    members: vec![("y".into(), 2.0), ("x".into(), 1.0)],
                },
            ])
            .await
            .unwrap();

        let values = store
            .read_all(vec![StoreRead::Hash("h".into()), StoreRead::Ranked("z".into())])
            .await
            .unwrap();
        assert_eq!(values[0], StoreValue::Hash(store.hget_all("h").await.unwrap()));
        assert_eq!(
            values[1],
            StoreValue::Ranked(store.zrange_with_scores("z").await.unwrap())
        );
    }

    #[tokio::test]
    async fn test_list_fifo() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .exec(vec![rpush("q", "a"), rpush("q", "b")])
            .await
            .unwrap();

        assert_eq!(store.llen("q").await.unwrap(), 2);
        assert_eq!(store.lpop("q").await.unwrap(), Some("a".into()));
        assert_eq!(
            store.blpop("q", Duration::from_millis(10)).await.unwrap(),
            Some("b".into())
        );
        assert!(!store.exists("q").await.unwrap());
        assert_eq!(store.blpop("q", Duration::from_millis(10)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_survives_reopen() {
        let temp = tempdir().expect("Failed to create temp dir");
        let path = temp.path().join("store.db");

        {
            let store = SqliteStore::open_path(&path).unwrap();
            store.exec(vec![rpush("q", "payload")]).await.unwrap();
        }

        let store = SqliteStore::open_path(&path).unwrap();
        assert_eq!(store.lpop("q").await.unwrap(), Some("payload".into()));
    }
}
