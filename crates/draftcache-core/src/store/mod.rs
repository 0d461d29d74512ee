//! Shared store adapter.
//!
//! A thin capability wrapper over a low-latency key-value service. The rest of
//! the crate relies on five primitives only:
//!
//! - hash records (`hget`, `hget_all`, [`StoreCommand::HSet`], ...)
//! - score-ordered sets (`zrange_with_scores`, [`StoreCommand::ZAdd`], ...)
//! - atomic multi-key transactions ([`SharedStore::exec`]) and consistent
//!   multi-key reads ([`SharedStore::read_all`])
//! - per-key TTL ([`StoreCommand::Expire`], [`SharedStore::ttl`])
//! - list push to the tail and blocking pop from the head ([`SharedStore::blpop`])
//!
//! One adapter instance is built at startup and shared behind an `Arc` by every
//! component.

mod memory;
mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::Result;

/// A single mutation applied inside [`SharedStore::exec`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCommand {
    /// Set hash fields, creating the hash if needed.
    HSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    /// Remove hash fields. The hash disappears when emptied.
    HDel { key: String, fields: Vec<String> },
    /// Add `delta` to an integer hash field (missing counts as zero).
    HIncrBy {
        key: String,
        field: String,
        delta: i64,
    },
    /// Insert or rescore sorted-set members.
    ZAdd {
        key: String,
        members: Vec<(String, f64)>,
    },
    /// Remove sorted-set members. The set disappears when emptied.
    ZRem { key: String, members: Vec<String> },
    /// Delete a key of any type.
    Del { key: String },
    /// Set the remaining lifetime of an existing key. No-op when absent.
    Expire { key: String, ttl: Duration },
    /// Append values to the tail of a list.
    RPush { key: String, values: Vec<String> },
    /// Set an integer hash field to the larger of its current value (missing
    /// counts as zero) and `value`.
    HSetMax {
        key: String,
        field: String,
        value: i64,
    },
    /// Abort the whole batch with `NotFound` unless `key` is live.
    RequireExists { key: String },
}

impl StoreCommand {
    /// Key this command touches.
    pub fn key(&self) -> &str {
        match self {
            StoreCommand::HSet { key, .. }
            | StoreCommand::HDel { key, .. }
            | StoreCommand::HIncrBy { key, .. }
            | StoreCommand::ZAdd { key, .. }
            | StoreCommand::ZRem { key, .. }
            | StoreCommand::Del { key }
            | StoreCommand::Expire { key, .. }
            | StoreCommand::RPush { key, .. }
            | StoreCommand::HSetMax { key, .. }
            | StoreCommand::RequireExists { key } => key,
        }
    }
}

/// A single read served by [`SharedStore::read_all`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreRead {
    /// Whole hash, as [`SharedStore::hget_all`].
    Hash(String),
    /// Sorted set, as [`SharedStore::zrange_with_scores`].
    Ranked(String),
}

/// Result of one [`StoreRead`], in request order.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreValue {
    Hash(HashMap<String, String>),
    Ranked(Vec<(String, f64)>),
}

impl StoreValue {
    pub fn into_hash(self) -> Result<HashMap<String, String>> {
        match self {
            StoreValue::Hash(hash) => Ok(hash),
            StoreValue::Ranked(_) => Err(crate::Error::invalid_input("expected a hash read")),
        }
    }

    pub fn into_ranked(self) -> Result<Vec<(String, f64)>> {
        match self {
            StoreValue::Ranked(members) => Ok(members),
            StoreValue::Hash(_) => Err(crate::Error::invalid_input("expected a ranked read")),
        }
    }
}

/// Kind of value held under a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Hash,
    SortedSet,
    List,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Hash => "hash",
            ValueKind::SortedSet => "zset",
            ValueKind::List => "list",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "hash" => Some(ValueKind::Hash),
            "zset" => Some(ValueKind::SortedSet),
            "list" => Some(ValueKind::List),
            _ => None,
        }
    }
}

/// Core trait for shared store access.
///
/// Implementations handle the actual backend. Every method is a network round
/// trip from the caller's point of view; transport failures surface as
/// [`crate::Error::StoreUnavailable`].
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Check connectivity.
    async fn ping(&self) -> Result<()>;

    /// Whether a live (non-expired) key exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Read one hash field.
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Read a whole hash. Missing keys read as an empty map.
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Read a sorted set ordered by ascending score, ties broken by member.
    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, f64)>>;

    /// Remaining lifetime. `None` when the key is absent or has no TTL.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Serve several reads against one consistent view: no `exec` batch is
    /// observed half applied across them.
    async fn read_all(&self, reads: Vec<StoreRead>) -> Result<Vec<StoreValue>>;

    /// Apply all commands atomically: either every command lands or none does.
    async fn exec(&self, commands: Vec<StoreCommand>) -> Result<()>;

    /// Length of a list. Missing keys have length zero.
    async fn llen(&self, key: &str) -> Result<usize>;

    /// Pop the head of a list without waiting.
    async fn lpop(&self, key: &str) -> Result<Option<String>>;

    /// Pop the head of a list, waiting up to `timeout` for an element.
    ///
    /// A zero timeout waits indefinitely. Returns `None` when the wait elapsed.
    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<String>>;
}

/// Append a TTL refresh for every key in `keys`.
pub fn expire_all<'a>(
    commands: &mut Vec<StoreCommand>,
    keys: impl IntoIterator<Item = &'a str>,
    ttl: Duration,
) {
    commands.extend(keys.into_iter().map(|key| StoreCommand::Expire {
        key: key.to_string(),
        ttl,
    }));
}

fn not_an_integer(key: &str, field: &str) -> crate::Error {
    crate::Error::invalid_input(format!("hash field {key}.{field} is not an integer"))
}

fn wrong_type(key: &str, expected: ValueKind, found: ValueKind) -> crate::Error {
    crate::Error::invalid_input(format!(
        "key {key} holds a {} but a {} was expected",
        found.as_str(),
        expected.as_str()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_key() {
        let cmd = StoreCommand::Expire {
            key: "a".into(),
            ttl: Duration::from_secs(1),
        };
        assert_eq!(cmd.key(), "a");

        let cmd = StoreCommand::RPush {
            key: "q".into(),
            values: vec!["x".into()],
        };
        assert_eq!(cmd.key(), "q");
    }

    #[test]
    fn test_expire_all_appends_one_per_key() {
        let mut commands = Vec::new();
        expire_all(&mut commands, ["a", "b", "c"], Duration::from_secs(10));
        assert_eq!(commands.len(), 3);
        assert!(commands
            .iter()
            .all(|c| matches!(c, StoreCommand::Expire { ttl, .. } if *ttl == Duration::from_secs(10))));
    }

    #[test]
    fn test_guard_commands_name_their_key() {
        let guard = StoreCommand::RequireExists { key: "m".into() };
        assert_eq!(guard.key(), "m");

        let max = StoreCommand::HSetMax {
            key: "m".into(),
            field: "v".into(),
            value: 3,
        };
        assert_eq!(max.key(), "m");
    }

    #[test]
    fn test_store_value_accessors() {
        assert!(StoreValue::Hash(HashMap::new()).into_hash().is_ok());
        assert!(StoreValue::Hash(HashMap::new()).into_ranked().is_err());
        assert_eq!(StoreValue::Ranked(vec![]).into_ranked().unwrap(), vec![]);
    }

    #[test]
    fn test_value_kind_roundtrip() {
        for kind in [ValueKind::Hash, ValueKind::SortedSet, ValueKind::List] {
            assert_eq!(ValueKind::from_str(kind.as_str()), Some(kind));
        }
    }
}
