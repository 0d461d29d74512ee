//! Workspace configuration
//!
//! Defines the TTL, deadline and key-naming options shared by the cache,
//! the queue and the caller-facing service.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Workspace system configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Prefix for every shared-store key (default: "draftcache")
    pub key_prefix: String,

    /// Idle window after which a workspace expires, in seconds (default: 3600)
    pub idle_ttl_secs: u64,

    /// Deadline for a single cache operation in milliseconds (default: 300)
    pub cache_timeout_ms: u64,

    /// Deadline for an enqueue in milliseconds (default: 2000)
    pub enqueue_timeout_ms: u64,

    /// List key holding pending persistence tasks
    pub queue_key: String,

    /// List key holding failed persistence tasks
    pub dead_letter_key: String,

    /// Reads younger than this are treated as fresh, in seconds (default: 30)
    pub fresh_window_secs: u64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            key_prefix: "draftcache".to_string(),
            idle_ttl_secs: 3600, // 1 hour
            cache_timeout_ms: 300,
            enqueue_timeout_ms: 2000,
            queue_key: "draftcache:persist:queue".to_string(),
            dead_letter_key: "draftcache:persist:dead".to_string(),
            fresh_window_secs: 30,
        }
    }
}

impl WorkspaceConfig {
    /// Workspace TTL as a duration.
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn cache_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_timeout_ms)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn fresh_window(&self) -> Duration {
        Duration::from_secs(self.fresh_window_secs)
    }

    /// Set the idle TTL
    pub fn with_idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl_secs = ttl.as_secs();
        self
    }

    /// Set the key prefix, deriving queue keys from it
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.queue_key = format!("{prefix}:persist:queue");
        self.dead_letter_key = format!("{prefix}:persist:dead");
        self.key_prefix = prefix;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.key_prefix.trim().is_empty() {
            return Err(Error::config("workspace.key_prefix", "must not be empty"));
        }

        if self.idle_ttl_secs == 0 {
            return Err(Error::config(
                "workspace.idle_ttl_secs",
                "must be greater than 0",
            ));
        }

        if self.cache_timeout_ms == 0 || self.enqueue_timeout_ms == 0 {
            return Err(Error::config(
                "workspace.timeouts",
                "must be greater than 0",
            ));
        }

        if self.queue_key.is_empty() || self.dead_letter_key.is_empty() {
            return Err(Error::config("workspace.queue_key", "must not be empty"));
        }

        if self.queue_key == self.dead_letter_key {
            return Err(Error::config(
                "workspace.dead_letter_key",
                "must differ from queue_key",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WorkspaceConfig::default();
        assert_eq!(config.idle_ttl(), Duration::from_secs(3600));
        assert_eq!(config.cache_timeout(), Duration::from_millis(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_with_prefix_derives_queue_keys() {
        let config = WorkspaceConfig::default().with_prefix("test");
        assert_eq!(config.key_prefix, "test");
        assert_eq!(config.queue_key, "test:persist:queue");
        assert_eq!(config.dead_letter_key, "test:persist:dead");
    }

    #[test]
    fn test_config_validation() {
        let mut config = WorkspaceConfig::default();
        config.idle_ttl_secs = 0;
        assert!(config.validate().is_err());

        let mut config = WorkspaceConfig::default();
        config.dead_letter_key = config.queue_key.clone();
        assert!(config.validate().is_err());

        let mut config = WorkspaceConfig::default();
        config.cache_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: WorkspaceConfig = serde_json::from_str(r#"{"idle_ttl_secs": 60}"#).unwrap();
        assert_eq!(config.idle_ttl_secs, 60);
        assert_eq!(config.key_prefix, "draftcache");
    }
}
