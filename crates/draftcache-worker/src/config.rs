//! Worker configuration.
//!
//! Configuration is loaded from multiple sources with precedence:
//! 1. Environment variables (DRAFTCACHE_*)
//! 2. Config file (DRAFTCACHE_CONFIG, else <data dir>/config.toml)
//! 3. Default values

use anyhow::{Context, Result};
use draftcache_core::WorkspaceConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Worker process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Relational artifact database
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Durable shared store file
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Number of concurrent workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// How long one dequeue waits before re-checking for shutdown
    #[serde(default = "default_dequeue_timeout")]
    pub dequeue_timeout_secs: u64,

    /// Pause after a store failure before the next dequeue
    #[serde(default = "default_failure_backoff")]
    pub failure_backoff_ms: u64,

    /// Cache and queue settings shared with the edit path
    #[serde(default)]
    pub workspace: WorkspaceConfig,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    std::env::var("DRAFTCACHE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".draftcache")
        })
}

fn default_database_path() -> PathBuf {
    default_data_dir().join("artifacts.db")
}

fn default_store_path() -> PathBuf {
    default_data_dir().join("store.db")
}

fn default_workers() -> usize {
    2
}

fn default_dequeue_timeout() -> u64 {
    5
}

fn default_failure_backoff() -> u64 {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            store_path: default_store_path(),
            workers: default_workers(),
            dequeue_timeout_secs: default_dequeue_timeout(),
            failure_backoff_ms: default_failure_backoff(),
            workspace: WorkspaceConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path())?;
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Read a config file, using defaults when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Get the config file path.
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("DRAFTCACHE_CONFIG") {
            PathBuf::from(path)
        } else {
            default_data_dir().join("config.toml")
        }
    }

    /// Apply `DRAFTCACHE_*` overrides read through `var`.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(path) = var("DRAFTCACHE_DATABASE_PATH") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(path) = var("DRAFTCACHE_STORE_PATH") {
            self.store_path = PathBuf::from(path);
        }
        if let Some(workers) = var("DRAFTCACHE_WORKERS") {
            self.workers = workers
                .trim()
                .parse()
                .with_context(|| format!("DRAFTCACHE_WORKERS is not a number: {workers}"))?;
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        self.workspace.validate()?;
        Ok(())
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_secs(self.dequeue_timeout_secs)
    }

    pub fn failure_backoff(&self) -> Duration {
        Duration::from_millis(self.failure_backoff_ms)
    }

    /// Ensure the parent directories of both database files exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        for path in [&self.database_path, &self.store_path] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::env;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.workers, 2);
        assert_eq!(config.dequeue_timeout(), Duration::from_secs(5));
        assert_eq!(config.failure_backoff(), Duration::from_millis(500));
        assert!(config.database_path.ends_with("artifacts.db"));
        assert!(config.store_path.ends_with("store.db"));
        assert_eq!(config.workspace.key_prefix, "draftcache");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.workers, 2);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
workers = 4
database_path = "/var/lib/draftcache/artifacts.db"

[workspace]
idle_ttl_secs = 120
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.database_path, PathBuf::from("/var/lib/draftcache/artifacts.db"));
        assert_eq!(config.workspace.idle_ttl_secs, 120);
        assert_eq!(config.workspace.cache_timeout_ms, 300);
        assert_eq!(config.dequeue_timeout_secs, 5);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "workers = \"many\"").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("DRAFTCACHE_DATABASE_PATH", "/tmp/a.db"),
            ("DRAFTCACHE_WORKERS", "8"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.database_path, PathBuf::from("/tmp/a.db"));
        assert_eq!(config.workers, 8);
        assert!(config.store_path.ends_with("store.db"));
    }

    #[test]
    fn test_bad_worker_override() {
        let mut config = Config::default();
        let result = config.apply_overrides(|name| {
            (name == "DRAFTCACHE_WORKERS").then(|| "lots".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = Config {
            workers: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_path_from_env() {
        let dir = tempdir().unwrap();
        let custom = dir.path().join("worker.toml");
        std::fs::write(&custom, "workers = 3").unwrap();

        // Save current value to restore later
        let old_val = env::var("DRAFTCACHE_CONFIG").ok();
        // SAFETY: This test runs in isolation and we restore the env var afterward
        unsafe { env::set_var("DRAFTCACHE_CONFIG", &custom) };

        let path = Config::config_path();
        let config = Config::load_from(&path).unwrap();

        // SAFETY: Restoring environment to previous state
        unsafe {
            if let Some(val) = old_val {
                env::set_var("DRAFTCACHE_CONFIG", val);
            } else {
                env::remove_var("DRAFTCACHE_CONFIG");
            }
        }

        assert_eq!(path, custom);
        assert_eq!(config.workers, 3);
    }

    #[test]
    fn test_ensure_dirs_creates_parents() {
        let dir = tempdir().unwrap();
        let config = Config {
            database_path: dir.path().join("db/artifacts.db"),
            store_path: dir.path().join("store/store.db"),
            ..Config::default()
        };

        config.ensure_dirs().unwrap();
        assert!(dir.path().join("db").is_dir());
        assert!(dir.path().join("store").is_dir());
    }
}
