//! Application state.

use anyhow::{Context, Result};
use draftcache_core::{Database, PersistenceQueue, SharedStore, SqliteStore, WorkspaceCache};
use std::sync::Arc;

use crate::config::Config;

/// Shared application state
///
/// One store adapter and one database handle are built at startup and shared
/// by every worker.
#[derive(Clone)]
pub struct AppState {
    /// Worker configuration
    pub config: Arc<Config>,
    /// Shared store adapter
    pub store: Arc<dyn SharedStore>,
    /// Relational artifact store
    pub db: Arc<Database>,
    /// Workspace cache, for stale checks and linking back
    pub cache: Arc<WorkspaceCache>,
    /// Persistence task queue
    pub queue: Arc<PersistenceQueue>,
}

impl AppState {
    /// Open the durable store and the database named by `config`.
    pub fn open(config: Config) -> Result<Self> {
        config.ensure_dirs()?;

        let store = SqliteStore::open_path(&config.store_path)
            .with_context(|| format!("Failed to open store at {}", config.store_path.display()))?;
        let db = Database::open_path(&config.database_path).with_context(|| {
            format!(
                "Failed to open database at {}",
                config.database_path.display()
            )
        })?;

        Ok(Self::from_parts(config, Arc::new(store), Arc::new(db)))
    }

    /// Assemble state from already-open components.
    pub fn from_parts(config: Config, store: Arc<dyn SharedStore>, db: Arc<Database>) -> Self {
        let cache = Arc::new(WorkspaceCache::new(store.clone(), config.workspace.clone()));
        let queue = Arc::new(PersistenceQueue::new(store.clone(), &config.workspace));

        Self {
            config: Arc::new(config),
            store,
            db,
            cache,
            queue,
        }
    }
}
