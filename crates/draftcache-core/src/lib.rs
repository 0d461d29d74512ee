//! draftcache-core - Draft workspace cache with asynchronous write-back
//!
//! This crate provides the pieces shared by the interactive edit path and the
//! persistence worker:
//!
//! - **store**: Shared store adapter trait plus in-memory and SQLite adapters
//! - **workspace**: TTL-bounded workspace cache over the shared store
//! - **queue**: Durable persistence task queue with dead letters
//! - **db**: Relational artifact store
//! - **persistence**: Idempotent write-back of tasks to the artifact store
//! - **service**: Caller-facing operations, including the degraded direct path

pub mod config;
pub mod db;
pub mod error;
pub mod persistence;
pub mod queue;
pub mod service;
pub mod store;
pub mod types;
pub mod workspace;

// Re-export commonly used types
pub use config::WorkspaceConfig;
pub use db::{ArtifactRepository, Database};
pub use error::{Error, Result};
pub use persistence::{WriteOutcome, write_back};
pub use queue::PersistenceQueue;
pub use service::{EditAction, OpenRequest, OpenedWorkspace, SessionMode, WorkspaceService};
pub use store::{InMemoryStore, SharedStore, SqliteStore};
pub use types::{PersistenceTask, Polarity, WorkspaceKeyword, WorkspaceSnapshot};
pub use workspace::WorkspaceCache;
