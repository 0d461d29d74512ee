//! Service layer for draftcache-worker
//!
//! Contains the long-running services the worker process hosts.

pub mod persistence;

pub use persistence::WorkerPool;
