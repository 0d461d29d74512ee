//! Run the worker pool until interrupted.

use anyhow::Result;
use tracing::info;

use crate::config::Config;
use crate::services::WorkerPool;
use crate::state::AppState;

pub async fn execute(workers: Option<usize>, config: Config) -> Result<()> {
    let count = workers.unwrap_or(config.workers).max(1);
    info!(
        store = %config.store_path.display(),
        database = %config.database_path.display(),
        "Opening worker state"
    );

    let state = AppState::open(config)?;
    let pool = WorkerPool::spawn(&state, count);
    info!(workers = pool.len(), "Waiting for tasks (Ctrl-C to stop)");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    pool.shutdown().await;

    Ok(())
}
