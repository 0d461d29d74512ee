//! Replay dead-lettered tasks.

use anyhow::{Context, Result};
use tracing::info;

use crate::config::Config;
use crate::state::AppState;

pub async fn execute(limit: usize, config: Config) -> Result<()> {
    let state = AppState::open(config)?;
    let replayed = replay(&state, limit).await?;

    println!("Replayed {replayed} task(s)");
    Ok(())
}

/// Move up to `limit` dead letters back onto the queue.
pub async fn replay(state: &AppState, limit: usize) -> Result<usize> {
    let replayed = state
        .queue
        .replay_dead_letters(limit)
        .await
        .context("Failed to replay dead letters")?;

    info!(replayed = replayed, limit = limit, "Dead letters replayed");
    Ok(replayed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use draftcache_core::{Database, InMemoryStore, PersistenceTask, WorkspaceSnapshot};
    use std::sync::Arc;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_replay_moves_tasks_back() {
        let state = AppState::from_parts(
            Config::default(),
            Arc::new(InMemoryStore::new()),
            Arc::new(Database::open_in_memory().unwrap()),
        );

        let mut snapshot = WorkspaceSnapshot::new(7, "interview");
        snapshot.token = "tok".into();
        let task = PersistenceTask::from_snapshot(&snapshot, true);
        assert_ok!(state.queue.dead_letter(&task, "boom").await);
        assert_ok!(state.queue.dead_letter(&task, "boom again").await);

        assert_eq!(replay(&state, 1).await.unwrap(), 1);
        assert_eq!(state.queue.depth().await.unwrap(), 1);
        assert_eq!(state.queue.dead_letter_depth().await.unwrap(), 1);
    }
}
