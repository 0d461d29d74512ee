//! Queue status command.
//!
//! Supports JSON output for programmatic use.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::state::AppState;

/// Queue status for JSON output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub timestamp: String,
    pub store_path: String,
    pub database_path: String,
    pub store_reachable: bool,
    pub queue_depth: Option<usize>,
    pub dead_letter_depth: Option<usize>,
}

pub async fn execute(json: bool, config: Config) -> Result<()> {
    let state = AppState::open(config)?;
    let status = gather_status(&state).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status(&status);
    }

    Ok(())
}

pub async fn gather_status(state: &AppState) -> QueueStatus {
    let store_reachable = state.store.ping().await.is_ok();

    QueueStatus {
        timestamp: Utc::now().to_rfc3339(),
        store_path: state.config.store_path.display().to_string(),
        database_path: state.config.database_path.display().to_string(),
        store_reachable,
        queue_depth: state.queue.depth().await.ok(),
        dead_letter_depth: state.queue.dead_letter_depth().await.ok(),
    }
}

fn print_status(status: &QueueStatus) {
    let depth = |d: Option<usize>| d.map_or_else(|| "unknown".to_string(), |d| d.to_string());

    println!("draftcache worker status ({})", status.timestamp);
    println!("  store:        {}", status.store_path);
    println!("  database:     {}", status.database_path);
    println!(
        "  reachable:    {}",
        if status.store_reachable { "yes" } else { "no" }
    );
    println!("  queued:       {}", depth(status.queue_depth));
    println!("  dead letters: {}", depth(status.dead_letter_depth));
}
