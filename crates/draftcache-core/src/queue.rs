//! Persistence task queue.
//!
//! Durable FIFO hand-off of write-back intents from the interactive path to
//! the worker, stored as a list in the shared store. Delivery is at least
//! once; consumers must treat the task version, not arrival order, as the
//! authority for conflicts.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::WorkspaceConfig;
use crate::error::{Error, Result};
use crate::store::{SharedStore, StoreCommand};
use crate::types::{DeadLetter, PersistenceTask};

/// Queue of [`PersistenceTask`]s with a dead-letter list for failures.
pub struct PersistenceQueue {
    store: Arc<dyn SharedStore>,
    queue_key: String,
    dead_letter_key: String,
}

impl PersistenceQueue {
    pub fn new(store: Arc<dyn SharedStore>, config: &WorkspaceConfig) -> Self {
        Self {
            store,
            queue_key: config.queue_key.clone(),
            dead_letter_key: config.dead_letter_key.clone(),
        }
    }

    pub fn queue_key(&self) -> &str {
        &self.queue_key
    }

    /// Append a task to the tail. Assigns the id and enqueue time when missing.
    pub async fn enqueue(&self, mut task: PersistenceTask) -> Result<String> {
        if task.owner_id <= 0 {
            return Err(Error::invalid_input(format!("invalid owner id {}", task.owner_id)));
        }
        if task.workspace_token.trim().is_empty() {
            return Err(Error::invalid_input("task workspace token must not be empty"));
        }
        if task.task_id.is_empty() {
            task.task_id = Uuid::new_v4().to_string();
        }
        if task.requested_at.is_none() {
            task.requested_at = Some(Utc::now());
        }

        let payload = serde_json::to_string(&task)?;
        self.store
            .exec(vec![StoreCommand::RPush {
                key: self.queue_key.clone(),
                values: vec![payload],
            }])
            .await?;

        info!(
            task_id = %task.task_id,
            owner_id = task.owner_id,
            token = %task.workspace_token,
            version = task.version,
            commit = task.commit,
            "Persistence task enqueued"
        );
        Ok(task.task_id)
    }

    /// Pop the head task, waiting up to `timeout` (zero waits indefinitely).
    ///
    /// Malformed payloads are moved to the dead-letter list and skipped.
    /// Returns [`Error::Timeout`] when nothing arrived in time.
    pub async fn blocking_dequeue(&self, timeout: Duration) -> Result<PersistenceTask> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

        loop {
            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(Error::timeout(timeout.as_millis() as u64));
                    }
                    remaining
                }
                None => Duration::ZERO,
            };

            let Some(payload) = self.store.blpop(&self.queue_key, wait).await? else {
                return Err(Error::timeout(timeout.as_millis() as u64));
            };

            match serde_json::from_str::<PersistenceTask>(&payload) {
                Ok(task) => {
                    debug!(
                        task_id = %task.task_id,
                        queue_age_ms = task.queue_age_ms().unwrap_or_default(),
                        "Persistence task dequeued"
                    );
                    return Ok(task);
                }
                Err(e) => {
                    warn!(error = %e, payload = %payload, "Malformed persistence task");
                    self.park(None, payload, format!("malformed payload: {e}"))
                        .await?;
                }
            }
        }
    }

    /// Park a failed task for manual replay.
    pub async fn dead_letter(&self, task: &PersistenceTask, reason: impl Into<String>) -> Result<()> {
        let payload = serde_json::to_string(task)?;
        self.park(Some(task.clone()), payload, reason.into()).await
    }

    async fn park(&self, task: Option<PersistenceTask>, payload: String, reason: String) -> Result<()> {
        let letter = DeadLetter {
            task,
            payload,
            reason,
            failed_at: Utc::now(),
        };
        self.store
            .exec(vec![StoreCommand::RPush {
                key: self.dead_letter_key.clone(),
                values: vec![serde_json::to_string(&letter)?],
            }])
            .await
    }

    /// Move up to `limit` dead letters back onto the queue tail.
    ///
    /// Letters without a parseable task cannot be replayed; they are rotated to
    /// the back of the dead-letter list. Returns the number replayed.
    pub async fn replay_dead_letters(&self, limit: usize) -> Result<usize> {
        let mut replayed = 0;

        for _ in 0..limit {
            let Some(raw) = self.store.lpop(&self.dead_letter_key).await? else {
                break;
            };

            let task = serde_json::from_str::<DeadLetter>(&raw)
                .ok()
                .and_then(|letter| letter.task);

            let command = match task {
                Some(mut task) => {
                    task.requested_at = Some(Utc::now());
                    info!(task_id = %task.task_id, "Replaying dead-lettered task");
                    replayed += 1;
                    StoreCommand::RPush {
                        key: self.queue_key.clone(),
                        values: vec![serde_json::to_string(&task)?],
                    }
                }
                None => {
                    warn!("Dead letter has no replayable task");
                    StoreCommand::RPush {
                        key: self.dead_letter_key.clone(),
                        values: vec![raw],
                    }
                }
            };
            self.store.exec(vec![command]).await?;
        }

        Ok(replayed)
    }

    /// Tasks waiting in the queue.
    pub async fn depth(&self) -> Result<usize> {
        self.store.llen(&self.queue_key).await
    }

    /// Tasks parked in the dead-letter list.
    pub async fn dead_letter_depth(&self) -> Result<usize> {
        self.store.llen(&self.dead_letter_key).await
    }
}
