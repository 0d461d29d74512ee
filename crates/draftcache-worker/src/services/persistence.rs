//! PersistenceWorker - drains write-back tasks into the relational store
//!
//! Per task:
//! - Stale check: drop tasks older than the workspace's linked version
//! - Resolving/Writing: idempotent write-back to the artifact store
//! - LinkingBack: record the artifact id and version on the workspace
//!
//! Failed writes are logged in full and dead-lettered for manual replay.
//! They are never re-enqueued automatically.

use draftcache_core::db::ArtifactRepository;
use draftcache_core::{
    Error, PersistenceQueue, PersistenceTask, WorkspaceCache, WriteOutcome, write_back,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::state::AppState;

/// What happened to one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The artifact was created or updated.
    Applied { artifact_id: i64 },
    /// The artifact already held this content.
    Unchanged { artifact_id: i64 },
    /// A newer version was already written; the task was dropped.
    Stale,
    /// The write failed; the task was dead-lettered.
    Failed,
}

/// A single queue consumer.
pub struct PersistenceWorker {
    id: usize,
    cache: Arc<WorkspaceCache>,
    queue: Arc<PersistenceQueue>,
    repo: Arc<dyn ArtifactRepository>,
    dequeue_timeout: Duration,
    failure_backoff: Duration,
}

impl PersistenceWorker {
    pub fn new(id: usize, state: &AppState) -> Self {
        Self {
            id,
            cache: state.cache.clone(),
            queue: state.queue.clone(),
            repo: state.db.clone(),
            dequeue_timeout: state.config.dequeue_timeout(),
            failure_backoff: state.config.failure_backoff(),
        }
    }

    /// Consume tasks until `shutdown` turns true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = self.id, "Persistence worker started");

        while !*shutdown.borrow() {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }

                next = self.queue.blocking_dequeue(self.dequeue_timeout) => match next {
                    Ok(task) => {
                        self.process(task).await;
                    }
                    Err(Error::Timeout { .. }) => {}
                    Err(e) => {
                        warn!(worker = self.id, error = %e, "Dequeue failed, backing off");
                        tokio::select! {
                            _ = shutdown.changed() => {}
                            _ = tokio::time::sleep(self.failure_backoff) => {}
                        }
                    }
                },
            }
        }

        info!(worker = self.id, "Persistence worker stopped");
    }

    /// Drive one task through stale check, write-back and linking back.
    pub async fn process(&self, task: PersistenceTask) -> TaskOutcome {
        let owner_id = task.owner_id;
        let token = task.workspace_token.as_str();

        match self.cache.snapshot(owner_id, token).await {
            Ok(snapshot) if task.version < snapshot.linked_version => {
                warn!(
                    worker = self.id,
                    task_id = %task.task_id,
                    task_version = task.version,
                    linked_version = snapshot.linked_version,
                    "Dropping stale task"
                );
                return TaskOutcome::Stale;
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                debug!(task_id = %task.task_id, token = %token, "Workspace gone, writing anyway");
            }
            Err(e) => {
                warn!(task_id = %task.task_id, error = %e, "Stale check skipped");
            }
        }

        let outcome = match write_back(self.repo.as_ref(), &task) {
            Ok(outcome) => outcome,
            Err(e) if e.is_stale() => {
                warn!(worker = self.id, task_id = %task.task_id, error = %e, "Dropping stale task");
                return TaskOutcome::Stale;
            }
            Err(e) => {
                self.fail(&task, &e).await;
                return TaskOutcome::Failed;
            }
        };

        let artifact_id = outcome.artifact_id();
        let linked = self
            .cache
            .set_artifact_linkage(owner_id, token, artifact_id, &outcome.artifact().status, task.version)
            .await;
        match linked {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                info!(task_id = %task.task_id, artifact_id = artifact_id, "Workspace expired before linking back");
            }
            Err(e) => {
                warn!(task_id = %task.task_id, artifact_id = artifact_id, error = %e, "Linking back failed");
            }
        }

        info!(
            worker = self.id,
            task_id = %task.task_id,
            artifact_id = artifact_id,
            outcome = outcome.as_str(),
            "Task processed"
        );

        match outcome {
            WriteOutcome::Unchanged(_) => TaskOutcome::Unchanged { artifact_id },
            WriteOutcome::Created(_) | WriteOutcome::Updated(_) => TaskOutcome::Applied { artifact_id },
        }
    }

    async fn fail(&self, task: &PersistenceTask, err: &Error) {
        let payload = serde_json::to_string(task).unwrap_or_else(|e| format!("<unserializable: {e}>"));
        error!(
            worker = self.id,
            task_id = %task.task_id,
            error = %err,
            task = %payload,
            "Write-back failed"
        );

        if let Err(e) = self.queue.dead_letter(task, err.to_string()).await {
            error!(task_id = %task.task_id, error = %e, "Failed to dead-letter task");
        }
    }
}

/// A set of workers sharing one shutdown signal.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers over the shared state.
    pub fn spawn(state: &AppState, count: usize) -> Self {
        let (shutdown, receiver) = watch::channel(false);

        let handles = (0..count)
            .map(|id| {
                let worker = PersistenceWorker::new(id, state);
                let receiver = receiver.clone();
                tokio::spawn(async move { worker.run(receiver).await })
            })
            .collect();

        info!(workers = count, "Worker pool started");
        Self { shutdown, handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Signal every worker and wait for them to finish their current task.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
        info!("Worker pool stopped");
    }
}
