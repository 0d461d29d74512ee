//! WorkspaceService - caller-facing edit and commit operations
//!
//! Wraps the workspace cache, the persistence queue and the relational
//! repository behind the operations the edit and commit handlers use. Every
//! cache call runs under the configured deadline.
//!
//! When the shared store cannot be reached at session open, the session is
//! opened in [`SessionMode::Direct`]: the caller then skips the cache and the
//! queue and saves synchronously through [`WorkspaceService::save_direct`].
//! Outages after a session was opened in cached mode surface as errors.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::WorkspaceConfig;
use crate::db::ArtifactRepository;
use crate::error::{Error, Result};
use crate::persistence::{WriteOutcome, write_back};
use crate::queue::PersistenceQueue;
use crate::types::{
    EXTRA_INSTRUCTIONS, KeywordOrigin, MetadataPatch, PersistenceTask, Polarity, WorkspaceKeyword,
    WorkspaceSnapshot,
};
use crate::workspace::WorkspaceCache;

/// How a session is backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Edits go to the workspace cache, commits through the queue.
    Cached,
    /// The shared store was unreachable; reads and writes go straight to the
    /// relational store.
    Direct,
}

/// Parameters for opening a session.
#[derive(Debug, Clone, Default)]
pub struct OpenRequest {
    /// Resume this workspace when it is still live.
    pub token: Option<String>,
    pub topic: String,
    pub language: String,
    pub generation_target: String,
    /// Start from an existing artifact (zero for none).
    pub artifact_id: i64,
}

impl OpenRequest {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Default::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_artifact(mut self, artifact_id: i64) -> Self {
        self.artifact_id = artifact_id;
        self
    }
}

/// A session handed back to the caller.
#[derive(Debug, Clone)]
pub struct OpenedWorkspace {
    pub mode: SessionMode,
    pub snapshot: WorkspaceSnapshot,
    /// Whether an existing live workspace was resumed.
    pub resumed: bool,
    /// Whether the workspace was touched within the fresh window.
    pub fresh: bool,
}

/// A single-keyword edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditAction {
    Add { weight: i64 },
    Remove,
}

/// Run `fut` under a deadline, reporting elapse as [`Error::Timeout`].
async fn with_deadline<T>(limit: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(limit.as_millis() as u64)),
    }
}

pub struct WorkspaceService {
    cache: Arc<WorkspaceCache>,
    queue: Arc<PersistenceQueue>,
    repo: Arc<dyn ArtifactRepository>,
    config: WorkspaceConfig,
}

impl WorkspaceService {
    pub fn new(
        cache: Arc<WorkspaceCache>,
        queue: Arc<PersistenceQueue>,
        repo: Arc<dyn ArtifactRepository>,
    ) -> Self {
        let config = cache.config().clone();
        Self {
            cache,
            queue,
            repo,
            config,
        }
    }

    async fn cached<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        with_deadline(self.config.cache_timeout(), fut).await
    }

    /// Open a session, resuming a live workspace or creating a new one.
    ///
    /// Falls back to [`SessionMode::Direct`] when the shared store does not
    /// answer a ping within the cache deadline.
    pub async fn open_or_resume(&self, owner_id: i64, request: OpenRequest) -> Result<OpenedWorkspace> {
        if owner_id <= 0 {
            return Err(Error::invalid_input(format!("invalid owner id {owner_id}")));
        }

        if let Err(e) = self.cached(self.cache.ping()).await {
            warn!(owner_id = owner_id, error = %e, "Shared store unreachable, opening direct session");
            let snapshot = self.hydrate(owner_id, &request)?;
            return Ok(OpenedWorkspace {
                mode: SessionMode::Direct,
                snapshot,
                resumed: false,
                fresh: true,
            });
        }

        if let Some(token) = request.token.as_deref().filter(|t| !t.trim().is_empty()) {
            match self.cached(self.cache.snapshot(owner_id, token)).await {
                Ok(snapshot) => {
                    self.cached(self.cache.touch(owner_id, token)).await?;
                    let fresh = snapshot.is_fresh(self.config.fresh_window());
                    return Ok(OpenedWorkspace {
                        mode: SessionMode::Cached,
                        snapshot,
                        resumed: true,
                        fresh,
                    });
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        let snapshot = self.hydrate(owner_id, &request)?;
        let token = self
            .cached(self.cache.create_or_replace(owner_id, snapshot))
            .await?;
        let snapshot = self.cached(self.cache.snapshot(owner_id, &token)).await?;

        info!(owner_id = owner_id, token = %token, "Workspace opened");
        Ok(OpenedWorkspace {
            mode: SessionMode::Cached,
            snapshot,
            resumed: false,
            fresh: true,
        })
    }

    /// Build a fresh snapshot, seeded from an existing artifact when asked.
    fn hydrate(&self, owner_id: i64, request: &OpenRequest) -> Result<WorkspaceSnapshot> {
        let mut snapshot = WorkspaceSnapshot::new(owner_id, request.topic.trim());
        snapshot.token = request
            .token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        snapshot.language = request.language.clone();
        snapshot.generation_target = request.generation_target.clone();

        if request.artifact_id > 0 {
            let artifact = self.repo.find_artifact(owner_id, request.artifact_id)?;
            if snapshot.topic.is_empty() {
                snapshot.topic = artifact.topic.clone();
            }
            if snapshot.generation_target.is_empty() {
                snapshot.generation_target = artifact.generation_target.clone();
            }
            snapshot.draft_body = artifact.body.clone();
            snapshot.status = artifact.status.clone();
            snapshot.committed_artifact_id = artifact.id;
            if !artifact.instructions.is_empty() {
                snapshot
                    .extra
                    .insert(EXTRA_INSTRUCTIONS.to_string(), artifact.instructions.clone());
            }
            snapshot.positive_keywords = artifact
                .tags
                .iter()
                .filter(|tag| !tag.trim().is_empty())
                .map(|tag| WorkspaceKeyword::positive(tag.as_str()).with_origin(KeywordOrigin::CarriedOver))
                .collect();
        }

        if snapshot.topic.is_empty() {
            return Err(Error::invalid_input("workspace topic must not be empty"));
        }
        Ok(snapshot)
    }

    /// Merge generated keyword suggestions into a workspace.
    pub async fn apply_suggestions(
        &self,
        owner_id: i64,
        token: &str,
        keywords: Vec<WorkspaceKeyword>,
    ) -> Result<()> {
        self.cached(self.cache.merge_keywords(owner_id, token, keywords))
            .await
    }

    /// Add or remove one keyword typed by the user. Returns whether anything
    /// changed.
    pub async fn apply_manual_edit(
        &self,
        owner_id: i64,
        token: &str,
        polarity: Polarity,
        word: &str,
        action: EditAction,
    ) -> Result<bool> {
        match action {
            EditAction::Add { weight } => {
                let keyword = WorkspaceKeyword::new(word, polarity).with_weight(weight);
                self.cached(self.cache.merge_keywords(owner_id, token, vec![keyword]))
                    .await?;
                Ok(true)
            }
            EditAction::Remove => {
                self.cached(self.cache.remove_keyword(owner_id, token, polarity, word))
                    .await
            }
        }
    }

    /// Patch session metadata such as the draft body.
    pub async fn update_metadata(&self, owner_id: i64, token: &str, patch: MetadataPatch) -> Result<()> {
        self.cached(self.cache.patch_metadata(owner_id, token, patch))
            .await
    }

    /// Queue a write-back of the current workspace. Returns the task id.
    ///
    /// An expired workspace fails with [`Error::NotFound`]; nothing is
    /// enqueued. Enqueue failures should be shown with
    /// [`Error::user_message`].
    pub async fn request_commit(
        &self,
        owner_id: i64,
        token: &str,
        commit: bool,
        instructions: Option<String>,
    ) -> Result<String> {
        let snapshot = self.cached(self.cache.snapshot(owner_id, token)).await?;

        let mut task = PersistenceTask::from_snapshot(&snapshot, commit);
        if let Some(instructions) = instructions {
            task.instructions = instructions;
        }

        let task_id = with_deadline(self.config.enqueue_timeout(), self.queue.enqueue(task))
            .await
            .inspect_err(|e| {
                warn!(owner_id = owner_id, token = %token, error = %e, "Commit not queued");
            })?;

        info!(
            owner_id = owner_id,
            token = %token,
            task_id = %task_id,
            version = snapshot.version,
            commit = commit,
            "Commit requested"
        );
        Ok(task_id)
    }

    pub async fn get_snapshot(&self, owner_id: i64, token: &str) -> Result<WorkspaceSnapshot> {
        self.cached(self.cache.snapshot(owner_id, token)).await
    }

    /// End a cached session.
    pub async fn close(&self, owner_id: i64, token: &str) -> Result<bool> {
        self.cached(self.cache.delete(owner_id, token)).await
    }

    /// Synchronous write for a [`SessionMode::Direct`] session.
    pub fn save_direct(&self, owner_id: i64, snapshot: &WorkspaceSnapshot, commit: bool) -> Result<WriteOutcome> {
        let mut task = PersistenceTask::from_snapshot(snapshot, commit);
        task.owner_id = owner_id;
        let outcome = write_back(self.repo.as_ref(), &task)?;

        info!(
            owner_id = owner_id,
            artifact_id = outcome.artifact_id(),
            outcome = outcome.as_str(),
            "Direct save"
        );
        Ok(outcome)
    }
}
