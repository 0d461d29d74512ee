//! Relational types.

use serde::{Deserialize, Serialize};

use crate::types::{ArtifactStatus, PersistenceTask};

// ─────────────────────────────────────────────────────────────────────────────
// Entity Types
// ─────────────────────────────────────────────────────────────────────────────

/// A committed or saved artifact row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: i64,
    pub owner_id: i64,
    pub topic: String,
    pub body: String,
    pub instructions: String,
    pub generation_target: String,
    pub status: String,
    pub tags: Vec<String>,
    /// Relational version, bumped on every write.
    pub version: i64,
    /// Workspace that last wrote this row, if any.
    pub workspace_token: Option<String>,
    /// Workspace version of that write.
    pub source_version: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub committed_at: Option<i64>,
}

impl Artifact {
    pub fn is_committed(&self) -> bool {
        self.status == ArtifactStatus::Committed.as_str()
    }

    /// Whether writing `fields` would change nothing visible.
    pub fn matches(&self, fields: &ArtifactFields) -> bool {
        self.topic == fields.topic
            && self.body == fields.body
            && self.instructions == fields.instructions
            && self.generation_target == fields.generation_target
            && self.status == fields.status
            && self.tags == fields.tags
    }

    /// Whether the row was written by a newer version of the same workspace.
    pub fn supersedes(&self, fields: &ArtifactFields) -> bool {
        self.workspace_token.as_deref() == Some(fields.workspace_token.as_str())
            && self.source_version > fields.source_version
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Input Types
// ─────────────────────────────────────────────────────────────────────────────

/// Column values for a create or update.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactFields {
    pub topic: String,
    pub body: String,
    pub instructions: String,
    pub generation_target: String,
    /// "draft" or "committed"
    pub status: String,
    pub tags: Vec<String>,
    pub workspace_token: String,
    pub source_version: i64,
}

impl ArtifactFields {
    pub fn from_task(task: &PersistenceTask) -> Self {
        let status = if task.status.is_empty() {
            ArtifactStatus::for_commit(task.commit).as_str().to_string()
        } else {
            task.status.clone()
        };

        Self {
            topic: task.topic.clone(),
            body: task.body.clone(),
            instructions: task.instructions.clone(),
            generation_target: task.generation_target.clone(),
            status,
            tags: task.tags.clone(),
            workspace_token: task.workspace_token.clone(),
            source_version: task.version,
        }
    }
}
