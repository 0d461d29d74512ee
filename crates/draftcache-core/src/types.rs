//! Core types shared by the workspace cache, the persistence queue and the worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ─────────────────────────────────────────────────────────────────────────────
// Keywords
// ─────────────────────────────────────────────────────────────────────────────

/// Whether a keyword is desired or excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    Positive,
    Negative,
}

impl Polarity {
    /// Both polarities, positive first.
    pub const ALL: [Polarity; 2] = [Polarity::Positive, Polarity::Negative];

    /// Convert to string for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Polarity::Positive => "positive",
            Polarity::Negative => "negative",
        }
    }

    /// Parse from string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "positive" => Some(Polarity::Positive),
            "negative" => Some(Polarity::Negative),
            _ => None,
        }
    }
}

impl std::fmt::Display for Polarity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a keyword came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeywordOrigin {
    /// Typed by the user.
    #[default]
    Manual,
    /// Suggested by a generation run.
    Generated,
    /// Inherited from a previously committed artifact.
    CarriedOver,
}

impl KeywordOrigin {
    /// Convert to string for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeywordOrigin::Manual => "manual",
            KeywordOrigin::Generated => "generated",
            KeywordOrigin::CarriedOver => "carried-over",
        }
    }
}

/// Normalize a keyword into its dedup key (trimmed, lowercase).
pub fn normalize_word(word: &str) -> String {
    word.trim().to_lowercase()
}

/// A single keyword inside a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceKeyword {
    pub word: String,
    /// Normalized dedup key, derived from `word`.
    pub key: String,
    pub polarity: Polarity,
    #[serde(default)]
    pub origin: KeywordOrigin,
    #[serde(default = "default_weight")]
    pub weight: i64,
    #[serde(default)]
    pub display: Option<String>,
    /// Ranking score. `None` on input means "now".
    #[serde(default)]
    pub score: Option<f64>,
}

pub(crate) fn default_weight() -> i64 {
    1
}

impl WorkspaceKeyword {
    /// Create a keyword with default weight and manual origin.
    pub fn new(word: impl Into<String>, polarity: Polarity) -> Self {
        let word = word.into().trim().to_string();
        Self {
            key: normalize_word(&word),
            word,
            polarity,
            origin: KeywordOrigin::Manual,
            weight: default_weight(),
            display: None,
            score: None,
        }
    }

    pub fn positive(word: impl Into<String>) -> Self {
        Self::new(word, Polarity::Positive)
    }

    pub fn negative(word: impl Into<String>) -> Self {
        Self::new(word, Polarity::Negative)
    }

    pub fn with_weight(mut self, weight: i64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_origin(mut self, origin: KeywordOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Workspace snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// Key in `extra` holding auxiliary generation instructions.
pub const EXTRA_INSTRUCTIONS: &str = "instructions";

/// Fully materialized state of one editing session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceSnapshot {
    /// Opaque session token. Empty means "assign one".
    pub token: String,
    pub owner_id: i64,
    pub topic: String,
    pub language: String,
    pub generation_target: String,
    pub draft_body: String,
    pub positive_keywords: Vec<WorkspaceKeyword>,
    pub negative_keywords: Vec<WorkspaceKeyword>,
    /// Zero until a relational record exists.
    pub committed_artifact_id: i64,
    pub status: String,
    pub version: i64,
    /// Workspace version last written back to the relational store.
    pub linked_version: i64,
    pub updated_at: DateTime<Utc>,
    /// Free-form string attributes.
    pub extra: BTreeMap<String, String>,
}

impl WorkspaceSnapshot {
    /// Create an empty draft snapshot for a topic.
    pub fn new(owner_id: i64, topic: impl Into<String>) -> Self {
        Self {
            token: String::new(),
            owner_id,
            topic: topic.into(),
            language: String::new(),
            generation_target: String::new(),
            draft_body: String::new(),
            positive_keywords: Vec::new(),
            negative_keywords: Vec::new(),
            committed_artifact_id: 0,
            status: ArtifactStatus::Draft.as_str().to_string(),
            version: 0,
            linked_version: 0,
            updated_at: Utc::now(),
            extra: BTreeMap::new(),
        }
    }

    /// Keywords of one polarity.
    pub fn keywords(&self, polarity: Polarity) -> &[WorkspaceKeyword] {
        match polarity {
            Polarity::Positive => &self.positive_keywords,
            Polarity::Negative => &self.negative_keywords,
        }
    }

    /// Find a keyword by polarity and (un-normalized) word.
    pub fn keyword(&self, polarity: Polarity, word: &str) -> Option<&WorkspaceKeyword> {
        let key = normalize_word(word);
        self.keywords(polarity).iter().find(|k| k.key == key)
    }

    /// Whether the snapshot was touched within `window`.
    pub fn is_fresh(&self, window: std::time::Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.updated_at);
        age.to_std().map(|age| age <= window).unwrap_or(true)
    }

    /// Auxiliary instructions stored in the extra attributes.
    pub fn instructions(&self) -> &str {
        self.extra
            .get(EXTRA_INSTRUCTIONS)
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// Partial metadata update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataPatch {
    pub topic: Option<String>,
    pub language: Option<String>,
    pub generation_target: Option<String>,
    pub draft_body: Option<String>,
    /// Replaces the whole extra map when set.
    pub extra: Option<BTreeMap<String, String>>,
}

impl MetadataPatch {
    pub fn draft_body(body: impl Into<String>) -> Self {
        Self {
            draft_body: Some(body.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.topic.is_none()
            && self.language.is_none()
            && self.generation_target.is_none()
            && self.draft_body.is_none()
            && self.extra.is_none()
    }
}

/// Lifecycle labels shared with the relational store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactStatus {
    Draft,
    Committed,
}

impl ArtifactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStatus::Draft => "draft",
            ArtifactStatus::Committed => "committed",
        }
    }

    pub fn for_commit(commit: bool) -> Self {
        if commit {
            ArtifactStatus::Committed
        } else {
            ArtifactStatus::Draft
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Persistence tasks
// ─────────────────────────────────────────────────────────────────────────────

/// Relational write a task asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Create,
    Update,
}

/// A durable write-back intent.
///
/// Carries a denormalized copy of everything the worker writes so it never
/// has to re-read the workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceTask {
    /// Assigned at enqueue time when empty.
    #[serde(default)]
    pub task_id: String,
    pub owner_id: i64,
    pub workspace_token: String,
    /// Zero when the artifact does not exist yet.
    #[serde(default)]
    pub artifact_id: i64,
    pub action: TaskAction,
    /// Finalize the artifact instead of merely saving it.
    #[serde(default)]
    pub commit: bool,
    /// Workspace version the task was built from.
    #[serde(default)]
    pub version: i64,
    pub topic: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub generation_target: String,
    /// Target lifecycle label.
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Assigned at enqueue time when absent.
    #[serde(default)]
    pub requested_at: Option<DateTime<Utc>>,
}

impl PersistenceTask {
    /// Build a task from a workspace snapshot.
    pub fn from_snapshot(snapshot: &WorkspaceSnapshot, commit: bool) -> Self {
        let action = if snapshot.committed_artifact_id > 0 {
            TaskAction::Update
        } else {
            TaskAction::Create
        };

        Self {
            task_id: String::new(),
            owner_id: snapshot.owner_id,
            workspace_token: snapshot.token.clone(),
            artifact_id: snapshot.committed_artifact_id,
            action,
            commit,
            version: snapshot.version,
            topic: snapshot.topic.clone(),
            body: snapshot.draft_body.clone(),
            instructions: snapshot.instructions().to_string(),
            generation_target: snapshot.generation_target.clone(),
            status: ArtifactStatus::for_commit(commit).as_str().to_string(),
            tags: snapshot
                .positive_keywords
                .iter()
                .map(|k| k.word.clone())
                .collect(),
            requested_at: None,
        }
    }

    /// Milliseconds between enqueue and now, if known.
    pub fn queue_age_ms(&self) -> Option<i64> {
        self.requested_at
            .map(|at| Utc::now().signed_duration_since(at).num_milliseconds())
    }
}

/// A task that failed and was parked for manual replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Parsed task, absent when the payload itself was malformed.
    pub task: Option<PersistenceTask>,
    /// Raw payload as it came off the queue.
    pub payload: String,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}
