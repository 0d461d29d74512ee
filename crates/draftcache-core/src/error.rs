//! Error types for draftcache-core.

use thiserror::Error;

/// Result type alias using draftcache-core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Message shown to end users when a commit could not be handed off.
pub const NOT_SAVED_MESSAGE: &str = "Not yet saved, please retry";

/// Core error types for workspace and write-back operations
#[derive(Error, Debug)]
pub enum Error {
    // Lookup errors
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    // Shared store errors
    #[error("Shared store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    // Input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Write-back errors
    #[error("Stale task version {task_version} (linked version is {linked_version})")]
    StaleVersion {
        task_version: i64,
        linked_version: i64,
    },

    #[error("Write failed: {0}")]
    WriteFailure(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Configuration errors
    #[error("invalid value for {field}: {message}")]
    Config { field: String, message: String },
}

impl Error {
    /// Create a not found error
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create a store unavailable error
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable(message.into())
    }

    /// Create a write failure error
    pub fn write_failure(message: impl Into<String>) -> Self {
        Self::WriteFailure(message.into())
    }

    /// Create a configuration error
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Check if this error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this error is a stale version error
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleVersion { .. })
    }

    /// Whether the caller may retry the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Timeout { .. })
    }

    /// Message suitable for the end user of the edit/commit handlers.
    pub fn user_message(&self) -> String {
        match self {
            Self::StoreUnavailable(_) | Self::Timeout { .. } => NOT_SAVED_MESSAGE.to_string(),
            Self::NotFound { entity, .. } => format!("{entity} no longer exists"),
            other => other.to_string(),
        }
    }
}
