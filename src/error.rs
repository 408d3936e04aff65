//! Error types for quillstore.
//!
//! Everything below the store/save boundary surfaces as [`Error`]; nothing
//! in non-test code panics. The taxonomy:
//!
//! - *Recoverable, logged-only*: durable-id assignment failures (the save
//!   proceeds) and single migration-step failures (the store-open path is
//!   the remaining safety net).
//! - *Recoverable, self-healing*: store-open failures, handled by
//!   backup-and-recreate inside the store coordinator.
//! - *Typed, surfaced to callers*: save failures. Pending changes are
//!   retained so the caller can retry or escalate.
//! - *Fatal*: open failure after backup-and-recreate, routed through the
//!   injectable fatal hook rather than returned.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for quillstore operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the persistence-context layer.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Could not resolve a store location: {0}")]
    StoreLocation(String),

    #[error("Failed to open store at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Migration step {from} -> {to} failed: {source}")]
    MigrationStep {
        from: String,
        to: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Store schema version {on_disk} is newer than supported version {current}")]
    NewerSchema { on_disk: i32, current: i32 },

    #[error("Failed to save context '{context}': {source}")]
    SaveFailed {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Context manager has shut down")]
    ManagerGone,

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the caller can reasonably retry the failed operation.
    ///
    /// True for save, open, and plain database failures (transient lock
    /// contention, disk pressure). False for schema downgrades and a
    /// missing store location, which need operator intervention.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::OpenFailed { .. }
                | Self::MigrationStep { .. }
                | Self::SaveFailed { .. }
                | Self::Database(_)
                | Self::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_failure_is_recoverable() {
        let err = Error::SaveFailed {
            context: "main".to_string(),
            source: rusqlite::Error::InvalidQuery,
        };
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_newer_schema_is_not_recoverable() {
        let err = Error::NewerSchema {
            on_disk: 9,
            current: 4,
        };
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("newer"));
    }
}
