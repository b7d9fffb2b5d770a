//! Error types for flagport core
//!
//! Only a few failures end a run: a project key collision, a project that
//! cannot be created, unreadable source data at the top level, and invalid
//! configuration. Per-resource failures are recorded in the run report
//! instead of being returned.

use crate::state::MigrationState;
use crate::types::ResourceType;
use flagport_api::ApiError;
use std::path::PathBuf;

/// Main migration error type
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// API client failure
    #[error("api error: {0}")]
    Api(#[from] ApiError),

    /// Source data could not be read
    #[error("source data error: {0}")]
    Source(#[from] SourceError),

    /// Conflict resolution gave up
    #[error("conflict resolution failed: {0}")]
    Conflict(#[from] ConflictError),

    /// State machine misuse
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Destination project could not be created
    #[error("project '{key}' could not be created ({status}): {message}")]
    ProjectCreateFailed {
        /// Project key
        key: String,
        /// HTTP status
        status: u16,
        /// Server message
        message: String,
    },
}

impl MigrationError {
    /// Check if error must terminate the run
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Api(err) => err.is_fatal(),
            Self::ProjectCreateFailed { .. } | Self::Config(_) | Self::Source(_) => true,
            Self::Conflict(_) | Self::State(_) => false,
        }
    }
}

/// Source data errors
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// File could not be read
    #[error("cannot read {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// File is not the expected JSON
    #[error("cannot parse {path}: {source}")]
    Json {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: serde_json::Error,
    },

    /// Document has an unexpected shape
    #[error("malformed source document {what}: {reason}")]
    Malformed {
        /// Which document
        what: String,
        /// What is wrong with it
        reason: String,
    },
}

/// Conflict resolver errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConflictError {
    /// Both the original and the prefixed key collided already
    #[error("{resource_type} '{key}' still conflicts after {attempts} creation attempts")]
    AttemptsExhausted {
        /// Resource type
        resource_type: ResourceType,
        /// Original key
        key: String,
        /// Attempts made, including this one
        attempts: u8,
    },
}

/// Invalid state transition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {from:?} -> {to:?}")]
pub struct StateError {
    /// Current state
    pub from: MigrationState,
    /// Requested state
    pub to: MigrationState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_conflict_is_fatal() {
        let err = MigrationError::from(ApiError::ProjectConflict {
            key: "platform".to_string(),
        });
        assert!(err.is_fatal());
    }

    #[test]
    fn per_resource_errors_are_not_fatal() {
        let err = MigrationError::from(ConflictError::AttemptsExhausted {
            resource_type: ResourceType::Segment,
            key: "vip".to_string(),
            attempts: 3,
        });
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("segment 'vip'"));
    }

    #[test]
    fn transport_failure_is_not_fatal() {
        let err = MigrationError::from(ApiError::Transport("reset".to_string()));
        assert!(!err.is_fatal());
    }
}
