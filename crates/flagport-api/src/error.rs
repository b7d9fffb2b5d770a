//! Error types for the API client
//!
//! Only transport-level failures and the fatal project collision are errors
//! here. Every other status code is returned to the caller as a response so
//! the migration state machine can decide what it means.

/// API client error
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// HTTP request failed before a response arrived
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transport-specific failure (used by non-reqwest transports)
    #[error("transport error: {0}")]
    Transport(String),

    /// Project key already taken in the destination
    #[error("project '{key}' already exists in the destination; refusing to continue")]
    ProjectConflict {
        /// Project key that collided
        key: String,
    },
}

impl ApiError {
    /// Check if error must stop the whole migration run
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ProjectConflict { .. })
    }

    /// Check if error came from the network layer
    #[inline]
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Transport(_))
    }
}

/// Result type for API operations
pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_conflict_is_fatal() {
        let err = ApiError::ProjectConflict {
            key: "platform".to_string(),
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("platform"));
    }

    #[test]
    fn transport_errors_are_not_fatal() {
        let err = ApiError::Transport("connection reset".to_string());
        assert!(err.is_transport());
        assert!(!err.is_fatal());
    }
}
