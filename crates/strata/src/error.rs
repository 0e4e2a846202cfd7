//! Error types for Strata

use thiserror::Error;

/// Main error type for Strata operations
#[derive(Error, Debug)]
pub enum StrataError {
    /// Malformed input (bad ids, out-of-range scores, inconsistent positions)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Identity or content mismatch for an existing record
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A state or tier change the lifecycle does not permit
    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    /// Transient backing-store failure: pool exhausted, timeout, lost connection
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// The referenced record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Non-transient storage errors (LanceDB, schema mismatch, etc.)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StrataError {
    pub fn invalid_transition(
        id: impl Into<String>,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidTransition {
            id: id.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Only transient store failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result type alias for Strata operations
pub type Result<T> = std::result::Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(StrataError::Unavailable("pool exhausted".into()).is_retryable());
        assert!(!StrataError::Validation("bad".into()).is_retryable());
        assert!(!StrataError::Conflict("differs".into()).is_retryable());
        assert!(!StrataError::Storage("disk".into()).is_retryable());
        assert!(!StrataError::invalid_transition("c1", "completed", "pending").is_retryable());
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = StrataError::invalid_transition("c1", "completed", "pending");
        assert_eq!(err.to_string(), "Invalid transition for c1: completed -> pending");
    }
}
