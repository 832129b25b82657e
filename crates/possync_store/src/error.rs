//! Error types for store operations.

use possync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The document does not exist or its winning revision is a tombstone.
    #[error("document not found: {id}")]
    NotFound {
        /// Requested id.
        id: String,
    },

    /// The expected revision did not match the stored one.
    #[error("revision conflict on document {id}")]
    Conflict {
        /// Conflicted id.
        id: String,
    },

    /// Credentials were rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The store rejected a malformed document.
    #[error("invalid document {id}: {reason}")]
    Invalid {
        /// Rejected id.
        id: String,
        /// Reason given by the store.
        reason: String,
    },

    /// The store could not be reached or failed transiently.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The request timed out.
    #[error("store request timed out")]
    Timeout,

    /// The store answered with something unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl StoreError {
    /// Creates an invalid-document error.
    pub fn invalid(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Creates a conflict error.
    pub fn conflict(id: impl Into<String>) -> Self {
        Self::Conflict { id: id.into() }
    }

    /// Returns true if retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout)
    }

    /// Returns true if this is a stale-revision write.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    /// Returns true if the document is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

impl From<ProtocolError> for StoreError {
    fn from(err: ProtocolError) -> Self {
        StoreError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(StoreError::Unavailable("connection refused".into()).is_transient());
        assert!(StoreError::Timeout.is_transient());
        assert!(!StoreError::Unauthorized("bad password".into()).is_transient());
        assert!(!StoreError::conflict("p1").is_transient());
    }

    #[test]
    fn error_display() {
        let err = StoreError::invalid("o1", "missing total");
        assert_eq!(err.to_string(), "invalid document o1: missing total");
        assert!(StoreError::not_found("x").is_not_found());
    }
}
