//! Error types for the sync engine.

use crate::state::SessionState;
use possync_store::StoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// The remote could not be reached or failed transiently.
    #[error("transient network error: {0}")]
    Transient(String),

    /// Credentials were rejected by a store.
    #[error("authorization failed: {0}")]
    Unauthorized(String),

    /// A write lost a race against a concurrent edit.
    #[error("revision conflict on document {0}")]
    Conflict(String),

    /// A store rejected a malformed document.
    #[error("validation failed for {id}: {reason}")]
    Validation {
        /// Document id.
        id: String,
        /// Reason given by the store.
        reason: String,
    },

    /// A conflict resolver failed, panicked or timed out.
    #[error("conflict resolver failed for {doc_id}: {reason}")]
    Resolver {
        /// Conflicted document id.
        doc_id: String,
        /// Failure description.
        reason: String,
    },

    /// Any other store failure.
    #[error("store error: {0}")]
    Store(StoreError),

    /// Transient failures exceeded the retry budget.
    #[error("giving up after {attempts} consecutive failures: {last}")]
    RetryExhausted {
        /// Consecutive failures observed.
        attempts: u32,
        /// The last failure.
        last: String,
    },

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: SessionState,
        /// Attempted target state.
        to: SessionState,
    },

    /// Sync is switched off in the configuration.
    #[error("sync is disabled")]
    Disabled,

    /// No collection with this name was registered.
    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    /// A session is already running for the collection.
    #[error("sync already running for collection {0}")]
    AlreadyRunning(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Creates a resolver error.
    pub fn resolver(doc_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Resolver {
            doc_id: doc_id.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }

    /// Returns true if this error ends a session without retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncError::Unauthorized(_) | SyncError::RetryExhausted { .. } | SyncError::Store(_)
        )
    }

    /// Returns true if this error only affects one document.
    pub fn is_document_level(&self) -> bool {
        matches!(
            self,
            SyncError::Conflict(_) | SyncError::Validation { .. } | SyncError::Resolver { .. }
        )
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => SyncError::Transient(msg),
            StoreError::Timeout => SyncError::Transient("request timed out".into()),
            StoreError::Unauthorized(msg) => SyncError::Unauthorized(msg),
            StoreError::Conflict { id } => SyncError::Conflict(id),
            StoreError::Invalid { id, reason } => SyncError::Validation { id, reason },
            other => SyncError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::Transient("connection refused".into()).is_retryable());
        assert!(!SyncError::Unauthorized("bad password".into()).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::resolver("p1", "panicked").is_retryable());
    }

    #[test]
    fn store_error_mapping() {
        assert!(SyncError::from(StoreError::Timeout).is_retryable());
        assert!(SyncError::from(StoreError::Unauthorized("x".into())).is_terminal());
        assert_eq!(
            SyncError::from(StoreError::conflict("o1")),
            SyncError::Conflict("o1".into())
        );
        assert!(SyncError::from(StoreError::invalid("o1", "bad")).is_document_level());
    }

    #[test]
    fn error_display() {
        let err = SyncError::InvalidStateTransition {
            from: SessionState::Cancelled,
            to: SessionState::Active,
        };
        assert_eq!(
            err.to_string(),
            "invalid state transition from cancelled to active"
        );

        let err = SyncError::RetryExhausted {
            attempts: 3,
            last: "transient network error: offline".into(),
        };
        assert!(err.to_string().contains('3'));
    }
}
