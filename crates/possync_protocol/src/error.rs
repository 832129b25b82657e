//! Error types for protocol parsing.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while parsing protocol values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A revision token did not have the `<generation>-<digest>` shape.
    #[error("invalid revision token: {0:?}")]
    InvalidRevision(String),

    /// A checkpoint could not be interpreted by the store.
    #[error("invalid checkpoint: {0:?}")]
    InvalidCheckpoint(String),

    /// A JSON document was malformed.
    #[error("invalid document: {0}")]
    InvalidDocument(String),
}
