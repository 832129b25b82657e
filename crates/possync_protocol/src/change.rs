//! Change feed types.

use crate::error::{ProtocolError, ProtocolResult};
use crate::revision::Revision;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Cursor marking how much of a source's change history has been consumed.
///
/// Checkpoints are opaque to the engine; only the issuing store interprets
/// them. The empty history is represented by `"0"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint(String);

impl Checkpoint {
    /// The checkpoint before any change.
    pub fn zero() -> Self {
        Self("0".into())
    }

    /// Wraps a store-issued sequence token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Interprets the token as a numeric sequence.
    pub fn as_sequence(&self) -> ProtocolResult<u64> {
        self.0
            .parse()
            .map_err(|_| ProtocolError::InvalidCheckpoint(self.0.clone()))
    }

    /// Returns true if this is the start of history.
    pub fn is_zero(&self) -> bool {
        self.0 == "0"
    }
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::zero()
    }
}

impl From<u64> for Checkpoint {
    fn from(seq: u64) -> Self {
        Self(seq.to_string())
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single entry of a store's changes feed.
///
/// One event is reported per document: the latest change, carrying the
/// winning revision and any conflicting (non-winning, live) leaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Sequence at which the change was recorded.
    pub seq: Checkpoint,
    /// Document id.
    pub id: String,
    /// Winning revision after the change.
    pub revision: Revision,
    /// True if the winning revision is a tombstone.
    #[serde(default)]
    pub deleted: bool,
    /// Conflicting live revisions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<Revision>,
}

impl ChangeEvent {
    /// Returns true if the document currently has conflicting revisions.
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// A batch read from a changes feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesBatch {
    /// Changes in sequence order.
    pub results: Vec<ChangeEvent>,
    /// Checkpoint to resume from after this batch.
    pub last_seq: Checkpoint,
    /// Number of changes still pending after this batch.
    #[serde(default)]
    pub pending: u64,
}

impl ChangesBatch {
    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Returns true if more changes are waiting to be read.
    pub fn has_more(&self) -> bool {
        self.pending > 0
    }
}
