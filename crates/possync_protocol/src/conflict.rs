//! Conflict records.

use crate::document::{Document, Payload};
use crate::revision::Revision;
use serde::{Deserialize, Serialize};

/// Outcome of resolving one conflicted document.
///
/// Records are transient: they are produced per cycle for observers and
/// never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Conflicted document id.
    pub doc_id: String,
    /// Revision treated as the local side.
    pub local_revision: Option<Revision>,
    /// Local body.
    pub local_content: Payload,
    /// Revision treated as the remote side.
    pub remote_revision: Option<Revision>,
    /// Remote body.
    pub remote_content: Payload,
    /// Name of the strategy that picked the winner.
    pub strategy: String,
    /// Revision written for the winner, once stored.
    pub resolved_revision: Option<Revision>,
}

impl ConflictRecord {
    /// Creates an unresolved record for a local/remote pair.
    pub fn new(local: &Document, remote: &Document, strategy: impl Into<String>) -> Self {
        Self {
            doc_id: local.id.clone(),
            local_revision: local.revision.clone(),
            local_content: local.payload.clone(),
            remote_revision: remote.revision.clone(),
            remote_content: remote.payload.clone(),
            strategy: strategy.into(),
            resolved_revision: None,
        }
    }

    /// Returns true once the winner has been written.
    pub fn is_resolved(&self) -> bool {
        self.resolved_revision.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_from_pair() {
        let local = Document::from_value("p1", json!({"stock": 10}))
            .with_revision(Revision::new(2, "a"));
        let remote = Document::from_value("p1", json!({"stock": 7}))
            .with_revision(Revision::new(2, "b"));

        let mut record = ConflictRecord::new(&local, &remote, "remote-wins");
        assert_eq!(record.doc_id, "p1");
        assert!(!record.is_resolved());

        record.resolved_revision = Some(Revision::new(3, "c"));
        assert!(record.is_resolved());
    }
}
