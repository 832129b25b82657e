//! Document store trait definition.

use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use possync_protocol::{ChangesBatch, Checkpoint, Document, Revision};
use std::time::Duration;

/// How `bulk_put` interprets the revisions of incoming documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkMode {
    /// Each document is an edit; its `revision` is the expected current
    /// revision and the store assigns a new one.
    NewEdits,
    /// Each document is a replicated revision inserted as-is. Known
    /// revisions are skipped; unknown ones extend their ancestor leaf or
    /// open a conflicting branch.
    Replicate,
}

/// Per-document outcome of a bulk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteStatus {
    /// The revision was stored.
    Written(Revision),
    /// The store already held this revision; nothing changed.
    AlreadyPresent(Revision),
    /// The store rejected this document.
    Rejected(StoreError),
}

/// Result of one document in a bulk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocWriteResult {
    /// Document id.
    pub id: String,
    /// Outcome.
    pub status: WriteStatus,
}

impl DocWriteResult {
    /// Returns true if the destination now holds the revision.
    pub fn is_acknowledged(&self) -> bool {
        matches!(
            self.status,
            WriteStatus::Written(_) | WriteStatus::AlreadyPresent(_)
        )
    }
}

/// All leaf revisions of one document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentLeaves {
    /// Document id.
    pub id: String,
    /// Leaves, winner first. Empty if the document is unknown.
    pub leaves: Vec<Document>,
}

impl DocumentLeaves {
    /// Returns the winning leaf.
    pub fn winner(&self) -> Option<&Document> {
        self.leaves.first()
    }

    /// Returns the live, non-winning leaves.
    pub fn conflicts(&self) -> impl Iterator<Item = &Document> {
        self.leaves.iter().skip(1).filter(|doc| !doc.deleted)
    }

    /// Returns true if there is more than one live leaf.
    pub fn is_conflicted(&self) -> bool {
        self.conflicts().next().is_some()
    }
}

/// Parameters for reading a changes feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangesRequest {
    /// Maximum number of changes returned.
    pub limit: usize,
    /// If nothing is pending, wait up to `timeout` for the next change.
    pub live: bool,
    /// Wait bound for live requests.
    pub timeout: Duration,
}

impl ChangesRequest {
    /// A one-shot read of up to `limit` changes.
    pub fn batch(limit: usize) -> Self {
        Self {
            limit,
            live: false,
            timeout: Duration::ZERO,
        }
    }

    /// A long-poll read that waits up to `timeout` for new changes.
    pub fn live(limit: usize, timeout: Duration) -> Self {
        Self {
            limit,
            live: true,
            timeout,
        }
    }
}

/// A revision-tracked document store for one collection.
///
/// # Invariants
///
/// - Every successful write produces a new revision
/// - `put` with a stale expected revision fails with [`StoreError::Conflict`]
/// - Replicated writes of known revisions change nothing and do not appear
///   in the changes feed again
/// - The changes feed reports each document once, at its latest sequence
/// - Implementations must be `Send + Sync`; handles are shared across tasks
///
/// # Implementors
///
/// - [`crate::MemoryStore`] - In-process revision tree
/// - [`crate::HttpStore`] - CouchDB-compatible HTTP remote
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Name of the collection or database this store serves.
    fn name(&self) -> &str;

    /// Returns the winning revision of a document.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the document is missing or deleted.
    async fn get(&self, id: &str) -> StoreResult<Document>;

    /// Writes a document on top of `expected`.
    ///
    /// `expected` must be the current winning revision, or `None` when the
    /// document does not exist (or is deleted).
    async fn put(&self, doc: Document, expected: Option<&Revision>) -> StoreResult<Revision>;

    /// Returns every leaf revision for each id, in request order.
    async fn bulk_get(&self, ids: &[String]) -> StoreResult<Vec<DocumentLeaves>>;

    /// Writes many documents; one result per input, in order.
    ///
    /// Rejections of individual documents are reported per document; only
    /// failures of the whole request are returned as `Err`.
    async fn bulk_put(&self, docs: Vec<Document>, mode: BulkMode)
        -> StoreResult<Vec<DocWriteResult>>;

    /// Tombstones the leaf `revision` of a document.
    async fn remove(&self, id: &str, revision: &Revision) -> StoreResult<Revision>;

    /// Returns the `(id, revision)` pairs this store does not hold yet.
    async fn revs_diff(&self, revs: &[(String, Revision)]) -> StoreResult<Vec<(String, Revision)>>;

    /// Reads changes recorded after `since`.
    async fn changes(&self, since: &Checkpoint, request: ChangesRequest)
        -> StoreResult<ChangesBatch>;
}
