//! In-memory revision-tree store.

use crate::error::{StoreError, StoreResult};
use crate::store::{
    BulkMode, ChangesRequest, DocWriteResult, DocumentLeaves, DocumentStore, WriteStatus,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use possync_protocol::{ChangeEvent, ChangesBatch, Checkpoint, Document, Payload, Revision};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Validation hook run on every non-deleted document before it is stored.
pub type Validator = Arc<dyn Fn(&Document) -> Result<(), String> + Send + Sync>;

/// Revision tree of one document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DocTree {
    /// Leaves, winner first.
    leaves: Vec<Document>,
    /// Every revision ever seen for this document.
    known: BTreeSet<Revision>,
    /// Sequence of the latest change.
    seq: u64,
}

impl DocTree {
    fn winner(&self) -> Option<&Document> {
        self.leaves.first()
    }

    fn conflicts(&self) -> Vec<Revision> {
        self.leaves
            .iter()
            .skip(1)
            .filter(|leaf| !leaf.deleted)
            .filter_map(|leaf| leaf.revision.clone())
            .collect()
    }

    /// Live leaves come first, highest revision wins.
    fn sort(&mut self) {
        self.leaves.sort_by(|a, b| {
            a.deleted
                .cmp(&b.deleted)
                .then_with(|| b.revision.cmp(&a.revision))
        });
    }

    /// Adds `doc` as a leaf, replacing any leaf it descends from.
    fn extend(&mut self, doc: Document) {
        self.leaves.retain(|leaf| {
            leaf.revision
                .as_ref()
                .map_or(true, |rev| !doc.history.contains(rev))
        });
        for rev in doc.lineage() {
            self.known.insert(rev.clone());
        }
        self.leaves.push(doc);
        self.sort();
    }
}

#[derive(Debug, Default)]
struct Inner {
    docs: HashMap<String, DocTree>,
    by_seq: BTreeMap<u64, String>,
    seq: u64,
}

impl Inner {
    /// Records a change of `id` at a fresh sequence.
    fn touch(&mut self, id: &str) -> u64 {
        self.seq += 1;
        let seq = self.seq;
        if let Some(tree) = self.docs.get_mut(id) {
            if tree.seq != 0 {
                self.by_seq.remove(&tree.seq);
            }
            tree.seq = seq;
        }
        self.by_seq.insert(seq, id.to_string());
        seq
    }

    fn edit(&mut self, doc: Document, expected: Option<&Revision>) -> StoreResult<Revision> {
        let winner = self
            .docs
            .get(&doc.id)
            .and_then(DocTree::winner)
            .cloned();

        let parent = match winner {
            Some(w) if !w.deleted => {
                if expected != w.revision.as_ref() {
                    return Err(StoreError::conflict(&doc.id));
                }
                Some(w)
            }
            // Recreating over a tombstone continues its branch.
            Some(w) => match expected {
                None => Some(w),
                Some(rev) if Some(rev) == w.revision.as_ref() => Some(w),
                Some(_) => return Err(StoreError::conflict(&doc.id)),
            },
            None if expected.is_some() => return Err(StoreError::conflict(&doc.id)),
            None => None,
        };

        let (stored, rev) = derive_child(parent.as_ref(), doc.id.clone(), false, doc.payload);
        self.insert_edit(stored);
        Ok(rev)
    }

    fn tombstone(&mut self, id: &str, revision: &Revision) -> StoreResult<Revision> {
        let tree = self.docs.get(id).ok_or_else(|| StoreError::not_found(id))?;
        let leaf = tree
            .leaves
            .iter()
            .find(|leaf| !leaf.deleted && leaf.revision.as_ref() == Some(revision))
            .cloned()
            .ok_or_else(|| StoreError::conflict(id))?;

        let (stored, rev) = derive_child(Some(&leaf), id.to_string(), true, Payload::new());
        self.insert_edit(stored);
        Ok(rev)
    }

    fn insert_edit(&mut self, stored: Document) {
        let id = stored.id.clone();
        self.docs.entry(id.clone()).or_default().extend(stored);
        self.touch(&id);
    }

    fn replicate(&mut self, doc: Document) -> StoreResult<WriteStatus> {
        let rev = doc
            .revision
            .clone()
            .ok_or_else(|| StoreError::invalid(&doc.id, "replicated document has no revision"))?;

        let id = doc.id.clone();
        let tree = self.docs.entry(id.clone()).or_default();
        if tree.known.contains(&rev) {
            return Ok(WriteStatus::AlreadyPresent(rev));
        }
        tree.extend(doc);
        self.touch(&id);
        Ok(WriteStatus::Written(rev))
    }

    fn changes_since(&self, since: u64, limit: usize) -> ChangesBatch {
        let mut results = Vec::new();
        let mut last = since;
        let mut remaining = self.by_seq.range(since + 1..);

        for (seq, id) in remaining.by_ref().take(limit.max(1)) {
            let Some(tree) = self.docs.get(id) else {
                continue;
            };
            let Some(winner) = tree.winner() else {
                continue;
            };
            let Some(revision) = winner.revision.clone() else {
                continue;
            };
            results.push(ChangeEvent {
                seq: Checkpoint::from(*seq),
                id: id.clone(),
                revision,
                deleted: winner.deleted,
                conflicts: tree.conflicts(),
            });
            last = *seq;
        }

        ChangesBatch {
            results,
            last_seq: Checkpoint::from(last),
            pending: remaining.count() as u64,
        }
    }
}

fn derive_child(
    parent: Option<&Document>,
    id: String,
    deleted: bool,
    payload: Payload,
) -> (Document, Revision) {
    let parent_rev = parent.and_then(|p| p.revision.as_ref());
    let revision = Revision::derive(parent_rev, deleted, &payload);
    let mut doc = Document {
        id,
        revision: Some(revision.clone()),
        deleted,
        payload,
        history: Vec::new(),
    };
    if let (Some(parent), Some(parent_rev)) = (parent, parent_rev) {
        doc.push_ancestor(parent_rev.clone(), &parent.history);
    }
    (doc, revision)
}

/// Serializable image of a [`MemoryStore`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemorySnapshot {
    /// Latest sequence.
    pub seq: u64,
    docs: BTreeMap<String, DocTree>,
}

impl MemorySnapshot {
    /// Number of documents, including deleted ones.
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// Returns true if the snapshot holds no documents.
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

/// Document counts of a [`MemoryStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    /// Documents whose winner is live.
    pub documents: usize,
    /// Documents whose winner is a tombstone.
    pub tombstones: usize,
    /// Documents with more than one live leaf.
    pub conflicted: usize,
    /// Latest sequence.
    pub update_seq: u64,
}

/// An in-memory, revision-tracked document store.
///
/// Suitable for:
/// - The terminal-side local store
/// - Unit and integration tests (as either side)
///
/// # Thread Safety
///
/// The store is `Send + Sync`; share it as `Arc<MemoryStore>`.
pub struct MemoryStore {
    name: String,
    inner: RwLock<Inner>,
    seq_tx: watch::Sender<u64>,
    validator: Option<Validator>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new(name: impl Into<String>) -> Self {
        let (seq_tx, _) = watch::channel(0);
        Self {
            name: name.into(),
            inner: RwLock::new(Inner::default()),
            seq_tx,
            validator: None,
        }
    }

    /// Restores a store from a snapshot.
    pub fn from_snapshot(name: impl Into<String>, snapshot: MemorySnapshot) -> Self {
        let mut inner = Inner {
            seq: snapshot.seq,
            ..Inner::default()
        };
        for (id, tree) in snapshot.docs {
            if tree.seq != 0 {
                inner.by_seq.insert(tree.seq, id.clone());
            }
            inner.docs.insert(id, tree);
        }
        let (seq_tx, _) = watch::channel(inner.seq);
        Self {
            name: name.into(),
            inner: RwLock::new(inner),
            seq_tx,
            validator: None,
        }
    }

    /// Installs a validator that rejects malformed documents.
    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Captures the current contents.
    pub fn snapshot(&self) -> MemorySnapshot {
        let inner = self.inner.read();
        MemorySnapshot {
            seq: inner.seq,
            docs: inner
                .docs
                .iter()
                .map(|(id, tree)| (id.clone(), tree.clone()))
                .collect(),
        }
    }

    /// Returns document counts.
    pub fn stats(&self) -> MemoryStats {
        let inner = self.inner.read();
        let mut stats = MemoryStats {
            update_seq: inner.seq,
            ..MemoryStats::default()
        };
        for tree in inner.docs.values() {
            match tree.winner() {
                Some(w) if w.deleted => stats.tombstones += 1,
                Some(_) => stats.documents += 1,
                None => {}
            }
            if !tree.conflicts().is_empty() {
                stats.conflicted += 1;
            }
        }
        stats
    }

    /// Returns all leaves of a document, winner first.
    pub fn leaves(&self, id: &str) -> Vec<Document> {
        self.inner
            .read()
            .docs
            .get(id)
            .map(|tree| tree.leaves.clone())
            .unwrap_or_default()
    }

    /// Returns the latest sequence.
    pub fn update_seq(&self) -> u64 {
        self.inner.read().seq
    }

    fn validate(&self, doc: &Document) -> StoreResult<()> {
        if doc.id.is_empty() || doc.id.starts_with('_') {
            return Err(StoreError::invalid(&doc.id, "reserved or empty id"));
        }
        if doc.deleted {
            return Ok(());
        }
        if let Some(validator) = &self.validator {
            validator(doc).map_err(|reason| StoreError::invalid(&doc.id, reason))?;
        }
        Ok(())
    }

    fn publish(&self) {
        let seq = self.inner.read().seq;
        self.seq_tx.send_replace(seq);
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("name", &self.name)
            .field("update_seq", &self.update_seq())
            .finish()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, id: &str) -> StoreResult<Document> {
        self.inner
            .read()
            .docs
            .get(id)
            .and_then(DocTree::winner)
            .filter(|doc| !doc.deleted)
            .cloned()
            .ok_or_else(|| StoreError::not_found(id))
    }

    async fn put(&self, doc: Document, expected: Option<&Revision>) -> StoreResult<Revision> {
        self.validate(&doc)?;
        let result = if doc.deleted {
            let rev = expected.ok_or_else(|| StoreError::conflict(&doc.id))?;
            self.inner.write().tombstone(&doc.id, rev)
        } else {
            self.inner.write().edit(doc, expected)
        };
        if result.is_ok() {
            self.publish();
        }
        result
    }

    async fn bulk_get(&self, ids: &[String]) -> StoreResult<Vec<DocumentLeaves>> {
        let inner = self.inner.read();
        Ok(ids
            .iter()
            .map(|id| DocumentLeaves {
                id: id.clone(),
                leaves: inner
                    .docs
                    .get(id)
                    .map(|tree| tree.leaves.clone())
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn bulk_put(
        &self,
        docs: Vec<Document>,
        mode: BulkMode,
    ) -> StoreResult<Vec<DocWriteResult>> {
        let mut results = Vec::with_capacity(docs.len());
        let mut changed = false;
        {
            let mut inner = self.inner.write();
            for doc in docs {
                let id = doc.id.clone();
                let outcome = self.validate(&doc).and_then(|()| match mode {
                    BulkMode::Replicate => inner.replicate(doc),
                    BulkMode::NewEdits => {
                        let expected = doc.revision.clone();
                        if doc.deleted {
                            match expected {
                                Some(rev) => inner.tombstone(&id, &rev).map(WriteStatus::Written),
                                None => Err(StoreError::conflict(&id)),
                            }
                        } else {
                            inner.edit(doc, expected.as_ref()).map(WriteStatus::Written)
                        }
                    }
                });
                let status = match outcome {
                    Ok(status) => status,
                    Err(err) => {
                        debug!(store = %self.name, doc_id = %id, error = %err, "bulk write rejected document");
                        WriteStatus::Rejected(err)
                    }
                };
                changed |= matches!(status, WriteStatus::Written(_));
                results.push(DocWriteResult { id, status });
            }
        }
        if changed {
            self.publish();
        }
        Ok(results)
    }

    async fn remove(&self, id: &str, revision: &Revision) -> StoreResult<Revision> {
        let rev = self.inner.write().tombstone(id, revision)?;
        self.publish();
        Ok(rev)
    }

    async fn revs_diff(&self, revs: &[(String, Revision)]) -> StoreResult<Vec<(String, Revision)>> {
        let inner = self.inner.read();
        Ok(revs
            .iter()
            .filter(|(id, rev)| {
                inner
                    .docs
                    .get(id)
                    .map_or(true, |tree| !tree.known.contains(rev))
            })
            .cloned()
            .collect())
    }

    async fn changes(
        &self,
        since: &Checkpoint,
        request: ChangesRequest,
    ) -> StoreResult<ChangesBatch> {
        let since_seq = since.as_sequence()?;
        // Subscribe before reading so a write in between still wakes us.
        let mut rx = self.seq_tx.subscribe();

        let batch = self.inner.read().changes_since(since_seq, request.limit);
        if !batch.is_empty() || !request.live {
            return Ok(batch);
        }

        let woke = matches!(
            tokio::time::timeout(request.timeout, rx.wait_for(|seq| *seq > since_seq)).await,
            Ok(Ok(_))
        );
        if !woke {
            return Ok(batch);
        }
        Ok(self.inner.read().changes_since(since_seq, request.limit))
    }
}
