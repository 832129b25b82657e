//! Coalescing queue for local writes.
//!
//! Terminals edit hot documents (stock counters, open orders) many times
//! between cycles. The queue keeps one pending write per id, holding the
//! first expected revision and the latest content, and writes them in one
//! batch on a schedule, when full, or when a cycle asks for it.
//!
//! An edit whose expected revision is no longer the winner, typically
//! because a pull replaced it, is not dropped: it is stored as a branch on
//! top of the revision it was made against, so the document becomes
//! conflicted and the resolver merges it like any other concurrent edit.

use crate::config::millis;
use crate::error::SyncResult;
use parking_lot::Mutex;
use possync_protocol::{BatchResult, Document, Revision};
use possync_store::{BulkMode, DocumentStore, WriteStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Configuration for a [`WriteQueue`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteQueueConfig {
    /// Pending ids that trigger an immediate flush.
    pub capacity: usize,
    /// Period of the background flush.
    #[serde(rename = "flush_interval_ms", with = "millis")]
    pub flush_interval: Duration,
}

impl WriteQueueConfig {
    /// Sets the capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the flush interval.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }
}

impl Default for WriteQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            flush_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingWrite {
    expected: Option<Revision>,
    doc: Document,
}

/// Bounded, coalescing buffer of local edits.
pub struct WriteQueue {
    collection: String,
    store: Arc<dyn DocumentStore>,
    config: WriteQueueConfig,
    pending: Mutex<Vec<PendingWrite>>,
    flushing: tokio::sync::Mutex<()>,
    shutdown: watch::Sender<bool>,
}

impl WriteQueue {
    /// Creates a queue writing into `store`.
    pub fn new(
        collection: impl Into<String>,
        store: Arc<dyn DocumentStore>,
        config: WriteQueueConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            collection: collection.into(),
            store,
            config,
            pending: Mutex::new(Vec::new()),
            flushing: tokio::sync::Mutex::new(()),
            shutdown,
        }
    }

    /// Number of pending documents.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Queues an edit of `doc` on top of `expected`.
    ///
    /// A later edit of the same id replaces the queued content but keeps the
    /// first expected revision. Flushes when the queue reaches capacity.
    pub async fn enqueue(&self, doc: Document, expected: Option<Revision>) -> SyncResult<()> {
        let full = {
            let mut pending = self.pending.lock();
            match pending.iter_mut().find(|w| w.doc.id == doc.id) {
                Some(existing) => existing.doc = doc,
                None => pending.push(PendingWrite { expected, doc }),
            }
            pending.len() >= self.config.capacity
        };
        if full {
            self.flush().await?;
        }
        Ok(())
    }

    /// Writes every pending edit in one batch.
    ///
    /// Stale edits become conflicting leaves. Other rejected documents are
    /// reported in the result and dropped. If a write fails as a whole the
    /// affected edits are queued again.
    pub async fn flush(&self) -> SyncResult<BatchResult> {
        let _guard = self.flushing.lock().await;
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return Ok(BatchResult::default());
        }

        let docs: Vec<Document> = batch
            .iter()
            .map(|w| Document {
                revision: w.expected.clone(),
                history: Vec::new(),
                ..w.doc.clone()
            })
            .collect();
        let mut result = BatchResult {
            docs_read: docs.len() as u64,
            ..BatchResult::default()
        };

        let writes = match self.store.bulk_put(docs, BulkMode::NewEdits).await {
            Ok(writes) => writes,
            Err(err) => {
                self.requeue(batch);
                return Err(err.into());
            }
        };

        let mut stale = Vec::new();
        for write in writes {
            match write.status {
                WriteStatus::Written(_) | WriteStatus::AlreadyPresent(_) => {
                    result.docs_written += 1
                }
                WriteStatus::Rejected(err) if err.is_conflict() => {
                    if let Some(pending) = batch.iter().find(|w| w.doc.id == write.id && !w.doc.deleted) {
                        stale.push(pending.clone());
                    } else {
                        result.record_failure(&write.id, err);
                    }
                }
                WriteStatus::Rejected(err) => {
                    warn!(collection = %self.collection, doc_id = %write.id, error = %err, "queued write rejected");
                    result.record_failure(&write.id, err);
                }
            }
        }

        if !stale.is_empty() {
            if let Err(err) = self.write_branches(&stale, &mut result).await {
                self.requeue(stale);
                return Err(err);
            }
        }

        debug!(
            collection = %self.collection,
            written = result.docs_written,
            failed = result.doc_write_failures,
            "write queue flushed"
        );
        Ok(result)
    }

    /// Stores stale edits as leaves branching off their expected revision.
    async fn write_branches(
        &self,
        stale: &[PendingWrite],
        result: &mut BatchResult,
    ) -> SyncResult<()> {
        let ids: Vec<String> = stale.iter().map(|w| w.doc.id.clone()).collect();
        let trees = self.store.bulk_get(&ids).await?;

        let branches: Vec<Document> = stale
            .iter()
            .map(|write| {
                let ancestors = match (&write.expected, trees.iter().find(|t| t.id == write.doc.id)) {
                    (Some(parent), Some(tree)) => ancestors_of(parent, &tree.leaves),
                    _ => Vec::new(),
                };
                let mut doc = Document {
                    revision: Some(Revision::derive(
                        write.expected.as_ref(),
                        false,
                        &write.doc.payload,
                    )),
                    history: Vec::new(),
                    ..write.doc.clone()
                };
                if let Some(parent) = &write.expected {
                    doc.push_ancestor(parent.clone(), &ancestors);
                }
                doc
            })
            .collect();

        for write in self.store.bulk_put(branches, BulkMode::Replicate).await? {
            match write.status {
                WriteStatus::Written(_) | WriteStatus::AlreadyPresent(_) => {
                    debug!(collection = %self.collection, doc_id = %write.id, "stale queued write kept as a conflicting leaf");
                    result.docs_written += 1;
                }
                WriteStatus::Rejected(err) => {
                    warn!(collection = %self.collection, doc_id = %write.id, error = %err, "queued write rejected");
                    result.record_failure(&write.id, err);
                }
            }
        }
        Ok(())
    }

    /// Puts a failed batch back in front of anything queued since.
    fn requeue(&self, batch: Vec<PendingWrite>) {
        let mut pending = self.pending.lock();
        let newer = std::mem::take(&mut *pending);
        *pending = batch;
        for write in newer {
            match pending.iter_mut().find(|w| w.doc.id == write.doc.id) {
                Some(existing) => existing.doc = write.doc,
                None => pending.push(write),
            }
        }
    }

    /// Starts the periodic background flush.
    pub fn spawn_flusher(self: &Arc<Self>) -> JoinHandle<()> {
        self.shutdown.send_replace(false);
        let queue = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(queue.config.flush_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if queue.is_empty() {
                            continue;
                        }
                        if let Err(err) = queue.flush().await {
                            warn!(collection = %queue.collection, error = %err, "scheduled flush failed");
                        }
                    }
                    _ = async {
                        let _ = shutdown.wait_for(|stop| *stop).await;
                    } => break,
                }
            }
        })
    }

    /// Stops the background flush started by [`spawn_flusher`](Self::spawn_flusher).
    pub fn stop_flusher(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Ancestors of `revision`, newest first, as recorded by the leaves that
/// still know it.
fn ancestors_of(revision: &Revision, leaves: &[Document]) -> Vec<Revision> {
    for leaf in leaves {
        if leaf.revision.as_ref() == Some(revision) {
            return leaf.history.clone();
        }
        if let Some(pos) = leaf.history.iter().position(|rev| rev == revision) {
            return leaf.history[pos + 1..].to_vec();
        }
    }
    Vec::new()
}

impl std::fmt::Debug for WriteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteQueue")
            .field("collection", &self.collection)
            .field("pending", &self.len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use possync_store::{MemoryStore, StoreError};
    use possync_testkit::FaultyStore;
    use serde_json::json;

    fn stock(id: &str, n: i64) -> Document {
        Document::from_value(id, json!({"name": "Aspirin", "stock": n}))
    }

    #[tokio::test]
    async fn coalesces_by_id() {
        let store = Arc::new(MemoryStore::new("products"));
        let rev = store.put(stock("p1", 10), None).await.unwrap();
        let queue = WriteQueue::new("products", store.clone(), WriteQueueConfig::default());

        queue.enqueue(stock("p1", 9), Some(rev.clone())).await.unwrap();
        queue.enqueue(stock("p1", 8), Some(Revision::new(9, "ignored"))).await.unwrap();
        queue.enqueue(stock("p2", 1), None).await.unwrap();
        assert_eq!(queue.len(), 2);

        let result = queue.flush().await.unwrap();
        assert_eq!(result.docs_written, 2);
        assert!(queue.is_empty());

        let p1 = store.get("p1").await.unwrap();
        assert_eq!(p1.i64_field("stock"), Some(8));
        assert_eq!(p1.revision.unwrap().generation(), 2);
    }

    #[tokio::test]
    async fn flushes_at_capacity() {
        let store = Arc::new(MemoryStore::new("products"));
        let config = WriteQueueConfig::default().with_capacity(2);
        let queue = WriteQueue::new("products", store.clone(), config);

        queue.enqueue(stock("p1", 1), None).await.unwrap();
        assert_eq!(store.stats().documents, 0);
        queue.enqueue(stock("p2", 1), None).await.unwrap();
        assert_eq!(store.stats().documents, 2);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn stale_edit_becomes_conflicting_leaf() {
        let store = Arc::new(MemoryStore::new("products"));
        let base = store.put(stock("p1", 12), None).await.unwrap();
        let queue = WriteQueue::new("products", store.clone(), WriteQueueConfig::default());

        // The sale is queued, then a pull moves the winner on.
        queue.enqueue(stock("p1", 10), Some(base.clone())).await.unwrap();
        let pulled = Document::from_value("p1", json!({"name": "Aspirin 500mg", "stock": 12}));
        store.put(pulled, Some(&base)).await.unwrap();

        let result = queue.flush().await.unwrap();
        assert!(result.ok());
        assert_eq!(result.docs_written, 1);
        assert!(queue.is_empty());

        let leaves = store.leaves("p1");
        assert_eq!(leaves.len(), 2);
        let sale = leaves
            .iter()
            .find(|leaf| leaf.i64_field("stock") == Some(10))
            .unwrap();
        assert_eq!(sale.history.first(), Some(&base));
        assert_eq!(sale.revision.as_ref().unwrap().generation(), 2);
    }

    #[tokio::test]
    async fn invalid_edit_is_reported() {
        let store = Arc::new(MemoryStore::new("products").with_validator(Arc::new(
            |doc: &Document| match doc.i64_field("stock") {
                Some(n) if n < 0 => Err("negative stock".to_string()),
                _ => Ok(()),
            },
        )));
        let queue = WriteQueue::new("products", store.clone(), WriteQueueConfig::default());

        queue.enqueue(stock("p1", -1), None).await.unwrap();
        let result = queue.flush().await.unwrap();
        assert_eq!(result.doc_write_failures, 1);
        assert!(!result.ok());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn failed_flush_requeues() {
        let store = Arc::new(FaultyStore::new(MemoryStore::new("products")));
        store.fail_next(1, StoreError::Timeout);
        let queue = WriteQueue::new("products", store.clone(), WriteQueueConfig::default());

        queue.enqueue(stock("p1", 1), None).await.unwrap();
        assert!(queue.flush().await.unwrap_err().is_retryable());
        assert_eq!(queue.len(), 1);

        queue.flush().await.unwrap();
        assert!(store.inner().get("p1").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn background_flush() {
        let store = Arc::new(MemoryStore::new("products"));
        let config = WriteQueueConfig::default().with_flush_interval(Duration::from_millis(100));
        let queue = Arc::new(WriteQueue::new("products", store.clone(), config));
        let flusher = queue.spawn_flusher();

        queue.enqueue(stock("p1", 1), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(store.get("p1").await.is_ok());

        queue.stop_flusher();
        flusher.await.unwrap();
    }
}
