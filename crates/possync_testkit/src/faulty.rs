//! Fault injection for store tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use possync_protocol::{ChangesBatch, Checkpoint, Document, Revision};
use possync_store::{
    BulkMode, ChangesRequest, DocWriteResult, DocumentLeaves, DocumentStore, StoreError,
    StoreResult,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Wraps a store and fails calls according to a script.
///
/// Scripted failures are consumed first, one per call; after that a
/// persistent failure (if set) applies to every call. Every call, failed
/// or not, is counted.
pub struct FaultyStore<S> {
    inner: S,
    scripted: Mutex<VecDeque<StoreError>>,
    persistent: Mutex<Option<StoreError>>,
    calls: AtomicUsize,
}

impl<S: DocumentStore> FaultyStore<S> {
    /// Wraps `inner` with no faults scheduled.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            scripted: Mutex::new(VecDeque::new()),
            persistent: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    /// Fails the next `count` calls with `error`.
    pub fn fail_next(&self, count: usize, error: StoreError) {
        let mut scripted = self.scripted.lock();
        for _ in 0..count {
            scripted.push_back(error.clone());
        }
    }

    /// Fails every call with `error` until [`heal`](Self::heal).
    pub fn fail_always(&self, error: StoreError) {
        *self.persistent.lock() = Some(error);
    }

    /// Removes every scheduled fault.
    pub fn heal(&self) {
        self.scripted.lock().clear();
        *self.persistent.lock() = None;
    }

    /// Number of calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Returns the wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn check(&self) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.scripted.lock().pop_front() {
            return Err(err);
        }
        match self.persistent.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<S: DocumentStore> DocumentStore for FaultyStore<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, id: &str) -> StoreResult<Document> {
        self.check()?;
        self.inner.get(id).await
    }

    async fn put(&self, doc: Document, expected: Option<&Revision>) -> StoreResult<Revision> {
        self.check()?;
        self.inner.put(doc, expected).await
    }

    async fn bulk_get(&self, ids: &[String]) -> StoreResult<Vec<DocumentLeaves>> {
        self.check()?;
        self.inner.bulk_get(ids).await
    }

    async fn bulk_put(
        &self,
        docs: Vec<Document>,
        mode: BulkMode,
    ) -> StoreResult<Vec<DocWriteResult>> {
        self.check()?;
        self.inner.bulk_put(docs, mode).await
    }

    async fn remove(&self, id: &str, revision: &Revision) -> StoreResult<Revision> {
        self.check()?;
        self.inner.remove(id, revision).await
    }

    async fn revs_diff(&self, revs: &[(String, Revision)]) -> StoreResult<Vec<(String, Revision)>> {
        self.check()?;
        self.inner.revs_diff(revs).await
    }

    async fn changes(
        &self,
        since: &Checkpoint,
        request: ChangesRequest,
    ) -> StoreResult<ChangesBatch> {
        self.check()?;
        self.inner.changes(since, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use possync_store::MemoryStore;

    #[tokio::test]
    async fn scripted_then_persistent() {
        let store = FaultyStore::new(MemoryStore::new("orders"));
        store.fail_next(1, StoreError::Timeout);

        assert_eq!(store.get("o1").await.unwrap_err(), StoreError::Timeout);
        assert!(store.get("o1").await.unwrap_err().is_not_found());

        store.fail_always(StoreError::Unauthorized("denied".into()));
        assert!(matches!(
            store.get("o1").await.unwrap_err(),
            StoreError::Unauthorized(_)
        ));

        store.heal();
        assert!(store.get("o1").await.unwrap_err().is_not_found());
        assert_eq!(store.calls(), 4);
    }
}
