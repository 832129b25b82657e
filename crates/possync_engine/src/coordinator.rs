//! Replication coordinator.
//!
//! A cycle is pull then push:
//!
//! 1. Retry conflicts left unresolved by earlier cycles
//! 2. Pull: read the remote feed, copy the revisions the local store lacks,
//!    resolve every document that became conflicted, advance the pull
//!    checkpoint
//! 3. Flush the collection's write queue
//! 4. Push: resolve conflicted local changes, copy the revisions the
//!    remote lacks, hand acknowledged documents to the purge manager,
//!    advance the push checkpoint
//!
//! Checkpoints only move past a batch once it was fully applied, so a
//! crash or failure replays the batch, which replication makes a no-op.

use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SessionEvent};
use crate::filter::FilterRegistry;
use crate::options::SyncOptions;
use crate::purge::PurgeManager;
use crate::resolver::{ConflictResolver, ConflictStrategy};
use crate::retry::{RetryDecision, RetryPolicy, RetrySupervisor};
use crate::session::ReplicationSession;
use crate::state::SessionState;
use crate::status::StatusRegistry;
use crate::write_queue::WriteQueue;
use possync_protocol::{BatchResult, ChangesBatch, Direction, Document, Flow, Revision};
use possync_store::{
    BulkMode, ChangesRequest, DocWriteResult, DocumentLeaves, DocumentStore, WriteStatus,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The stores one collection replicates between.
#[derive(Clone)]
pub struct CollectionStores {
    /// Terminal-side store.
    pub local: Arc<dyn DocumentStore>,
    /// Server-side store.
    pub remote: Arc<dyn DocumentStore>,
    /// Local edit buffer flushed before every push.
    pub write_queue: Option<Arc<WriteQueue>>,
}

impl CollectionStores {
    /// Pairs two stores without a write queue.
    pub fn new(local: Arc<dyn DocumentStore>, remote: Arc<dyn DocumentStore>) -> Self {
        Self {
            local,
            remote,
            write_queue: None,
        }
    }

    /// Attaches a write queue.
    pub fn with_write_queue(mut self, queue: Arc<WriteQueue>) -> Self {
        self.write_queue = Some(queue);
        self
    }
}

impl std::fmt::Debug for CollectionStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionStores")
            .field("local", &self.local.name())
            .field("remote", &self.remote.name())
            .field("write_queue", &self.write_queue.is_some())
            .finish()
    }
}

/// Tuning shared by every session.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Retry policy for transient failures.
    pub retry: RetryPolicy,
    /// Changes read per batch.
    pub batch_size: usize,
    /// Live wait per poll.
    pub live_timeout: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            batch_size: 100,
            live_timeout: Duration::from_secs(30),
        }
    }
}

/// Starts, drives and stops replication sessions.
#[derive(Clone)]
pub struct ReplicationCoordinator {
    settings: CoordinatorSettings,
    resolver: ConflictResolver,
    purge: Arc<PurgeManager>,
    filters: Arc<FilterRegistry>,
    events: EventBus<SessionEvent>,
    status: Arc<StatusRegistry>,
}

impl ReplicationCoordinator {
    /// Creates a coordinator.
    pub fn new(
        settings: CoordinatorSettings,
        resolver: ConflictResolver,
        events: EventBus<SessionEvent>,
        status: Arc<StatusRegistry>,
    ) -> Self {
        Self {
            settings,
            resolver,
            purge: Arc::new(PurgeManager::new()),
            filters: Arc::new(FilterRegistry::new()),
            events,
            status,
        }
    }

    /// Purge policies per collection.
    pub fn purge_manager(&self) -> &PurgeManager {
        &self.purge
    }

    /// Filters per collection.
    pub fn filters(&self) -> &FilterRegistry {
        &self.filters
    }

    /// Starts two-way replication resolving conflicts with `strategy`.
    pub fn start_bidirectional_sync(
        &self,
        collection: &str,
        stores: CollectionStores,
        strategy: ConflictStrategy,
        options: SyncOptions,
    ) -> Arc<ReplicationSession> {
        let options = options
            .with_direction(Direction::Bidirectional)
            .with_strategy(strategy);
        self.spawn(collection, stores, options, None)
    }

    /// Starts one-way replication.
    ///
    /// A bidirectional `options.direction` is narrowed to push.
    pub fn start_unidirectional_sync(
        &self,
        collection: &str,
        stores: CollectionStores,
        options: SyncOptions,
    ) -> Arc<ReplicationSession> {
        let direction = match options.direction {
            Direction::Bidirectional => Direction::Push,
            one_way => one_way,
        };
        self.spawn(collection, stores, options.with_direction(direction), None)
    }

    /// Starts a new session continuing where `previous` left off.
    pub fn restart(
        &self,
        previous: &ReplicationSession,
        stores: CollectionStores,
    ) -> Arc<ReplicationSession> {
        self.spawn(
            previous.collection(),
            stores,
            previous.options().clone(),
            Some(previous),
        )
    }

    /// Stops `session`. Idempotent.
    pub async fn stop(&self, session: &ReplicationSession) {
        session.stop().await;
    }

    fn spawn(
        &self,
        collection: &str,
        stores: CollectionStores,
        options: SyncOptions,
        previous: Option<&ReplicationSession>,
    ) -> Arc<ReplicationSession> {
        self.configure(collection, &options);
        let session = Arc::new(self.new_session(collection, options));
        if let Some(previous) = previous {
            session.resume_from(previous);
        }
        if let Err(err) = session.set_state(SessionState::Connecting) {
            session.fail(err);
            return session;
        }

        let coordinator = self.clone();
        let task_session = Arc::clone(&session);
        let task = tokio::spawn(async move {
            coordinator.run(&task_session, &stores).await;
        });
        session.attach(task);
        session
    }

    /// Installs the collection's filter and retention policy.
    fn configure(&self, collection: &str, options: &SyncOptions) {
        self.filters.register(collection, Arc::clone(&options.filter));
        self.purge.set_policy(collection, options.retention.clone());
    }

    pub(crate) fn new_session(&self, collection: &str, options: SyncOptions) -> ReplicationSession {
        ReplicationSession::new(
            collection,
            options,
            self.events.clone(),
            Arc::clone(&self.status),
        )
    }

    /// Runs exactly one cycle without retry.
    ///
    /// Progress is seeded from `previous` when given. A failure ends the
    /// temporary session in `Error` and is returned.
    pub async fn sync_once(
        &self,
        collection: &str,
        stores: &CollectionStores,
        options: SyncOptions,
        previous: Option<&ReplicationSession>,
    ) -> SyncResult<BatchResult> {
        self.configure(collection, &options);
        let session = self.new_session(collection, options.with_live(false));
        if let Some(previous) = previous {
            session.resume_from(previous);
        }
        session.set_state(SessionState::Connecting)?;

        match self.run_cycle(&session, stores).await {
            Ok(result) => {
                self.status.record_success(collection);
                Ok(result)
            }
            Err(err) => {
                session.fail(err.clone());
                Err(err)
            }
        }
    }

    /// Session task: cycles until stopped, failed, or done.
    async fn run(&self, session: &ReplicationSession, stores: &CollectionStores) {
        let collection = session.collection().to_string();
        let live = session.options().live;
        let mut supervisor = RetrySupervisor::new(self.settings.retry.clone());
        info!(collection = %collection, direction = %session.direction(), live, "replication session started");

        loop {
            if session.is_cancelled() {
                return;
            }

            match self.run_cycle(session, stores).await {
                Ok(result) => {
                    supervisor.on_success();
                    self.status.record_success(&collection);
                    debug!(
                        collection = %collection,
                        read = result.docs_read,
                        written = result.docs_written,
                        failed = result.doc_write_failures,
                        "cycle complete"
                    );
                    if !live {
                        info!(collection = %collection, "one-shot session complete");
                        return;
                    }
                    if !self.wait_for_changes(session, stores).await {
                        return;
                    }
                }
                Err(SyncError::Cancelled) => return,
                Err(err) => match supervisor.on_error(&err) {
                    RetryDecision::RetryAfter(delay) => {
                        let attempt = supervisor.failures();
                        warn!(
                            collection = %collection,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "cycle failed, retrying"
                        );
                        if let Err(transition) = session.set_state(SessionState::Connecting) {
                            session.fail(transition);
                            return;
                        }
                        self.status.update(&collection, true, Some(err.to_string()));
                        session.record(|stats| stats.retries += 1);
                        session.publish(SessionEvent::RetryScheduled {
                            collection: collection.clone(),
                            attempt,
                            delay,
                        });
                        if !session.sleep(delay).await {
                            return;
                        }
                    }
                    RetryDecision::GiveUp { attempts } => {
                        session.fail(SyncError::RetryExhausted {
                            attempts,
                            last: err.to_string(),
                        });
                        return;
                    }
                    RetryDecision::Fatal => {
                        session.fail(err);
                        return;
                    }
                },
            }
        }
    }

    /// One pull-then-push cycle; ends `Paused`.
    pub(crate) async fn run_cycle(
        &self,
        session: &ReplicationSession,
        stores: &CollectionStores,
    ) -> SyncResult<BatchResult> {
        let direction = session.direction();
        let mut result = BatchResult::default();

        // Queued edits must be in the tree before a pull can move the winner.
        self.flush_queue(session, stores).await?;
        self.retry_pending_conflicts(session, stores).await?;

        if direction.pulls() {
            result.absorb(self.pull(session, stores).await?);
        }

        // Edits queued during the pull branch off and are resolved by the push.
        self.flush_queue(session, stores).await?;

        if direction.pushes() {
            result.absorb(self.push(session, stores).await?);
        }

        session.check_cancelled()?;
        session.set_state(SessionState::Paused)?;
        session.record(|stats| {
            stats.cycles_completed += 1;
            stats.doc_write_failures += result.doc_write_failures;
        });
        Ok(result)
    }

    async fn flush_queue(
        &self,
        session: &ReplicationSession,
        stores: &CollectionStores,
    ) -> SyncResult<()> {
        let Some(queue) = &stores.write_queue else {
            return Ok(());
        };
        let flushed = queue.flush().await?;
        if flushed.doc_write_failures > 0 {
            warn!(
                collection = %session.collection(),
                failed = flushed.doc_write_failures,
                "queued local edits were rejected"
            );
        }
        Ok(())
    }

    async fn retry_pending_conflicts(
        &self,
        session: &ReplicationSession,
        stores: &CollectionStores,
    ) -> SyncResult<()> {
        for id in session.pending_conflicts() {
            session.check_cancelled()?;
            debug!(collection = %session.collection(), doc_id = %id, "retrying unresolved conflict");
            self.resolve_conflict(session, stores, &id).await?;
        }
        Ok(())
    }

    async fn pull(
        &self,
        session: &ReplicationSession,
        stores: &CollectionStores,
    ) -> SyncResult<BatchResult> {
        let collection = session.collection();
        let filter = self.filters.get(collection);
        let mut total = BatchResult::default();

        loop {
            session.check_cancelled()?;
            let since = session.pull_checkpoint();
            let batch = stores
                .remote
                .changes(&since, ChangesRequest::batch(self.settings.batch_size))
                .await?;
            if batch.is_empty() {
                session.set_pull_checkpoint(batch.last_seq);
                break;
            }

            let ids = changed_ids(&batch);
            let remote_leaves = stores.remote.bulk_get(&ids).await?;
            let missing = missing_revisions(stores.local.as_ref(), &remote_leaves).await?;
            let destination = if filter.reads_destination(Flow::Pull) && !missing.is_empty() {
                winners(stores.local.as_ref(), &ids).await?
            } else {
                HashMap::new()
            };

            let mut incoming = Vec::new();
            for leaves in remote_leaves {
                let Some(winner) = leaves.winner() else {
                    continue;
                };
                if !filter.should_replicate(Flow::Pull, winner) {
                    debug!(collection, doc_id = %leaves.id, "pull filtered out");
                    continue;
                }
                let current = destination.get(&leaves.id);
                for leaf in leaves.leaves {
                    if is_missing(&missing, &leaf) {
                        incoming.push(filter.transform(Flow::Pull, leaf, current));
                    }
                }
            }

            let mut result = BatchResult {
                docs_read: batch.results.len() as u64,
                ..BatchResult::default()
            };
            let mut touched = BTreeSet::new();
            if !incoming.is_empty() {
                session.set_state(SessionState::Active)?;
                let writes = stores.local.bulk_put(incoming, BulkMode::Replicate).await?;
                let rejected = tally(collection, &mut result, &writes)?;
                touched.extend(
                    writes
                        .into_iter()
                        .map(|w| w.id)
                        .filter(|id| !rejected.contains(id)),
                );
            }
            touched.extend(
                batch
                    .results
                    .iter()
                    .filter(|change| change.has_conflicts())
                    .map(|change| change.id.clone()),
            );
            for id in &touched {
                self.resolve_conflict(session, stores, id).await?;
            }

            debug!(
                collection,
                read = result.docs_read,
                written = result.docs_written,
                "pull batch applied"
            );
            session.record(|stats| stats.docs_pulled += result.docs_written);
            session.publish(SessionEvent::PullCompleted {
                collection: collection.to_string(),
                docs_read: result.docs_read,
                docs_written: result.docs_written,
            });
            session.set_pull_checkpoint(batch.last_seq.clone());
            total.absorb(result);

            if !batch.has_more() {
                break;
            }
        }
        Ok(total)
    }

    async fn push(
        &self,
        session: &ReplicationSession,
        stores: &CollectionStores,
    ) -> SyncResult<BatchResult> {
        let collection = session.collection();
        let filter = self.filters.get(collection);
        let mut total = BatchResult::default();

        loop {
            session.check_cancelled()?;
            let since = session.push_checkpoint();
            let batch = stores
                .local
                .changes(&since, ChangesRequest::batch(self.settings.batch_size))
                .await?;
            if batch.is_empty() {
                session.set_push_checkpoint(batch.last_seq);
                break;
            }

            for change in batch.results.iter().filter(|c| c.has_conflicts()) {
                self.resolve_conflict(session, stores, &change.id).await?;
            }

            let local_leaves = stores.local.bulk_get(&changed_ids(&batch)).await?;
            let mut outgoing = Vec::new();
            let mut pushed = Vec::new();
            for leaves in local_leaves {
                let Some(winner) = leaves.winner() else {
                    continue;
                };
                if !filter.should_replicate(Flow::Push, winner) {
                    debug!(collection, doc_id = %leaves.id, "push filtered out");
                    continue;
                }
                pushed.push(winner.clone());
                outgoing.push(leaves);
            }

            let missing = missing_revisions(stores.remote.as_ref(), &outgoing).await?;
            // Fields the remote owns are copied from its winner, never from ours.
            let destination = if filter.reads_destination(Flow::Push) && !missing.is_empty() {
                let ids: BTreeSet<String> = missing.iter().map(|(id, _)| id.clone()).collect();
                let ids: Vec<String> = ids.into_iter().collect();
                winners(stores.remote.as_ref(), &ids).await?
            } else {
                HashMap::new()
            };
            let mut to_send = Vec::new();
            for leaves in outgoing {
                let current = destination.get(&leaves.id);
                for leaf in leaves.leaves {
                    if is_missing(&missing, &leaf) {
                        to_send.push(filter.transform(Flow::Push, leaf, current));
                    }
                }
            }

            let mut result = BatchResult {
                docs_read: batch.results.len() as u64,
                ..BatchResult::default()
            };
            let mut rejected = HashSet::new();
            if !to_send.is_empty() {
                session.set_state(SessionState::Active)?;
                let writes = stores.remote.bulk_put(to_send, BulkMode::Replicate).await?;
                rejected = tally(collection, &mut result, &writes)?;
            }

            let acknowledged: Vec<Document> = pushed
                .into_iter()
                .filter(|doc| !rejected.contains(&doc.id))
                .collect();
            let mut purged = Vec::new();
            if !acknowledged.is_empty() {
                session.publish(SessionEvent::PushAcknowledged {
                    collection: collection.to_string(),
                    ids: acknowledged.iter().map(|doc| doc.id.clone()).collect(),
                });
                purged = self
                    .purge
                    .on_push_confirmed(collection, stores.local.as_ref(), &acknowledged)
                    .await?;
                if !purged.is_empty() {
                    session.record(|stats| stats.purged += purged.len() as u64);
                    session.publish(SessionEvent::Purged {
                        collection: collection.to_string(),
                        ids: purged.clone(),
                    });
                }
            }

            debug!(
                collection,
                read = result.docs_read,
                written = result.docs_written,
                purged = purged.len(),
                "push batch applied"
            );
            session.record(|stats| stats.docs_pushed += result.docs_written);
            session.set_push_checkpoint(batch.last_seq.clone());
            total.absorb(result);

            // Purging writes tombstones past the checkpoint; read them too.
            if !batch.has_more() && purged.is_empty() {
                break;
            }
        }
        Ok(total)
    }

    async fn resolve_conflict(
        &self,
        session: &ReplicationSession,
        stores: &CollectionStores,
        id: &str,
    ) -> SyncResult<()> {
        let outcome = self
            .resolver
            .resolve_document(
                stores.local.as_ref(),
                stores.remote.as_ref(),
                id,
                &session.options().strategy,
            )
            .await;

        match outcome {
            Ok(Some(record)) => {
                session.clear_pending(id);
                session.record(|stats| stats.conflicts_resolved += 1);
                session.publish(SessionEvent::ConflictResolved {
                    collection: session.collection().to_string(),
                    record,
                });
                Ok(())
            }
            Ok(None) => {
                session.clear_pending(id);
                Ok(())
            }
            Err(err) if err.is_document_level() => {
                warn!(collection = %session.collection(), doc_id = %id, error = %err, "conflict left unresolved");
                session.mark_pending(id);
                session.publish(SessionEvent::ConflictUnresolved {
                    collection: session.collection().to_string(),
                    doc_id: id.to_string(),
                    reason: err.to_string(),
                });
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Waits for new changes on either side; returns false if cancelled.
    async fn wait_for_changes(&self, session: &ReplicationSession, stores: &CollectionStores) -> bool {
        let direction = session.direction();
        let request = ChangesRequest::live(1, self.settings.live_timeout);
        let pull_since = session.pull_checkpoint();
        let push_since = session.push_checkpoint();

        let remote = async {
            if direction.pulls() {
                if let Err(err) = stores.remote.changes(&pull_since, request).await {
                    debug!(collection = %session.collection(), error = %err, "live wait on remote failed");
                }
            } else {
                futures::future::pending::<()>().await;
            }
        };
        let local = async {
            if direction.pushes() {
                if let Err(err) = stores.local.changes(&push_since, request).await {
                    debug!(collection = %session.collection(), error = %err, "live wait on local failed");
                }
            } else {
                futures::future::pending::<()>().await;
            }
        };

        tokio::select! {
            _ = session.cancelled() => false,
            _ = remote => true,
            _ = local => true,
        }
    }
}

impl std::fmt::Debug for ReplicationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationCoordinator")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Distinct ids of a changes batch, in feed order.
fn changed_ids(batch: &ChangesBatch) -> Vec<String> {
    let mut seen = HashSet::new();
    batch
        .results
        .iter()
        .filter(|change| seen.insert(change.id.as_str()))
        .map(|change| change.id.clone())
        .collect()
}

/// Revisions among `leaves` that `target` does not know.
async fn missing_revisions(
    target: &dyn DocumentStore,
    leaves: &[DocumentLeaves],
) -> SyncResult<HashSet<(String, Revision)>> {
    let pairs: Vec<(String, Revision)> = leaves
        .iter()
        .flat_map(|doc| {
            doc.leaves
                .iter()
                .filter_map(|leaf| leaf.revision.clone().map(|rev| (doc.id.clone(), rev)))
        })
        .collect();
    if pairs.is_empty() {
        return Ok(HashSet::new());
    }
    Ok(target.revs_diff(&pairs).await?.into_iter().collect())
}

/// Current winners of `ids` in `store`, keyed by id.
async fn winners(
    store: &dyn DocumentStore,
    ids: &[String],
) -> SyncResult<HashMap<String, Document>> {
    Ok(store
        .bulk_get(ids)
        .await?
        .into_iter()
        .filter_map(|leaves| {
            let winner = leaves.winner().cloned()?;
            Some((leaves.id, winner))
        })
        .collect())
}

fn is_missing(missing: &HashSet<(String, Revision)>, leaf: &Document) -> bool {
    leaf.revision
        .as_ref()
        .is_some_and(|rev| missing.contains(&(leaf.id.clone(), rev.clone())))
}

/// Counts write outcomes into `result`; returns the ids with a rejected
/// revision.
///
/// Rejections that mean the store itself is unusable abort the cycle.
fn tally(
    collection: &str,
    result: &mut BatchResult,
    writes: &[DocWriteResult],
) -> SyncResult<HashSet<String>> {
    let mut rejected = HashSet::new();
    for write in writes {
        match &write.status {
            WriteStatus::Written(_) => result.docs_written += 1,
            WriteStatus::AlreadyPresent(_) => {}
            WriteStatus::Rejected(err) => {
                let err = SyncError::from(err.clone());
                if err.is_retryable() || matches!(err, SyncError::Unauthorized(_)) {
                    return Err(err);
                }
                warn!(collection, doc_id = %write.id, error = %err, "document rejected");
                if rejected.insert(write.id.clone()) {
                    result.record_failure(&write.id, &err);
                }
            }
        }
    }
    Ok(rejected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use possync_store::{MemoryStore, StoreError, Validator};
    use possync_testkit::{order, product, seed, FaultyStore};

    fn coordinator() -> ReplicationCoordinator {
        ReplicationCoordinator::new(
            CoordinatorSettings::default(),
            ConflictResolver::new(2, Duration::from_secs(1)),
            EventBus::new(64),
            Arc::new(StatusRegistry::new()),
        )
    }

    #[test]
    fn tally_counts_and_dedupes_rejections() {
        let writes = vec![
            DocWriteResult {
                id: "p1".into(),
                status: WriteStatus::Written(Revision::new(1, "a")),
            },
            DocWriteResult {
                id: "p2".into(),
                status: WriteStatus::AlreadyPresent(Revision::new(1, "b")),
            },
            DocWriteResult {
                id: "p3".into(),
                status: WriteStatus::Rejected(StoreError::invalid("p3", "bad")),
            },
            DocWriteResult {
                id: "p3".into(),
                status: WriteStatus::Rejected(StoreError::invalid("p3", "bad")),
            },
        ];
        let mut result = BatchResult::default();
        let rejected = tally("products", &mut result, &writes).unwrap();

        assert_eq!(result.docs_written, 1);
        assert_eq!(result.doc_write_failures, 1);
        assert!(rejected.contains("p3"));
    }

    #[test]
    fn tally_aborts_on_transient_rejection() {
        let writes = vec![DocWriteResult {
            id: "p1".into(),
            status: WriteStatus::Rejected(StoreError::Timeout),
        }];
        let err = tally("products", &mut BatchResult::default(), &writes).unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn one_shot_bidirectional_cycle_converges() {
        let local: Arc<MemoryStore> = Arc::new(MemoryStore::new("products"));
        let remote: Arc<MemoryStore> = Arc::new(MemoryStore::new("products"));
        seed(local.as_ref(), vec![product("p1", "Aspirin", 10)]).await;
        seed(remote.as_ref(), vec![product("p2", "Ibuprofen", 4)]).await;

        let stores = CollectionStores::new(local.clone(), remote.clone());
        let coordinator = coordinator();
        let result = coordinator
            .sync_once("products", &stores, SyncOptions::default(), None)
            .await
            .unwrap();

        assert_eq!(result.docs_written, 2);
        assert!(local.get("p2").await.is_ok());
        assert!(remote.get("p1").await.is_ok());
    }

    #[tokio::test]
    async fn push_only_session_ignores_remote() {
        let local: Arc<MemoryStore> = Arc::new(MemoryStore::new("orders"));
        let remote: Arc<MemoryStore> = Arc::new(MemoryStore::new("orders"));
        seed(remote.as_ref(), vec![order("o9", "COMPLETED", &[("p1", 1)])]).await;
        seed(local.as_ref(), vec![order("o1", "COMPLETED", &[("p1", 2)])]).await;

        let coordinator = coordinator();
        let session = coordinator.start_unidirectional_sync(
            "orders",
            CollectionStores::new(local.clone(), remote.clone()),
            SyncOptions::new(Direction::Bidirectional).with_live(false),
        );
        assert_eq!(session.direction(), Direction::Push);

        let state = session
            .wait_for_state_timeout(|s| s == SessionState::Paused, Duration::from_secs(5))
            .await;
        assert_eq!(state, Some(SessionState::Paused));
        assert!(remote.get("o1").await.is_ok());
        assert!(local.get("o9").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn store_rejections_do_not_fail_the_cycle() {
        let local: Arc<MemoryStore> = Arc::new(MemoryStore::new("products"));
        let named: Validator = Arc::new(|doc: &Document| {
            doc.field("name")
                .map(|_| ())
                .ok_or_else(|| "name is required".to_string())
        });
        let remote = Arc::new(MemoryStore::new("products").with_validator(named));
        seed(
            local.as_ref(),
            vec![
                product("p1", "Aspirin", 10),
                Document::from_value("p2", serde_json::json!({"stock": 1})),
            ],
        )
        .await;

        let stores = CollectionStores::new(local.clone(), remote.clone());
        let result = coordinator()
            .sync_once("products", &stores, SyncOptions::new(Direction::Push), None)
            .await
            .unwrap();

        assert_eq!(result.docs_written, 1);
        assert_eq!(result.doc_write_failures, 1);
        assert!(result.ok());
        assert!(remote.get("p2").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn one_shot_failure_is_reported() {
        let local: Arc<MemoryStore> = Arc::new(MemoryStore::new("products"));
        let remote = Arc::new(FaultyStore::new(MemoryStore::new("products")));
        remote.fail_always(StoreError::Unauthorized("expired".into()));

        let stores = CollectionStores::new(local, remote);
        let coordinator = coordinator();
        let err = coordinator
            .sync_once("products", &stores, SyncOptions::default(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Unauthorized(_)));
        assert!(coordinator.status.get("products").last_error.is_some());
    }
}
