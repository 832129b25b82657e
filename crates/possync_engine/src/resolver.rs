//! Conflict resolution.
//!
//! When a document has more than one live leaf, a [`ConflictStrategy`]
//! picks the winning content, the winner is written on top of the current
//! winning leaf and every other live leaf is tombstoned. Strategies that run
//! caller-supplied code execute on the blocking pool, bounded by a worker
//! semaphore and a timeout, so a slow or panicking resolver can neither
//! stall the runtime nor lose revisions.

use crate::error::{SyncError, SyncResult};
use crate::merge::FieldMergePolicy;
use possync_protocol::{ConflictRecord, Document, Revision};
use possync_store::DocumentStore;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Caller-supplied merge of a local and a remote revision.
pub type CustomResolver =
    Arc<dyn Fn(&Document, &Document) -> Result<Document, String> + Send + Sync>;

/// How the winner of a conflict is chosen.
#[derive(Clone)]
pub enum ConflictStrategy {
    /// The highest remote revision wins.
    RemoteWins,
    /// The local revision wins.
    LocalWins,
    /// The most recently edited revision wins (`updated_at`, else
    /// `created_at`); ties favor local.
    Merge,
    /// Field-by-field merge.
    Fields(FieldMergePolicy),
    /// Caller-supplied merge, folded over the remote revisions.
    Custom(CustomResolver),
}

impl ConflictStrategy {
    /// Product preset: remote wins except for `stock`.
    pub fn products() -> Self {
        ConflictStrategy::Fields(FieldMergePolicy::remote_wins_except(["stock"]))
    }

    /// Short name recorded in [`ConflictRecord::strategy`].
    pub fn name(&self) -> &'static str {
        match self {
            ConflictStrategy::RemoteWins => "remote_wins",
            ConflictStrategy::LocalWins => "local_wins",
            ConflictStrategy::Merge => "merge",
            ConflictStrategy::Fields(_) => "fields",
            ConflictStrategy::Custom(_) => "custom",
        }
    }

    fn runs_user_code(&self) -> bool {
        match self {
            ConflictStrategy::Custom(_) => true,
            ConflictStrategy::Fields(policy) => policy.has_custom_rules(),
            _ => false,
        }
    }

    /// Picks the winning content.
    ///
    /// `remote` holds the remote-side revisions, highest first. Folding
    /// strategies visit them lowest first so the highest has the last say.
    pub fn select(&self, local: &Document, remote: &[Document]) -> Result<Document, String> {
        let Some(highest) = remote.first() else {
            return Ok(local.clone());
        };
        match self {
            ConflictStrategy::RemoteWins => Ok(highest.clone()),
            ConflictStrategy::LocalWins => Ok(local.clone()),
            ConflictStrategy::Merge => Ok(remote
                .iter()
                .fold(local, |best, candidate| {
                    if candidate.timestamp() > best.timestamp() {
                        candidate
                    } else {
                        best
                    }
                })
                .clone()),
            ConflictStrategy::Fields(policy) => {
                Ok(remote.iter().rev().fold(local.clone(), |acc, candidate| {
                    let payload = policy.merge(&acc, candidate);
                    Document { payload, ..acc }
                }))
            }
            ConflictStrategy::Custom(f) => remote
                .iter()
                .rev()
                .try_fold(local.clone(), |acc, candidate| f(&acc, candidate)),
        }
    }
}

impl fmt::Debug for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictStrategy::Fields(policy) => f.debug_tuple("Fields").field(policy).finish(),
            other => f.write_str(other.name()),
        }
    }
}

/// Runs strategies and applies their outcome to a store.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl ConflictResolver {
    /// Creates a resolver running at most `workers` custom resolutions at
    /// once, each bounded by `timeout`.
    pub fn new(workers: usize, timeout: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            timeout,
        }
    }

    /// Picks the winning content for `local` against `remote`.
    ///
    /// # Errors
    ///
    /// [`SyncError::Resolver`] if the strategy fails, panics or times out.
    pub async fn resolve(
        &self,
        local: &Document,
        remote: &[Document],
        strategy: &ConflictStrategy,
    ) -> SyncResult<Document> {
        if !strategy.runs_user_code() {
            return strategy
                .select(local, remote)
                .map_err(|reason| SyncError::resolver(&local.id, reason));
        }

        let id = local.id.clone();
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| SyncError::resolver(&id, "resolver pool closed"))?;

        let strategy = strategy.clone();
        let local = local.clone();
        let remote = remote.to_vec();
        // The permit travels with the task so an abandoned resolver still
        // counts against the pool until it returns.
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            strategy.select(&local, &remote)
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(Ok(winner))) => Ok(winner),
            Ok(Ok(Err(reason))) => Err(SyncError::resolver(id, reason)),
            Ok(Err(join)) if join.is_panic() => Err(SyncError::resolver(id, "resolver panicked")),
            Ok(Err(join)) => Err(SyncError::resolver(id, join.to_string())),
            Err(_) => Err(SyncError::resolver(
                id,
                format!("resolver timed out after {} ms", self.timeout.as_millis()),
            )),
        }
    }

    /// Resolves the conflicted document `id` in `local`.
    ///
    /// Leaves the remote already holds are the remote side; the highest leaf
    /// only this side holds is the local one. Returns `None` if the document
    /// is not conflicted.
    ///
    /// # Errors
    ///
    /// - [`SyncError::Resolver`] if the strategy failed; all leaves are kept
    /// - [`SyncError::Conflict`] if the document changed concurrently
    /// - Store errors from either side
    pub async fn resolve_document(
        &self,
        local: &dyn DocumentStore,
        remote: &dyn DocumentStore,
        id: &str,
        strategy: &ConflictStrategy,
    ) -> SyncResult<Option<ConflictRecord>> {
        let Some(leaves) = local.bulk_get(&[id.to_string()]).await?.pop() else {
            return Ok(None);
        };
        let Some(current) = leaves.winner().cloned() else {
            return Ok(None);
        };
        let mut live: Vec<Document> = leaves.leaves.into_iter().filter(|l| !l.deleted).collect();
        if live.len() < 2 {
            return Ok(None);
        }

        let pairs: Vec<(String, Revision)> = live
            .iter()
            .filter_map(|leaf| leaf.revision.clone().map(|rev| (id.to_string(), rev)))
            .collect();
        let unknown_to_remote: HashSet<Revision> = remote
            .revs_diff(&pairs)
            .await?
            .into_iter()
            .map(|(_, rev)| rev)
            .collect();

        let local_index = live
            .iter()
            .position(|leaf| {
                leaf.revision
                    .as_ref()
                    .is_some_and(|rev| unknown_to_remote.contains(rev))
            })
            .unwrap_or(0);
        let local_doc = live.remove(local_index);
        let candidates = live;

        let winner = self.resolve(&local_doc, &candidates, strategy).await?;

        let mut record = ConflictRecord::new(&local_doc, &candidates[0], strategy.name());
        let resolved = if winner.same_content(&current) {
            current.revision.clone()
        } else {
            let rev = local
                .put(Document::new(id, winner.payload), current.revision.as_ref())
                .await?;
            Some(rev)
        };

        let retired: Vec<Revision> = std::iter::once(&local_doc)
            .chain(candidates.iter())
            .filter_map(|leaf| leaf.revision.clone())
            .filter(|rev| Some(rev) != current.revision.as_ref())
            .collect();
        for rev in &retired {
            match local.remove(id, rev).await {
                Ok(_) => {}
                // Already retired by a concurrent resolution.
                Err(err) if err.is_conflict() => {
                    warn!(doc_id = %id, revision = %rev, "losing leaf changed during resolution");
                }
                Err(err) => return Err(err.into()),
            }
        }

        debug!(
            doc_id = %id,
            strategy = strategy.name(),
            retired = retired.len(),
            "conflict resolved"
        );
        record.resolved_revision = resolved;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use possync_store::{BulkMode, MemoryStore};
    use serde_json::json;

    fn doc(id: &str, rev: &str, value: serde_json::Value) -> Document {
        let rev: Revision = rev.parse().unwrap();
        Document::from_value(id, value).with_revision(rev)
    }

    #[test]
    fn remote_and_local_wins() {
        let local = doc("p1", "2-aaa", json!({"v": "local"}));
        let remote = vec![
            doc("p1", "2-ccc", json!({"v": "high"})),
            doc("p1", "2-bbb", json!({"v": "low"})),
        ];

        let winner = ConflictStrategy::RemoteWins.select(&local, &remote).unwrap();
        assert_eq!(winner.str_field("v"), Some("high"));

        let winner = ConflictStrategy::LocalWins.select(&local, &remote).unwrap();
        assert_eq!(winner.str_field("v"), Some("local"));
    }

    #[test]
    fn merge_prefers_latest_and_ties_favor_local() {
        let local = doc(
            "o1",
            "2-aaa",
            json!({"v": "local", "updated_at": "2024-01-15T10:00:00Z"}),
        );
        let newer = doc(
            "o1",
            "2-bbb",
            json!({"v": "remote", "updated_at": "2024-01-15T11:00:00Z"}),
        );
        let tie = doc(
            "o1",
            "2-ccc",
            json!({"v": "tie", "updated_at": "2024-01-15T10:00:00Z"}),
        );

        let winner = ConflictStrategy::Merge
            .select(&local, &[newer.clone()])
            .unwrap();
        assert_eq!(winner.str_field("v"), Some("remote"));

        let winner = ConflictStrategy::Merge.select(&local, &[tie]).unwrap();
        assert_eq!(winner.str_field("v"), Some("local"));
    }

    #[test]
    fn field_policy_keeps_local_stock() {
        let local = doc("p1", "2-aaa", json!({"name": "Aspirin", "stock": 10}));
        let remote = vec![doc("p1", "2-bbb", json!({"name": "Aspirin 500mg", "stock": 7}))];

        let winner = ConflictStrategy::products().select(&local, &remote).unwrap();
        assert_eq!(winner.str_field("name"), Some("Aspirin 500mg"));
        assert_eq!(winner.i64_field("stock"), Some(10));
    }

    #[test]
    fn custom_folds_over_candidates() {
        let sum: CustomResolver = Arc::new(|acc, other| {
            let total = acc.i64_field("n").unwrap_or(0) + other.i64_field("n").unwrap_or(0);
            let mut merged = acc.clone();
            merged.set_field("n", json!(total));
            Ok(merged)
        });
        let local = doc("c1", "2-aaa", json!({"n": 1}));
        let remote = vec![
            doc("c1", "2-ccc", json!({"n": 2})),
            doc("c1", "2-bbb", json!({"n": 3})),
        ];
        let winner = ConflictStrategy::Custom(sum).select(&local, &remote).unwrap();
        assert_eq!(winner.i64_field("n"), Some(6));
    }

    #[tokio::test]
    async fn panicking_resolver_is_contained() {
        let resolver = ConflictResolver::new(2, Duration::from_secs(5));
        let boom: CustomResolver = Arc::new(|_, _| panic!("boom"));
        let local = doc("c1", "2-aaa", json!({}));
        let remote = vec![doc("c1", "2-bbb", json!({}))];

        let err = resolver
            .resolve(&local, &remote, &ConflictStrategy::Custom(boom))
            .await
            .unwrap_err();
        assert_eq!(err, SyncError::resolver("c1", "resolver panicked"));
    }

    #[tokio::test]
    async fn slow_resolver_times_out() {
        let resolver = ConflictResolver::new(1, Duration::from_millis(50));
        let slow: CustomResolver = Arc::new(|local, _| {
            std::thread::sleep(Duration::from_millis(500));
            Ok(local.clone())
        });
        let local = doc("c1", "2-aaa", json!({}));
        let remote = vec![doc("c1", "2-bbb", json!({}))];

        let err = resolver
            .resolve(&local, &remote, &ConflictStrategy::Custom(slow))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Resolver { .. }));
    }

    async fn conflicted_pair() -> (MemoryStore, MemoryStore) {
        let local = MemoryStore::new("products");
        let remote = MemoryStore::new("products");
        let mine = doc("p1", "1-aaa", json!({"name": "Aspirin", "stock": 10}));
        let theirs = doc("p1", "1-bbb", json!({"name": "Aspirin 500mg", "stock": 7}));

        remote
            .bulk_put(vec![theirs.clone()], BulkMode::Replicate)
            .await
            .unwrap();
        local
            .bulk_put(vec![mine, theirs], BulkMode::Replicate)
            .await
            .unwrap();
        (local, remote)
    }

    #[tokio::test]
    async fn resolve_document_writes_winner_and_retires_losers() {
        let (local, remote) = conflicted_pair().await;
        let resolver = ConflictResolver::new(1, Duration::from_secs(1));

        let record = resolver
            .resolve_document(&local, &remote, "p1", &ConflictStrategy::products())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.local_revision, Some(Revision::new(1, "aaa")));
        assert_eq!(record.remote_revision, Some(Revision::new(1, "bbb")));
        assert!(record.is_resolved());

        let leaves = local.leaves("p1");
        assert_eq!(leaves.iter().filter(|l| !l.deleted).count(), 1);

        let winner = local.get("p1").await.unwrap();
        assert_eq!(winner.str_field("name"), Some("Aspirin 500mg"));
        assert_eq!(winner.i64_field("stock"), Some(10));
        assert_eq!(winner.revision, record.resolved_revision);
    }

    #[tokio::test]
    async fn failed_resolution_keeps_all_leaves() {
        let (local, remote) = conflicted_pair().await;
        let resolver = ConflictResolver::new(1, Duration::from_secs(1));
        let failing: CustomResolver = Arc::new(|_, _| Err("cannot merge".into()));

        let err = resolver
            .resolve_document(&local, &remote, "p1", &ConflictStrategy::Custom(failing))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Resolver { .. }));
        assert_eq!(local.leaves("p1").len(), 2);
    }

    #[tokio::test]
    async fn unconflicted_document_is_left_alone() {
        let local = MemoryStore::new("products");
        let remote = MemoryStore::new("products");
        local
            .put(Document::from_value("p1", json!({})), None)
            .await
            .unwrap();
        let resolver = ConflictResolver::new(1, Duration::from_secs(1));

        let outcome = resolver
            .resolve_document(&local, &remote, "p1", &ConflictStrategy::RemoteWins)
            .await
            .unwrap();
        assert!(outcome.is_none());
    }
}
