//! Purge of acknowledged write-once records.

use crate::error::SyncResult;
use parking_lot::RwLock;
use possync_protocol::Document;
use possync_store::{BulkMode, DocumentStore, WriteStatus};
use std::collections::HashMap;
use tracing::{debug, info};

/// What happens to local copies once the remote holds them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Local copies are kept.
    #[default]
    Keep,
    /// Local copies in a terminal state are tombstoned after acknowledgement.
    PurgeAfterAck {
        /// Field holding the lifecycle state.
        field: String,
        /// States after which the record is never edited again.
        terminal_values: Vec<String>,
    },
}

impl RetentionPolicy {
    /// Purge once acknowledged when `field` holds one of `terminal_values`.
    pub fn purge_after_ack<I, S>(field: impl Into<String>, terminal_values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RetentionPolicy::PurgeAfterAck {
            field: field.into(),
            terminal_values: terminal_values.into_iter().map(Into::into).collect(),
        }
    }

    /// Orders: completed and cancelled orders are purged.
    pub fn terminal_orders() -> Self {
        Self::purge_after_ack("status", ["COMPLETED", "CANCELLED"])
    }

    /// Returns true if `doc` may be purged once acknowledged.
    pub fn is_terminal(&self, doc: &Document) -> bool {
        match self {
            RetentionPolicy::Keep => false,
            RetentionPolicy::PurgeAfterAck {
                field,
                terminal_values,
            } => {
                !doc.deleted
                    && doc
                        .str_field(field)
                        .is_some_and(|value| terminal_values.iter().any(|v| v == value))
            }
        }
    }
}

/// Tombstones local copies that the remote has durably acknowledged.
///
/// # Invariants
///
/// - Only documents passed to [`on_push_confirmed`](Self::on_push_confirmed)
///   are considered, so nothing is purged before its acknowledgement
/// - A document edited locally after it was pushed is kept
#[derive(Debug, Default)]
pub struct PurgeManager {
    policies: RwLock<HashMap<String, RetentionPolicy>>,
}

impl PurgeManager {
    /// Creates a manager where every collection keeps its documents.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the retention policy of `collection`.
    pub fn set_policy(&self, collection: &str, policy: RetentionPolicy) {
        self.policies.write().insert(collection.to_string(), policy);
    }

    /// Returns the retention policy of `collection`.
    pub fn policy(&self, collection: &str) -> RetentionPolicy {
        self.policies
            .read()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Purges the acknowledged documents that the policy allows.
    ///
    /// `written` holds the local revisions the remote confirmed. Returns
    /// the ids that were tombstoned.
    pub async fn on_push_confirmed(
        &self,
        collection: &str,
        local: &dyn DocumentStore,
        written: &[Document],
    ) -> SyncResult<Vec<String>> {
        let policy = self.policy(collection);
        let candidates: Vec<&Document> = written
            .iter()
            .filter(|doc| policy.is_terminal(doc))
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = candidates.iter().map(|doc| doc.id.clone()).collect();
        let current = local.bulk_get(&ids).await?;

        let mut tombstones = Vec::with_capacity(candidates.len());
        for (pushed, leaves) in candidates.iter().zip(current.iter()) {
            let Some(winner) = leaves.winner() else {
                continue;
            };
            let unchanged = winner.revision == pushed.revision && !leaves.is_conflicted();
            if !unchanged || !policy.is_terminal(winner) {
                debug!(collection, doc_id = %pushed.id, "skipping purge of changed document");
                continue;
            }
            if let Some(rev) = winner.revision.clone() {
                tombstones.push(Document::tombstone(&pushed.id, rev));
            }
        }
        if tombstones.is_empty() {
            return Ok(Vec::new());
        }

        let results = local.bulk_put(tombstones, BulkMode::NewEdits).await?;
        let purged: Vec<String> = results
            .into_iter()
            .filter_map(|result| match result.status {
                WriteStatus::Written(_) => Some(result.id),
                WriteStatus::AlreadyPresent(_) => None,
                WriteStatus::Rejected(err) => {
                    debug!(collection, doc_id = %result.id, error = %err, "purge rejected");
                    None
                }
            })
            .collect();

        if !purged.is_empty() {
            info!(collection, count = purged.len(), "purged acknowledged documents");
        }
        Ok(purged)
    }
}
