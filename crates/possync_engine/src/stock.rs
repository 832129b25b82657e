//! Stock reconciliation.
//!
//! Product conflicts keep the local `stock`, and pushes never carry it, so
//! the terminal's count drifts from the warehouse. Reconciliation rebases
//! it explicitly: the remote count minus what the terminal sold in orders
//! the remote has not received yet.

use crate::error::{SyncError, SyncResult};
use possync_protocol::{Checkpoint, Revision};
use possync_store::{ChangesRequest, DocumentStore};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, info};

/// Order status whose items are deducted from stock.
pub const SOLD_STATUS: &str = "COMPLETED";

const SCAN_BATCH: usize = 500;

/// One product whose stock was recomputed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StockAdjustment {
    /// Product id.
    pub product_id: String,
    /// Stock held by the remote.
    pub remote_stock: i64,
    /// Quantity sold in local orders not yet purged.
    pub pending_quantity: i64,
    /// Local stock before reconciliation.
    pub previous_stock: Option<i64>,
    /// Local stock after reconciliation.
    pub new_stock: i64,
    /// Local revision after reconciliation.
    pub revision: Option<Revision>,
    /// False if the local stock already matched.
    pub changed: bool,
}

/// Outcome of [`reconcile_stock`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StockReport {
    /// Products that were checked.
    pub adjusted: Vec<StockAdjustment>,
    /// Products left alone, with the reason.
    pub skipped: Vec<(String, String)>,
}

impl StockReport {
    /// Number of products whose local stock changed.
    pub fn changed(&self) -> usize {
        self.adjusted.iter().filter(|a| a.changed).count()
    }
}

/// Sums item quantities per product over local orders with status
/// [`SOLD_STATUS`].
pub async fn pending_quantities(orders: &dyn DocumentStore) -> SyncResult<HashMap<String, i64>> {
    let mut totals = HashMap::new();
    let mut since = Checkpoint::zero();
    loop {
        let batch = orders
            .changes(&since, ChangesRequest::batch(SCAN_BATCH))
            .await?;
        if batch.is_empty() {
            break;
        }
        let ids: Vec<String> = batch
            .results
            .iter()
            .filter(|change| !change.deleted)
            .map(|change| change.id.clone())
            .collect();
        for leaves in orders.bulk_get(&ids).await? {
            let Some(order) = leaves.winner() else {
                continue;
            };
            if order.deleted || order.str_field("status") != Some(SOLD_STATUS) {
                continue;
            }
            let items = order.field("items").and_then(|v| v.as_array());
            for item in items.into_iter().flatten() {
                let product = item.get("product_id").and_then(|v| v.as_str());
                let quantity = item.get("quantity").and_then(|v| v.as_i64());
                if let (Some(product), Some(quantity)) = (product, quantity) {
                    *totals.entry(product.to_string()).or_insert(0) += quantity;
                }
            }
        }
        since = batch.last_seq.clone();
        if !batch.has_more() {
            break;
        }
    }
    Ok(totals)
}

/// Rebases local stock of `ids` on the remote count.
///
/// `new_stock = remote stock - quantity in unpurged sold local orders`.
/// Each product is written as an ordinary edit on its current revision, so
/// a concurrent local edit makes that product fail with a conflict instead
/// of being overwritten.
pub async fn reconcile_stock(
    local: &dyn DocumentStore,
    remote: &dyn DocumentStore,
    orders: &dyn DocumentStore,
    ids: &[String],
) -> SyncResult<StockReport> {
    let pending = pending_quantities(orders).await?;
    let mut report = StockReport::default();

    for id in ids {
        let remote_doc = match remote.get(id).await {
            Ok(doc) => doc,
            Err(err) if err.is_not_found() => {
                report.skipped.push((id.clone(), "missing remotely".into()));
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        let Some(remote_stock) = remote_doc.i64_field("stock") else {
            report
                .skipped
                .push((id.clone(), "remote has no stock".into()));
            continue;
        };
        let mut doc = match local.get(id).await {
            Ok(doc) => doc,
            Err(err) if err.is_not_found() => {
                report
                    .skipped
                    .push((id.clone(), "not replicated locally yet".into()));
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        let pending_quantity = pending.get(id).copied().unwrap_or(0);
        let new_stock = remote_stock - pending_quantity;
        let previous_stock = doc.i64_field("stock");
        let mut adjustment = StockAdjustment {
            product_id: id.clone(),
            remote_stock,
            pending_quantity,
            previous_stock,
            new_stock,
            revision: doc.revision.clone(),
            changed: previous_stock != Some(new_stock),
        };

        if adjustment.changed {
            let expected = doc.revision.clone();
            doc.set_field("stock", json!(new_stock));
            match local.put(doc, expected.as_ref()).await.map_err(SyncError::from) {
                Ok(rev) => adjustment.revision = Some(rev),
                Err(err) if err.is_document_level() => {
                    report.skipped.push((id.clone(), err.to_string()));
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        debug!(product_id = %id, remote_stock, pending_quantity, new_stock, "stock reconciled");
        report.adjusted.push(adjustment);
    }

    info!(
        checked = ids.len(),
        changed = report.changed(),
        skipped = report.skipped.len(),
        "stock reconciliation finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use possync_store::MemoryStore;
    use possync_testkit::{order, product, seed};

    #[tokio::test]
    async fn sums_only_sold_orders() {
        let orders = MemoryStore::new("orders");
        seed(
            &orders,
            vec![
                order("o1", "COMPLETED", &[("p1", 2), ("p2", 1)]),
                order("o2", "COMPLETED", &[("p1", 3)]),
                order("o3", "OPEN", &[("p1", 50)]),
                order("o4", "CANCELLED", &[("p1", 50)]),
            ],
        )
        .await;

        let totals = pending_quantities(&orders).await.unwrap();
        assert_eq!(totals.get("p1"), Some(&5));
        assert_eq!(totals.get("p2"), Some(&1));
    }

    #[tokio::test]
    async fn rebases_on_remote_stock() {
        let local = MemoryStore::new("products");
        let remote = MemoryStore::new("products");
        let orders = MemoryStore::new("orders");
        seed(&local, vec![product("p1", "Aspirin", 10), product("p2", "Gauze", 3)]).await;
        seed(&remote, vec![product("p1", "Aspirin", 40), product("p2", "Gauze", 3)]).await;
        seed(&orders, vec![order("o1", "COMPLETED", &[("p1", 4)])]).await;

        let ids = vec!["p1".to_string(), "p2".to_string(), "p3".to_string()];
        let report = reconcile_stock(&local, &remote, &orders, &ids).await.unwrap();

        assert_eq!(report.changed(), 1);
        assert_eq!(report.adjusted[0].new_stock, 36);
        assert!(!report.adjusted[1].changed);
        assert_eq!(report.skipped, vec![("p3".to_string(), "missing remotely".to_string())]);

        let p1 = local.get("p1").await.unwrap();
        assert_eq!(p1.i64_field("stock"), Some(36));
        assert_eq!(p1.revision, report.adjusted[0].revision);
    }

    #[tokio::test]
    async fn purged_orders_no_longer_count() {
        let local = MemoryStore::new("products");
        let remote = MemoryStore::new("products");
        let orders = MemoryStore::new("orders");
        seed(&local, vec![product("p1", "Aspirin", 10)]).await;
        seed(&remote, vec![product("p1", "Aspirin", 8)]).await;
        let rev = orders
            .put(order("o1", "COMPLETED", &[("p1", 2)]), None)
            .await
            .unwrap();
        orders.remove("o1", &rev).await.unwrap();

        let report = reconcile_stock(&local, &remote, &orders, &["p1".to_string()])
            .await
            .unwrap();
        assert_eq!(report.adjusted[0].new_stock, 8);
    }
}
