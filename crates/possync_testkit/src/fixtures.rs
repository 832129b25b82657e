//! Document fixtures and store helpers.
//!
//! Provides builders for the point-of-sale collections and convenience
//! functions for setting up seeded stores.

use possync_protocol::{Checkpoint, Document, Payload};
use possync_store::{BulkMode, ChangesRequest, DocumentStore, MemorySnapshot, MemoryStore};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// Fixed timestamp used by fixtures unless a test sets its own.
pub const FIXTURE_TIME: &str = "2024-01-15T10:00:00Z";

/// Builds an unwritten product document.
pub fn product(id: &str, name: &str, stock: i64) -> Document {
    Document::from_value(
        id,
        json!({
            "type": "product",
            "name": name,
            "stock": stock,
            "updated_at": FIXTURE_TIME,
        }),
    )
}

/// Builds an unwritten order document.
///
/// `items` lists `(product_id, quantity)` lines.
pub fn order(id: &str, status: &str, items: &[(&str, i64)]) -> Document {
    let lines: Vec<Value> = items
        .iter()
        .map(|(product_id, quantity)| json!({"product_id": product_id, "quantity": quantity}))
        .collect();
    Document::from_value(
        id,
        json!({
            "type": "order",
            "status": status,
            "items": lines,
            "created_at": FIXTURE_TIME,
        }),
    )
}

/// Returns `doc` with its `updated_at` set to `timestamp`.
pub fn updated_at(mut doc: Document, timestamp: &str) -> Document {
    doc.set_field("updated_at", Value::String(timestamp.to_string()));
    doc
}

/// Returns a payload built from a JSON object literal.
pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

/// Writes `docs` into `store` as fresh edits.
///
/// # Panics
///
/// Panics if any document is rejected.
pub async fn seed(store: &dyn DocumentStore, docs: Vec<Document>) {
    let results = store
        .bulk_put(docs, BulkMode::NewEdits)
        .await
        .expect("seed bulk_put failed");
    for result in results {
        assert!(result.is_acknowledged(), "seed rejected {}", result.id);
    }
}

/// Creates a memory store named `name` holding `docs`.
pub async fn seeded_store(name: &str, docs: Vec<Document>) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new(name));
    seed(store.as_ref(), docs).await;
    store
}

/// Copies every winning revision of `from` into `to` as replicated
/// revisions, so both sides share history.
pub async fn mirror(from: &MemoryStore, to: &MemoryStore) {
    let snapshot = from.snapshot();
    let ids: Vec<String> = from
        .changes(
            &Checkpoint::zero(),
            ChangesRequest::batch(snapshot.len().max(1)),
        )
        .await
        .expect("changes failed")
        .results
        .into_iter()
        .map(|change| change.id)
        .collect();
    let leaves = from.bulk_get(&ids).await.expect("bulk_get failed");
    let docs: Vec<Document> = leaves.into_iter().flat_map(|l| l.leaves).collect();
    to.bulk_put(docs, BulkMode::Replicate)
        .await
        .expect("mirror bulk_put failed");
}

/// A temporary directory holding a snapshot file.
pub struct SnapshotFile {
    /// Path of the snapshot file.
    pub path: PathBuf,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: TempDir,
}

impl SnapshotFile {
    /// Writes one snapshot per collection into a fresh temporary file.
    pub fn write(stores: &[(&str, &MemoryStore)]) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("local.json");
        let snapshots: BTreeMap<&str, MemorySnapshot> = stores
            .iter()
            .map(|(name, store)| (*name, store.snapshot()))
            .collect();
        let json = serde_json::to_vec_pretty(&snapshots).expect("Failed to encode snapshot");
        std::fs::write(&path, json).expect("Failed to write snapshot");
        Self {
            path,
            _temp_dir: temp_dir,
        }
    }

    /// Reads the snapshots back.
    pub fn read(&self) -> BTreeMap<String, MemorySnapshot> {
        let bytes = std::fs::read(&self.path).expect("Failed to read snapshot");
        serde_json::from_slice(&bytes).expect("Failed to decode snapshot")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_lines() {
        let doc = order("o1", "COMPLETED", &[("p1", 2), ("p2", 1)]);
        assert_eq!(doc.str_field("status"), Some("COMPLETED"));
        assert_eq!(doc.field("items").unwrap()[0]["quantity"], 2);
    }

    #[tokio::test]
    async fn seeded_and_mirrored() {
        let local = seeded_store("products", vec![product("p1", "Aspirin", 10)]).await;
        let remote = MemoryStore::new("products");
        mirror(&local, &remote).await;

        let a = local.get("p1").await.unwrap();
        let b = remote.get("p1").await.unwrap();
        assert_eq!(a.revision, b.revision);
    }

    #[tokio::test]
    async fn snapshot_file_roundtrip() {
        let store = seeded_store("orders", vec![order("o1", "OPEN", &[])]).await;
        let file = SnapshotFile::write(&[("orders", store.as_ref())]);
        let snapshots = file.read();
        assert_eq!(snapshots["orders"].len(), 1);
    }
}
