//! Inspect command implementation.

use super::{CliError, LocalStores};
use possync_store::MemoryStats;
use serde::Serialize;
use std::path::Path;

/// Snapshot inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Snapshot path.
    pub path: String,
    /// Per-collection counts.
    pub collections: Vec<CollectionStats>,
}

/// Counts for a single collection.
#[derive(Debug, Serialize)]
pub struct CollectionStats {
    /// Collection name.
    pub name: String,
    /// Document counts.
    #[serde(flatten)]
    pub stats: MemoryStats,
}

/// Runs the inspect command.
pub fn run(local: &Path, format: &str) -> Result<(), CliError> {
    if !local.exists() {
        return Err(CliError::Io {
            path: local.to_path_buf(),
            source: std::io::ErrorKind::NotFound.into(),
        });
    }
    let result = inspect(&LocalStores::load(local)?, local);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Collects the counts of every collection in `stores`.
pub fn inspect(stores: &LocalStores, path: &Path) -> InspectResult {
    InspectResult {
        path: path.display().to_string(),
        collections: stores
            .iter()
            .map(|(name, store)| CollectionStats {
                name: name.to_string(),
                stats: store.stats(),
            })
            .collect(),
    }
}

fn print_text_output(result: &InspectResult) {
    println!("Snapshot: {}", result.path);
    if result.collections.is_empty() {
        println!("  (no collections)");
        return;
    }
    println!(
        "  {:<20} {:>10} {:>10} {:>10} {:>8}",
        "collection", "documents", "tombstones", "conflicted", "seq"
    );
    for collection in &result.collections {
        println!(
            "  {:<20} {:>10} {:>10} {:>10} {:>8}",
            collection.name,
            collection.stats.documents,
            collection.stats.tombstones,
            collection.stats.conflicted,
            collection.stats.update_seq
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use possync_store::{DocumentStore, MemoryStore};
    use possync_testkit::{order, product, seed, SnapshotFile};

    #[tokio::test]
    async fn counts_documents_per_collection() {
        let products = MemoryStore::new("products");
        let orders = MemoryStore::new("orders");
        seed(&products, vec![product("p1", "Aspirin", 10), product("p2", "Gauze", 4)]).await;
        let rev = orders
            .put(order("o1", "COMPLETED", &[("p1", 1)]), None)
            .await
            .unwrap();
        orders.remove("o1", &rev).await.unwrap();
        let file = SnapshotFile::write(&[("products", &products), ("orders", &orders)]);

        let result = inspect(&LocalStores::load(&file.path).unwrap(), &file.path);
        let names: Vec<&str> = result.collections.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["orders", "products"]);
        assert_eq!(result.collections[0].stats.tombstones, 1);
        assert_eq!(result.collections[0].stats.documents, 0);
        assert_eq!(result.collections[1].stats.documents, 2);

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["collections"][1]["documents"], 2);
    }
}
