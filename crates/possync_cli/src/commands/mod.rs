//! CLI command implementations.

pub mod inspect;
pub mod sync;
pub mod watch;

use possync_engine::{SyncConfig, SyncError};
use possync_store::{MemorySnapshot, MemoryStore};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// A file could not be read or written.
    #[error("{path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A snapshot file is not valid JSON.
    #[error("{path}: invalid snapshot: {source}")]
    Snapshot {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },

    /// The engine rejected a request.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// A sync cycle reported failure.
    #[error("sync of {0} failed")]
    Failed(String),

    /// Output could not be encoded.
    #[error("encoding output: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Reads and validates a sync configuration file.
pub fn load_config(path: &Path) -> Result<SyncConfig, CliError> {
    let json = std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(SyncConfig::from_json(&json)?)
}

/// Local stores of every collection, backed by one snapshot file.
///
/// The file is a JSON object mapping collection names to store images. A
/// missing file is an empty set of stores.
pub struct LocalStores {
    path: PathBuf,
    stores: BTreeMap<String, Arc<MemoryStore>>,
}

impl LocalStores {
    /// Loads `path`, or starts empty if it does not exist.
    pub fn load(path: &Path) -> Result<Self, CliError> {
        let snapshots: BTreeMap<String, MemorySnapshot> = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| CliError::Snapshot {
                path: path.to_path_buf(),
                source,
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => {
                return Err(CliError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let stores = snapshots
            .into_iter()
            .map(|(name, snapshot)| {
                let store = Arc::new(MemoryStore::from_snapshot(name.clone(), snapshot));
                (name, store)
            })
            .collect();
        Ok(Self {
            path: path.to_path_buf(),
            stores,
        })
    }

    /// Returns the store of `collection`, creating an empty one if needed.
    pub fn store(&mut self, collection: &str) -> Arc<MemoryStore> {
        Arc::clone(
            self.stores
                .entry(collection.to_string())
                .or_insert_with(|| Arc::new(MemoryStore::new(collection))),
        )
    }

    /// Stores by collection name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MemoryStore)> {
        self.stores
            .iter()
            .map(|(name, store)| (name.as_str(), store.as_ref()))
    }

    /// Writes every store back to the snapshot file.
    pub fn save(&self) -> Result<(), CliError> {
        let snapshots: BTreeMap<&str, MemorySnapshot> = self
            .stores
            .iter()
            .map(|(name, store)| (name.as_str(), store.snapshot()))
            .collect();
        let json = serde_json::to_vec_pretty(&snapshots)?;
        std::fs::write(&self.path, json).map_err(|source| CliError::Io {
            path: self.path.clone(),
            source,
        })?;
        tracing::debug!(path = %self.path.display(), collections = snapshots.len(), "snapshot saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use possync_store::DocumentStore;
    use possync_testkit::{product, seed, SnapshotFile};
    use tempfile::TempDir;

    #[tokio::test]
    async fn snapshot_round_trip() {
        let products = MemoryStore::new("products");
        seed(&products, vec![product("p1", "Aspirin", 10)]).await;
        let file = SnapshotFile::write(&[("products", &products)]);

        let mut stores = LocalStores::load(&file.path).unwrap();
        let loaded = stores.store("products");
        assert_eq!(loaded.get("p1").await.unwrap().i64_field("stock"), Some(10));

        stores.store("orders");
        stores.save().unwrap();
        let reread = file.read();
        assert_eq!(reread.len(), 2);
        assert!(reread["orders"].is_empty());
    }

    #[test]
    fn missing_snapshot_is_empty() {
        let dir = TempDir::new().unwrap();
        let stores = LocalStores::load(&dir.path().join("none.json")).unwrap();
        assert_eq!(stores.iter().count(), 0);
    }

    #[test]
    fn invalid_snapshot_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(matches!(
            LocalStores::load(&path),
            Err(CliError::Snapshot { .. })
        ));
    }

    #[test]
    fn config_errors_are_surfaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync.json");
        std::fs::write(&path, br#"{"batch_size": 0}"#).unwrap();
        assert!(matches!(load_config(&path), Err(CliError::Sync(_))));
        assert!(matches!(
            load_config(&dir.path().join("missing.json")),
            Err(CliError::Io { .. })
        ));
    }
}
