//! Per-collection sync status.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;

/// Status of one collection's sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatusEntry {
    /// Collection name.
    pub collection: String,
    /// True while the session is connecting or transferring.
    pub is_active: bool,
    /// End of the last successful cycle.
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Last session-fatal or cycle error.
    pub last_error: Option<String>,
}

impl SyncStatusEntry {
    fn idle(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            is_active: false,
            last_sync_time: None,
            last_error: None,
        }
    }

    /// Derived health.
    pub fn health(&self) -> Health {
        if self.last_error.is_some() {
            Health::Error
        } else if self.is_active {
            Health::Syncing
        } else {
            Health::Healthy
        }
    }
}

/// Health shown to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    /// Idle or caught up.
    Healthy,
    /// Work in progress.
    Syncing,
    /// The last cycle or session failed.
    Error,
}

/// Process-wide status bookkeeping.
#[derive(Debug, Default)]
pub struct StatusRegistry {
    entries: RwLock<BTreeMap<String, SyncStatusEntry>>,
}

impl StatusRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records activity and, if given, an error.
    pub fn update(&self, collection: &str, is_active: bool, error: Option<String>) {
        let mut entries = self.entries.write();
        let entry = entries
            .entry(collection.to_string())
            .or_insert_with(|| SyncStatusEntry::idle(collection));
        entry.is_active = is_active;
        if error.is_some() {
            entry.last_error = error;
        }
    }

    /// Records a successful cycle: stamps the time and clears the error.
    pub fn record_success(&self, collection: &str) {
        let mut entries = self.entries.write();
        let entry = entries
            .entry(collection.to_string())
            .or_insert_with(|| SyncStatusEntry::idle(collection));
        entry.last_sync_time = Some(Utc::now());
        entry.last_error = None;
    }

    /// Returns the entry for `collection`; unknown collections are idle.
    pub fn get(&self, collection: &str) -> SyncStatusEntry {
        self.entries
            .read()
            .get(collection)
            .cloned()
            .unwrap_or_else(|| SyncStatusEntry::idle(collection))
    }

    /// Returns all entries.
    pub fn get_all(&self) -> BTreeMap<String, SyncStatusEntry> {
        self.entries.read().clone()
    }

    /// Overall health: any error wins, then any activity.
    pub fn health(&self) -> Health {
        let entries = self.entries.read();
        if entries.values().any(|e| e.health() == Health::Error) {
            Health::Error
        } else if entries.values().any(|e| e.is_active) {
            Health::Syncing
        } else {
            Health::Healthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_collection_is_idle() {
        let registry = StatusRegistry::new();
        let entry = registry.get("orders");
        assert!(!entry.is_active);
        assert!(entry.last_sync_time.is_none());
        assert_eq!(entry.health(), Health::Healthy);
    }

    #[test]
    fn error_then_success() {
        let registry = StatusRegistry::new();
        registry.update("orders", true, None);
        assert_eq!(registry.health(), Health::Syncing);

        registry.update("orders", false, Some("offline".into()));
        assert_eq!(registry.get("orders").health(), Health::Error);
        assert_eq!(registry.health(), Health::Error);

        // Activity alone keeps the error visible.
        registry.update("orders", true, None);
        assert_eq!(registry.get("orders").last_error.as_deref(), Some("offline"));

        registry.record_success("orders");
        registry.update("orders", false, None);
        let entry = registry.get("orders");
        assert!(entry.last_error.is_none());
        assert!(entry.last_sync_time.is_some());
        assert_eq!(registry.health(), Health::Healthy);
    }

    #[test]
    fn get_all_lists_every_collection() {
        let registry = StatusRegistry::new();
        registry.update("orders", false, None);
        registry.update("products", true, None);
        let all = registry.get_all();
        assert_eq!(all.len(), 2);
        assert!(all["products"].is_active);
    }
}
