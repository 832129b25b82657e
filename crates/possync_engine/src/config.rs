//! Configuration for the sync engine.

use crate::error::{SyncError, SyncResult};
use crate::options::SyncOptions;
use crate::resolver::ConflictStrategy;
use crate::retry::RetryPolicy;
use crate::write_queue::WriteQueueConfig;
use crate::merge::FieldMergePolicy;
use possync_protocol::Direction;
use possync_store::Credentials;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Serde helper storing a [`Duration`] as integer milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Where a collection's remote lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    /// CouchDB-compatible server at `remote_url`.
    #[default]
    Http,
    /// In-process store, for demos and tests.
    Memory,
}

/// Built-in collection behaviors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionPreset {
    /// See [`SyncOptions::orders`].
    Orders,
    /// See [`SyncOptions::products`].
    Products,
}

/// Conflict strategy as written in configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ConflictPolicyConfig {
    /// [`ConflictStrategy::RemoteWins`].
    RemoteWins,
    /// [`ConflictStrategy::LocalWins`].
    LocalWins,
    /// [`ConflictStrategy::Merge`].
    Merge,
    /// Field policy keeping `fields` from the local side.
    RemoteWinsExcept {
        /// Fields kept from the local side.
        fields: Vec<String>,
    },
}

impl ConflictPolicyConfig {
    /// Builds the strategy.
    pub fn to_strategy(&self) -> ConflictStrategy {
        match self {
            ConflictPolicyConfig::RemoteWins => ConflictStrategy::RemoteWins,
            ConflictPolicyConfig::LocalWins => ConflictStrategy::LocalWins,
            ConflictPolicyConfig::Merge => ConflictStrategy::Merge,
            ConflictPolicyConfig::RemoteWinsExcept { fields } => ConflictStrategy::Fields(
                FieldMergePolicy::remote_wins_except(fields.iter().cloned()),
            ),
        }
    }
}

/// Configuration of one synced collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Collection name.
    pub name: String,
    /// Remote database name; defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    /// Remote adapter.
    #[serde(default)]
    pub adapter: AdapterKind,
    /// Built-in behavior to start from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<CollectionPreset>,
    /// Overrides the preset's direction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    /// Overrides the preset's live flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live: Option<bool>,
    /// Overrides the preset's conflict strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ConflictPolicyConfig>,
}

impl CollectionConfig {
    /// Creates a collection config with no preset.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            database: None,
            adapter: AdapterKind::default(),
            preset: None,
            direction: None,
            live: None,
            conflict: None,
        }
    }

    /// Sets the preset.
    pub fn with_preset(mut self, preset: CollectionPreset) -> Self {
        self.preset = Some(preset);
        self
    }

    /// Sets the adapter.
    pub fn with_adapter(mut self, adapter: AdapterKind) -> Self {
        self.adapter = adapter;
        self
    }

    /// Remote database name.
    pub fn remote_database(&self) -> &str {
        self.database.as_deref().unwrap_or(&self.name)
    }

    /// Builds the sync options: preset first, then explicit overrides.
    pub fn to_options(&self) -> SyncOptions {
        let mut options = match self.preset {
            Some(CollectionPreset::Orders) => SyncOptions::orders(),
            Some(CollectionPreset::Products) => SyncOptions::products(),
            None => SyncOptions::default(),
        };
        if let Some(direction) = self.direction {
            options.direction = direction;
        }
        if let Some(live) = self.live {
            options.live = live;
        }
        if let Some(conflict) = &self.conflict {
            options.strategy = conflict.to_strategy();
        }
        options
    }
}

/// Configuration for sync operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Master switch; when false no session starts.
    pub enabled: bool,
    /// Base URL of the remote server.
    pub remote_url: String,
    /// Remote credentials.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    /// Retry configuration.
    pub retry: RetryPolicy,
    /// Maximum changes read per batch.
    pub batch_size: usize,
    /// How long a live session waits for new changes per poll.
    #[serde(rename = "live_timeout_ms", with = "millis")]
    pub live_timeout: Duration,
    /// Bound for one custom conflict resolution.
    #[serde(rename = "resolver_timeout_ms", with = "millis")]
    pub resolver_timeout: Duration,
    /// Custom resolutions running at once.
    pub resolver_workers: usize,
    /// Local write coalescing.
    pub write_queue: WriteQueueConfig,
    /// Default timeout of remote requests.
    #[serde(rename = "request_timeout_ms", with = "millis")]
    pub request_timeout: Duration,
    /// Events buffered per subscriber.
    pub event_capacity: usize,
    /// Synced collections.
    pub collections: Vec<CollectionConfig>,
}

impl SyncConfig {
    /// Creates a configuration for the remote at `remote_url`.
    pub fn new(remote_url: impl Into<String>) -> Self {
        Self {
            enabled: true,
            remote_url: remote_url.into(),
            credentials: None,
            retry: RetryPolicy::default(),
            batch_size: 100,
            live_timeout: Duration::from_secs(30),
            resolver_timeout: Duration::from_secs(5),
            resolver_workers: 4,
            write_queue: WriteQueueConfig::default(),
            request_timeout: Duration::from_secs(30),
            event_capacity: 1024,
            collections: Vec::new(),
        }
    }

    /// Parses a JSON configuration and validates it.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        let config: SyncConfig =
            serde_json::from_str(json).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges and collection names.
    pub fn validate(&self) -> SyncResult<()> {
        if self.batch_size == 0 {
            return Err(SyncError::Config("batch_size must be positive".into()));
        }
        if self.resolver_workers == 0 {
            return Err(SyncError::Config("resolver_workers must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Config("retry.max_attempts must be positive".into()));
        }
        let mut seen = HashSet::new();
        for collection in &self.collections {
            if !seen.insert(collection.name.as_str()) {
                return Err(SyncError::Config(format!(
                    "collection {} configured twice",
                    collection.name
                )));
            }
            if collection.adapter == AdapterKind::Http && self.remote_url.is_empty() {
                return Err(SyncError::Config(format!(
                    "collection {} uses the http adapter but remote_url is empty",
                    collection.name
                )));
            }
        }
        Ok(())
    }

    /// Returns the configuration of `name`.
    pub fn collection(&self, name: &str) -> Option<&CollectionConfig> {
        self.collections.iter().find(|c| c.name == name)
    }

    /// Enables or disables sync.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the credentials.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the live poll timeout.
    pub fn with_live_timeout(mut self, timeout: Duration) -> Self {
        self.live_timeout = timeout;
        self
    }

    /// Sets the resolver bounds.
    pub fn with_resolver(mut self, workers: usize, timeout: Duration) -> Self {
        self.resolver_workers = workers;
        self.resolver_timeout = timeout;
        self
    }

    /// Sets the write queue configuration.
    pub fn with_write_queue(mut self, write_queue: WriteQueueConfig) -> Self {
        self.write_queue = write_queue;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Adds a collection.
    pub fn with_collection(mut self, collection: CollectionConfig) -> Self {
        self.collections.push(collection);
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new("http://localhost:5984")
            .with_batch_size(50)
            .with_live_timeout(Duration::from_secs(10))
            .with_retry(RetryPolicy::new(5));

        assert!(config.enabled);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.live_timeout, Duration::from_secs(10));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(1000));
    }

    #[test]
    fn parses_json_with_defaults() {
        let config = SyncConfig::from_json(
            r#"{
                "remote_url": "http://couch:5984",
                "credentials": {"username": "pos", "password": "secret"},
                "retry": {"base_delay_ms": 500},
                "collections": [
                    {"name": "orders", "preset": "orders"},
                    {"name": "products", "preset": "products", "live": false},
                    {"name": "customers", "adapter": "memory",
                     "conflict": {"strategy": "remote_wins_except", "fields": ["notes"]}}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.retry.base_delay, Duration::from_millis(500));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.collections.len(), 3);

        let orders = config.collection("orders").unwrap().to_options();
        assert_eq!(orders.direction, Direction::Push);

        let products = config.collection("products").unwrap().to_options();
        assert!(!products.live);

        let customers = config.collection("customers").unwrap();
        assert_eq!(customers.adapter, AdapterKind::Memory);
        assert_eq!(customers.to_options().strategy.name(), "fields");
    }

    #[test]
    fn rejects_duplicate_collections() {
        let config = SyncConfig::new("http://couch:5984")
            .with_collection(CollectionConfig::new("orders"))
            .with_collection(CollectionConfig::new("orders"));
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn http_adapter_needs_url() {
        let config = SyncConfig::default().with_collection(CollectionConfig::new("orders"));
        assert!(config.validate().is_err());

        let config = SyncConfig::default()
            .with_collection(CollectionConfig::new("orders").with_adapter(AdapterKind::Memory));
        assert!(config.validate().is_ok());
    }
}
