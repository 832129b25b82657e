//! The engine's entry point.

use crate::config::{AdapterKind, CollectionConfig, SyncConfig};
use crate::coordinator::{CollectionStores, CoordinatorSettings, ReplicationCoordinator};
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SessionEvent};
use crate::options::SyncOptions;
use crate::resolver::ConflictResolver;
use crate::session::ReplicationSession;
use crate::state::SessionState;
use crate::status::{StatusRegistry, SyncStatusEntry};
use crate::stock::{reconcile_stock, StockReport};
use crate::write_queue::WriteQueue;
use futures::future::join_all;
use parking_lot::RwLock;
use possync_protocol::{BatchResult, Direction};
use possync_store::{DocumentStore, HttpStore, MemoryStore, ReqwestClient};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Outcome of [`SyncContext::trigger_manual_sync`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManualSyncResult {
    /// False if the cycle failed or every attempted write was rejected.
    pub ok: bool,
    /// Changes read from both feeds.
    pub docs_read: u64,
    /// Revisions written to either side.
    pub docs_written: u64,
    /// Documents rejected by either side.
    pub doc_write_failures: u64,
    /// Per-document and cycle errors.
    pub errors: Vec<String>,
}

impl From<BatchResult> for ManualSyncResult {
    fn from(result: BatchResult) -> Self {
        Self {
            ok: result.ok(),
            docs_read: result.docs_read,
            docs_written: result.docs_written,
            doc_write_failures: result.doc_write_failures,
            errors: result.errors,
        }
    }
}

struct CollectionEntry {
    stores: CollectionStores,
    options: Option<SyncOptions>,
    session: Option<Arc<ReplicationSession>>,
    flusher: Option<JoinHandle<()>>,
}

/// Owns every collection's stores, sessions and shared engine services.
///
/// Built once from a [`SyncConfig`] and passed to whoever needs it.
pub struct SyncContext {
    config: SyncConfig,
    coordinator: ReplicationCoordinator,
    events: EventBus<SessionEvent>,
    status: Arc<StatusRegistry>,
    collections: RwLock<BTreeMap<String, CollectionEntry>>,
}

impl SyncContext {
    /// Creates a context with no collections.
    pub fn new(config: SyncConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        let status = Arc::new(StatusRegistry::new());
        let settings = CoordinatorSettings {
            retry: config.retry.clone(),
            batch_size: config.batch_size,
            live_timeout: config.live_timeout,
        };
        let resolver = ConflictResolver::new(config.resolver_workers, config.resolver_timeout);
        let coordinator =
            ReplicationCoordinator::new(settings, resolver, events.clone(), Arc::clone(&status));
        Self {
            config,
            coordinator,
            events,
            status,
            collections: RwLock::new(BTreeMap::new()),
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Registers `name`, replicating between `local` and `remote`.
    ///
    /// Re-registering replaces the stores; a running session keeps the old
    /// ones until restarted.
    pub fn register_collection(
        &self,
        name: &str,
        local: Arc<dyn DocumentStore>,
        remote: Arc<dyn DocumentStore>,
    ) -> Arc<WriteQueue> {
        let queue = Arc::new(WriteQueue::new(
            name,
            Arc::clone(&local),
            self.config.write_queue.clone(),
        ));
        let stores = CollectionStores::new(local, remote).with_write_queue(Arc::clone(&queue));
        let options = self.config.collection(name).map(CollectionConfig::to_options);

        let mut collections = self.collections.write();
        let previous = collections.insert(
            name.to_string(),
            CollectionEntry {
                stores,
                options,
                session: None,
                flusher: None,
            },
        );
        if let Some(previous) = previous {
            if let Some(queue) = previous.stores.write_queue {
                queue.stop_flusher();
            }
            if let Some(entry) = collections.get_mut(name) {
                entry.session = previous.session;
            }
        }
        queue
    }

    /// Registers `name` with the remote its configuration names.
    pub fn register_configured(
        &self,
        name: &str,
        local: Arc<dyn DocumentStore>,
    ) -> SyncResult<Arc<WriteQueue>> {
        let collection = self
            .config
            .collection(name)
            .ok_or_else(|| SyncError::UnknownCollection(name.to_string()))?;
        let remote = remote_store(&self.config, collection)?;
        Ok(self.register_collection(name, local, remote))
    }

    /// Registered collection names.
    pub fn collections(&self) -> Vec<String> {
        self.collections.read().keys().cloned().collect()
    }

    /// Starts replicating `collection`.
    ///
    /// # Errors
    ///
    /// - [`SyncError::Disabled`] if sync is switched off
    /// - [`SyncError::UnknownCollection`] if it was never registered
    /// - [`SyncError::AlreadyRunning`] if its session task is still running
    pub fn start_sync(
        &self,
        collection: &str,
        options: SyncOptions,
    ) -> SyncResult<Arc<ReplicationSession>> {
        if !self.config.enabled {
            return Err(SyncError::Disabled);
        }
        let mut collections = self.collections.write();
        let entry = collections
            .get_mut(collection)
            .ok_or_else(|| SyncError::UnknownCollection(collection.to_string()))?;
        if entry.session.as_ref().is_some_and(|session| session.is_running()) {
            return Err(SyncError::AlreadyRunning(collection.to_string()));
        }

        if entry.flusher.as_ref().map_or(true, JoinHandle::is_finished) {
            entry.flusher = entry.stores.write_queue.as_ref().map(WriteQueue::spawn_flusher);
        }

        let session = self.launch(collection, entry.stores.clone(), options.clone());
        entry.options = Some(options);
        entry.session = Some(Arc::clone(&session));
        info!(collection, session = %session.id(), "sync started");
        Ok(session)
    }

    /// Starts every registered collection with its configured options.
    pub fn start_all(&self) -> SyncResult<Vec<Arc<ReplicationSession>>> {
        let mut sessions = Vec::new();
        for name in self.collections() {
            sessions.push(self.start_sync(&name, self.options_for(&name))?);
        }
        Ok(sessions)
    }

    fn launch(
        &self,
        collection: &str,
        stores: CollectionStores,
        options: SyncOptions,
    ) -> Arc<ReplicationSession> {
        match options.direction {
            Direction::Bidirectional => {
                let strategy = options.strategy.clone();
                self.coordinator
                    .start_bidirectional_sync(collection, stores, strategy, options)
            }
            Direction::Push | Direction::Pull => {
                self.coordinator
                    .start_unidirectional_sync(collection, stores, options)
            }
        }
    }

    /// Stops `collection`'s session and flushes its pending local edits.
    /// Idempotent.
    pub async fn stop_sync(&self, collection: &str) -> SyncResult<()> {
        let (session, stores, flusher) = {
            let mut collections = self.collections.write();
            let entry = collections
                .get_mut(collection)
                .ok_or_else(|| SyncError::UnknownCollection(collection.to_string()))?;
            (
                entry.session.clone(),
                entry.stores.clone(),
                entry.flusher.take(),
            )
        };

        if let Some(session) = session {
            self.coordinator.stop(&session).await;
        }
        if let Some(queue) = &stores.write_queue {
            queue.stop_flusher();
            if let Some(flusher) = flusher {
                if let Err(err) = flusher.await {
                    warn!(collection, error = %err, "write queue flusher ended abnormally");
                }
            }
            if let Err(err) = queue.flush().await {
                warn!(collection, error = %err, "final write queue flush failed");
            }
        }
        info!(collection, "sync stopped");
        Ok(())
    }

    /// Stops every session.
    pub async fn shutdown(&self) {
        let names = self.collections();
        let results = join_all(names.iter().map(|name| self.stop_sync(name))).await;
        for (name, result) in names.iter().zip(results) {
            if let Err(err) = result {
                warn!(collection = %name, error = %err, "stop failed during shutdown");
            }
        }
    }

    /// Status of `collection`.
    pub fn get_sync_status(&self, collection: &str) -> SyncStatusEntry {
        self.status.get(collection)
    }

    /// Status registry shared by every session.
    pub fn status(&self) -> &StatusRegistry {
        &self.status
    }

    /// Current or last session of `collection`.
    pub fn session(&self, collection: &str) -> Option<Arc<ReplicationSession>> {
        self.collections
            .read()
            .get(collection)
            .and_then(|entry| entry.session.clone())
    }

    /// Write queue of `collection`.
    pub fn write_queue(&self, collection: &str) -> Option<Arc<WriteQueue>> {
        self.collections
            .read()
            .get(collection)
            .and_then(|entry| entry.stores.write_queue.clone())
    }

    /// Event bus shared by every session.
    pub fn events(&self) -> &EventBus<SessionEvent> {
        &self.events
    }

    /// Subscribes to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Options `collection` runs with: those of its last start, else its
    /// configuration, else the defaults.
    pub fn options_for(&self, collection: &str) -> SyncOptions {
        self.collections
            .read()
            .get(collection)
            .and_then(|entry| entry.options.clone())
            .unwrap_or_default()
    }

    /// Runs one cycle for `collection` now, without retry.
    ///
    /// If the cycle succeeds and the collection's live session had ended in
    /// `Error`, a fresh live session is started with the same options.
    ///
    /// # Errors
    ///
    /// [`SyncError::Disabled`] or [`SyncError::UnknownCollection`]. Cycle
    /// failures are reported in the result.
    pub async fn trigger_manual_sync(&self, collection: &str) -> SyncResult<ManualSyncResult> {
        if !self.config.enabled {
            return Err(SyncError::Disabled);
        }
        let (stores, options, previous) = {
            let collections = self.collections.read();
            let entry = collections
                .get(collection)
                .ok_or_else(|| SyncError::UnknownCollection(collection.to_string()))?;
            (
                entry.stores.clone(),
                entry.options.clone().unwrap_or_default(),
                entry.session.clone(),
            )
        };

        info!(collection, "manual sync requested");
        let outcome = self
            .coordinator
            .sync_once(collection, &stores, options, previous.as_deref())
            .await;

        let result = match outcome {
            Ok(result) => result,
            Err(err) => {
                warn!(collection, error = %err, "manual sync failed");
                return Ok(ManualSyncResult {
                    ok: false,
                    errors: vec![err.to_string()],
                    ..ManualSyncResult::default()
                });
            }
        };

        let failed_live = previous
            .as_ref()
            .filter(|session| session.options().live && session.state() == SessionState::Error);
        if let Some(previous) = failed_live {
            info!(collection, "restarting failed live session after manual sync");
            let session = self.coordinator.restart(previous, stores);
            if let Some(entry) = self.collections.write().get_mut(collection) {
                entry.session = Some(session);
            }
        }
        Ok(result.into())
    }

    /// Rebases local product stock on the remote count.
    ///
    /// See [`reconcile_stock`](crate::stock::reconcile_stock).
    pub async fn reconcile_stock(
        &self,
        products: &str,
        orders: &str,
        ids: &[String],
    ) -> SyncResult<StockReport> {
        let (product_stores, order_stores) = {
            let collections = self.collections.read();
            let lookup = |name: &str| {
                collections
                    .get(name)
                    .map(|entry| entry.stores.clone())
                    .ok_or_else(|| SyncError::UnknownCollection(name.to_string()))
            };
            (lookup(products)?, lookup(orders)?)
        };
        reconcile_stock(
            product_stores.local.as_ref(),
            product_stores.remote.as_ref(),
            order_stores.local.as_ref(),
            ids,
        )
        .await
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("config", &self.config)
            .field("collections", &self.collections())
            .finish_non_exhaustive()
    }
}

/// Builds the remote store `collection` is configured with.
pub fn remote_store(
    config: &SyncConfig,
    collection: &CollectionConfig,
) -> SyncResult<Arc<dyn DocumentStore>> {
    match collection.adapter {
        AdapterKind::Memory => Ok(Arc::new(MemoryStore::new(collection.remote_database()))),
        AdapterKind::Http => {
            let mut client = ReqwestClient::new(&config.remote_url, config.request_timeout)?;
            if let Some(credentials) = &config.credentials {
                client = client.with_credentials(credentials.clone());
            }
            Ok(Arc::new(HttpStore::new(collection.remote_database(), client)))
        }
    }
}
