//! # possync engine
//!
//! Offline-first replication for point-of-sale terminals.
//!
//! This crate provides:
//! - Replication sessions per collection (bidirectional or one-way, live or
//!   one-shot)
//! - Conflict resolution with declarative field policies
//! - Purge of write-once records once the remote acknowledged them
//! - Change filters and per-direction document transforms
//! - Retry with exponential backoff and a per-collection status registry
//! - A coalescing write queue for local edits
//! - Explicit stock reconciliation
//!
//! ## Architecture
//!
//! Each session runs a **pull-then-push** cycle:
//! 1. Pull remote revisions the terminal lacks
//! 2. Resolve documents that became conflicted
//! 3. Push local revisions the remote lacks
//! 4. Purge acknowledged terminal records
//!
//! ## Key Invariants
//!
//! - Checkpoints advance only past fully applied batches
//! - A document is purged strictly after its push acknowledgement
//! - Re-running a converged cycle writes nothing
//! - Conflict resolution is deterministic for the same leaves and strategy
//! - Authorization failures are never retried
//!
//! ## Example
//!
//! ```rust
//! use possync_engine::{SyncConfig, SyncContext, SyncOptions};
//! use possync_store::MemoryStore;
//! use std::sync::Arc;
//!
//! let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
//! rt.block_on(async {
//!     let ctx = SyncContext::new(SyncConfig::default());
//!     ctx.register_collection(
//!         "products",
//!         Arc::new(MemoryStore::new("products")),
//!         Arc::new(MemoryStore::new("products")),
//!     );
//!     let result = ctx.trigger_manual_sync("products").await.unwrap();
//!     assert!(result.ok);
//!     ctx.start_sync("products", SyncOptions::products()).unwrap();
//!     ctx.shutdown().await;
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod context;
mod coordinator;
mod error;
mod events;
mod filter;
mod merge;
mod options;
mod purge;
mod resolver;
mod retry;
mod session;
mod state;
mod status;
mod stock;
mod write_queue;

pub use config::{AdapterKind, CollectionConfig, CollectionPreset, ConflictPolicyConfig, SyncConfig};
pub use context::{remote_store, ManualSyncResult, SyncContext};
pub use coordinator::{CollectionStores, CoordinatorSettings, ReplicationCoordinator};
pub use error::{SyncError, SyncResult};
pub use events::{EventBus, SessionEvent};
pub use filter::{ChangeFilter, CollectionFilter, DocPredicate, FilterRegistry, Predicate};
pub use merge::{FieldMergeFn, FieldMergePolicy, FieldRule, Side};
pub use options::SyncOptions;
pub use purge::{PurgeManager, RetentionPolicy};
pub use resolver::{ConflictResolver, ConflictStrategy, CustomResolver};
pub use retry::{RetryDecision, RetryPolicy, RetrySupervisor};
pub use session::{ReplicationSession, SessionStats};
pub use state::SessionState;
pub use status::{Health, StatusRegistry, SyncStatusEntry};
pub use stock::{pending_quantities, reconcile_stock, StockAdjustment, StockReport, SOLD_STATUS};
pub use write_queue::{WriteQueue, WriteQueueConfig};
