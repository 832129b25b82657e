//! # possync testkit
//!
//! Test utilities for possync.
//!
//! This crate provides:
//! - Document fixtures for the point-of-sale collections
//! - Seeded store helpers and snapshot files
//! - [`FaultyStore`], a store wrapper that injects scripted failures
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use possync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn replicates_orders() {
//!     let local = seeded_store("orders", vec![order("o1", "COMPLETED", &[("p1", 2)])]).await;
//!     let remote = FaultyStore::new(MemoryStore::new("orders"));
//!     remote.fail_next(1, StoreError::Timeout);
//!     // ... drive a session against `local` and `remote`
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod faulty;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::faulty::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use possync_protocol::{Document, Revision};
    pub use possync_store::{DocumentStore, MemoryStore, StoreError};
}

pub use faulty::*;
pub use fixtures::*;
pub use generators::*;
