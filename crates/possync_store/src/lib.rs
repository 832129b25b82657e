//! # possync store
//!
//! The document store interface the replication engine consumes, plus two
//! implementations.
//!
//! Stores are **revision-tracked document stores**: every write is checked
//! against an expected revision and produces a new one, concurrent branches
//! are kept as conflicting leaves, and a changes feed reports one entry per
//! document in sequence order.
//!
//! ## Available stores
//!
//! - [`MemoryStore`] - Revision-tree store used on terminals and in tests
//! - [`HttpStore`] - CouchDB-compatible remote over any [`HttpClient`]
//!
//! ## Example
//!
//! ```rust
//! use possync_protocol::Document;
//! use possync_store::{DocumentStore, MemoryStore};
//! use serde_json::json;
//!
//! let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
//! rt.block_on(async {
//!     let store = MemoryStore::new("products");
//!     let rev = store
//!         .put(Document::from_value("p1", json!({"name": "Aspirin"})), None)
//!         .await
//!         .unwrap();
//!     assert_eq!(store.get("p1").await.unwrap().revision, Some(rev));
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod http;
mod memory;
mod reqwest_client;
mod store;

pub use error::{StoreError, StoreResult};
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, HttpStore};
pub use memory::{MemorySnapshot, MemoryStats, MemoryStore, Validator};
pub use reqwest_client::{Credentials, ReqwestClient};
pub use store::{
    BulkMode, ChangesRequest, DocWriteResult, DocumentLeaves, DocumentStore, WriteStatus,
};
