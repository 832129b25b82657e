//! # possync protocol
//!
//! Data types shared by every possync crate.
//!
//! This crate provides:
//! - [`Document`] and [`Revision`] for revision-tracked documents
//! - [`ChangeEvent`], [`ChangesBatch`] and [`Checkpoint`] for change feeds
//! - [`BatchResult`] for per-batch replication accounting
//! - [`ConflictRecord`] describing one resolved conflict
//! - CouchDB-style JSON mapping for documents
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod change;
mod conflict;
mod direction;
mod document;
mod error;
mod revision;

pub use batch::BatchResult;
pub use change::{ChangeEvent, ChangesBatch, Checkpoint};
pub use conflict::ConflictRecord;
pub use direction::{Direction, Flow};
pub use document::{Document, Payload};
pub use error::{ProtocolError, ProtocolResult};
pub use revision::{Revision, REVS_LIMIT};
