//! # docrev Core
//!
//! Document abstraction for an embedded, sync-capable document database.
//!
//! This crate provides:
//! - Totally ordered revision IDs (`generation-hash`)
//! - Immutable revisions and a builder for new ones
//! - A document entity with a cached current revision, conflict visibility
//!   and an optimistic-concurrency update loop
//! - Distinct tombstone (replicated) and purge (local) removal
//! - Store traits plus in-memory reference implementations

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attachments;
pub mod database;
pub mod document;
pub mod error;
pub mod memory;
pub mod properties;
pub mod rev_id;
pub mod revision;
pub mod store;
pub mod tree;
pub mod update;

pub use attachments::MemoryAttachmentStore;
pub use database::{Database, DatabaseOptions};
pub use document::{Deletion, Document, Removal};
pub use error::{Error, Result};
pub use memory::MemoryStore;
pub use properties::Properties;
pub use rev_id::{RevisionId, RevisionIdError};
pub use revision::{NewRevision, Revision};
pub use store::{
    AttachmentStore, ContentOptions, EvictionListener, PurgeReport, PurgeRequest, PurgeSelector,
    RevisionDraft, RevisionRecord, RevisionStore,
};
pub use tree::RevisionTree;
pub use update::{RetryPolicy, UpdateDecision};
