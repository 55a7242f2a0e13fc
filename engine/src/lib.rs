//! # docsync engine
//!
//! The pure half of the docsync offline-first client: documents, pending
//! operation records and the local query engine.
//!
//! ## Design Principles
//!
//! - **No IO**: nothing here knows about storage, the network or time
//! - **Deterministic**: the same documents and query always give the same result
//! - **Mirrors the remote**: queries evaluate locally with the remote API's semantics
//!
//! ## Core Concepts
//!
//! ### Documents
//!
//! A [`Document`] is an open key/value map with reserved `_id`, `_acl` and
//! `_kmd` fields. A document created offline carries `_kmd.local = true`
//! until the server assigns it a real identity.
//!
//! ### Sync records
//!
//! Each local change leaves a [`SyncRecord`] describing the pending
//! [`SyncOperation`] for one document.
//!
//! ### Queries
//!
//! A [`Query`] holds a filter tree, sort keys, paging and a projection.
//! [`evaluate`] runs it over documents; [`Query::fingerprint`] gives the
//! cache key used for delta sync.
//!
//! ## Quick Start
//!
//! ```rust
//! use docsync_engine::{evaluate, Query};
//! use serde_json::json;
//!
//! let docs = vec![
//!     json!({"_id": "1", "title": "Dune", "pages": 412}),
//!     json!({"_id": "2", "title": "Ubik", "pages": 202}),
//! ];
//!
//! let query = Query::new().greater_than("pages", 300).with_fields(["title"]);
//! let result = evaluate(docs, &query).unwrap();
//!
//! assert_eq!(result, vec![json!({"_id": "1", "title": "Dune"})]);
//! ```

pub mod document;
pub mod error;
pub mod evaluate;
pub mod matcher;
pub mod operation;
pub mod query;

// Re-export main types at crate root
pub use document::{Document, Metadata, PROTECTED_FIELDS};
pub use error::Error;
pub use evaluate::{evaluate, matches, sort_documents};
pub use matcher::Filter;
pub use operation::{SyncOperation, SyncRecord};
pub use query::{Comparable, JoinOperator, Query, SortDirection, UNBOUNDED_LIMIT};

/// Type aliases for clarity
pub type EntityId = String;
pub type RecordId = String;
pub type CollectionName = String;
