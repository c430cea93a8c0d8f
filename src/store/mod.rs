//! Store - transactional document storage for the order pipeline.
//!
//! Documents are typed records keyed by `COLLECTION:id`. All mutations made
//! while processing one order go through a [`Session`], which buffers writes
//! and applies them atomically on [`Session::commit`] after checking that
//! nothing it read has changed underneath it (optimistic concurrency).
//! Dropping a session without committing discards its writes.
//!
//! ## Example
//!
//! ```
//! use order_pipeline::store::{Document, DocumentStore, InMemoryStore, Session};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, Clone)]
//! struct Counter {
//!     id: String,
//!     value: u32,
//! }
//!
//! impl Document for Counter {
//!     const COLLECTION: &'static str = "counters";
//!     fn id(&self) -> &str { &self.id }
//! }
//!
//! let store = InMemoryStore::new();
//! let mut session = store.start_session().unwrap();
//! session.save(&Counter { id: "c1".into(), value: 1 }).unwrap();
//! session.commit().unwrap();
//!
//! let loaded = store.get::<Counter>("c1").unwrap().unwrap();
//! assert_eq!(loaded.data.value, 1);
//! assert_eq!(loaded.version, 1);
//! ```

mod in_memory;
mod session;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Trait for types that can be stored as documents.
pub trait Document: Serialize + DeserializeOwned + Clone + Send + Sync {
    /// The collection name for this document type (e.g., "products", "orders").
    const COLLECTION: &'static str;

    /// Returns the unique identifier for this document.
    fn id(&self) -> &str;
}

/// A versioned wrapper around document data.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub data: T,
    pub version: u64,
}

/// Error type for store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A document read by the session changed before commit.
    #[error("concurrency conflict on {collection}:{id} (expected version {expected}, actual {actual})")]
    ConcurrencyConflict {
        collection: String,
        id: String,
        expected: u64,
        actual: u64,
    },
    /// Insert of a document that already exists.
    #[error("document already exists: {collection}:{id}")]
    AlreadyExists { collection: String, id: String },
    #[error("document not found: {collection}:{id}")]
    NotFound { collection: String, id: String },
    /// Encoding or decoding a document failed.
    #[error("document codec error: {0}")]
    Codec(String),
    /// Storage-level error.
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn not_found<D: Document>(id: &str) -> Self {
        StoreError::NotFound {
            collection: D::COLLECTION.to_string(),
            id: id.to_string(),
        }
    }
}

pub(crate) fn document_key(collection: &str, id: &str) -> String {
    format!("{}:{}", collection, id)
}

pub(crate) fn split_key(key: &str) -> (String, String) {
    match key.split_once(':') {
        Some((collection, id)) => (collection.to_string(), id.to_string()),
        None => (String::new(), key.to_string()),
    }
}

pub use in_memory::{InMemorySession, InMemoryStore};
pub use session::{DocumentStore, Session};
