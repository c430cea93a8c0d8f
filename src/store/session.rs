//! DocumentStore / Session - the transaction boundary.

use super::{Document, StoreError, Versioned};

/// A unit of work against the store.
///
/// Reads see the session's own buffered writes. Nothing is visible to other
/// sessions until `commit` succeeds; a failed or skipped commit leaves the
/// store untouched.
pub trait Session {
    /// Load a document by ID. Returns None if not found.
    fn get<D: Document>(&mut self, id: &str) -> Result<Option<D>, StoreError>;

    /// Upsert a document.
    fn save<D: Document>(&mut self, document: &D) -> Result<(), StoreError>;

    /// Insert a new document. Fails if it already exists, at the latest on commit.
    fn insert<D: Document>(&mut self, document: &D) -> Result<(), StoreError>;

    /// Delete a document by ID.
    fn delete<D: Document>(&mut self, id: &str) -> Result<(), StoreError>;

    /// Apply every buffered write atomically.
    fn commit(self) -> Result<(), StoreError>
    where
        Self: Sized;

    /// Discard every buffered write.
    fn abort(self)
    where
        Self: Sized;
}

/// A store that hands out sessions.
pub trait DocumentStore: Send + Sync {
    type Session: Session;

    /// Begin a new session.
    fn start_session(&self) -> Result<Self::Session, StoreError>;

    /// Read a committed document outside any session.
    fn get<D: Document>(&self, id: &str) -> Result<Option<Versioned<D>>, StoreError>;
}
