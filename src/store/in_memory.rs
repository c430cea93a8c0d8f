//! InMemoryStore - HashMap-backed document store for testing and development.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, trace};

use super::{document_key, split_key, Document, DocumentStore, Session, StoreError, Versioned};

/// Internal stored representation of a document.
struct StoredDocument {
    bytes: Vec<u8>,
    version: u64,
}

type Storage = Arc<RwLock<HashMap<String, StoredDocument>>>;

/// In-memory document store.
///
/// Storage key is `"COLLECTION:id"`, documents are bitcode-encoded.
/// Clone-friendly via Arc.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    storage: Storage,
    fail_next_commit: Arc<AtomicBool>,
}

impl InMemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a document outside any session (seeding, fixtures).
    pub fn put<D: Document>(&self, document: &D) -> Result<u64, StoreError> {
        let key = document_key(D::COLLECTION, document.id());
        let bytes = encode(document)?;
        let mut storage = self
            .storage
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".into()))?;
        let version = storage.get(&key).map(|s| s.version + 1).unwrap_or(1);
        storage.insert(key, StoredDocument { bytes, version });
        Ok(version)
    }

    /// Find committed documents matching a predicate.
    pub fn find<D: Document>(&self, predicate: &dyn Fn(&D) -> bool) -> Result<Vec<D>, StoreError> {
        let prefix = format!("{}:", D::COLLECTION);
        let storage = self
            .storage
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".into()))?;

        let mut found = Vec::new();
        for (key, stored) in storage.iter() {
            if !key.starts_with(&prefix) {
                continue;
            }
            let document: D = decode(&stored.bytes)?;
            if predicate(&document) {
                found.push(document);
            }
        }
        Ok(found)
    }

    /// Number of committed documents in a collection.
    pub fn count(&self, collection: &str) -> usize {
        let prefix = format!("{}:", collection);
        self.storage
            .read()
            .map(|storage| storage.keys().filter(|k| k.starts_with(&prefix)).count())
            .unwrap_or(0)
    }

    /// Make the next commit fail with a storage error.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }
}

impl DocumentStore for InMemoryStore {
    type Session = InMemorySession;

    fn start_session(&self) -> Result<InMemorySession, StoreError> {
        Ok(InMemorySession {
            storage: Arc::clone(&self.storage),
            fail_commit: Arc::clone(&self.fail_next_commit),
            observed: HashMap::new(),
            writes: BTreeMap::new(),
            inserts: HashSet::new(),
        })
    }

    fn get<D: Document>(&self, id: &str) -> Result<Option<Versioned<D>>, StoreError> {
        let key = document_key(D::COLLECTION, id);
        let storage = self
            .storage
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".into()))?;

        match storage.get(&key) {
            Some(stored) => Ok(Some(Versioned {
                data: decode(&stored.bytes)?,
                version: stored.version,
            })),
            None => Ok(None),
        }
    }
}

enum Write {
    Put(Vec<u8>),
    Delete,
}

/// Session over an [`InMemoryStore`].
///
/// Tracks the version of every document it touches; `commit` fails with
/// `ConcurrencyConflict` if any of them moved, and with `AlreadyExists` if an
/// inserted key appeared in the meantime.
pub struct InMemorySession {
    storage: Storage,
    fail_commit: Arc<AtomicBool>,
    /// key -> version first seen (0 = absent)
    observed: HashMap<String, u64>,
    writes: BTreeMap<String, Write>,
    inserts: HashSet<String>,
}

impl InMemorySession {
    fn observe(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let storage = self
            .storage
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".into()))?;
        let stored = storage.get(key);
        self.observed
            .entry(key.to_string())
            .or_insert_with(|| stored.map_or(0, |s| s.version));
        Ok(stored.map(|s| s.bytes.clone()))
    }

    /// Number of buffered writes.
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }
}

impl Session for InMemorySession {
    fn get<D: Document>(&mut self, id: &str) -> Result<Option<D>, StoreError> {
        let key = document_key(D::COLLECTION, id);
        match self.writes.get(&key) {
            Some(Write::Put(bytes)) => return decode(bytes).map(Some),
            Some(Write::Delete) => return Ok(None),
            None => {}
        }
        match self.observe(&key)? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn save<D: Document>(&mut self, document: &D) -> Result<(), StoreError> {
        let key = document_key(D::COLLECTION, document.id());
        let bytes = encode(document)?;
        if !self.observed.contains_key(&key) {
            self.observe(&key)?;
        }
        self.writes.insert(key, Write::Put(bytes));
        Ok(())
    }

    fn insert<D: Document>(&mut self, document: &D) -> Result<(), StoreError> {
        let key = document_key(D::COLLECTION, document.id());
        let already = match self.writes.get(&key) {
            Some(Write::Put(_)) => true,
            Some(Write::Delete) => false,
            None => self.observe(&key)?.is_some(),
        };
        if already {
            return Err(StoreError::AlreadyExists {
                collection: D::COLLECTION.to_string(),
                id: document.id().to_string(),
            });
        }
        let bytes = encode(document)?;
        self.inserts.insert(key.clone());
        self.writes.insert(key, Write::Put(bytes));
        Ok(())
    }

    fn delete<D: Document>(&mut self, id: &str) -> Result<(), StoreError> {
        let key = document_key(D::COLLECTION, id);
        if !self.observed.contains_key(&key) {
            self.observe(&key)?;
        }
        self.writes.insert(key, Write::Delete);
        Ok(())
    }

    fn commit(self) -> Result<(), StoreError> {
        if self.fail_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Storage("commit rejected by storage".into()));
        }

        let mut storage = self
            .storage
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".into()))?;

        for (key, expected) in &self.observed {
            let actual = storage.get(key).map_or(0, |s| s.version);
            if actual == *expected {
                continue;
            }
            let (collection, id) = split_key(key);
            if *expected == 0 && self.inserts.contains(key) {
                return Err(StoreError::AlreadyExists { collection, id });
            }
            return Err(StoreError::ConcurrencyConflict {
                collection,
                id,
                expected: *expected,
                actual,
            });
        }

        let count = self.writes.len();
        for (key, write) in self.writes {
            match write {
                Write::Put(bytes) => {
                    let version = storage.get(&key).map_or(0, |s| s.version) + 1;
                    trace!(key = %key, version, "Document written");
                    storage.insert(key, StoredDocument { bytes, version });
                }
                Write::Delete => {
                    storage.remove(&key);
                }
            }
        }
        debug!(writes = count, "Session committed");
        Ok(())
    }

    fn abort(self) {
        debug!(discarded = self.writes.len(), "Session aborted");
    }
}

fn encode<D: Document>(document: &D) -> Result<Vec<u8>, StoreError> {
    bitcode::serialize(document).map_err(|e| StoreError::Codec(e.to_string()))
}

fn decode<D: Document>(bytes: &[u8]) -> Result<D, StoreError> {
    bitcode::deserialize(bytes).map_err(|e| StoreError::Codec(e.to_string()))
}
