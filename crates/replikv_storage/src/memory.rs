//! In-memory storage backend.

use crate::backend::{BatchOp, KvBackend, WriteBatch};
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// An in-memory storage backend.
///
/// All data lives in a `BTreeMap`; contents are dropped on close. Suitable
/// for tests and for stores configured with the memory option.
///
/// # Thread Safety
///
/// This backend is thread-safe and can be shared across threads.
#[derive(Debug, Default)]
pub struct MemBackend {
    // None once closed.
    state: RwLock<Option<BTreeMap<String, Vec<u8>>>>,
}

impl MemBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Some(BTreeMap::new())),
        }
    }

    /// Creates a backend with pre-existing contents.
    ///
    /// Useful for testing recovery scenarios.
    #[must_use]
    pub fn with_contents(contents: BTreeMap<String, Vec<u8>>) -> Self {
        Self {
            state: RwLock::new(Some(contents)),
        }
    }

    /// Returns the number of keys, or `None` if closed.
    #[must_use]
    pub fn len(&self) -> Option<usize> {
        self.state.read().as_ref().map(BTreeMap::len)
    }

    /// Returns true if the backend is open and holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

impl KvBackend for MemBackend {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let state = self.state.read();
        let map = state.as_ref().ok_or(StorageError::Closed)?;
        Ok(map.get(key).cloned())
    }

    fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let state = self.state.read();
        let map = state.as_ref().ok_or(StorageError::Closed)?;
        Ok(map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn apply(&self, batch: WriteBatch) -> StorageResult<()> {
        let mut state = self.state.write();
        let map = state.as_mut().ok_or(StorageError::Closed)?;
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => {
                    map.insert(key, value);
                }
                BatchOp::Del { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn close(&self) -> StorageResult<()> {
        *self.state.write() = None;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.read().is_none()
    }
}
