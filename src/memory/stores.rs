//! In-memory idempotency, dead-letter, and transaction stores.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::interfaces::{DeadLetterStore, Idempotent, StoreError, TxStore};
use crate::message::next_seq_id;

/// Mutex-guarded key set implementing the advisory lease.
#[derive(Debug, Default)]
pub struct MemoryIdempotent {
    keys: Mutex<HashSet<String>>,
}

impl MemoryIdempotent {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Idempotent for MemoryIdempotent {
    async fn acquire(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.keys.lock().unwrap().insert(key.to_string()))
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        self.keys.lock().unwrap().remove(key);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct DeadLetters {
    seq: u64,
    /// id -> owning queue, so removal does not need the queue name.
    index: HashMap<String, String>,
    entries: HashMap<String, HashMap<String, Vec<u8>>>,
}

/// Per-queue dead-letter map keyed by a store-local sequence id.
#[derive(Debug, Default)]
pub struct MemoryDeadLetterStore {
    inner: Mutex<DeadLetters>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently stored for `queue`.
    pub fn len(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .entries
            .get(queue)
            .map_or(0, HashMap::len)
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn store(&self, queue: &str, data: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.seq += 1;
        let id = inner.seq.to_string();
        inner.index.insert(id.clone(), queue.to_string());
        inner
            .entries
            .entry(queue.to_string())
            .or_default()
            .insert(id, data.to_vec());
        Ok(())
    }

    async fn fetch(&self, queue: &str) -> Result<HashMap<String, Vec<u8>>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .entries
            .get(queue)
            .cloned()
            .unwrap_or_default())
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(queue) = inner.index.remove(id) {
            if let Some(entries) = inner.entries.get_mut(&queue) {
                entries.remove(id);
            }
        }
        Ok(())
    }
}

/// Half-message staging keyed by generated sequence ids.
#[derive(Debug, Default)]
pub struct MemoryTxStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryTxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of staged half-messages.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TxStore for MemoryTxStore {
    async fn store(&self, data: &[u8]) -> Result<String, StoreError> {
        let id = next_seq_id();
        self.entries
            .lock()
            .unwrap()
            .insert(id.clone(), data.to_vec());
        Ok(id)
    }

    async fn fetch(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.lock().unwrap().get(id).cloned())
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.entries.lock().unwrap().remove(id);
        Ok(())
    }
}
