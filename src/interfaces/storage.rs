//! Dead-letter and transaction storage contracts.

use std::collections::HashMap;

use async_trait::async_trait;

/// Errors surfaced by storage and idempotency backings.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("storage error: {0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// Out-of-broker persistence for messages whose retry budget is
/// exhausted or whose processing panicked.
///
/// Stored entries hold the raw envelope bytes, so a stored message can be
/// replayed through the regular delivery path unchanged.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Persist an unhandleable message for `queue`.
    async fn store(&self, queue: &str, data: &[u8]) -> Result<(), StoreError>;

    /// All stored entries for `queue`, keyed by store-local id.
    async fn fetch(&self, queue: &str) -> Result<HashMap<String, Vec<u8>>, StoreError>;

    /// Delete one stored entry by its store-local id.
    async fn remove(&self, id: &str) -> Result<(), StoreError>;
}

/// Discarding no-op store, substituted when no backing is configured.
/// Messages routed here are acknowledged and gone.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDeadLetterStore;

#[async_trait]
impl DeadLetterStore for NullDeadLetterStore {
    async fn store(&self, _queue: &str, _data: &[u8]) -> Result<(), StoreError> {
        Ok(())
    }

    async fn fetch(&self, _queue: &str) -> Result<HashMap<String, Vec<u8>>, StoreError> {
        Ok(HashMap::new())
    }

    async fn remove(&self, _id: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Staging storage for transactional half-messages.
#[async_trait]
pub trait TxStore: Send + Sync {
    /// Persist a half-message and return its storage id.
    async fn store(&self, data: &[u8]) -> Result<String, StoreError>;

    /// Fetch a half-message by id. An id that was already removed yields
    /// `Ok(None)`, which the reconciliation handler reads as "the fast
    /// path cleaned up".
    async fn fetch(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Delete a half-message by id.
    async fn remove(&self, id: &str) -> Result<(), StoreError>;
}
