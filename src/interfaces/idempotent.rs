//! Advisory idempotency lease.

use async_trait::async_trait;

use super::StoreError;

/// Acquire/release over a delivery key.
///
/// The lease is advisory: protocol correctness does not depend on it, it
/// only short-circuits duplicate work. A consumer that needs strict
/// consistency pairs it with an ensure callback that consults the
/// authoritative business state.
#[async_trait]
pub trait Idempotent: Send + Sync {
    /// Try to take ownership of `key`. `Ok(true)` means the caller now
    /// owns the key and may process; `Ok(false)` means it is already
    /// owned and processing should be denied.
    async fn acquire(&self, key: &str) -> Result<bool, StoreError>;

    /// Give ownership of `key` back, making it acquirable again.
    async fn release(&self, key: &str) -> Result<(), StoreError>;
}

/// Rejecting no-op lease, substituted when no store is configured.
///
/// `acquire` always denies, which routes every delivery through the
/// ensure callback: without an idempotency backing, the application's
/// double-check becomes the sole gate.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullIdempotent;

#[async_trait]
impl Idempotent for NullIdempotent {
    async fn acquire(&self, _key: &str) -> Result<bool, StoreError> {
        Ok(false)
    }

    async fn release(&self, _key: &str) -> Result<(), StoreError> {
        Ok(())
    }
}
