//! Bus facade for in-process library usage.
//!
//! A [`Bus`] is an explicitly constructed value that owns the
//! process-wide collaborators — driver, stores, logger, and a shared
//! shutdown token — and stamps them into every [`Handler`] and
//! [`Sender`] built through it. There is no module-level state: two
//! buses with different drivers coexist in one process.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use relay_bus::{Bus, MemoryDriver, MemoryDeadLetterStore, Subscribe};
//!
//! # async fn demo() {
//! let bus = Bus::new(Arc::new(MemoryDriver::new()))
//!     .with_dead_letters(Arc::new(MemoryDeadLetterStore::new()));
//!
//! let handler = Arc::new(
//!     bus.handler("billing.invoice", |msg| async move {
//!         println!("invoicing {}", msg.biz_uid);
//!         true
//!     })
//!     .with_subscribe(Subscribe::new("billing", "order.paid")),
//! );
//! handler.prepare().await;
//!
//! let worker = tokio::spawn({
//!     let handler = Arc::clone(&handler);
//!     let token = bus.shutdown_token();
//!     async move { handler.run(token).await }
//! });
//!
//! bus.shutdown();
//! worker.await.unwrap();
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::handler::Handler;
use crate::interfaces::{DeadLetterStore, Driver, Idempotent, Logger, TxStore};
use crate::message::Message;
use crate::sender::{Sender, TxOptions};

/// Shared collaborators for a family of handlers and senders.
pub struct Bus {
    driver: Arc<dyn Driver>,
    logger: Option<Arc<dyn Logger>>,
    dead_letters: Option<Arc<dyn DeadLetterStore>>,
    idempotent: Option<Arc<dyn Idempotent>>,
    tx_storage: Option<Arc<dyn TxStore>>,
    shutdown: CancellationToken,
}

impl Bus {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            logger: None,
            dead_letters: None,
            idempotent: None,
            tx_storage: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_dead_letters(mut self, store: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letters = Some(store);
        self
    }

    pub fn with_idempotent(mut self, store: Arc<dyn Idempotent>) -> Self {
        self.idempotent = Some(store);
        self
    }

    /// Transaction store handed to every transactional sender built via
    /// [`Bus::tx_options`].
    pub fn with_tx_storage(mut self, storage: Arc<dyn TxStore>) -> Self {
        self.tx_storage = Some(storage);
        self
    }

    /// A handler wired to this bus's driver, logger, and stores. Tune it
    /// further with the handler's own builders before `prepare`.
    pub fn handler<F, Fut>(&self, queue: impl Into<String>, handle: F) -> Handler
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        let mut handler = Handler::new(queue, Arc::clone(&self.driver), handle);
        if let Some(logger) = &self.logger {
            handler = handler.with_logger(Arc::clone(logger));
        }
        if let Some(store) = &self.dead_letters {
            handler = handler.with_dead_letters(Arc::clone(store));
        }
        if let Some(store) = &self.idempotent {
            handler = handler.with_idempotent(Arc::clone(store));
        }
        handler
    }

    /// A sender wired to this bus's driver and logger.
    pub fn sender(&self, topic: impl Into<String>) -> Sender {
        let mut sender = Sender::new(topic, Arc::clone(&self.driver));
        if let Some(logger) = &self.logger {
            sender = sender.with_logger(Arc::clone(logger));
        }
        sender
    }

    /// Transaction options backed by this bus's transaction store and
    /// cancelled by this bus's shutdown token.
    ///
    /// # Panics
    ///
    /// Panics when the bus was built without
    /// [`Bus::with_tx_storage`].
    pub fn tx_options<F, Fut>(&self, timeout: Duration, ensure: F) -> TxOptions
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        let storage = self
            .tx_storage
            .clone()
            .unwrap_or_else(|| panic!("relay-bus: the bus is missing a transaction storage"));
        TxOptions::new(timeout, storage, ensure)
            .with_cancellation(self.shutdown.child_token())
    }

    /// Child token cancelled by [`Bus::shutdown`]; hand it to
    /// [`Handler::run`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Cancel every component running off this bus's tokens.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryDriver, MemoryTxStore};

    #[tokio::test]
    async fn handler_and_sender_share_the_bus_driver() {
        let driver = Arc::new(MemoryDriver::new());
        let bus = Bus::new(driver).with_tx_storage(Arc::new(MemoryTxStore::new()));

        let sender = bus.sender("t");
        sender.prepare().await;

        let handler = bus.handler("q", |_msg| async { true });
        handler.prepare().await;

        // The topic declared by the sender is visible to the handler's
        // driver handle.
        bus.driver.subscribe("t", "q", "").await.unwrap();
    }

    #[tokio::test]
    #[should_panic(expected = "missing a transaction storage")]
    async fn tx_options_require_storage() {
        let bus = Bus::new(Arc::new(MemoryDriver::new()));
        let _ = bus.tx_options(Duration::from_secs(1), |_msg| async { true });
    }

    #[tokio::test]
    async fn shutdown_cancels_child_tokens() {
        let bus = Bus::new(Arc::new(MemoryDriver::new()));
        let token = bus.shutdown_token();
        bus.shutdown();
        assert!(token.is_cancelled());
    }
}
