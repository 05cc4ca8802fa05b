//! Publisher and transactional coordinator.
//!
//! A [`Sender`] owns one topic. Plain sends are a single driver publish.
//! With [`TxOptions`] configured, [`Sender::send_tx`] pairs a local
//! transaction with the publication through a half-message protocol:
//!
//! 1. The encoded message is staged in the transaction store.
//! 2. A reconciliation record is enqueued on the per-topic record queue,
//!    delayed by the transaction timeout.
//! 3. The local transaction runs. Failure removes the half-message and
//!    surfaces the error; the delayed record then finds nothing and is
//!    dropped.
//! 4. On success the message is published and the half-message removed.
//!    If the publish fails, the half-message stays behind: when the
//!    record arrives, the reconciliation handler asks the application's
//!    ensure callback whether the transaction committed and either
//!    republishes or abandons the message.
//!
//! Duplicate publication is possible when reconciliation fires before
//! the fast-path cleanup; consumer idempotency absorbs it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::handler::{Handler, MessageFn, RetryDelayFn};
use crate::interfaces::{Driver, DriverError, Logger, StoreError, TracingLogger, TxStore};
use crate::message::{CodecError, Message};

/// Errors surfaced by [`Sender::send`] and [`Sender::send_tx`].
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("transactional send requires transaction options")]
    TxNotConfigured,

    #[error("local transaction failed")]
    LocalTx(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Configuration of the transactional protocol.
///
/// The timeout is how long the reconciliation record stays invisible: it
/// should comfortably exceed the local transaction's worst case, since a
/// record arriving mid-transaction forces the ensure callback to judge a
/// state that is still in flight.
pub struct TxOptions {
    timeout: Duration,
    storage: Arc<dyn TxStore>,
    ensure: MessageFn,
    retry_delay: Option<RetryDelayFn>,
    cancel: Option<CancellationToken>,
}

impl TxOptions {
    /// `ensure` is the transaction verdict: `true` means the local
    /// transaction committed and the message must be published, `false`
    /// means it aborted and the half-message is abandoned.
    pub fn new<F, Fut>(timeout: Duration, storage: Arc<dyn TxStore>, ensure: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        Self {
            timeout,
            storage,
            ensure: crate::handler::message_fn(ensure),
            retry_delay: None,
            cancel: None,
        }
    }

    /// Retry policy of the reconciliation handler. Defaults to
    /// `10s * attempts`, capped at one minute.
    pub fn with_retry_delay<F>(mut self, retry_delay: F) -> Self
    where
        F: Fn(u32) -> Option<Duration> + Send + Sync + 'static,
    {
        self.retry_delay = Some(Arc::new(retry_delay));
        self
    }

    /// Token that stops the reconciliation handler. Defaults to a fresh
    /// token, i.e. the handler runs for the life of the process.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

fn default_tx_retry_delay(attempts: u32) -> Option<Duration> {
    if attempts > 5 {
        Some(Duration::from_secs(60))
    } else {
        Some(Duration::from_secs(10) * attempts)
    }
}

/// Topic publisher, optionally coordinating publication with local
/// transactions.
///
/// Lifecycle mirrors [`Handler`]: build, [`prepare`](Sender::prepare)
/// once (fatal on misconfiguration), then send. [`Sender::wait`] blocks
/// until the internal reconciliation handler has drained, when one is
/// configured.
pub struct Sender {
    topic: String,
    driver: Arc<dyn Driver>,
    logger: Option<Arc<dyn Logger>>,
    tx_options: Option<TxOptions>,
    state: OnceCell<SenderState>,
}

struct SenderState {
    logger: Arc<dyn Logger>,
    tx: Option<TxState>,
}

struct TxState {
    record_queue: String,
    timeout: Duration,
    storage: Arc<dyn TxStore>,
    handler: Arc<Handler>,
}

impl Sender {
    pub fn new(topic: impl Into<String>, driver: Arc<dyn Driver>) -> Self {
        Self {
            topic: topic.into(),
            driver,
            logger: None,
            tx_options: None,
            state: OnceCell::new(),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Enable the transactional protocol for this sender.
    pub fn with_tx_options(mut self, tx_options: TxOptions) -> Self {
        self.tx_options = Some(tx_options);
        self
    }

    /// The topic this sender publishes to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Create the topic and, when transactions are configured, start the
    /// reconciliation handler on the record queue.
    ///
    /// Idempotent: repeated calls are no-ops. Misconfiguration and broker
    /// declaration failures are fatal and panic with a `relay-bus:`
    /// prefixed message.
    pub async fn prepare(&self) {
        self.state
            .get_or_init(|| async {
                if self.topic.is_empty() {
                    panic!("relay-bus: the sender is missing a topic name");
                }
                if let Err(err) = self.driver.create_topic(&self.topic).await {
                    panic!(
                        "relay-bus: the sender {:?} failed to create its topic, {err}",
                        self.topic
                    );
                }
                let logger: Arc<dyn Logger> = self
                    .logger
                    .clone()
                    .unwrap_or_else(|| Arc::new(TracingLogger));
                let tx = match &self.tx_options {
                    Some(opts) => Some(self.start_tx_handler(opts, Arc::clone(&logger)).await),
                    None => None,
                };
                info!(topic = %self.topic, transactional = tx.is_some(), "sender prepared");
                SenderState { logger, tx }
            })
            .await;
    }

    async fn start_tx_handler(&self, opts: &TxOptions, logger: Arc<dyn Logger>) -> TxState {
        if opts.timeout.is_zero() {
            panic!("relay-bus: the transaction timeout must be greater than zero");
        }
        let record_queue = format!("{}.tx-record", self.topic);
        let reconciler = Arc::new(Reconciler {
            driver: Arc::clone(&self.driver),
            topic: self.topic.clone(),
            storage: Arc::clone(&opts.storage),
            ensure: Arc::clone(&opts.ensure),
            logger: Arc::clone(&logger),
        });
        let handler = Arc::new(
            Handler::new(record_queue.clone(), Arc::clone(&self.driver), {
                move |record| {
                    let reconciler = Arc::clone(&reconciler);
                    async move { reconciler.reconcile(record).await }
                }
            })
            .with_logger(logger)
            // The coordinator's own double-check always allows: every
            // record must be judged, duplicates included.
            .with_ensure(|_record| async { true })
            .with_retry_delay_fn(
                opts.retry_delay
                    .clone()
                    .unwrap_or_else(|| Arc::new(default_tx_retry_delay)),
            ),
        );
        handler.prepare().await;

        let cancel = opts.cancel.clone().unwrap_or_default();
        tokio::spawn({
            let handler = Arc::clone(&handler);
            async move { handler.run(cancel).await }
        });

        TxState {
            record_queue,
            timeout: opts.timeout,
            storage: Arc::clone(&opts.storage),
            handler,
        }
    }

    fn state(&self) -> &SenderState {
        match self.state.get() {
            Some(state) => state,
            None => panic!(
                "relay-bus: send is forbidden before the sender {:?} is prepared",
                self.topic
            ),
        }
    }

    /// Publish a message to the topic.
    ///
    /// # Panics
    ///
    /// Panics when called before [`Sender::prepare`].
    pub async fn send(&self, msg: &Message) -> Result<(), SendError> {
        self.state();
        let data = msg.encode()?;
        self.driver
            .send_to_topic(&self.topic, &data, &msg.route_key)
            .await?;
        Ok(())
    }

    /// Publish a message paired with a local transaction.
    ///
    /// The message reaches the topic only if `local_tx` succeeds — either
    /// on the fast path here, or later through reconciliation when the
    /// publish itself fails. A `local_tx` error is returned as
    /// [`SendError::LocalTx`] after the staged half-message is removed.
    ///
    /// # Panics
    ///
    /// Panics when called before [`Sender::prepare`].
    pub async fn send_tx<F, Fut, E>(&self, msg: &Message, local_tx: F) -> Result<(), SendError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let state = self.state();
        let tx = state.tx.as_ref().ok_or(SendError::TxNotConfigured)?;

        let data = msg.encode()?;
        // Stage the half-message. Failure here owes no compensation.
        let id = tx.storage.store(&data).await?;

        // Schedule the reconciliation record before touching the local
        // transaction, so a crash from here on always gets judged.
        let record = Message::with_id(&id, &id, "")?;
        if let Err(err) = self
            .driver
            .send_to_queue(&tx.record_queue, &record.encode()?, tx.timeout)
            .await
        {
            self.remove_half_message(state, tx, &id).await;
            return Err(err.into());
        }

        if let Err(err) = local_tx().await {
            self.remove_half_message(state, tx, &id).await;
            return Err(SendError::LocalTx(Box::new(err)));
        }

        match self
            .driver
            .send_to_topic(&self.topic, &data, &msg.route_key)
            .await
        {
            Ok(()) => self.remove_half_message(state, tx, &id).await,
            Err(err) => {
                // Leave the half-message in place: reconciliation retries.
                state.logger.error(&format!(
                    "sender {:?} publish failed, reconciliation will retry, {err}",
                    self.topic
                ));
            }
        }
        Ok(())
    }

    async fn remove_half_message(&self, state: &SenderState, tx: &TxState, id: &str) {
        if let Err(err) = tx.storage.remove(id).await {
            state.logger.error(&format!(
                "sender {:?} failed to remove half-message {id:?}, {err}",
                self.topic
            ));
        }
    }

    /// Block until the reconciliation handler has drained. Returns
    /// immediately when the sender is not transactional.
    pub async fn wait(&self) {
        if let Some(tx) = self.state.get().and_then(|state| state.tx.as_ref()) {
            tx.handler.wait().await;
        }
    }
}

/// Decision procedure applied to every reconciliation record.
struct Reconciler {
    driver: Arc<dyn Driver>,
    topic: String,
    storage: Arc<dyn TxStore>,
    ensure: MessageFn,
    logger: Arc<dyn Logger>,
}

impl Reconciler {
    /// `true` acknowledges the record, `false` retries it later.
    async fn reconcile(&self, record: Message) -> bool {
        let id: String = match record.scan() {
            Ok(id) => id,
            Err(err) => {
                self.logger
                    .error(&format!("malformed transaction record dropped, {err}"));
                return true;
            }
        };
        let data = match self.storage.fetch(&id).await {
            Ok(Some(data)) => data,
            // Already removed: the fast path published and cleaned up.
            Ok(None) => return true,
            Err(err) => {
                self.logger
                    .error(&format!("half-message {id:?} fetch error, {err}"));
                return false;
            }
        };
        let msg = match Message::decode(&data) {
            Ok(msg) => msg,
            Err(err) => {
                self.logger
                    .error(&format!("half-message {id:?} dropped, decode error, {err}"));
                return true;
            }
        };
        if (self.ensure)(msg.clone()).await {
            // Local transaction committed but the message never made it
            // out. Publish the staged bytes as-is.
            match self.driver.send_to_topic(&self.topic, &data, &msg.route_key).await {
                Ok(()) => {
                    self.remove(&id).await;
                    true
                }
                Err(err) => {
                    self.logger.error(&format!(
                        "half-message {id:?} republish error, will retry, {err}"
                    ));
                    false
                }
            }
        } else {
            // Local transaction aborted: abandon the half-message.
            self.remove(&id).await;
            true
        }
    }

    async fn remove(&self, id: &str) {
        if let Err(err) = self.storage.remove(id).await {
            self.logger
                .error(&format!("half-message {id:?} remove error, {err}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryDriver, MemoryTxStore};

    #[tokio::test]
    #[should_panic(expected = "missing a topic name")]
    async fn prepare_rejects_empty_topic() {
        Sender::new("", Arc::new(MemoryDriver::new())).prepare().await;
    }

    #[tokio::test]
    #[should_panic(expected = "send is forbidden")]
    async fn send_requires_prepare() {
        let sender = Sender::new("t", Arc::new(MemoryDriver::new()));
        let msg = Message::auto_id(&1u8, "").unwrap();
        let _ = sender.send(&msg).await;
    }

    #[tokio::test]
    #[should_panic(expected = "timeout must be greater than zero")]
    async fn prepare_rejects_zero_tx_timeout() {
        let storage = Arc::new(MemoryTxStore::new());
        let sender = Sender::new("t", Arc::new(MemoryDriver::new())).with_tx_options(
            TxOptions::new(Duration::ZERO, storage, |_msg| async { true }),
        );
        sender.prepare().await;
    }

    #[tokio::test]
    async fn send_tx_requires_tx_options() {
        let sender = Sender::new("t", Arc::new(MemoryDriver::new()));
        sender.prepare().await;

        let msg = Message::auto_id(&1u8, "").unwrap();
        let result = sender
            .send_tx(&msg, || async { Ok::<(), std::io::Error>(()) })
            .await;
        assert!(matches!(result, Err(SendError::TxNotConfigured)));
    }

    #[tokio::test]
    async fn plain_send_reaches_the_driver() {
        let driver = Arc::new(MemoryDriver::new());
        let sender = Sender::new("t", driver.clone());
        sender.prepare().await;

        // No subscription: publish succeeds and routes nowhere.
        let msg = Message::auto_id(&"payload", "any").unwrap();
        sender.send(&msg).await.unwrap();
    }
}
