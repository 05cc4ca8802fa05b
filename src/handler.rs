//! Consumer pipeline.
//!
//! A [`Handler`] owns one queue: it declares the broker objects, runs the
//! receive loop, and wraps every delivery in the protocol that makes
//! at-least-once consumption safe — idempotency acquire, the application
//! double-check, retry scheduling with delay, and dead-letter capture. A
//! background ticker periodically replays dead-lettered messages through
//! the same delivery path.
//!
//! ## Delivery verdicts
//!
//! The handle callback returns `true` when the message was processed and
//! may be acknowledged, `false` when processing failed. On failure the
//! pipeline consults the retry-delay function: `Some(delay)` re-publishes
//! the message with its retry counter bumped, `None` hands it to the
//! dead-letter store.
//!
//! ## Reinjection fixpoint
//!
//! A replayed dead letter keeps incrementing its retry counter. If the
//! retry-delay function eventually answers `None` again, the message
//! lands back in the dead-letter store and waits for the next tick —
//! dead letters cycle at the ticker's low rate until processing finally
//! succeeds.

use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::sync::{Notify, OnceCell};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::interfaces::{
    DeadLetterStore, DeliveryFn, Driver, DriverError, Idempotent, Logger, NullDeadLetterStore,
    NullIdempotent, TracingLogger,
};
use crate::message::Message;

/// Callback over a decoded [`Message`], resolving to a boolean verdict.
///
/// Used for both the handle callback (`true` = processed, ack) and the
/// ensure callback (`true` = not yet processed, go ahead).
pub type MessageFn = Arc<dyn Fn(Message) -> BoxFuture<'static, bool> + Send + Sync>;

/// Maps the attempt count to the delay before the next retry, or `None`
/// to stop retrying and dead-letter the message.
pub type RetryDelayFn = Arc<dyn Fn(u32) -> Option<Duration> + Send + Sync>;

pub(crate) fn message_fn<F, Fut>(f: F) -> MessageFn
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = bool> + Send + 'static,
{
    Arc::new(move |msg| Box::pin(f(msg)))
}

/// Topic subscription installed at prepare time. Immutable afterwards.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Subscribe {
    pub topic: String,
    pub route_key: String,
}

impl Subscribe {
    pub fn new(topic: impl Into<String>, route_key: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            route_key: route_key.into(),
        }
    }
}

/// Default cadence of the dead-letter reinjection ticker.
const REINJECT_INTERVAL: Duration = Duration::from_secs(60);

/// Per-queue message reception loop with idempotent delivery, bounded
/// retry, and dead-letter capture.
///
/// Lifecycle: build, [`prepare`](Handler::prepare) once, then
/// [`run`](Handler::run) until the shutdown token fires;
/// [`wait`](Handler::wait) blocks until the loop has fully drained.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use relay_bus::{Handler, MemoryDriver, Subscribe};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn demo() {
/// let driver = Arc::new(MemoryDriver::new());
/// let handler = Arc::new(
///     Handler::new("orders.reserve", driver, |msg| async move {
///         println!("reserving for {}", msg.biz_uid);
///         true
///     })
///     .with_subscribe(Subscribe::new("orders", "created"))
///     .with_retry_delay(|attempts| (attempts <= 5).then(|| Duration::from_secs(10))),
/// );
/// handler.prepare().await;
///
/// let shutdown = CancellationToken::new();
/// handler.run(shutdown.clone()).await;
/// # }
/// ```
pub struct Handler {
    queue: String,
    consume_delay: Duration,
    subscribe: Option<Subscribe>,
    reinject_every: Duration,
    driver: Arc<dyn Driver>,
    logger: Option<Arc<dyn Logger>>,
    dead_letters: Option<Arc<dyn DeadLetterStore>>,
    idempotent: Option<Arc<dyn Idempotent>>,
    handle: MessageFn,
    ensure: Option<MessageFn>,
    retry_delay: Option<RetryDelayFn>,
    pipeline: OnceCell<Arc<Pipeline>>,
    running: AtomicBool,
    quit: Notify,
}

impl Handler {
    /// Build a handler for `queue` with the required collaborators.
    /// Optional pieces are filled in by the `with_*` builders; anything
    /// left unset falls back to a null implementation at prepare time.
    pub fn new<F, Fut>(queue: impl Into<String>, driver: Arc<dyn Driver>, handle: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        Self {
            queue: queue.into(),
            consume_delay: Duration::ZERO,
            subscribe: None,
            reinject_every: REINJECT_INTERVAL,
            driver,
            logger: None,
            dead_letters: None,
            idempotent: None,
            handle: message_fn(handle),
            ensure: None,
            retry_delay: None,
            pipeline: OnceCell::new(),
            running: AtomicBool::new(false),
            quit: Notify::new(),
        }
    }

    /// Default visibility delay applied to every message in the queue.
    pub fn with_consume_delay(mut self, delay: Duration) -> Self {
        self.consume_delay = delay;
        self
    }

    /// Subscribe the queue to a topic at prepare time.
    pub fn with_subscribe(mut self, subscribe: Subscribe) -> Self {
        self.subscribe = Some(subscribe);
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Where unhandleable messages end up. Without a store they are
    /// silently dropped.
    pub fn with_dead_letters(mut self, store: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letters = Some(store);
        self
    }

    /// Advisory duplicate-delivery guard. Without a store every delivery
    /// goes through the ensure callback.
    pub fn with_idempotent(mut self, store: Arc<dyn Idempotent>) -> Self {
        self.idempotent = Some(store);
        self
    }

    /// Second check consulted when the idempotency lease denies (or
    /// errors): `true` means "not processed yet, go ahead", `false`
    /// means "already processed, acknowledge and drop". Defaults to
    /// rejecting.
    pub fn with_ensure<F, Fut>(mut self, ensure: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        self.ensure = Some(message_fn(ensure));
        self
    }

    /// Retry policy for failed deliveries. Defaults to never retrying,
    /// which sends every failure straight to the dead-letter store.
    pub fn with_retry_delay<F>(self, retry_delay: F) -> Self
    where
        F: Fn(u32) -> Option<Duration> + Send + Sync + 'static,
    {
        self.with_retry_delay_fn(Arc::new(retry_delay))
    }

    /// Same as [`Handler::with_retry_delay`] for an already shared policy.
    pub fn with_retry_delay_fn(mut self, retry_delay: RetryDelayFn) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    /// Cadence of the dead-letter reinjection ticker. Defaults to one
    /// minute.
    pub fn with_reinject_interval(mut self, every: Duration) -> Self {
        self.reinject_every = every;
        self
    }

    /// The queue this handler consumes.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Declare the broker objects and latch the delivery pipeline.
    ///
    /// Idempotent: repeated calls are no-ops. Misconfiguration and broker
    /// declaration failures are fatal and panic with a `relay-bus:`
    /// prefixed message.
    pub async fn prepare(&self) {
        self.pipeline
            .get_or_init(|| async {
                if self.queue.is_empty() {
                    panic!("relay-bus: the handler is missing a queue name");
                }
                let pipeline = Arc::new(Pipeline {
                    queue: self.queue.clone(),
                    consume_delay: self.consume_delay,
                    subscribe: self.subscribe.clone(),
                    driver: Arc::clone(&self.driver),
                    logger: self
                        .logger
                        .clone()
                        .unwrap_or_else(|| Arc::new(TracingLogger)),
                    dead_letters: self
                        .dead_letters
                        .clone()
                        .unwrap_or_else(|| Arc::new(NullDeadLetterStore)),
                    idempotent: self
                        .idempotent
                        .clone()
                        .unwrap_or_else(|| Arc::new(NullIdempotent)),
                    handle: Arc::clone(&self.handle),
                    ensure: self.ensure.clone(),
                    retry_delay: self
                        .retry_delay
                        .clone()
                        .unwrap_or_else(|| Arc::new(|_attempts| None)),
                });
                if let Err(err) = pipeline.init_driver().await {
                    panic!(
                        "relay-bus: the handler {:?} failed to declare broker objects, {err}",
                        self.queue
                    );
                }
                info!(queue = %self.queue, "handler prepared");
                pipeline
            })
            .await;
    }

    /// Consume the queue until `shutdown` is cancelled.
    ///
    /// At most one run is active at a time; a second call on a running
    /// handler returns immediately with no side effect. Alongside the
    /// receive loop, a drain task heals the driver on reported errors and
    /// a ticker replays dead letters.
    ///
    /// # Panics
    ///
    /// Panics when called before [`Handler::prepare`].
    pub async fn run(&self, shutdown: CancellationToken) {
        let pipeline = match self.pipeline.get() {
            Some(pipeline) => Arc::clone(pipeline),
            None => panic!(
                "relay-bus: run is forbidden before the handler {:?} is prepared",
                self.queue
            ),
        };
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let (err_tx, mut err_rx) = mpsc::unbounded_channel();

        let drain = tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            async move {
                while let Some(err) = err_rx.recv().await {
                    pipeline.recover(err).await;
                }
            }
        });

        let ticker = tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            let every = self.reinject_every;
            async move {
                let mut tick = interval(every);
                tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick of a tokio interval fires immediately.
                tick.tick().await;
                loop {
                    tick.tick().await;
                    pipeline.replay_dead_letters().await;
                }
            }
        });

        info!(queue = %self.queue, "handler running");
        self.driver
            .receive_message(shutdown, &self.queue, err_tx, pipeline.delivery_fn())
            .await;

        // Receive loop ended: the error sender is gone, so the drain task
        // finishes once in-flight deliveries have dropped their clones.
        ticker.abort();
        let _ = drain.await;
        self.running.store(false, Ordering::SeqCst);
        self.quit.notify_one();
        info!(queue = %self.queue, "handler stopped");
    }

    /// Block until the current run has fully drained.
    pub async fn wait(&self) {
        self.quit.notified().await;
    }
}

/// Snapshot of the handler configuration with null implementations
/// substituted, shared by the receive loop, the error drain, and the
/// reinjection ticker.
struct Pipeline {
    queue: String,
    consume_delay: Duration,
    subscribe: Option<Subscribe>,
    driver: Arc<dyn Driver>,
    logger: Arc<dyn Logger>,
    dead_letters: Arc<dyn DeadLetterStore>,
    idempotent: Arc<dyn Idempotent>,
    handle: MessageFn,
    ensure: Option<MessageFn>,
    retry_delay: RetryDelayFn,
}

impl Pipeline {
    fn delivery_fn(self: &Arc<Self>) -> DeliveryFn {
        let pipeline = Arc::clone(self);
        Arc::new(move |data| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move { pipeline.handle_msg(data).await })
        })
    }

    /// Declare the queue and its subscription. Used at prepare time and
    /// again whenever the driver reports an error, because a broker
    /// restart may have invalidated the declarations.
    async fn init_driver(&self) -> Result<(), DriverError> {
        self.driver
            .create_queue(&self.queue, self.consume_delay)
            .await?;
        if let Some(sub) = &self.subscribe {
            self.driver
                .subscribe(&sub.topic, &self.queue, &sub.route_key)
                .await?;
        }
        Ok(())
    }

    async fn recover(&self, err: DriverError) {
        if let Err(declare_err) = self.init_driver().await {
            self.logger.error(&format!(
                "handler {:?} re-declaration failed, {declare_err}",
                self.queue
            ));
        }
        self.logger
            .error(&format!("handler {:?} driver error, {err}", self.queue));
    }

    /// The delivery protocol. `true` acknowledges the message, `false`
    /// leaves it to the driver for redelivery.
    async fn handle_msg(&self, data: Vec<u8>) -> bool {
        match AssertUnwindSafe(self.deliver(&data)).catch_unwind().await {
            Ok(done) => done,
            Err(panic) => {
                // Contain the panic and keep the message: dead-letter the
                // raw envelope so reinjection can replay it verbatim.
                self.logger.error(&format!(
                    "handler {:?} delivery panicked, {}\n{}",
                    self.queue,
                    panic_message(panic.as_ref()),
                    Backtrace::force_capture()
                ));
                self.store_dead_letter(&data).await
            }
        }
    }

    async fn deliver(&self, data: &[u8]) -> bool {
        let mut msg = match Message::decode(data) {
            Ok(msg) => msg,
            Err(err) => {
                self.logger
                    .error(&format!("handler {:?} decode error, {err}", self.queue));
                return self.store_dead_letter(data).await;
            }
        };

        // Key embeds the queue name so the same business id consumed by
        // two queues never collides.
        let key = format!("{}.{}", self.queue, msg.biz_uid);
        let allow = match self.idempotent.acquire(&key).await {
            Ok(allow) => allow,
            Err(err) => {
                self.logger.error(&format!(
                    "handler {:?} idempotent acquire error, {err}",
                    self.queue
                ));
                false
            }
        };
        if !allow && !self.ensure_allows(msg.clone()).await {
            // The second check says the message was already processed.
            return true;
        }

        if (self.handle)(msg.clone()).await {
            return true;
        }

        // Failure path. Release the lease first: a redelivery arriving
        // before the release would be denied by acquire and funneled
        // through the ensure check.
        if let Err(err) = self.idempotent.release(&key).await {
            self.logger.error(&format!(
                "handler {:?} idempotent release error, {err}",
                self.queue
            ));
        }
        msg.retried += 1;
        match (self.retry_delay)(msg.retried) {
            None => {
                debug!(queue = %self.queue, biz_uid = %msg.biz_uid, "retry budget exhausted, dead-lettering");
                self.store_dead_letter(data).await
            }
            Some(delay) => {
                let encoded = match msg.encode() {
                    Ok(encoded) => encoded,
                    Err(err) => {
                        self.logger
                            .error(&format!("handler {:?} encode error, {err}", self.queue));
                        return self.store_dead_letter(data).await;
                    }
                };
                match self.driver.send_to_queue(&self.queue, &encoded, delay).await {
                    Ok(()) => true,
                    Err(err) => {
                        self.logger.error(&format!(
                            "handler {:?} retry publish error, {err}",
                            self.queue
                        ));
                        false
                    }
                }
            }
        }
    }

    async fn ensure_allows(&self, msg: Message) -> bool {
        match &self.ensure {
            Some(ensure) => ensure(msg).await,
            None => false,
        }
    }

    /// `true` when the message is safely persisted (or intentionally
    /// dropped by the null store); `false` keeps it with the driver.
    async fn store_dead_letter(&self, data: &[u8]) -> bool {
        match self.dead_letters.store(&self.queue, data).await {
            Ok(()) => true,
            Err(err) => {
                self.logger.error(&format!(
                    "handler {:?} dead-letter store error, {err}",
                    self.queue
                ));
                false
            }
        }
    }

    /// One ticker pass: replay every dead letter through the delivery
    /// protocol and drop the ones that now succeed.
    async fn replay_dead_letters(&self) {
        let entries = match self.dead_letters.fetch(&self.queue).await {
            Ok(entries) => entries,
            Err(err) => {
                self.logger.error(&format!(
                    "handler {:?} dead-letter fetch error, {err}",
                    self.queue
                ));
                return;
            }
        };
        for (id, data) in entries {
            if self.handle_msg(data).await {
                if let Err(err) = self.dead_letters.remove(&id).await {
                    self.logger.error(&format!(
                        "handler {:?} dead-letter remove error, {err}",
                        self.queue
                    ));
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDriver;

    fn noop_handler(queue: &str) -> Handler {
        Handler::new(queue, Arc::new(MemoryDriver::new()), |_msg| async { true })
    }

    #[tokio::test]
    #[should_panic(expected = "missing a queue name")]
    async fn prepare_rejects_empty_queue() {
        noop_handler("").prepare().await;
    }

    #[tokio::test]
    #[should_panic(expected = "run is forbidden")]
    async fn run_requires_prepare() {
        noop_handler("q").run(CancellationToken::new()).await;
    }

    #[tokio::test]
    #[should_panic(expected = "failed to declare broker objects")]
    async fn prepare_fails_on_unknown_subscription_topic() {
        let driver = Arc::new(MemoryDriver::new());
        let handler = Handler::new("q", driver, |_msg| async { true })
            .with_subscribe(Subscribe::new("missing-topic", ""));
        handler.prepare().await;
    }

    #[tokio::test]
    async fn prepare_is_idempotent() {
        let handler = noop_handler("q");
        handler.prepare().await;
        handler.prepare().await;
    }

    #[tokio::test]
    async fn second_run_returns_immediately() {
        let handler = Arc::new(noop_handler("q"));
        handler.prepare().await;

        let shutdown = CancellationToken::new();
        let first = tokio::spawn({
            let handler = Arc::clone(&handler);
            let shutdown = shutdown.clone();
            async move { handler.run(shutdown).await }
        });
        // Give the first run time to claim the running flag.
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Completes without waiting for cancellation.
        handler.run(shutdown.clone()).await;

        shutdown.cancel();
        first.await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), handler.wait())
            .await
            .expect("wait should release after cancellation");
    }
}
