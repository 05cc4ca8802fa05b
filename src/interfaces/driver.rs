//! Broker driver contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

/// Errors surfaced by a broker driver.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("queue {0:?} does not exist")]
    QueueNotFound(String),

    #[error("topic {0:?} does not exist")]
    TopicNotFound(String),

    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("receive failed: {0}")]
    Receive(String),
}

/// Per-delivery callback installed by the consumer pipeline.
///
/// Receives the raw envelope bytes and resolves to the delivery verdict:
/// `true` acknowledges the message, `false` asks the driver to redeliver.
pub type DeliveryFn = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, bool> + Send + Sync>;

/// Abstraction over a message broker: queues, topics, subscriptions,
/// publication, and a long-running receive loop.
///
/// Declaration operations (`create_queue`, `create_topic`, `subscribe`)
/// are idempotent so the pipeline can re-issue them after a broker
/// restart invalidated earlier declarations.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Declare a queue. `delay` is the queue's minimum visibility delay:
    /// messages become consumable only after it elapses.
    async fn create_queue(&self, name: &str, delay: Duration) -> Result<(), DriverError>;

    /// Declare a fan-out topic.
    async fn create_topic(&self, name: &str) -> Result<(), DriverError>;

    /// Route messages published on `topic` with a matching `route_key`
    /// into `queue`. Matching semantics are driver-defined; the reference
    /// driver matches exactly.
    async fn subscribe(&self, topic: &str, queue: &str, route_key: &str)
        -> Result<(), DriverError>;

    /// Drop a routing rule previously installed by [`Driver::subscribe`].
    async fn unsubscribe(
        &self,
        topic: &str,
        queue: &str,
        route_key: &str,
    ) -> Result<(), DriverError>;

    /// Publish raw bytes directly to a queue. `delay` overrides the
    /// queue's default visibility delay for this message.
    async fn send_to_queue(
        &self,
        queue: &str,
        content: &[u8],
        delay: Duration,
    ) -> Result<(), DriverError>;

    /// Publish raw bytes to a topic; only subscriptions whose route key
    /// matches receive the message.
    async fn send_to_topic(
        &self,
        topic: &str,
        content: &[u8],
        route_key: &str,
    ) -> Result<(), DriverError>;

    /// Consume `queue` until `shutdown` is cancelled.
    ///
    /// The driver invokes `handler` for every delivered message. When the
    /// handler resolves to `false` the driver must redeliver the message,
    /// re-enqueued with the queue's default delay. Transient errors are
    /// reported through `errors` and must not terminate the loop.
    async fn receive_message(
        &self,
        shutdown: CancellationToken,
        queue: &str,
        errors: UnboundedSender<DriverError>,
        handler: DeliveryFn,
    );
}
