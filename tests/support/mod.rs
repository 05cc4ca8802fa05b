//! Shared test doubles and helpers.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use relay_bus::interfaces::{DeliveryFn, Driver, DriverError};
use relay_bus::MemoryDriver;

/// Memory driver with switchable publish failures, for exercising the
/// compensation and reconciliation paths.
#[derive(Default)]
pub struct FlakyDriver {
    inner: MemoryDriver,
    fail_topic_sends: AtomicBool,
    fail_queue_sends: AtomicBool,
}

impl FlakyDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_topic_sends(&self, fail: bool) {
        self.fail_topic_sends.store(fail, Ordering::SeqCst);
    }

    pub fn fail_queue_sends(&self, fail: bool) {
        self.fail_queue_sends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Driver for FlakyDriver {
    async fn create_queue(&self, name: &str, delay: Duration) -> Result<(), DriverError> {
        self.inner.create_queue(name, delay).await
    }

    async fn create_topic(&self, name: &str) -> Result<(), DriverError> {
        self.inner.create_topic(name).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        queue: &str,
        route_key: &str,
    ) -> Result<(), DriverError> {
        self.inner.subscribe(topic, queue, route_key).await
    }

    async fn unsubscribe(
        &self,
        topic: &str,
        queue: &str,
        route_key: &str,
    ) -> Result<(), DriverError> {
        self.inner.unsubscribe(topic, queue, route_key).await
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        content: &[u8],
        delay: Duration,
    ) -> Result<(), DriverError> {
        if self.fail_queue_sends.load(Ordering::SeqCst) {
            return Err(DriverError::Publish("flaky queue send".to_string()));
        }
        self.inner.send_to_queue(queue, content, delay).await
    }

    async fn send_to_topic(
        &self,
        topic: &str,
        content: &[u8],
        route_key: &str,
    ) -> Result<(), DriverError> {
        if self.fail_topic_sends.load(Ordering::SeqCst) {
            return Err(DriverError::Publish("flaky topic send".to_string()));
        }
        self.inner.send_to_topic(topic, content, route_key).await
    }

    async fn receive_message(
        &self,
        shutdown: CancellationToken,
        queue: &str,
        errors: UnboundedSender<DriverError>,
        handler: DeliveryFn,
    ) {
        self.inner
            .receive_message(shutdown, queue, errors, handler)
            .await;
    }
}

/// Poll `cond` until it holds or `deadline` elapses.
pub async fn eventually(deadline: Duration, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() > deadline {
            panic!("condition not met within {deadline:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
