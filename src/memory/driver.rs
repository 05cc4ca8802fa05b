//! In-memory broker driver built on tokio channels.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::interfaces::{DeliveryFn, Driver, DriverError};

struct Delivery {
    data: Vec<u8>,
    delay: Duration,
}

/// One declared queue: an unbounded channel plus its default delay.
///
/// The receiver side is parked here between receive loops so a cancelled
/// consumer can resume the queue later without losing buffered messages.
struct QueueSlot {
    delay: Duration,
    tx: UnboundedSender<Delivery>,
    rx: Mutex<Option<UnboundedReceiver<Delivery>>>,
}

#[derive(Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    route_key: String,
}

/// In-memory broker: queues are tokio mpsc channels, topics are exact
/// route-key bindings onto queues.
///
/// Each delivered message is dispatched onto its own task, which honors
/// the per-message delay before invoking the handler and re-enqueues the
/// message with the queue's default delay when the handler reports
/// failure.
///
/// # Example
///
/// ```no_run
/// use relay_bus::MemoryDriver;
/// use relay_bus::interfaces::Driver;
/// use std::time::Duration;
///
/// # async fn demo() {
/// let driver = MemoryDriver::new();
/// driver.create_queue("orders", Duration::ZERO).await.unwrap();
/// driver.send_to_queue("orders", b"hi", Duration::ZERO).await.unwrap();
/// # }
/// ```
#[derive(Default)]
pub struct MemoryDriver {
    queues: Mutex<HashMap<String, Arc<QueueSlot>>>,
    topics: Mutex<HashMap<String, Vec<Binding>>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, name: &str) -> Result<Arc<QueueSlot>, DriverError> {
        self.queues
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| DriverError::QueueNotFound(name.to_string()))
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn create_queue(&self, name: &str, delay: Duration) -> Result<(), DriverError> {
        let mut queues = self.queues.lock().unwrap();
        // Redeclaring keeps the existing channel and its buffered messages.
        queues.entry(name.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            Arc::new(QueueSlot {
                delay,
                tx,
                rx: Mutex::new(Some(rx)),
            })
        });
        Ok(())
    }

    async fn create_topic(&self, name: &str) -> Result<(), DriverError> {
        self.topics
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        queue: &str,
        route_key: &str,
    ) -> Result<(), DriverError> {
        if !self.queues.lock().unwrap().contains_key(queue) {
            return Err(DriverError::QueueNotFound(queue.to_string()));
        }
        let mut topics = self.topics.lock().unwrap();
        let bindings = topics
            .get_mut(topic)
            .ok_or_else(|| DriverError::TopicNotFound(topic.to_string()))?;
        let binding = Binding {
            queue: queue.to_string(),
            route_key: route_key.to_string(),
        };
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    async fn unsubscribe(
        &self,
        topic: &str,
        queue: &str,
        route_key: &str,
    ) -> Result<(), DriverError> {
        let mut topics = self.topics.lock().unwrap();
        let bindings = topics
            .get_mut(topic)
            .ok_or_else(|| DriverError::TopicNotFound(topic.to_string()))?;
        bindings.retain(|b| !(b.queue == queue && b.route_key == route_key));
        Ok(())
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        content: &[u8],
        delay: Duration,
    ) -> Result<(), DriverError> {
        let slot = self.queue(queue)?;
        slot.tx
            .send(Delivery {
                data: content.to_vec(),
                delay,
            })
            .map_err(|_| DriverError::QueueNotFound(queue.to_string()))
    }

    async fn send_to_topic(
        &self,
        topic: &str,
        content: &[u8],
        route_key: &str,
    ) -> Result<(), DriverError> {
        let targets: Vec<String> = {
            let topics = self.topics.lock().unwrap();
            let bindings = topics
                .get(topic)
                .ok_or_else(|| DriverError::TopicNotFound(topic.to_string()))?;
            bindings
                .iter()
                .filter(|b| b.route_key == route_key)
                .map(|b| b.queue.clone())
                .collect()
        };
        for queue in targets {
            let slot = self.queue(&queue)?;
            let delay = slot.delay;
            slot.tx
                .send(Delivery {
                    data: content.to_vec(),
                    delay,
                })
                .map_err(|_| DriverError::QueueNotFound(queue.clone()))?;
        }
        Ok(())
    }

    async fn receive_message(
        &self,
        shutdown: CancellationToken,
        queue: &str,
        errors: UnboundedSender<DriverError>,
        handler: DeliveryFn,
    ) {
        let slot = match self.queue(queue) {
            Ok(slot) => slot,
            Err(err) => {
                let _ = errors.send(err);
                return;
            }
        };
        let mut rx = match slot.rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => {
                let _ = errors.send(DriverError::Receive(format!(
                    "queue {queue:?} already has an active consumer"
                )));
                return;
            }
        };

        debug!(queue, "memory driver consuming");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Some(delivery) => {
                        let slot = Arc::clone(&slot);
                        let handler = Arc::clone(&handler);
                        let errors = errors.clone();
                        let queue = queue.to_string();
                        // Deliveries run concurrently, each on its own task.
                        tokio::spawn(async move {
                            if !delivery.delay.is_zero() {
                                tokio::time::sleep(delivery.delay).await;
                            }
                            if !handler(delivery.data.clone()).await {
                                let redeliver = Delivery {
                                    data: delivery.data,
                                    delay: slot.delay,
                                };
                                if slot.tx.send(redeliver).is_err() {
                                    let _ = errors.send(DriverError::Receive(format!(
                                        "redelivery to queue {queue:?} failed"
                                    )));
                                }
                            }
                        });
                    }
                    None => break,
                },
            }
        }
        // Park the receiver so a later run resumes where this one stopped.
        *slot.rx.lock().unwrap() = Some(rx);
        debug!(queue, "memory driver stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::time::timeout;

    fn counting_handler() -> (DeliveryFn, Arc<AtomicUsize>, Arc<tokio::sync::Notify>) {
        let count = Arc::new(AtomicUsize::new(0));
        let notify = Arc::new(tokio::sync::Notify::new());
        let handler: DeliveryFn = {
            let count = Arc::clone(&count);
            let notify = Arc::clone(&notify);
            Arc::new(move |_data| {
                let count = Arc::clone(&count);
                let notify = Arc::clone(&notify);
                Box::pin(async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    notify.notify_one();
                    true
                })
            })
        };
        (handler, count, notify)
    }

    #[tokio::test]
    async fn queue_send_and_receive() {
        let driver = MemoryDriver::new();
        driver.create_queue("q", Duration::ZERO).await.unwrap();
        driver
            .send_to_queue("q", b"one", Duration::ZERO)
            .await
            .unwrap();

        let (handler, count, notify) = counting_handler();
        let (err_tx, _err_rx) = unbounded_channel();
        let shutdown = CancellationToken::new();
        let consumer = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                driver
                    .receive_message(shutdown, "q", err_tx, handler)
                    .await;
            }
        });

        timeout(Duration::from_secs(1), notify.notified())
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn topic_routes_on_exact_key_only() {
        let driver = MemoryDriver::new();
        driver.create_queue("q", Duration::ZERO).await.unwrap();
        driver.create_topic("t").await.unwrap();
        driver.subscribe("t", "q", "match").await.unwrap();

        driver.send_to_topic("t", b"yes", "match").await.unwrap();
        driver.send_to_topic("t", b"no", "other").await.unwrap();

        let (handler, count, notify) = counting_handler();
        let (err_tx, _err_rx) = unbounded_channel();
        let shutdown = CancellationToken::new();
        let drv = Arc::new(driver);
        let consumer = tokio::spawn({
            let drv = Arc::clone(&drv);
            let shutdown = shutdown.clone();
            async move {
                drv.receive_message(shutdown, "q", err_tx, handler).await;
            }
        });

        timeout(Duration::from_secs(1), notify.notified())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn failed_delivery_is_redelivered() {
        let driver = Arc::new(MemoryDriver::new());
        driver.create_queue("q", Duration::ZERO).await.unwrap();
        driver
            .send_to_queue("q", b"flaky", Duration::ZERO)
            .await
            .unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let notify = Arc::new(tokio::sync::Notify::new());
        let handler: DeliveryFn = {
            let count = Arc::clone(&count);
            let notify = Arc::clone(&notify);
            Arc::new(move |_data| {
                let count = Arc::clone(&count);
                let notify = Arc::clone(&notify);
                Box::pin(async move {
                    // Fail the first attempt, accept the redelivery.
                    if count.fetch_add(1, Ordering::SeqCst) == 0 {
                        false
                    } else {
                        notify.notify_one();
                        true
                    }
                })
            })
        };

        let (err_tx, _err_rx) = unbounded_channel();
        let shutdown = CancellationToken::new();
        let consumer = tokio::spawn({
            let driver = Arc::clone(&driver);
            let shutdown = shutdown.clone();
            async move {
                driver.receive_message(shutdown, "q", err_tx, handler).await;
            }
        });

        timeout(Duration::from_secs(1), notify.notified())
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_targets_are_errors() {
        let driver = MemoryDriver::new();
        assert!(matches!(
            driver.send_to_queue("nope", b"x", Duration::ZERO).await,
            Err(DriverError::QueueNotFound(_))
        ));
        assert!(matches!(
            driver.send_to_topic("nope", b"x", "").await,
            Err(DriverError::TopicNotFound(_))
        ));
    }
}
