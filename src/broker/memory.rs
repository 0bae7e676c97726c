//! In-process broker backend
//!
//! Backs the broker traits with process-local queues so the consumer
//! pipeline can run without an external broker: integration tests and
//! playground mode (`--in-memory`) use it. Semantics mirror the AMQP
//! backend where the consumer pipeline can observe them:
//!
//! - durable queues survive connection loss (state outlives connections)
//! - unacknowledged deliveries are requeued when the connection drops
//! - nack with requeue increments the redelivery count
//! - nack without requeue routes the payload to the dead-letter store
//!   under the queue's dead-letter routing key
//! - per-consumer prefetch bounds in-flight unacknowledged deliveries

use crate::broker::{Acker, Broker, BrokerChannel, BrokerConnector, Delivery};
use crate::error::{CarrierError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, Semaphore};

/// Effective permit count when no prefetch limit has been set
const UNLIMITED_PREFETCH: usize = 1024;

#[derive(Debug, Clone)]
struct QueuedMessage {
    payload: Bytes,
    redeliveries: u32,
}

/// One-shot latch signalling connection or channel closure
struct ClosedSignal {
    closed: AtomicBool,
    notify: Notify,
}

impl ClosedSignal {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn wait(&self) {
        // Register the waiter before checking the flag: `notify_waiters`
        // only wakes already-registered `Notified` futures, so checking
        // first would drop a notification landing in between.
        let mut notified = std::pin::pin!(self.notify.notified());
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}

struct MemoryQueue {
    name: String,
    dead_letter_routing_key: String,
    messages: Mutex<VecDeque<QueuedMessage>>,
    notify: Notify,
    deleted: AtomicBool,
}

impl MemoryQueue {
    fn new(name: &str, dead_letter_routing_key: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            dead_letter_routing_key: dead_letter_routing_key.to_string(),
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            deleted: AtomicBool::new(false),
        })
    }

    fn push_back(&self, msg: QueuedMessage) {
        if self.deleted.load(Ordering::Acquire) {
            return;
        }
        self.messages.lock().push_back(msg);
        self.notify.notify_one();
    }

    fn push_front(&self, msg: QueuedMessage) {
        if self.deleted.load(Ordering::Acquire) {
            return;
        }
        self.messages.lock().push_front(msg);
        self.notify.notify_one();
    }

    /// Wait for the next message. Returns `None` once the queue is deleted.
    async fn pop(&self) -> Option<QueuedMessage> {
        loop {
            // Registered before the deleted check so the `notify_waiters`
            // in `mark_deleted` cannot slip through unobserved.
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            if self.deleted.load(Ordering::Acquire) {
                return None;
            }
            if let Some(msg) = self.messages.lock().pop_front() {
                return Some(msg);
            }
            notified.await;
        }
    }

    fn depth(&self) -> usize {
        self.messages.lock().len()
    }

    fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// Broker-side state shared by every connection the connector hands out.
///
/// Queues and dead-letter stores are "durable": they survive connection
/// loss. The epoch counter advances on every connection teardown so that
/// stale acknowledgments are detected and their messages requeued, the way
/// a real broker requeues unacked deliveries of a dead connection.
pub struct MemoryState {
    queues: DashMap<String, Arc<MemoryQueue>>,
    dead_letters: DashMap<String, Mutex<Vec<Bytes>>>,
    acked: DashMap<String, Arc<AtomicU64>>,
    epoch: AtomicU64,
}

impl MemoryState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queues: DashMap::new(),
            dead_letters: DashMap::new(),
            acked: DashMap::new(),
            epoch: AtomicU64::new(0),
        })
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    fn record_ack(&self, queue: &str) {
        self.acked
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .fetch_add(1, Ordering::AcqRel);
    }

    fn route_dead_letter(&self, routing_key: &str, payload: Bytes) {
        self.dead_letters
            .entry(routing_key.to_string())
            .or_insert_with(|| Mutex::new(Vec::new()))
            .lock()
            .push(payload);
    }

    /// Payloads routed to the dead-letter store under a routing key
    pub fn dead_letters(&self, routing_key: &str) -> Vec<Bytes> {
        self.dead_letters
            .get(routing_key)
            .map(|entry| entry.lock().clone())
            .unwrap_or_default()
    }

    /// Total acknowledgments recorded for a queue
    pub fn acked_count(&self, queue: &str) -> u64 {
        self.acked
            .get(queue)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.queues.contains_key(queue)
    }

    /// Messages currently waiting in a queue (excludes in-flight deliveries)
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.queues.get(queue).map(|q| q.depth()).unwrap_or(0)
    }
}

struct MemoryAcker {
    state: Arc<MemoryState>,
    queue: Arc<MemoryQueue>,
    msg: Option<QueuedMessage>,
    _permit: Option<tokio::sync::OwnedSemaphorePermit>,
    epoch: u64,
}

impl MemoryAcker {
    fn take_msg(&mut self) -> QueuedMessage {
        self.msg.take().expect("delivery settled twice")
    }

    fn requeue_redelivered(&self, msg: QueuedMessage) {
        self.queue.push_back(QueuedMessage {
            payload: msg.payload,
            redeliveries: msg.redeliveries + 1,
        });
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(mut self: Box<Self>) -> Result<()> {
        let msg = self.take_msg();
        if self.state.epoch() != self.epoch {
            // Connection died before the ack reached the broker; the broker
            // redelivers the message on the next connection.
            self.requeue_redelivered(msg);
            return Err(CarrierError::broker("ack", "connection closed"));
        }
        self.state.record_ack(&self.queue.name);
        Ok(())
    }

    async fn nack(mut self: Box<Self>, requeue: bool) -> Result<()> {
        let msg = self.take_msg();
        if self.state.epoch() != self.epoch {
            self.requeue_redelivered(msg);
            return Err(CarrierError::broker("nack", "connection closed"));
        }
        if requeue {
            self.requeue_redelivered(msg);
        } else {
            self.state
                .route_dead_letter(&self.queue.dead_letter_routing_key, msg.payload);
        }
        Ok(())
    }

    fn on_unreceived(mut self: Box<Self>) {
        let msg = self.take_msg();
        // Never reached a worker: back to the head, no redelivery counted.
        self.queue.push_front(msg);
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        // A delivery dropped without settlement (worker aborted mid-message)
        // is redelivered, preserving at-least-once semantics.
        if let Some(msg) = self.msg.take() {
            self.queue.push_back(QueuedMessage {
                payload: msg.payload,
                redeliveries: msg.redeliveries + 1,
            });
        }
    }
}

struct MemoryChannel {
    state: Arc<MemoryState>,
    epoch: u64,
    prefetch: AtomicU16,
    channel_closed: Arc<ClosedSignal>,
    connection_closed: Arc<ClosedSignal>,
}

impl MemoryChannel {
    fn ensure_open(&self, operation: &str) -> Result<()> {
        if self.channel_closed.is_closed() || self.connection_closed.is_closed() {
            return Err(CarrierError::broker(operation, "channel closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.ensure_open("basic_qos")?;
        self.prefetch.store(count, Ordering::Release);
        Ok(())
    }

    async fn declare_queue(
        &self,
        queue: &str,
        _dead_letter_exchange: &str,
        dead_letter_routing_key: &str,
    ) -> Result<()> {
        self.ensure_open("queue_declare")?;
        self.state
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| MemoryQueue::new(queue, dead_letter_routing_key));
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.ensure_open("queue_delete")?;
        if let Some((_, q)) = self.state.queues.remove(queue) {
            q.mark_deleted();
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<mpsc::Receiver<Delivery>> {
        self.ensure_open("basic_consume")?;
        let queue = self
            .state
            .queues
            .get(queue)
            .map(|q| q.clone())
            .ok_or_else(|| CarrierError::broker("basic_consume", format!("no queue {}", queue)))?;

        let prefetch = match self.prefetch.load(Ordering::Acquire) {
            0 => UNLIMITED_PREFETCH,
            n => n as usize,
        };
        let (tx, rx) = mpsc::channel(1);
        let state = self.state.clone();
        let epoch = self.epoch;
        let channel_closed = self.channel_closed.clone();
        let connection_closed = self.connection_closed.clone();
        let tag = consumer_tag.to_string();

        tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(prefetch));
            loop {
                let permit = tokio::select! {
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    _ = channel_closed.wait() => break,
                    _ = connection_closed.wait() => break,
                };
                let msg = tokio::select! {
                    msg = queue.pop() => match msg {
                        Some(msg) => msg,
                        None => break, // queue deleted
                    },
                    _ = channel_closed.wait() => break,
                    _ = connection_closed.wait() => break,
                };
                let delivery = Delivery::new(
                    msg.payload.clone(),
                    msg.redeliveries,
                    Box::new(MemoryAcker {
                        state: state.clone(),
                        queue: queue.clone(),
                        msg: Some(msg),
                        _permit: Some(permit),
                        epoch,
                    }),
                );
                tokio::select! {
                    sent = tx.send(delivery) => {
                        if let Err(err) = sent {
                            err.0.release_unreceived();
                            break;
                        }
                    }
                    _ = channel_closed.wait() => break,
                    _ = connection_closed.wait() => break,
                }
            }
            tracing::trace!(consumer_tag = %tag, "Memory consumer stopped");
        });

        Ok(rx)
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<()> {
        self.ensure_open("basic_publish")?;
        let queue = self
            .state
            .queues
            .get(queue)
            .map(|q| q.clone())
            .ok_or_else(|| CarrierError::broker("basic_publish", format!("no queue {}", queue)))?;
        queue.push_back(QueuedMessage {
            payload: Bytes::copy_from_slice(payload),
            redeliveries: 0,
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.channel_closed.close();
        Ok(())
    }
}

/// One in-process "physical connection"
pub struct MemoryBroker {
    state: Arc<MemoryState>,
    epoch: u64,
    closed: Arc<ClosedSignal>,
}

impl MemoryBroker {
    fn new(state: Arc<MemoryState>) -> Arc<Self> {
        Arc::new(Self {
            epoch: state.epoch(),
            state,
            closed: ClosedSignal::new(),
        })
    }

    /// Simulate an abrupt connection loss. All channels die, unacked
    /// deliveries are requeued on settlement, and `wait_closed` resolves.
    pub fn sever(&self) {
        self.state.bump_epoch();
        self.closed.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if self.closed.is_closed() {
            return Err(CarrierError::BrokerUnavailable(
                "connection closed".to_string(),
            ));
        }
        Ok(Arc::new(MemoryChannel {
            state: self.state.clone(),
            epoch: self.epoch,
            prefetch: AtomicU16::new(0),
            channel_closed: ClosedSignal::new(),
            connection_closed: self.closed.clone(),
        }))
    }

    async fn wait_closed(&self) {
        self.closed.wait().await;
    }

    async fn close(&self) -> Result<()> {
        self.sever();
        Ok(())
    }
}

/// Connector producing in-process connections over shared broker state
pub struct MemoryConnector {
    state: Arc<MemoryState>,
    current: Mutex<Option<Arc<MemoryBroker>>>,
    fail_connects: AtomicU32,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self {
            state: MemoryState::new(),
            current: Mutex::new(None),
            fail_connects: AtomicU32::new(0),
        }
    }

    /// Shared broker-side state, for inspection in tests
    pub fn state(&self) -> Arc<MemoryState> {
        self.state.clone()
    }

    /// The most recently established connection, if any
    pub fn current(&self) -> Option<Arc<MemoryBroker>> {
        self.current.lock().clone()
    }

    /// Make the next `n` connection attempts fail, to exercise backoff
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_connects.store(n, Ordering::Release);
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerConnector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn Broker>> {
        let remaining = self.fail_connects.load(Ordering::Acquire);
        if remaining > 0 {
            self.fail_connects.store(remaining - 1, Ordering::Release);
            return Err(CarrierError::BrokerUnavailable(
                "simulated connect failure".to_string(),
            ));
        }
        let broker = MemoryBroker::new(self.state.clone());
        *self.current.lock() = Some(broker.clone());
        Ok(broker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PREFETCH_COUNT;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn open_test_channel(
        connector: &MemoryConnector,
    ) -> (Arc<dyn Broker>, Arc<dyn BrokerChannel>) {
        let broker = connector.connect().await.unwrap();
        let channel = broker.open_channel().await.unwrap();
        channel.set_prefetch(PREFETCH_COUNT).await.unwrap();
        channel.declare_queue("q", "dlx", "dl.q").await.unwrap();
        (broker, channel)
    }

    async fn recv(rx: &mut mpsc::Receiver<Delivery>) -> Delivery {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("consumer stream ended")
    }

    #[tokio::test]
    async fn test_publish_consume_ack() {
        let connector = MemoryConnector::new();
        let (_broker, channel) = open_test_channel(&connector).await;

        channel.publish("q", b"hello").await.unwrap();
        let mut rx = channel.consume("q", "q-worker-0").await.unwrap();

        let delivery = recv(&mut rx).await;
        assert_eq!(delivery.payload(), b"hello");
        assert_eq!(delivery.redeliveries(), 0);
        delivery.ack().await.unwrap();

        assert_eq!(connector.state().acked_count("q"), 1);
        assert_eq!(connector.state().queue_depth("q"), 0);
    }

    #[tokio::test]
    async fn test_nack_requeue_increments_redeliveries() {
        let connector = MemoryConnector::new();
        let (_broker, channel) = open_test_channel(&connector).await;

        channel.publish("q", b"again").await.unwrap();
        let mut rx = channel.consume("q", "q-worker-0").await.unwrap();

        let first = recv(&mut rx).await;
        assert_eq!(first.redeliveries(), 0);
        first.nack(true).await.unwrap();

        let second = recv(&mut rx).await;
        assert_eq!(second.redeliveries(), 1);
        second.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_nack_without_requeue_dead_letters() {
        let connector = MemoryConnector::new();
        let (_broker, channel) = open_test_channel(&connector).await;

        channel.publish("q", b"poison").await.unwrap();
        let mut rx = channel.consume("q", "q-worker-0").await.unwrap();

        let delivery = recv(&mut rx).await;
        delivery.nack(false).await.unwrap();

        let dead = connector.state().dead_letters("dl.q");
        assert_eq!(dead.len(), 1);
        assert_eq!(&dead[0][..], b"poison");
        assert_eq!(connector.state().queue_depth("q"), 0);
        assert_eq!(connector.state().acked_count("q"), 0);
    }

    #[tokio::test]
    async fn test_prefetch_bounds_in_flight() {
        let connector = MemoryConnector::new();
        let (_broker, channel) = open_test_channel(&connector).await;

        channel.publish("q", b"one").await.unwrap();
        channel.publish("q", b"two").await.unwrap();
        let mut rx = channel.consume("q", "q-worker-0").await.unwrap();

        let first = recv(&mut rx).await;
        // With prefetch 1 the second message must not arrive before the
        // first is settled.
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());

        first.ack().await.unwrap();
        let second = recv(&mut rx).await;
        assert_eq!(second.payload(), b"two");
        second.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_delete_ends_consumer() {
        let connector = MemoryConnector::new();
        let (_broker, channel) = open_test_channel(&connector).await;

        let mut rx = channel.consume("q", "q-worker-0").await.unwrap();
        channel.delete_queue("q").await.unwrap();

        let ended = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert!(ended.is_none());
        assert!(!connector.state().queue_exists("q"));
    }

    #[tokio::test]
    async fn test_sever_requeues_unacked() {
        let connector = MemoryConnector::new();
        let (broker, channel) = open_test_channel(&connector).await;

        channel.publish("q", b"inflight").await.unwrap();
        let mut rx = channel.consume("q", "q-worker-0").await.unwrap();
        let delivery = recv(&mut rx).await;

        let memory = connector.current().unwrap();
        memory.sever();

        // Ack on the dead connection fails and the message returns to the
        // queue for the next connection.
        assert!(delivery.ack().await.is_err());
        assert_eq!(connector.state().acked_count("q"), 0);
        assert_eq!(connector.state().queue_depth("q"), 1);

        // Durable state survives: a new connection consumes the redelivery.
        let broker2 = connector.connect().await.unwrap();
        let channel2 = broker2.open_channel().await.unwrap();
        let mut rx2 = channel2.consume("q", "q-worker-0").await.unwrap();
        let redelivered = recv(&mut rx2).await;
        assert_eq!(redelivered.payload(), b"inflight");
        assert_eq!(redelivered.redeliveries(), 1);
        redelivered.ack().await.unwrap();

        drop(broker);
    }

    #[tokio::test]
    async fn test_wait_closed_resolves_on_sever() {
        let connector = MemoryConnector::new();
        let broker = connector.connect().await.unwrap();
        let memory = connector.current().unwrap();

        let waiter = tokio::spawn(async move { broker.wait_closed().await });
        memory.sever();
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_closed did not resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_connects_then_success() {
        let connector = MemoryConnector::new();
        connector.fail_next_connects(2);
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_signal_wait_after_close_returns() {
        let signal = ClosedSignal::new();
        signal.close();
        timeout(Duration::from_secs(1), signal.wait())
            .await
            .expect("wait hung on an already-closed signal");
    }

    #[tokio::test]
    async fn test_closed_signal_wakes_waiter_racing_with_close() {
        // close() and wait() land in any order; the waiter must resolve
        // whichever side wins the race.
        for _ in 0..200 {
            let signal = ClosedSignal::new();
            let waiter = {
                let signal = signal.clone();
                tokio::spawn(async move { signal.wait().await })
            };
            let closer = {
                let signal = signal.clone();
                tokio::spawn(async move { signal.close() })
            };
            timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter missed the close notification")
                .unwrap();
            closer.await.unwrap();
        }
    }
}
