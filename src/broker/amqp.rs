//! AMQP 0.9.1 broker backend via lapin
//!
//! One lapin `Connection` per [`AmqpBroker`]; each tenant gets its own lapin
//! `Channel`. Queues are durable and carry `x-dead-letter-exchange` /
//! `x-dead-letter-routing-key` arguments so rejected messages route to the
//! shared dead-letter exchange without any work on our side.
//!
//! Redelivery counts come from the broker: the `x-delivery-count` header when
//! the queue tracks it, otherwise the AMQP `redelivered` flag (which only
//! distinguishes first delivery from any redelivery).

use crate::broker::{Acker, Broker, BrokerChannel, BrokerConnector, Delivery};
use crate::error::{CarrierError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

const REPLY_SUCCESS: u16 = 200;

/// Header set by quorum queues counting deliveries of a message
const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// Persistent delivery mode for published messages
const DELIVERY_MODE_PERSISTENT: u8 = 2;

struct ClosedLatch {
    closed: AtomicBool,
    notify: Notify,
}

impl ClosedLatch {
    fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
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

fn broker_err(operation: &'static str, err: lapin::Error) -> CarrierError {
    CarrierError::broker(operation, err.to_string())
}

fn amqp_value_as_u64(value: &AMQPValue) -> Option<u64> {
    match value {
        AMQPValue::ShortShortInt(n) => u64::try_from(*n).ok(),
        AMQPValue::ShortShortUInt(n) => Some(u64::from(*n)),
        AMQPValue::ShortInt(n) => u64::try_from(*n).ok(),
        AMQPValue::ShortUInt(n) => Some(u64::from(*n)),
        AMQPValue::LongInt(n) => u64::try_from(*n).ok(),
        AMQPValue::LongUInt(n) => Some(u64::from(*n)),
        AMQPValue::LongLongInt(n) => u64::try_from(*n).ok(),
        _ => None,
    }
}

/// Broker-reported redelivery count for a delivery
fn redelivery_count(properties: &BasicProperties, redelivered: bool) -> u32 {
    if let Some(headers) = properties.headers() {
        if let Some(value) = headers.inner().get(DELIVERY_COUNT_HEADER) {
            if let Some(count) = amqp_value_as_u64(value) {
                return count.min(u64::from(u32::MAX)) as u32;
            }
        }
    }
    u32::from(redelivered)
}

struct AmqpAcker {
    inner: lapin::acker::Acker,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.inner
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| broker_err("basic_ack", e))
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<()> {
        self.inner
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| broker_err("basic_nack", e))
    }

    fn on_unreceived(self: Box<Self>) {
        // Requeue so another worker picks the message up. The broker marks
        // it redelivered either way.
        tokio::spawn(async move {
            if let Err(e) = self
                .inner
                .nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await
            {
                debug!(error = %e, "Requeue of undispatched delivery failed");
            }
        });
    }
}

/// One lapin channel, owned by a single tenant consumer
pub struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(|e| broker_err("basic_qos", e))
    }

    async fn declare_queue(
        &self,
        queue: &str,
        dead_letter_exchange: &str,
        dead_letter_routing_key: &str,
    ) -> Result<()> {
        self.channel
            .exchange_declare(
                dead_letter_exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| broker_err("exchange_declare", e))?;

        let mut arguments = FieldTable::default();
        arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(dead_letter_exchange.into()),
        );
        arguments.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(dead_letter_routing_key.into()),
        );

        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|e| broker_err("queue_declare", e))?;
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .map_err(|e| broker_err("queue_delete", e))?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<mpsc::Receiver<Delivery>> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| broker_err("basic_consume", e))?;

        // Bounded to keep broker-side prefetch the effective flow control.
        let (tx, rx) = mpsc::channel(1);
        let tag = consumer_tag.to_string();
        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                let delivery = match result {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        debug!(consumer_tag = %tag, error = %e, "Consumer stream ended");
                        break;
                    }
                };
                let redeliveries = redelivery_count(&delivery.properties, delivery.redelivered);
                let payload = Bytes::from(delivery.data);
                let acker = Box::new(AmqpAcker {
                    inner: delivery.acker,
                });
                if let Err(unsent) = tx.send(Delivery::new(payload, redeliveries, acker)).await {
                    unsent.0.release_unreceived();
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<()> {
        self.channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_delivery_mode(DELIVERY_MODE_PERSISTENT),
            )
            .await
            .map_err(|e| broker_err("basic_publish", e))?
            .await
            .map_err(|e| broker_err("publisher_confirm", e))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(REPLY_SUCCESS, "channel closed")
            .await
            .map_err(|e| broker_err("channel_close", e))
    }
}

/// One physical AMQP connection
pub struct AmqpBroker {
    connection: Connection,
    closed: Arc<ClosedLatch>,
}

impl AmqpBroker {
    fn new(connection: Connection) -> Self {
        let closed = Arc::new(ClosedLatch::new());
        let latch = closed.clone();
        connection.on_error(move |err| {
            warn!(error = %err, "AMQP connection error");
            latch.close();
        });
        Self { connection, closed }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| broker_err("create_channel", e))?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn wait_closed(&self) {
        if !self.connection.status().connected() {
            return;
        }
        self.closed.wait().await;
    }

    async fn close(&self) -> Result<()> {
        self.closed.close();
        self.connection
            .close(REPLY_SUCCESS, "shutting down")
            .await
            .map_err(|e| broker_err("connection_close", e))
    }
}

/// Connects to an AMQP broker by URL
pub struct AmqpConnector {
    url: String,
}

impl AmqpConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self) -> Result<Arc<dyn Broker>> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| CarrierError::BrokerUnavailable(e.to_string()))?;
        Ok(Arc::new(AmqpBroker::new(connection)))
    }
}
