//! Broker abstraction for Carrier
//!
//! One physical broker connection is shared by all tenants; each tenant owns
//! an independent logical channel derived from it. The traits here keep the
//! consumer pipeline agnostic of the transport: `amqp` backs them with a real
//! AMQP 0.9.1 broker via lapin, `memory` backs them with an in-process broker
//! used by tests and playground mode.
//!
//! Channels are derived, recreatable resources. On connection loss they are
//! all considered invalid and rebuilt from the tenant registry by the
//! connection guardian / manager pair.

pub mod amqp;
pub mod guardian;
pub mod memory;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use amqp::AmqpConnector;
pub use guardian::{ConnectionGuardian, ConnectionState};
pub use memory::{MemoryConnector, MemoryState};

/// Name of the shared dead-letter exchange
pub const DEAD_LETTER_EXCHANGE: &str = "dlx";

/// Per-worker QoS prefetch: at most one unacknowledged delivery in flight
pub const PREFETCH_COUNT: u16 = 1;

/// Derive the durable queue name for a tenant
pub fn queue_name(tenant_id: &str) -> String {
    format!("tenant_{}_queue", tenant_id)
}

/// Derive the dead-letter routing key for a tenant
pub fn dead_letter_routing_key(tenant_id: &str) -> String {
    format!("dl.{}", tenant_id)
}

/// Derive the consumer tag for one worker of a tenant
pub fn consumer_tag(tenant_id: &str, worker_index: usize) -> String {
    format!("{}-worker-{}", tenant_id, worker_index)
}

/// Settles a single delivery. Implemented per broker backend.
#[async_trait]
pub trait Acker: Send {
    /// Acknowledge the delivery
    async fn ack(self: Box<Self>) -> Result<()>;

    /// Negatively acknowledge the delivery. With `requeue`, the message goes
    /// back to the queue with an incremented redelivery count; without it,
    /// the dead-letter binding routes it to the tenant's dead-letter target.
    async fn nack(self: Box<Self>, requeue: bool) -> Result<()>;

    /// Called when the delivery was handed out but never reached a worker
    /// (e.g. the worker stopped first). Returns the message to the queue
    /// without counting a redelivery.
    fn on_unreceived(self: Box<Self>);
}

/// One message delivered to a worker
pub struct Delivery {
    payload: Bytes,
    redeliveries: u32,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(payload: Bytes, redeliveries: u32, acker: Box<dyn Acker>) -> Self {
        Self {
            payload,
            redeliveries,
            acker,
        }
    }

    /// Message payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// How many times this message has been redelivered before this delivery
    pub fn redeliveries(&self) -> u32 {
        self.redeliveries
    }

    /// Acknowledge the message
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Negatively acknowledge the message
    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }

    pub(crate) fn release_unreceived(self) {
        self.acker.on_unreceived();
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .field("redeliveries", &self.redeliveries)
            .finish()
    }
}

/// A logical channel on the shared connection, owned by one tenant
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Set per-consumer QoS prefetch (count, size 0, non-global)
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Declare a durable, non-exclusive queue bound to the dead-letter
    /// exchange with the given routing key. Idempotent.
    async fn declare_queue(
        &self,
        queue: &str,
        dead_letter_exchange: &str,
        dead_letter_routing_key: &str,
    ) -> Result<()>;

    /// Delete a queue
    async fn delete_queue(&self, queue: &str) -> Result<()>;

    /// Register a consumer on the queue. Deliveries arrive on the returned
    /// receiver; dropping it cancels the consumer. The receiver is bounded
    /// so broker-side prefetch remains the effective backpressure control.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<mpsc::Receiver<Delivery>>;

    /// Publish a payload directly to a queue (default exchange semantics)
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<()>;

    /// Close the channel. Consumers registered on it stop receiving.
    async fn close(&self) -> Result<()>;
}

/// The shared physical connection
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a new logical channel
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// Resolve when the connection is lost. Used by the connection guardian
    /// to drive reconnection.
    async fn wait_closed(&self);

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// Establishes physical connections. The guardian calls this on startup and
/// on every reconnection attempt.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Broker>>;
}
