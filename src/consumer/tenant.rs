//! Per-tenant consumer
//!
//! A [`TenantConsumer`] owns one logical broker channel and a pool of worker
//! tasks. All channel and pool mutation goes through an async mutex; the
//! lifecycle state is kept separately so snapshots never wait on broker I/O.
//!
//! The channel is a derived resource. On connection loss the manager calls
//! [`TenantConsumer::rebuild`] with the replacement connection and the
//! consumer comes back at its last configured worker count.

use crate::broker::{
    dead_letter_routing_key, queue_name, Broker, BrokerChannel, DEAD_LETTER_EXCHANGE,
    PREFETCH_COUNT,
};
use crate::consumer::worker::{spawn_worker, WorkerContext, WorkerHandle};
use crate::consumer::MessageHandler;
use crate::error::{CarrierError, Result};
use crate::metrics;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Consumer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Registered but not yet consuming
    Created,
    /// Workers are consuming
    Active,
    /// Worker pool is being resized
    Resizing,
    /// Workers are finishing their in-flight messages
    Draining,
    /// Fully stopped
    Closed,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Created => write!(f, "created"),
            LifecycleState::Active => write!(f, "active"),
            LifecycleState::Resizing => write!(f, "resizing"),
            LifecycleState::Draining => write!(f, "draining"),
            LifecycleState::Closed => write!(f, "closed"),
        }
    }
}

struct ConsumerInner {
    channel: Option<Arc<dyn BrokerChannel>>,
    workers: Vec<WorkerHandle>,
}

/// One tenant's channel and worker pool
pub struct TenantConsumer {
    tenant_id: String,
    queue: String,
    dead_letter_key: String,
    context: Arc<WorkerContext>,
    desired: AtomicUsize,
    state: parking_lot::Mutex<LifecycleState>,
    inner: Mutex<ConsumerInner>,
}

impl TenantConsumer {
    pub(crate) fn new(
        tenant_id: &str,
        worker_count: usize,
        max_redeliveries: u32,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            queue: queue_name(tenant_id),
            dead_letter_key: dead_letter_routing_key(tenant_id),
            context: Arc::new(WorkerContext {
                tenant_id: tenant_id.to_string(),
                max_redeliveries,
                handler,
            }),
            desired: AtomicUsize::new(worker_count),
            state: parking_lot::Mutex::new(LifecycleState::Created),
            inner: Mutex::new(ConsumerInner {
                channel: None,
                workers: Vec::new(),
            }),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// Configured worker count. Survives reconnection even while the pool is
    /// down.
    pub fn desired_workers(&self) -> usize {
        self.desired.load(Ordering::Acquire)
    }

    /// Workers currently running
    pub async fn worker_count(&self) -> usize {
        self.inner.lock().await.workers.len()
    }

    /// Open a channel, set QoS, and declare the tenant queue with its
    /// dead-letter binding. Declaration is idempotent.
    async fn open_prepared_channel(&self, broker: &dyn Broker) -> Result<Arc<dyn BrokerChannel>> {
        let channel = broker.open_channel().await?;
        channel.set_prefetch(PREFETCH_COUNT).await?;
        channel
            .declare_queue(&self.queue, DEAD_LETTER_EXCHANGE, &self.dead_letter_key)
            .await?;
        Ok(channel)
    }

    async fn spawn_pool(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        count: usize,
    ) -> Result<Vec<WorkerHandle>> {
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            match spawn_worker(channel.as_ref(), &self.queue, self.context.clone(), index).await {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    for worker in &workers {
                        worker.abort();
                    }
                    return Err(e);
                }
            }
        }
        Ok(workers)
    }

    /// Provision broker resources and start the worker pool
    pub(crate) async fn start(&self, broker: &dyn Broker) -> Result<()> {
        if self.state() != LifecycleState::Created {
            return Err(CarrierError::Server(format!(
                "consumer for tenant {} already started",
                self.tenant_id
            )));
        }
        let mut inner = self.inner.lock().await;
        let channel = self.open_prepared_channel(broker).await?;
        let desired = self.desired_workers();
        let workers = match self.spawn_pool(&channel, desired).await {
            Ok(workers) => workers,
            Err(e) => {
                let _ = channel.close().await;
                return Err(e);
            }
        };
        inner.channel = Some(channel);
        inner.workers = workers;
        *self.state.lock() = LifecycleState::Active;
        metrics::set_worker_count(&self.tenant_id, desired);
        info!(tenant_id = %self.tenant_id, workers = desired, queue = %self.queue, "Tenant consumer started");
        Ok(())
    }

    /// Rebuild channel and workers on a replacement connection, at the last
    /// configured worker count.
    pub(crate) async fn rebuild(&self, broker: &dyn Broker) -> Result<()> {
        if matches!(
            self.state(),
            LifecycleState::Draining | LifecycleState::Closed
        ) {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        // The old channel is dead; workers exit once their delivery streams end.
        for worker in &inner.workers {
            worker.signal_stop();
        }
        for worker in inner.workers.drain(..) {
            worker.join().await;
        }
        inner.channel = None;

        let channel = self.open_prepared_channel(broker).await?;
        let desired = self.desired_workers();
        let workers = match self.spawn_pool(&channel, desired).await {
            Ok(workers) => workers,
            Err(e) => {
                let _ = channel.close().await;
                return Err(e);
            }
        };
        inner.channel = Some(channel);
        inner.workers = workers;
        *self.state.lock() = LifecycleState::Active;
        metrics::set_worker_count(&self.tenant_id, desired);
        info!(tenant_id = %self.tenant_id, workers = desired, "Tenant consumer rebuilt");
        Ok(())
    }

    /// Resize the worker pool. Scale-up spawns workers at the next indexes;
    /// scale-down stops the highest-indexed workers after their in-flight
    /// message.
    pub(crate) async fn resize(&self, new_count: usize) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                LifecycleState::Active => *state = LifecycleState::Resizing,
                LifecycleState::Created | LifecycleState::Resizing => {
                    return Err(CarrierError::Server(format!(
                        "consumer for tenant {} is not ready to resize",
                        self.tenant_id
                    )))
                }
                LifecycleState::Draining | LifecycleState::Closed => {
                    return Err(CarrierError::NotFound(self.tenant_id.clone()))
                }
            }
        }

        let mut inner = self.inner.lock().await;
        // With no live channel the new count is recorded and applied on rebuild.
        if let Some(channel) = inner.channel.clone() {
            let current = inner.workers.len();
            if new_count > current {
                let mut added = Vec::with_capacity(new_count - current);
                for index in current..new_count {
                    match spawn_worker(channel.as_ref(), &self.queue, self.context.clone(), index)
                        .await
                    {
                        Ok(worker) => added.push(worker),
                        Err(e) => {
                            for worker in &added {
                                worker.abort();
                            }
                            *self.state.lock() = LifecycleState::Active;
                            return Err(e);
                        }
                    }
                }
                inner.workers.extend(added);
            } else if new_count < current {
                let removed = inner.workers.split_off(new_count);
                for worker in &removed {
                    debug!(tenant_id = %self.tenant_id, worker = worker.index(), "Stopping worker");
                    worker.signal_stop();
                }
                for worker in removed {
                    worker.join().await;
                }
            }
        }
        self.desired.store(new_count, Ordering::Release);
        *self.state.lock() = LifecycleState::Active;
        metrics::set_worker_count(&self.tenant_id, new_count);
        info!(tenant_id = %self.tenant_id, workers = new_count, "Worker pool resized");
        Ok(())
    }

    /// Publish a payload to this tenant's queue
    pub async fn publish(&self, payload: &[u8]) -> Result<()> {
        let channel = {
            let inner = self.inner.lock().await;
            inner.channel.clone().ok_or_else(|| {
                CarrierError::BrokerUnavailable("tenant channel is down".to_string())
            })?
        };
        channel.publish(&self.queue, payload).await
    }

    /// Stop workers after their in-flight messages and release the channel.
    /// With `delete_queue`, the tenant queue is deleted as well.
    pub(crate) async fn drain_and_close(&self, delete_queue: bool) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state == LifecycleState::Closed {
                return Ok(());
            }
            *state = LifecycleState::Draining;
        }
        let mut inner = self.inner.lock().await;
        for worker in &inner.workers {
            worker.signal_stop();
        }
        for worker in inner.workers.drain(..) {
            worker.join().await;
        }

        let mut result = Ok(());
        if let Some(channel) = inner.channel.take() {
            if delete_queue {
                if let Err(e) = channel.delete_queue(&self.queue).await {
                    result = Err(CarrierError::teardown(&self.queue, e.to_string()));
                }
            }
            if let Err(e) = channel.close().await {
                warn!(tenant_id = %self.tenant_id, error = %e, "Channel close failed");
            }
        }
        *self.state.lock() = LifecycleState::Closed;
        metrics::set_worker_count(&self.tenant_id, 0);
        info!(tenant_id = %self.tenant_id, "Tenant consumer closed");
        result
    }

    /// Abort workers immediately. Unacked messages return to the queue.
    pub(crate) async fn force_close(&self) {
        let mut inner = self.inner.lock().await;
        for worker in inner.workers.drain(..) {
            worker.abort();
        }
        inner.channel = None;
        *self.state.lock() = LifecycleState::Closed;
        metrics::set_worker_count(&self.tenant_id, 0);
    }
}
