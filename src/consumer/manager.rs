//! Tenant registry and lifecycle manager
//!
//! The manager owns the tenant map and is the only entry point for tenant
//! lifecycle operations. Registration reserves the tenant id in the map
//! before any broker I/O so concurrent adds of the same id cannot both
//! succeed; removal claims the entry first so the second caller observes
//! `NotFound`.
//!
//! On reconnection the manager rebuilds every registered tenant on the
//! replacement connection at its last configured worker count.

use crate::broker::{ConnectionGuardian, ConnectionState};
use crate::consumer::tenant::TenantConsumer;
use crate::consumer::{validate_tenant_id, validate_worker_count, MessageHandler};
use crate::error::{CarrierError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Point-in-time view of a tenant, as reported by the admin API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantSnapshot {
    pub id: String,
    pub worker_count: usize,
    pub state: String,
}

/// Owns all tenant consumers
pub struct TenantManager {
    tenants: DashMap<String, Arc<TenantConsumer>>,
    guardian: Arc<ConnectionGuardian>,
    max_redeliveries: u32,
    handler: Arc<dyn MessageHandler>,
    rebuild_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl TenantManager {
    /// Create the manager and start watching for reconnections
    pub fn new(
        guardian: Arc<ConnectionGuardian>,
        max_redeliveries: u32,
        handler: Arc<dyn MessageHandler>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            tenants: DashMap::new(),
            guardian: guardian.clone(),
            max_redeliveries,
            handler,
            rebuild_task: parking_lot::Mutex::new(None),
        });
        let handle = tokio::spawn(Self::watch_reconnects(
            Arc::downgrade(&manager),
            guardian.subscribe(),
        ));
        *manager.rebuild_task.lock() = Some(handle);
        manager
    }

    async fn watch_reconnects(
        manager: Weak<Self>,
        mut states: tokio::sync::watch::Receiver<ConnectionState>,
    ) {
        loop {
            if states.changed().await.is_err() {
                return;
            }
            let state = *states.borrow_and_update();
            if state != ConnectionState::Connected {
                continue;
            }
            let Some(manager) = manager.upgrade() else {
                return;
            };
            manager.rebuild_all().await;
        }
    }

    /// Rebuild every registered tenant on the current connection
    async fn rebuild_all(&self) {
        let broker = match self.guardian.broker() {
            Ok(broker) => broker,
            // Lost again before we got here; the next transition retries.
            Err(_) => return,
        };
        let consumers: Vec<Arc<TenantConsumer>> = self
            .tenants
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        info!(tenants = consumers.len(), "Rebuilding tenant consumers after reconnect");
        for consumer in consumers {
            if let Err(e) = consumer.rebuild(broker.as_ref()).await {
                error!(tenant_id = %consumer.tenant_id(), error = %e, "Tenant rebuild failed");
            }
        }
    }

    /// Register a tenant and start consuming its queue
    pub async fn add_tenant(&self, tenant_id: &str, worker_count: usize) -> Result<TenantSnapshot> {
        validate_tenant_id(tenant_id)?;
        validate_worker_count(worker_count)?;

        // Reserve the id before broker I/O; losers of the race see it here.
        let consumer = match self.tenants.entry(tenant_id.to_string()) {
            Entry::Occupied(_) => return Err(CarrierError::AlreadyExists(tenant_id.to_string())),
            Entry::Vacant(vacant) => {
                let consumer = Arc::new(TenantConsumer::new(
                    tenant_id,
                    worker_count,
                    self.max_redeliveries,
                    self.handler.clone(),
                ));
                vacant.insert(consumer.clone());
                consumer
            }
        };

        let started = async {
            let broker = self.guardian.broker()?;
            consumer.start(broker.as_ref()).await
        }
        .await;

        if let Err(e) = started {
            self.tenants.remove(tenant_id);
            consumer.force_close().await;
            return Err(e);
        }
        info!(tenant_id, worker_count, "Tenant created");
        Ok(snapshot(&consumer).await)
    }

    /// Remove a tenant, stop its workers, and delete its queue
    pub async fn remove_tenant(&self, tenant_id: &str) -> Result<()> {
        let (_, consumer) = self
            .tenants
            .remove(tenant_id)
            .ok_or_else(|| CarrierError::NotFound(tenant_id.to_string()))?;

        // Teardown problems are logged, not surfaced: the tenant is already
        // unregistered and a retry would hit NotFound.
        if let Err(e) = consumer.drain_and_close(true).await {
            warn!(tenant_id, error = %e, "Tenant teardown incomplete");
        }
        info!(tenant_id, "Tenant removed");
        Ok(())
    }

    /// Change a tenant's worker count
    pub async fn update_concurrency(
        &self,
        tenant_id: &str,
        worker_count: usize,
    ) -> Result<TenantSnapshot> {
        validate_worker_count(worker_count)?;
        let consumer = self.consumer(tenant_id)?;
        consumer.resize(worker_count).await?;
        Ok(snapshot(&consumer).await)
    }

    /// Look up one tenant
    pub async fn get_tenant(&self, tenant_id: &str) -> Result<TenantSnapshot> {
        let consumer = self.consumer(tenant_id)?;
        Ok(snapshot(&consumer).await)
    }

    /// Snapshot all tenants, ordered by id
    pub async fn list_tenants(&self) -> Vec<TenantSnapshot> {
        let consumers: Vec<Arc<TenantConsumer>> = self
            .tenants
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut snapshots = Vec::with_capacity(consumers.len());
        for consumer in consumers {
            snapshots.push(snapshot(&consumer).await);
        }
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Publish a payload to a tenant's queue
    pub async fn publish(&self, tenant_id: &str, payload: &[u8]) -> Result<()> {
        let consumer = self.consumer(tenant_id)?;
        consumer.publish(payload).await
    }

    /// Connection state as seen by the guardian
    pub fn connection_state(&self) -> ConnectionState {
        self.guardian.state()
    }

    fn consumer(&self, tenant_id: &str) -> Result<Arc<TenantConsumer>> {
        self.tenants
            .get(tenant_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CarrierError::NotFound(tenant_id.to_string()))
    }

    /// Drain all tenants within `deadline`, aborting stragglers, then close
    /// the broker connection. Durable queues are left in place.
    ///
    /// Best-effort: teardown problems are logged, never surfaced. The
    /// process is exiting either way.
    pub async fn close(&self, deadline: Duration) {
        if let Some(handle) = self.rebuild_task.lock().take() {
            handle.abort();
        }
        let consumers: Vec<Arc<TenantConsumer>> = self
            .tenants
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.tenants.clear();

        let drain = async {
            for consumer in &consumers {
                if let Err(e) = consumer.drain_and_close(false).await {
                    warn!(tenant_id = %consumer.tenant_id(), error = %e, "Drain failed");
                }
            }
        };
        if tokio::time::timeout(deadline, drain).await.is_err() {
            warn!("Shutdown deadline exceeded, aborting remaining workers");
            for consumer in &consumers {
                consumer.force_close().await;
            }
        }
        if let Err(e) = self.guardian.shutdown().await {
            warn!(error = %e, "Broker connection close failed");
        }
    }
}

async fn snapshot(consumer: &TenantConsumer) -> TenantSnapshot {
    TenantSnapshot {
        id: consumer.tenant_id().to_string(),
        worker_count: consumer.worker_count().await,
        state: consumer.state().to_string(),
    }
}
