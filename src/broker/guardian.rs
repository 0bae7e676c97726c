//! Broker connection guardian
//!
//! Owns the single physical connection to the broker. Detects closure,
//! reconnects with exponential backoff (jittered, capped), and publishes
//! connection-state transitions on a watch channel. Retries continue
//! indefinitely: a broker outage is degraded service, not a fatal
//! condition for the process.
//!
//! Only the guardian ever mutates connection identity. Consumers request a
//! channel from whatever connection is currently valid via [`ConnectionGuardian::broker`].

use crate::broker::{Broker, BrokerConnector};
use crate::config::ReconnectConfig;
use crate::error::{CarrierError, Result};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Connection lifecycle as observed by consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Physical connection is established
    Connected,
    /// Connection lost; the guardian is retrying with backoff
    Reconnecting,
    /// Guardian shut down; the connection is gone for good
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Compute the delay before reconnection attempt `attempt` (zero-based).
///
/// Exponential in the attempt number, capped at `max_delay_ms`, with a
/// jitter factor in [0.5, 1.0] to avoid reconnect stampedes.
pub fn backoff_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    let exponent = attempt.min(32) as i32;
    let base = config.initial_delay_ms as f64 * config.multiplier.powi(exponent);
    let capped = base.min(config.max_delay_ms as f64);
    let jitter = rand::thread_rng().gen_range(0.5..=1.0);
    Duration::from_millis((capped * jitter) as u64)
}

/// Guards the shared physical connection
pub struct ConnectionGuardian {
    connector: Arc<dyn BrokerConnector>,
    reconnect: ReconnectConfig,
    current: RwLock<Option<Arc<dyn Broker>>>,
    state_tx: watch::Sender<ConnectionState>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionGuardian {
    /// Establish the initial connection and start monitoring it.
    ///
    /// The initial connection must succeed; once it has, all later
    /// connection loss is handled internally.
    pub async fn connect(
        connector: Arc<dyn BrokerConnector>,
        reconnect: ReconnectConfig,
    ) -> Result<Arc<Self>> {
        let broker = connector.connect().await?;
        info!("Broker connection established");

        let (state_tx, _) = watch::channel(ConnectionState::Connected);
        let guardian = Arc::new(Self {
            connector,
            reconnect,
            current: RwLock::new(Some(broker)),
            state_tx,
            monitor: Mutex::new(None),
        });

        let handle = tokio::spawn(guardian.clone().monitor_loop());
        *guardian.monitor.lock() = Some(handle);
        Ok(guardian)
    }

    /// The currently valid connection, or `BrokerUnavailable` while
    /// reconnecting.
    pub fn broker(&self) -> Result<Arc<dyn Broker>> {
        self.current
            .read()
            .clone()
            .ok_or_else(|| CarrierError::BrokerUnavailable("connection is down".to_string()))
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Subscribe to connection-state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Stop monitoring and close the connection.
    ///
    /// The monitor task never holds a lock across an await, so aborting it
    /// is safe at any point, including mid-retry.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(handle) = self.monitor.lock().take() {
            handle.abort();
            let _ = handle.await;
        }
        let broker = self.current.write().take();
        self.state_tx.send_replace(ConnectionState::Closed);
        if let Some(broker) = broker {
            broker.close().await?;
        }
        Ok(())
    }

    async fn monitor_loop(self: Arc<Self>) {
        loop {
            let broker = match self.broker() {
                Ok(broker) => broker,
                Err(_) => return,
            };
            broker.wait_closed().await;

            warn!("Broker connection lost, reconnecting");
            *self.current.write() = None;
            self.state_tx.send_replace(ConnectionState::Reconnecting);

            let broker = self.reconnect_with_backoff().await;
            *self.current.write() = Some(broker);
            self.state_tx.send_replace(ConnectionState::Connected);
            info!("Broker connection re-established");
        }
    }

    async fn reconnect_with_backoff(&self) -> Arc<dyn Broker> {
        let mut attempt: u32 = 0;
        loop {
            let delay = backoff_delay(&self.reconnect, attempt);
            tokio::time::sleep(delay).await;
            match self.connector.connect().await {
                Ok(broker) => return broker,
                Err(e) => {
                    warn!(attempt, error = %e, "Reconnect attempt failed");
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
}
