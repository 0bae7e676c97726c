//! Worker tasks
//!
//! One worker = one broker consumer with prefetch 1 plus a task that feeds
//! deliveries to the handler and settles them. Failed messages are requeued
//! until their redelivery count reaches the cap, then rejected without
//! requeue so the dead-letter binding takes them.

use crate::broker::{consumer_tag, BrokerChannel, Delivery};
use crate::consumer::MessageHandler;
use crate::error::Result;
use crate::metrics;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Shared per-tenant context for worker tasks
pub(crate) struct WorkerContext {
    pub tenant_id: String,
    pub max_redeliveries: u32,
    pub handler: Arc<dyn MessageHandler>,
}

/// Handle to one running worker task
pub(crate) struct WorkerHandle {
    index: usize,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Ask the worker to stop after its in-flight message, if any
    pub fn signal_stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Wait for the worker task to finish
    pub async fn join(self) {
        let _ = self.handle.await;
    }

    /// Abort the worker task without waiting
    pub fn abort(&self) {
        self.handle.abort();
    }
}

/// Register a consumer for worker `index` on `queue` and spawn its task
pub(crate) async fn spawn_worker(
    channel: &dyn BrokerChannel,
    queue: &str,
    context: Arc<WorkerContext>,
    index: usize,
) -> Result<WorkerHandle> {
    let tag = consumer_tag(&context.tenant_id, index);
    let deliveries = channel.consume(queue, &tag).await?;
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(worker_loop(context, index, deliveries, stop_rx));
    Ok(WorkerHandle {
        index,
        stop: stop_tx,
        handle,
    })
}

async fn worker_loop(
    context: Arc<WorkerContext>,
    index: usize,
    mut deliveries: mpsc::Receiver<Delivery>,
    mut stop: watch::Receiver<bool>,
) {
    debug!(tenant_id = %context.tenant_id, worker = index, "Worker started");
    loop {
        let delivery = tokio::select! {
            _ = stop.changed() => break,
            maybe = deliveries.recv() => match maybe {
                Some(delivery) => delivery,
                None => break,
            },
        };
        settle(&context, index, delivery).await;
    }

    // Return anything already dispatched to us without counting a redelivery.
    deliveries.close();
    while let Ok(delivery) = deliveries.try_recv() {
        delivery.release_unreceived();
    }
    debug!(tenant_id = %context.tenant_id, worker = index, "Worker stopped");
}

/// Run the handler for one delivery and settle it per the redelivery policy
async fn settle(context: &WorkerContext, index: usize, delivery: Delivery) {
    let started = Instant::now();
    let result = context.handler.process_message(delivery.payload()).await;
    metrics::record_processing_duration(&context.tenant_id, started.elapsed());

    match result {
        Ok(()) => {
            if let Err(e) = delivery.ack().await {
                warn!(tenant_id = %context.tenant_id, worker = index, error = %e, "Ack failed");
                return;
            }
            metrics::record_processed(&context.tenant_id, metrics::STATUS_SUCCESS);
        }
        Err(e) => {
            let redeliveries = delivery.redeliveries();
            let requeue = redeliveries < context.max_redeliveries;
            warn!(
                tenant_id = %context.tenant_id,
                worker = index,
                redeliveries,
                requeue,
                error = %e,
                "Message processing failed"
            );
            let status = if requeue {
                metrics::STATUS_REQUEUED
            } else {
                metrics::STATUS_DEAD_LETTERED
            };
            if let Err(nack_err) = delivery.nack(requeue).await {
                warn!(tenant_id = %context.tenant_id, worker = index, error = %nack_err, "Nack failed");
                return;
            }
            metrics::record_processed(&context.tenant_id, status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Acker;
    use crate::error::CarrierError;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct RecordingAcker {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Acker for RecordingAcker {
        async fn ack(self: Box<Self>) -> Result<()> {
            self.log.lock().push("ack".to_string());
            Ok(())
        }

        async fn nack(self: Box<Self>, requeue: bool) -> Result<()> {
            self.log.lock().push(format!("nack:{}", requeue));
            Ok(())
        }

        fn on_unreceived(self: Box<Self>) {
            self.log.lock().push("unreceived".to_string());
        }
    }

    struct OkHandler;

    #[async_trait]
    impl MessageHandler for OkHandler {
        async fn process_message(&self, _payload: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    struct FailHandler;

    #[async_trait]
    impl MessageHandler for FailHandler {
        async fn process_message(&self, _payload: &[u8]) -> Result<()> {
            Err(CarrierError::HandlerFailure("boom".to_string()))
        }
    }

    fn context(handler: Arc<dyn MessageHandler>, max_redeliveries: u32) -> Arc<WorkerContext> {
        Arc::new(WorkerContext {
            tenant_id: "acme".to_string(),
            max_redeliveries,
            handler,
        })
    }

    fn delivery(redeliveries: u32, log: &Arc<Mutex<Vec<String>>>) -> Delivery {
        Delivery::new(
            Bytes::from_static(b"payload"),
            redeliveries,
            Box::new(RecordingAcker { log: log.clone() }),
        )
    }

    async fn run_one(context: Arc<WorkerContext>, item: Delivery) {
        let (tx, rx) = mpsc::channel(1);
        let (_stop_tx, stop_rx) = watch::channel(false);
        tx.send(item).await.unwrap();
        drop(tx);
        worker_loop(context, 0, rx, stop_rx).await;
    }

    #[tokio::test]
    async fn test_success_acks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        run_one(context(Arc::new(OkHandler), 5), delivery(0, &log)).await;
        assert_eq!(*log.lock(), vec!["ack"]);
    }

    #[tokio::test]
    async fn test_failure_below_cap_requeues() {
        let log = Arc::new(Mutex::new(Vec::new()));
        run_one(context(Arc::new(FailHandler), 5), delivery(4, &log)).await;
        assert_eq!(*log.lock(), vec!["nack:true"]);
    }

    #[tokio::test]
    async fn test_failure_at_cap_dead_letters() {
        let log = Arc::new(Mutex::new(Vec::new()));
        run_one(context(Arc::new(FailHandler), 5), delivery(5, &log)).await;
        assert_eq!(*log.lock(), vec!["nack:false"]);
    }

    #[tokio::test]
    async fn test_stop_signal_ends_loop() {
        let (_tx, rx) = mpsc::channel::<Delivery>(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(worker_loop(context(Arc::new(OkHandler), 5), 0, rx, stop_rx));
        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_channel_ends_loop() {
        let (tx, rx) = mpsc::channel::<Delivery>(1);
        let (_stop_tx, stop_rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(
            Duration::from_secs(1),
            worker_loop(context(Arc::new(OkHandler), 5), 0, rx, stop_rx),
        )
        .await
        .expect("worker did not stop");
    }
}
