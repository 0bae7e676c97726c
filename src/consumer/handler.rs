//! Message handler seam
//!
//! Workers hand every delivery to a [`MessageHandler`]. The handler decides
//! success or failure; acknowledgment and redelivery policy stay with the
//! worker.

use crate::error::Result;
use async_trait::async_trait;
use tracing::info;

/// Processes a single message payload.
///
/// `Ok(())` acknowledges the message. Any error triggers the redelivery
/// policy: requeue until the redelivery cap, then dead-letter.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn process_message(&self, payload: &[u8]) -> Result<()>;
}

/// Default handler: logs the payload and succeeds.
#[derive(Debug, Default)]
pub struct LogHandler;

#[async_trait]
impl MessageHandler for LogHandler {
    async fn process_message(&self, payload: &[u8]) -> Result<()> {
        let preview = String::from_utf8_lossy(&payload[..payload.len().min(128)]);
        info!(payload_len = payload.len(), %preview, "Processing message");
        Ok(())
    }
}
