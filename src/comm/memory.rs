//! In-process loopback transport.
//!
//! Publish pushes the frame straight into the manager's inbound queue, so
//! sender and receiver share one in-process path and delivery happens
//! within the hub loop.

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

use super::transport::{CommError, Transport, TransportFrame};

#[derive(Default)]
pub struct InMemoryTransport {
    inbound: RwLock<Option<mpsc::Sender<TransportFrame>>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn start(&self, inbound: mpsc::Sender<TransportFrame>) -> Result<(), CommError> {
        *self.inbound.write().await = Some(inbound);
        Ok(())
    }

    async fn stop(&self) {
        *self.inbound.write().await = None;
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CommError> {
        let guard = self.inbound.read().await;
        let tx = guard.as_ref().ok_or(CommError::NotStarted)?;
        tx.send(TransportFrame {
            channel: channel.to_string(),
            payload: payload.to_string(),
        })
        .await
        .map_err(|_| CommError::PublishFailed("inbound queue closed".to_string()))
    }
}
