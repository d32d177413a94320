//! Boundary-only transport for the `http` protocol.
//!
//! Envelopes are not auto-routed: outbound frames accumulate in an egress
//! buffer for an injected HTTP surface to drain, and inbound envelopes are
//! handed to the manager directly by that surface. The transport itself
//! never delivers anything.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::transport::{CommError, Transport, TransportFrame};

pub struct HttpBoundaryTransport {
    egress: Mutex<VecDeque<TransportFrame>>,
    max_egress: usize,
}

impl HttpBoundaryTransport {
    pub fn new(max_egress: usize) -> Self {
        Self {
            egress: Mutex::new(VecDeque::new()),
            max_egress: max_egress.max(1),
        }
    }

    /// Take all buffered outbound frames. Called by the HTTP surface.
    pub async fn drain_egress(&self) -> Vec<TransportFrame> {
        self.egress.lock().await.drain(..).collect()
    }
}

impl Default for HttpBoundaryTransport {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Transport for HttpBoundaryTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn start(&self, _inbound: tokio::sync::mpsc::Sender<TransportFrame>) -> Result<(), CommError> {
        Ok(())
    }

    async fn stop(&self) {
        self.egress.lock().await.clear();
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CommError> {
        let mut egress = self.egress.lock().await;
        if egress.len() >= self.max_egress {
            egress.pop_front();
        }
        egress.push_back(TransportFrame {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }
}
