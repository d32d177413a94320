//! Redis pub/sub transport.
//!
//! Envelopes travel as JSON on per-kind channels plus the broadcast
//! channel. A subscriber task pulls messages and feeds them into the
//! manager's inbound queue; publishing goes through a multiplexed
//! connection shared by all callers.

use futures_util::StreamExt;
use redis::AsyncCommands;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use async_trait::async_trait;

use super::transport::{CommError, Transport, TransportFrame};

pub struct RedisPubSubTransport {
    name: &'static str,
    client: redis::Client,
    channels: Vec<String>,
    patterns: Vec<String>,
    publisher: RwLock<Option<redis::aio::MultiplexedConnection>>,
    shutdown: watch::Sender<bool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl RedisPubSubTransport {
    /// Per-kind channel subscriber (the `pubsub` protocol).
    pub fn new(url: &str, channels: Vec<String>) -> Result<Self, CommError> {
        Self::with_patterns("pubsub", url, channels, Vec::new())
    }

    /// Subscriber for explicit channels plus patterns (used by the
    /// topic-broker protocol for per-target topics).
    pub fn with_patterns(
        name: &'static str,
        url: &str,
        channels: Vec<String>,
        patterns: Vec<String>,
    ) -> Result<Self, CommError> {
        let client =
            redis::Client::open(url).map_err(|e| CommError::ConnectionFailed(e.to_string()))?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            name,
            client,
            channels,
            patterns,
            publisher: RwLock::new(None),
            shutdown,
            reader: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Transport for RedisPubSubTransport {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn start(&self, inbound: mpsc::Sender<TransportFrame>) -> Result<(), CommError> {
        let publisher = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CommError::ConnectionFailed(e.to_string()))?;
        *self.publisher.write().await = Some(publisher);

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| CommError::ConnectionFailed(e.to_string()))?;
        for channel in &self.channels {
            pubsub
                .subscribe(channel)
                .await
                .map_err(|e| CommError::SubscribeFailed(e.to_string()))?;
        }
        for pattern in &self.patterns {
            pubsub
                .psubscribe(pattern)
                .await
                .map_err(|e| CommError::SubscribeFailed(e.to_string()))?;
        }

        let mut shutdown_rx = self.shutdown.subscribe();
        let name = self.name;
        let handle = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    maybe = stream.next() => {
                        let Some(msg) = maybe else {
                            warn!("{name} subscription stream closed");
                            break;
                        };
                        let channel = msg.get_channel_name().to_string();
                        match msg.get_payload::<String>() {
                            Ok(payload) => {
                                if inbound
                                    .send(TransportFrame { channel, payload })
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            Err(e) => warn!("{name} payload decode failed: {e}"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("{name} reader shutting down");
                            break;
                        }
                    }
                }
            }
        });
        *self.reader.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        *self.publisher.write().await = None;
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CommError> {
        let conn = self.publisher.read().await.clone();
        let mut conn = conn.ok_or(CommError::NotStarted)?;
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(|e| CommError::PublishFailed(e.to_string()))
    }
}
