//! Topic-broker transport.
//!
//! Same broker as the pub/sub transport, with per-target topics layered on
//! top of the per-kind channels: envelopes for a named agent publish to
//! `{topic_prefix}{agent_id}`, and the subscriber covers those topics with
//! a pattern subscription.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::pubsub::RedisPubSubTransport;
use super::transport::{CommError, Transport, TransportFrame};

pub struct TopicBrokerTransport {
    inner: RedisPubSubTransport,
    topic_prefix: String,
}

impl TopicBrokerTransport {
    pub fn new(url: &str, channels: Vec<String>, topic_prefix: &str) -> Result<Self, CommError> {
        let patterns = vec![format!("{topic_prefix}*")];
        Ok(Self {
            inner: RedisPubSubTransport::with_patterns("topic-broker", url, channels, patterns)?,
            topic_prefix: topic_prefix.to_string(),
        })
    }

    /// Broker topic for a named agent.
    pub fn topic_for(&self, agent_id: &str) -> String {
        format!("{}{}", self.topic_prefix, agent_id)
    }
}

#[async_trait]
impl Transport for TopicBrokerTransport {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn start(&self, inbound: mpsc::Sender<TransportFrame>) -> Result<(), CommError> {
        self.inner.start(inbound).await
    }

    async fn stop(&self) {
        self.inner.stop().await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CommError> {
        self.inner.publish(channel, payload).await
    }
}
