//! Transport abstraction.
//!
//! A transport moves opaque string frames between named channels. The
//! communication manager serializes envelopes into frames on the way out
//! and parses frames handed back through the inbound mpsc on the way in.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Transport selection from `communication.protocol`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Memory,
    PubSub,
    TopicBroker,
    Http,
}

impl Protocol {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "memory" => Ok(Protocol::Memory),
            "pubsub" => Ok(Protocol::PubSub),
            "topic-broker" => Ok(Protocol::TopicBroker),
            "http" => Ok(Protocol::Http),
            other => anyhow::bail!("unknown communication.protocol '{other}'"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Memory => "memory",
            Protocol::PubSub => "pubsub",
            Protocol::TopicBroker => "topic-broker",
            Protocol::Http => "http",
        }
    }
}

/// One frame received from a transport.
#[derive(Debug, Clone)]
pub struct TransportFrame {
    pub channel: String,
    pub payload: String,
}

/// Error type for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("transport not started")]
    NotStarted,
}

/// A pluggable message transport.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Connect and begin feeding received frames into `inbound`.
    async fn start(&self, inbound: mpsc::Sender<TransportFrame>) -> Result<(), CommError>;

    async fn stop(&self);

    /// Publish one frame to a channel.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CommError>;
}
