//! Communication Manager
//!
//! Owns the transport, the outbound priority queues, the topic handler
//! table, and the per-message callback table. The hub hands envelopes to
//! [`CommunicationManager::send`]; a background drain task serializes them
//! and publishes to the transport. Frames arriving from the transport are
//! parsed and routed to any message-id callback and to the topic handlers
//! registered for the envelope's target (and, for events, its topic).
//!
//! A broker transport that cannot connect at startup falls back to the
//! in-process transport with a single warning.

pub mod http;
pub mod memory;
pub mod pubsub;
pub mod topic;
pub mod transport;

pub use http::HttpBoundaryTransport;
pub use memory::InMemoryTransport;
pub use pubsub::RedisPubSubTransport;
pub use topic::TopicBrokerTransport;
pub use transport::{CommError, Protocol, Transport, TransportFrame};

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use serde_json::json;
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::CommConfig;
use crate::errors::{codes, ErrorHandler, ErrorRecord};
use crate::message::{Envelope, EventKind, BROADCAST_TARGET};

/// Handler for envelopes arriving on a topic.
pub type TopicHandler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, ()> + Send + Sync>;

/// One-shot or repeated callback bound to a specific message id.
pub type MessageCallback = Arc<dyn Fn(Envelope) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`TopicHandler`].
pub fn topic_handler<F, Fut>(f: F) -> TopicHandler
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |env| Box::pin(f(env)))
}

/// Wrap an async closure as a [`MessageCallback`].
pub fn message_callback<F, Fut>(f: F) -> MessageCallback
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |env| Box::pin(f(env)))
}

struct CallbackEntry {
    handler: MessageCallback,
    one_time: bool,
    registered_at: Instant,
}

/// Outbound queue: one FIFO per priority ordinal.
#[derive(Default)]
pub(crate) struct PriorityQueue {
    buckets: [VecDeque<Envelope>; 4],
}

impl PriorityQueue {
    pub fn push(&mut self, env: Envelope) {
        self.buckets[env.priority.ordinal()].push_back(env);
    }

    pub fn push_front(&mut self, env: Envelope) {
        self.buckets[env.priority.ordinal()].push_front(env);
    }

    /// Highest-priority envelope first, FIFO within a priority.
    pub fn pop(&mut self) -> Option<Envelope> {
        self.buckets.iter_mut().find_map(|b| b.pop_front())
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }
}

/// Transport-agnostic message plumbing for the hub.
pub struct CommunicationManager {
    cfg: CommConfig,
    protocol: Protocol,
    transport: RwLock<Arc<dyn Transport>>,
    outbound: Mutex<PriorityQueue>,
    outbound_notify: Notify,
    topic_handlers: RwLock<HashMap<String, Vec<TopicHandler>>>,
    callbacks: Mutex<HashMap<String, CallbackEntry>>,
    errors: Arc<ErrorHandler>,
    connected: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CommunicationManager {
    pub fn new(cfg: CommConfig, errors: Arc<ErrorHandler>) -> anyhow::Result<Self> {
        let protocol = Protocol::parse(&cfg.protocol)?;
        let (shutdown, _) = watch::channel(false);
        let manager = Self {
            transport: RwLock::new(Arc::new(InMemoryTransport::new())),
            outbound: Mutex::new(PriorityQueue::default()),
            outbound_notify: Notify::new(),
            topic_handlers: RwLock::new(HashMap::new()),
            callbacks: Mutex::new(HashMap::new()),
            errors,
            connected: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            protocol,
            cfg,
        };
        Ok(manager)
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn make_transport(&self) -> Arc<dyn Transport> {
        let mut channels: Vec<String> = self.cfg.channels.values().cloned().collect();
        channels.push(self.cfg.broadcast_channel.clone());
        channels.sort();
        channels.dedup();

        match self.protocol {
            Protocol::Memory => Arc::new(InMemoryTransport::new()),
            Protocol::Http => Arc::new(HttpBoundaryTransport::default()),
            Protocol::PubSub => match RedisPubSubTransport::new(&self.cfg.redis_url, channels) {
                Ok(t) => Arc::new(t),
                Err(e) => {
                    warn!("pubsub transport unavailable ({e}), falling back to memory");
                    Arc::new(InMemoryTransport::new())
                }
            },
            Protocol::TopicBroker => {
                match TopicBrokerTransport::new(&self.cfg.redis_url, channels, &self.cfg.topic_prefix)
                {
                    Ok(t) => Arc::new(t),
                    Err(e) => {
                        warn!("topic-broker transport unavailable ({e}), falling back to memory");
                        Arc::new(InMemoryTransport::new())
                    }
                }
            }
        }
    }

    /// Bring the transport up and spawn the inbound router. Falls back to
    /// the in-process transport when a broker cannot be reached.
    pub async fn connect(self: &Arc<Self>) -> anyhow::Result<()> {
        let (inbound_tx, inbound_rx) = mpsc::channel::<TransportFrame>(1024);

        let transport = self.make_transport();
        let transport = match transport.start(inbound_tx.clone()).await {
            Ok(()) => transport,
            Err(e) => {
                warn!(
                    "{} transport failed to start ({e}), falling back to memory",
                    transport.name()
                );
                let fallback: Arc<dyn Transport> = Arc::new(InMemoryTransport::new());
                fallback
                    .start(inbound_tx)
                    .await
                    .map_err(|e| anyhow::anyhow!("memory transport failed to start: {e}"))?;
                fallback
            }
        };
        debug!("communication transport up: {}", transport.name());
        *self.transport.write().await = transport;
        self.connected.store(true, Ordering::SeqCst);

        let manager = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut inbound_rx = inbound_rx;
            loop {
                tokio::select! {
                    maybe = inbound_rx.recv() => {
                        let Some(frame) = maybe else { break };
                        manager.handle_frame(frame).await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        self.tasks.lock().await.push(handle);
        Ok(())
    }

    /// Connect and start the background drain task.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        self.connect().await?;

        let manager = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        let quantum = Duration::from_millis(self.cfg.drain_quantum_ms.max(1));
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.outbound_notify.notified() => {}
                    _ = tokio::time::sleep(quantum) => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
                manager.drain_once().await;
            }
        });
        self.tasks.lock().await.push(handle);
        Ok(())
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.transport.read().await.stop().await;
        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        debug!("communication manager stopped");
    }

    /// Tear the transport down and bring it back up. Used by the
    /// communication-failure handler; queued envelopes are retained, but
    /// the envelope that failed is not retried.
    pub async fn restart(self: &Arc<Self>) -> anyhow::Result<()> {
        self.transport.read().await.stop().await;
        self.connected.store(false, Ordering::SeqCst);
        self.connect().await
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    // ============ Outbound path ============

    /// Queue an envelope for delivery.
    pub async fn send(&self, env: Envelope) {
        self.outbound.lock().await.push(env);
        self.outbound_notify.notify_one();
    }

    pub async fn pending_outbound(&self) -> usize {
        self.outbound.lock().await.len()
    }

    /// Drain the current backlog in priority order, bounded by the drain
    /// quantum; anything past the deadline is requeued in order. Returns
    /// the number of envelopes published.
    pub async fn drain_once(&self) -> usize {
        let mut batch = Vec::new();
        {
            let mut outbound = self.outbound.lock().await;
            while let Some(env) = outbound.pop() {
                batch.push(env);
            }
        }
        if batch.is_empty() {
            return 0;
        }

        let deadline = Instant::now() + Duration::from_millis(self.cfg.drain_quantum_ms.max(1));
        let mut published = 0;
        let mut remainder = Vec::new();

        for env in batch {
            if Instant::now() > deadline && published > 0 {
                remainder.push(env);
                continue;
            }
            self.publish(env).await;
            published += 1;
        }

        if !remainder.is_empty() {
            let mut outbound = self.outbound.lock().await;
            for env in remainder.into_iter().rev() {
                outbound.push_front(env);
            }
            self.outbound_notify.notify_one();
        }
        published
    }

    async fn publish(&self, env: Envelope) {
        let wire = match env.to_wire() {
            Ok(wire) => wire,
            Err(e) => {
                self.errors.handle(
                    ErrorRecord::new(codes::COMMUNICATION_FAILURE, "envelope serialization failed")
                        .with_source("communication_manager")
                        .with_detail("message_id", json!(env.message_id))
                        .with_detail("cause", json!(e.to_string())),
                );
                return;
            }
        };

        let channel = self.channel_for(&env);
        let transport = self.transport.read().await.clone();
        if let Err(e) = transport.publish(&channel, &wire).await {
            self.errors.handle(
                ErrorRecord::new(codes::COMMUNICATION_FAILURE, "transport publish failed")
                    .with_source("communication_manager")
                    .with_detail("channel", json!(channel))
                    .with_detail("message_id", json!(env.message_id))
                    .with_detail("cause", json!(e.to_string())),
            );
        }
    }

    /// Destination channel for an envelope under the active protocol.
    fn channel_for(&self, env: &Envelope) -> String {
        if env.target_agent_id == BROADCAST_TARGET {
            return self.cfg.broadcast_channel.clone();
        }
        match self.protocol {
            // Loopback routing happens on envelope content; the channel
            // carries the target for observability.
            Protocol::Memory | Protocol::Http => env.target_agent_id.clone(),
            Protocol::PubSub => self.kind_channel(env.event_kind),
            Protocol::TopicBroker => {
                format!("{}{}", self.cfg.topic_prefix, env.target_agent_id)
            }
        }
    }

    fn kind_channel(&self, kind: EventKind) -> String {
        self.cfg
            .channels
            .get(kind.channel_key())
            .cloned()
            .unwrap_or_else(|| self.cfg.broadcast_channel.clone())
    }

    // ============ Inbound path ============

    async fn handle_frame(&self, frame: TransportFrame) {
        match Envelope::from_wire(&frame.payload) {
            Ok(env) => self.route_inbound(env).await,
            Err(e) => {
                self.errors.handle(
                    ErrorRecord::new(codes::COMMUNICATION_FAILURE, "inbound frame parse failed")
                        .with_source("communication_manager")
                        .with_detail("channel", json!(frame.channel))
                        .with_detail("cause", json!(e.to_string())),
                );
            }
        }
    }

    /// Route a received envelope: satisfy any message-id callback, then
    /// invoke topic handlers for the target id and, for events, the topic.
    pub async fn route_inbound(&self, env: Envelope) {
        let callback_key = env
            .in_reply_to()
            .unwrap_or(env.message_id.as_str())
            .to_string();
        let callback = {
            let mut callbacks = self.callbacks.lock().await;
            match callbacks.get(&callback_key) {
                Some(entry) if entry.one_time => {
                    callbacks.remove(&callback_key).map(|e| e.handler)
                }
                Some(entry) => Some(Arc::clone(&entry.handler)),
                None => None,
            }
        };
        if let Some(callback) = callback {
            callback(env.clone()).await;
        }

        let mut topics = vec![env.target_agent_id.clone()];
        if env.event_kind == EventKind::Event {
            topics.push(env.topic());
        }

        let handlers: Vec<TopicHandler> = {
            let table = self.topic_handlers.read().await;
            topics
                .iter()
                .filter_map(|t| table.get(t))
                .flatten()
                .cloned()
                .collect()
        };
        for handler in handlers {
            handler(env.clone()).await;
        }
    }

    // ============ Handler and callback tables ============

    pub async fn register_topic_handler(&self, topic: &str, handler: TopicHandler) {
        self.topic_handlers
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(handler);
    }

    /// Register a callback fired when an envelope referencing `message_id`
    /// arrives. One-time callbacks are removed when fired.
    pub async fn register_message_callback(
        &self,
        message_id: &str,
        callback: MessageCallback,
        one_time: bool,
    ) {
        self.callbacks.lock().await.insert(
            message_id.to_string(),
            CallbackEntry {
                handler: callback,
                one_time,
                registered_at: Instant::now(),
            },
        );
    }

    pub async fn callback_count(&self) -> usize {
        self.callbacks.lock().await.len()
    }

    /// Drop callbacks older than `timeout` (defaults to the configured
    /// callback TTL). Returns how many were removed.
    pub async fn clean_expired_callbacks(&self, timeout: Option<Duration>) -> usize {
        let ttl = timeout.unwrap_or(Duration::from_secs_f64(self.cfg.callback_ttl_secs));
        let mut callbacks = self.callbacks.lock().await;
        let before = callbacks.len();
        callbacks.retain(|_, entry| entry.registered_at.elapsed() < ttl);
        let removed = before - callbacks.len();
        if removed > 0 {
            debug!("expired {removed} message callbacks");
        }
        removed
    }
}
