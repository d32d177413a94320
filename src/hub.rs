//! Core Hub
//!
//! The orchestrator and the only component that applies policy. It owns the
//! dispatch loop (one envelope at a time, highest priority first), routes
//! by event kind, persists hub state, records assistance experiences into
//! the replay buffer, and runs the periodic maintenance loop: health
//! checks, dependency re-checks, callback sweeps, and master-prompt
//! refresh.
//!
//! Agents never hold the hub directly; they are constructed with the
//! narrow [`HubFacade`] interface.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::HubFacade;
use crate::comm::{topic_handler, CommunicationManager, PriorityQueue};
use crate::config::{ConfigTree, CoreConfig};
use crate::errors::{
    codes, write_json_atomic, ErrorCategory, ErrorHandler, ErrorLevel, ErrorRecord, HandlerKey,
};
use crate::message::{
    Envelope, EventKind, Priority, BROADCAST_TARGET, MASTER_PROMPT_COMMAND,
};
use crate::registry::{AgentManager, AgentRecord, AgentStatus};
use crate::replay::{create_replay_buffer, Experience, ReplayBuffer};

/// Reward assigned when an assistance request is first recorded; rewritten
/// to 1.0 or 0.0 when the correlating response arrives.
const ASSISTANCE_INITIAL_REWARD: f64 = 0.5;

/// Priority for assistance experiences, above the buffer default.
const ASSISTANCE_PRIORITY: f64 = 1.5;

struct HubRunState {
    running: bool,
    started_at: DateTime<Utc>,
    last_prompt_refresh: Option<DateTime<Utc>>,
    updates_since_save: u32,
}

#[derive(Deserialize)]
struct StoredHubState {
    #[serde(default)]
    last_prompt_refresh: Option<DateTime<Utc>>,
}

/// The orchestrator.
pub struct Hub {
    core: CoreConfig,
    master_prompt: String,
    registry: Arc<AgentManager>,
    comm: Arc<CommunicationManager>,
    errors: Arc<ErrorHandler>,
    replay: Mutex<Box<dyn ReplayBuffer>>,
    inbound: Mutex<PriorityQueue>,
    inbound_notify: Notify,
    state: RwLock<HubRunState>,
    state_path: PathBuf,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    /// Build the hub and its subsystems from config. Restores prior agent
    /// and hub state from `core.data_dir`.
    pub fn new(cfg: &ConfigTree) -> Result<Arc<Self>> {
        let core = cfg.core();
        let data_dir = core.data_dir.clone();
        std::fs::create_dir_all(&data_dir)?;

        let errors = Arc::new(ErrorHandler::new(
            core.max_errors,
            Some(data_dir.join("errors.json")),
        ));
        let registry = Arc::new(AgentManager::new(
            cfg.agents(),
            Some(data_dir.join("agents.json")),
        ));
        let comm = Arc::new(CommunicationManager::new(
            cfg.communication(),
            Arc::clone(&errors),
        )?);
        let replay = create_replay_buffer(&cfg.replay_buffer())?;

        let state_path = data_dir.join("hub_state.json");
        let last_prompt_refresh = std::fs::read_to_string(&state_path)
            .ok()
            .and_then(|raw| serde_json::from_str::<StoredHubState>(&raw).ok())
            .and_then(|s| s.last_prompt_refresh);

        let (shutdown, _) = watch::channel(false);
        let hub = Arc::new(Self {
            master_prompt: cfg.master_prompt(),
            core,
            registry,
            comm: Arc::clone(&comm),
            errors: Arc::clone(&errors),
            replay: Mutex::new(replay),
            inbound: Mutex::new(PriorityQueue::default()),
            inbound_notify: Notify::new(),
            state: RwLock::new(HubRunState {
                running: false,
                started_at: Utc::now(),
                last_prompt_refresh,
                updates_since_save: 0,
            }),
            state_path,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        });

        // Canonical communication handler: a COMMUNICATION_FAILURE pauses
        // briefly, then restarts the transport. The failed envelope is not
        // retried.
        let comm_for_restart = Arc::clone(&comm);
        errors.register_handler(
            HandlerKey::Category(ErrorCategory::Communication),
            Arc::new(move |record| {
                if record.code != codes::COMMUNICATION_FAILURE {
                    return Ok(());
                }
                let comm = Arc::clone(&comm_for_restart);
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        if let Err(e) = comm.restart().await {
                            warn!("transport restart failed: {e:#}");
                        }
                    });
                }
                Ok(())
            }),
        );

        Ok(hub)
    }

    // ============ Lifecycle ============

    /// Bring the transport up, register the hub's inbound topic, spawn the
    /// dispatch and maintenance loops, and push the master prompt.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.comm.start().await?;

        let hub = Arc::clone(self);
        self.comm
            .register_topic_handler(
                &self.core.name,
                topic_handler(move |env| {
                    let hub = Arc::clone(&hub);
                    async move {
                        hub.submit(env).await;
                    }
                }),
            )
            .await;

        {
            let mut state = self.state.write().await;
            state.running = true;
            state.started_at = Utc::now();
        }

        // Dispatch loop.
        let hub = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        let dispatch = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = hub.inbound_notify.notified() => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
                loop {
                    let next = hub.inbound.lock().await.pop();
                    match next {
                        Some(env) => hub.dispatch(env).await,
                        None => break,
                    }
                }
            }
        });

        // Maintenance loop.
        let hub = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        let tick = Duration::from_secs_f64(self.core.tick_interval.max(0.01));
        let maintenance = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => hub.maintenance_tick().await,
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        self.tasks.lock().await.extend([dispatch, maintenance]);

        self.refresh_master_prompt(true).await;
        self.force_save_state().await;
        info!(name = %self.core.name, version = %self.core.version, "hub started");
        Ok(())
    }

    /// Flush state, stop the communication manager, close the error log.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().await;
            state.running = false;
        }
        let _ = self.shutdown.send(true);
        self.force_save_state().await;
        self.registry.force_save().await;
        self.comm.stop().await;
        self.errors.close();
        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }
        info!("hub stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.state.read().await.running
    }

    // ============ Agent-facing pass-throughs ============

    /// Register an agent. A successful registration immediately receives
    /// the current master prompt.
    pub async fn register_agent(&self, record: AgentRecord) -> bool {
        let agent_id = record.agent_id.clone();
        if !self.registry.register(record).await {
            return false;
        }
        self.send_prompt_to(&agent_id).await;
        self.force_save_state().await;
        true
    }

    pub async fn deregister_agent(&self, agent_id: &str) -> bool {
        let removed = self.registry.deregister(agent_id).await;
        if removed {
            self.force_save_state().await;
        }
        removed
    }

    /// Build and enqueue an envelope. This is the one send signature; the
    /// envelope enters the hub's inbound queue like any transport arrival.
    pub async fn send_message(
        &self,
        source: &str,
        target: &str,
        kind: EventKind,
        payload: Map<String, Value>,
        priority: Option<Priority>,
        ttl_seconds: Option<f64>,
    ) -> String {
        let mut env = Envelope::new(source, target, kind, payload);
        if let Some(p) = priority {
            env.priority = p;
        }
        env.ttl_seconds = ttl_seconds;
        let message_id = env.message_id.clone();
        self.submit(env).await;
        message_id
    }

    /// One copy per registered agent, target rewritten per recipient.
    pub async fn broadcast_message(&self, env: Envelope) {
        for agent_id in self.registry.agent_ids().await {
            if agent_id == env.source_agent_id {
                continue;
            }
            let mut copy = env.clone();
            copy.target_agent_id = agent_id;
            copy.metadata.insert(
                "original_message_id".into(),
                Value::String(env.message_id.clone()),
            );
            self.comm.send(copy).await;
        }
    }

    /// Queue an inbound envelope for dispatch.
    pub async fn submit(&self, env: Envelope) {
        self.inbound.lock().await.push(env);
        self.inbound_notify.notify_one();
    }

    // ============ Dispatch ============

    async fn dispatch(&self, env: Envelope) {
        if env.is_expired() {
            warn!(
                message_id = %env.message_id,
                kind = %env.event_kind.as_str(),
                "dropping expired envelope"
            );
            return;
        }

        debug!(
            message_id = %env.message_id,
            kind = %env.event_kind.as_str(),
            source = %env.source_agent_id,
            target = %env.target_agent_id,
            "dispatching"
        );

        match env.event_kind {
            EventKind::Command | EventKind::Query => self.dispatch_directed(env).await,
            EventKind::Event => self.dispatch_event(env).await,
            EventKind::Response => self.dispatch_response(env).await,
            EventKind::Error => self.dispatch_error(env).await,
            EventKind::StatusUpdate => self.dispatch_status_update(env).await,
            EventKind::AssistanceRequest => self.dispatch_assistance(env).await,
        }

        let save_now = {
            let mut state = self.state.write().await;
            state.updates_since_save += 1;
            state.updates_since_save >= self.core.state_save_every
        };
        if save_now {
            self.force_save_state().await;
        }
    }

    /// COMMAND / QUERY: forward to a known target, otherwise answer the
    /// source with RESOURCE_NOT_FOUND. Nothing is delivered to the unknown
    /// target.
    async fn dispatch_directed(&self, env: Envelope) {
        if env.target_agent_id == BROADCAST_TARGET {
            self.broadcast_message(env).await;
            return;
        }
        if self.registry.get(&env.target_agent_id).await.is_none() {
            self.errors.handle(
                ErrorRecord::new(codes::RESOURCE_NOT_FOUND, "message target is not registered")
                    .with_level(ErrorLevel::Warning)
                    .with_source(&self.core.name)
                    .with_detail("target_agent_id", json!(env.target_agent_id))
                    .with_detail("message_id", json!(env.message_id)),
            );
            let reply = Envelope::error_reply(
                &env,
                &self.core.name,
                codes::RESOURCE_NOT_FOUND,
                &format!("agent '{}' is not registered", env.target_agent_id),
                None,
            );
            self.comm.send(reply).await;
            return;
        }
        self.comm.send(env).await;
    }

    /// EVENT: one copy to each agent subscribed to the topic.
    async fn dispatch_event(&self, env: Envelope) {
        let topic = env.topic();
        let subscribers = self.registry.by_subscription(&topic).await;
        if subscribers.is_empty() {
            debug!(topic = %topic, "event has no subscribers");
            return;
        }
        for subscriber in subscribers {
            if subscriber.agent_id == env.source_agent_id {
                continue;
            }
            let mut copy = env.clone();
            copy.target_agent_id = subscriber.agent_id;
            copy.metadata.insert(
                "original_message_id".into(),
                Value::String(env.message_id.clone()),
            );
            self.comm.send(copy).await;
        }
    }

    /// RESPONSE: forward, and close out a recorded assistance round-trip
    /// when the correlation matches one.
    async fn dispatch_response(&self, env: Envelope) {
        if let Some(correlation) = env.in_reply_to().map(str::to_string) {
            self.record_assistance_response(&correlation, &env).await;
        }
        self.comm.send(env).await;
    }

    /// ERROR: feed the error subsystem, then forward to the named target.
    async fn dispatch_error(&self, env: Envelope) {
        let code = env.payload_str("error_code").unwrap_or(codes::UNKNOWN_ERROR);
        let message = env
            .payload_str("error_message")
            .unwrap_or("unspecified remote error");
        let mut record = ErrorRecord::new(code, message).with_source(&env.source_agent_id);
        if let Some(details) = env.payload.get("details").and_then(Value::as_object) {
            record.details = details.clone();
        }
        if let Some(level) = env
            .payload
            .get("level")
            .cloned()
            .and_then(|v| serde_json::from_value::<ErrorLevel>(v).ok())
        {
            record.level = level;
        }
        if let Some(category) = env
            .payload
            .get("category")
            .cloned()
            .and_then(|v| serde_json::from_value::<ErrorCategory>(v).ok())
        {
            record.category = category;
        }
        self.errors.handle(record);
        self.comm.send(env).await;
    }

    /// STATUS_UPDATE: apply to the source agent's record; not forwarded.
    async fn dispatch_status_update(&self, env: Envelope) {
        let Some(status) = env.payload_str("status").and_then(AgentStatus::parse) else {
            self.errors.handle(
                ErrorRecord::new(codes::INVALID_MESSAGE, "status update with unknown status")
                    .with_category(ErrorCategory::Validation)
                    .with_level(ErrorLevel::Warning)
                    .with_source(&env.source_agent_id)
                    .with_detail("payload", Value::Object(env.payload.clone())),
            );
            return;
        };
        let metrics = env
            .payload
            .get("metrics")
            .and_then(Value::as_object)
            .cloned();
        if !self
            .registry
            .update_status(&env.source_agent_id, status, metrics)
            .await
        {
            debug!(agent_id = %env.source_agent_id, "status update for unknown agent");
        }
    }

    /// ASSISTANCE_REQUEST: record an experience, then route to the first
    /// ACTIVE provider of the requested capability. No provider (or no
    /// ACTIVE agent at all for capability-less requests) answers the
    /// source with RESOURCE_UNAVAILABLE.
    async fn dispatch_assistance(&self, env: Envelope) {
        self.record_assistance_request(&env).await;

        let targets: Vec<String> = match env.payload_str("capability") {
            Some(capability) => self
                .registry
                .active_provider(capability)
                .await
                .map(|p| vec![p.agent_id])
                .unwrap_or_default(),
            None => self
                .registry
                .by_status(AgentStatus::Active)
                .await
                .into_iter()
                .map(|a| a.agent_id)
                .filter(|id| *id != env.source_agent_id)
                .collect(),
        };

        if targets.is_empty() {
            self.errors.handle(
                ErrorRecord::new(codes::RESOURCE_UNAVAILABLE, "no active provider for assistance")
                    .with_level(ErrorLevel::Warning)
                    .with_source(&self.core.name)
                    .with_detail("capability", json!(env.payload_str("capability")))
                    .with_detail("message_id", json!(env.message_id)),
            );
            let reply = Envelope::error_reply(
                &env,
                &self.core.name,
                codes::RESOURCE_UNAVAILABLE,
                "no active provider for the requested capability",
                None,
            );
            self.comm.send(reply).await;
            return;
        }

        for target in targets {
            let mut copy = env.clone();
            copy.target_agent_id = target;
            copy.metadata.insert(
                "original_message_id".into(),
                Value::String(env.message_id.clone()),
            );
            self.comm.send(copy).await;
        }
    }

    // ============ Experience recording ============

    async fn record_assistance_request(&self, env: &Envelope) {
        let mut state = Map::new();
        state.insert("kind".into(), Value::String("assistance_request".into()));

        let exp = Experience::new(&env.source_agent_id)
            .with_id(&env.message_id)
            .with_state(state)
            .with_action(env.payload.clone())
            .with_reward(ASSISTANCE_INITIAL_REWARD)
            .with_priority(ASSISTANCE_PRIORITY);

        self.replay.lock().await.add(exp);
        self.force_save_state().await;
    }

    /// Rewrite the assistance experience keyed by `correlation` with the
    /// final reward: 1.0 for success, 0.0 for failure.
    async fn record_assistance_response(&self, correlation: &str, response: &Envelope) {
        let mut replay = self.replay.lock().await;
        let Some(mut exp) = replay.get(correlation) else {
            return;
        };
        let success = response.payload_str("status") == Some("success");
        exp.reward = Some(if success { 1.0 } else { 0.0 });
        exp.result = response.payload.clone();
        replay.update(exp);
        drop(replay);
        self.force_save_state().await;
    }

    // ============ Periodic work ============

    async fn maintenance_tick(&self) {
        let _ = self.registry.check_health().await;

        for (agent_id, missing) in self.registry.check_dependencies().await {
            warn!(agent_id = %agent_id, missing = ?missing, "unmet capability dependencies");
        }

        self.comm.clean_expired_callbacks(None).await;
        self.refresh_master_prompt(false).await;
    }

    /// Broadcast the configured master prompt when the refresh interval has
    /// elapsed (or unconditionally with `force`).
    async fn refresh_master_prompt(&self, force: bool) {
        if self.master_prompt.is_empty() {
            return;
        }
        let due = {
            let state = self.state.read().await;
            match state.last_prompt_refresh {
                None => true,
                Some(last) => {
                    let elapsed =
                        Utc::now().signed_duration_since(last).num_milliseconds() as f64 / 1000.0;
                    elapsed > self.core.master_prompt_refresh_interval
                }
            }
        };
        if !force && !due {
            return;
        }

        for agent_id in self.registry.agent_ids().await {
            self.send_prompt_to(&agent_id).await;
        }
        {
            let mut state = self.state.write().await;
            state.last_prompt_refresh = Some(Utc::now());
        }
        self.force_save_state().await;
    }

    async fn send_prompt_to(&self, agent_id: &str) {
        if self.master_prompt.is_empty() {
            return;
        }
        let env = Envelope::command(
            &self.core.name,
            agent_id,
            MASTER_PROMPT_COMMAND,
            json!({ "prompt": self.master_prompt }),
        );
        self.comm.send(env).await;
    }

    // ============ State and status ============

    /// Write hub state to `core.data_dir/hub_state.json`.
    pub async fn force_save_state(&self) {
        let (started_at, last_prompt_refresh) = {
            let mut state = self.state.write().await;
            state.updates_since_save = 0;
            (state.started_at, state.last_prompt_refresh)
        };
        let doc = json!({
            "name": self.core.name,
            "version": self.core.version,
            "started_at": started_at,
            "last_prompt_refresh": last_prompt_refresh,
            "agents": self.registry.agent_ids().await,
            "saved_at": Utc::now(),
        });
        if let Err(e) = write_json_atomic(&self.state_path, &doc) {
            self.errors.handle(
                ErrorRecord::new(codes::PERSISTENCE_FAILURE, "failed to save hub state")
                    .with_source(&self.core.name)
                    .with_detail("path", json!(self.state_path.display().to_string()))
                    .with_detail("cause", json!(e.to_string())),
            );
        }
    }

    /// Observable status view.
    pub async fn status(&self) -> Value {
        let state = self.state.read().await;
        let uptime = Utc::now()
            .signed_duration_since(state.started_at)
            .num_seconds();
        let replay_stats = self.replay.lock().await.stats();
        json!({
            "core": {
                "name": self.core.name,
                "version": self.core.version,
                "uptime": uptime,
                "running": state.running,
            },
            "agents": { "by_status": self.registry.count_by_status().await },
            "errors": { "summary": self.errors.summary() },
            "replay_buffer": {
                "size": replay_stats.size,
                "capacity": replay_stats.capacity,
            },
        })
    }

    pub fn registry(&self) -> &Arc<AgentManager> {
        &self.registry
    }

    pub fn comm(&self) -> &Arc<CommunicationManager> {
        &self.comm
    }

    pub fn errors(&self) -> &Arc<ErrorHandler> {
        &self.errors
    }

    /// Current replay buffer size, for the status surface and tests.
    pub async fn replay_len(&self) -> usize {
        self.replay.lock().await.len()
    }
}

#[async_trait]
impl HubFacade for Hub {
    async fn send(&self, env: Envelope) -> Result<()> {
        self.submit(env).await;
        Ok(())
    }

    async fn register(&self, record: AgentRecord) -> Result<bool> {
        Ok(self.register_agent(record).await)
    }

    async fn update_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        metrics: Option<Map<String, Value>>,
    ) -> Result<bool> {
        Ok(self.registry.update_status(agent_id, status, metrics).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> ConfigTree {
        ConfigTree::from_value(json!({
            "core": { "data_dir": dir.join("data").to_str().unwrap() },
            "replay_buffer": { "seed": 7 },
        }))
    }

    #[tokio::test]
    async fn test_status_view_shape() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Hub::new(&test_config(dir.path())).unwrap();

        let status = hub.status().await;
        assert_eq!(status["core"]["name"], "corehub");
        assert_eq!(status["core"]["running"], false);
        assert_eq!(status["replay_buffer"]["size"], 0);
        assert!(status["agents"]["by_status"].is_object());
    }

    #[tokio::test]
    async fn test_expired_envelope_is_dropped_before_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Hub::new(&test_config(dir.path())).unwrap();
        hub.registry
            .register(AgentRecord::new("a1", "worker"))
            .await;

        let mut env = Envelope::command("x", "a1", "noop", json!({}));
        env.ttl_seconds = Some(0.01);
        env.created_at = Utc::now() - chrono::Duration::seconds(5);
        hub.dispatch(env).await;

        // Nothing was queued for delivery.
        assert_eq!(hub.comm.pending_outbound().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_target_yields_error_to_source() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Hub::new(&test_config(dir.path())).unwrap();

        let env = Envelope::command("a1", "ghost", "noop", json!({}));
        hub.dispatch(env).await;

        // Exactly one envelope queued: the error reply to the source.
        assert_eq!(hub.comm.pending_outbound().await, 1);
        let errors = hub.errors.query(&crate::errors::ErrorFilter {
            code: Some(codes::RESOURCE_NOT_FOUND.to_string()),
            ..Default::default()
        });
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn test_assistance_request_records_experience() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Hub::new(&test_config(dir.path())).unwrap();
        hub.registry
            .register(
                AgentRecord::new("v1", "worker")
                    .with_capability("V")
                    .with_status(AgentStatus::Active),
            )
            .await;

        let request = Envelope::assistance_request("a1", "corehub", Some("V"), json!({}), "high");
        let request_id = request.message_id.clone();
        hub.dispatch(request).await;

        assert_eq!(hub.replay_len().await, 1);
        let mut replay = hub.replay.lock().await;
        let exp = replay.get(&request_id).unwrap();
        assert_eq!(exp.reward, Some(ASSISTANCE_INITIAL_REWARD));
        assert_eq!(exp.priority(), Some(ASSISTANCE_PRIORITY));
        assert_eq!(exp.agent_id, "a1");
    }

    #[tokio::test]
    async fn test_response_rewrites_assistance_reward() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Hub::new(&test_config(dir.path())).unwrap();
        hub.registry
            .register(
                AgentRecord::new("v1", "worker")
                    .with_capability("V")
                    .with_status(AgentStatus::Active),
            )
            .await;

        let request = Envelope::assistance_request("a1", "corehub", Some("V"), json!({}), "normal");
        let request_id = request.message_id.clone();
        hub.dispatch(request.clone()).await;

        let response = Envelope::response_to(&request, "v1", true, json!({"handled": true}));
        hub.dispatch(response).await;

        let mut replay = hub.replay.lock().await;
        assert_eq!(replay.get(&request_id).unwrap().reward, Some(1.0));

        drop(replay);
        let request2 = Envelope::assistance_request("a1", "corehub", Some("V"), json!({}), "normal");
        let request2_id = request2.message_id.clone();
        hub.dispatch(request2.clone()).await;
        let failure = Envelope::response_to(&request2, "v1", false, json!({}));
        hub.dispatch(failure).await;

        let mut replay = hub.replay.lock().await;
        assert_eq!(replay.get(&request2_id).unwrap().reward, Some(0.0));
    }

    #[tokio::test]
    async fn test_status_update_applies_to_registry() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Hub::new(&test_config(dir.path())).unwrap();
        hub.registry
            .register(AgentRecord::new("a1", "worker"))
            .await;

        let env = Envelope::status_update("a1", "corehub", "ACTIVE", Some(json!({"errors": 0})));
        hub.dispatch(env).await;

        assert_eq!(
            hub.registry.get("a1").await.unwrap().status,
            AgentStatus::Active
        );
        // Not forwarded anywhere.
        assert_eq!(hub.comm.pending_outbound().await, 0);
    }

    #[tokio::test]
    async fn test_hub_state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        {
            let hub = Hub::new(&cfg).unwrap();
            {
                let mut state = hub.state.write().await;
                state.last_prompt_refresh = Some(Utc::now());
            }
            hub.force_save_state().await;
        }

        let hub = Hub::new(&cfg).unwrap();
        assert!(hub.state.read().await.last_prompt_refresh.is_some());
    }
}
