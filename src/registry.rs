//! Agent Registry
//!
//! Tracks every registered agent with its capabilities, topic subscriptions,
//! and capability dependencies. Reverse indices (capability to providers,
//! topic to subscribers) are maintained on every registration change, so
//! lookups are map reads.
//!
//! Health checks compare each ACTIVE agent's `last_update` against the
//! configured timeout and flip stale agents to UNREACHABLE. State is
//! mirrored to a JSON file on significant writes and restored at startup.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::AgentsConfig;
use crate::errors::write_json_atomic;

/// Agent lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Initializing,
    Active,
    Busy,
    Inactive,
    Error,
    Unreachable,
    Terminated,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Initializing => "INITIALIZING",
            AgentStatus::Active => "ACTIVE",
            AgentStatus::Busy => "BUSY",
            AgentStatus::Inactive => "INACTIVE",
            AgentStatus::Error => "ERROR",
            AgentStatus::Unreachable => "UNREACHABLE",
            AgentStatus::Terminated => "TERMINATED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INITIALIZING" => Some(AgentStatus::Initializing),
            "ACTIVE" => Some(AgentStatus::Active),
            "BUSY" => Some(AgentStatus::Busy),
            "INACTIVE" => Some(AgentStatus::Inactive),
            "ERROR" => Some(AgentStatus::Error),
            "UNREACHABLE" => Some(AgentStatus::Unreachable),
            "TERMINATED" => Some(AgentStatus::Terminated),
            _ => None,
        }
    }

    /// Statuses that trigger an immediate state save.
    fn persists_immediately(&self) -> bool {
        matches!(
            self,
            AgentStatus::Error | AgentStatus::Terminated | AgentStatus::Unreachable
        )
    }
}

/// One registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub subscriptions: BTreeSet<String>,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    pub status: AgentStatus,
    pub registered_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    #[serde(default)]
    pub metrics: Option<Map<String, Value>>,
}

impl AgentRecord {
    pub fn new(agent_id: &str, kind: &str) -> Self {
        let now = Utc::now();
        Self {
            agent_id: agent_id.to_string(),
            kind: kind.to_string(),
            name: agent_id.to_string(),
            description: String::new(),
            capabilities: BTreeSet::new(),
            subscriptions: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            status: AgentStatus::Inactive,
            registered_at: now,
            last_update: now,
            metrics: None,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_capability(mut self, capability: &str) -> Self {
        self.capabilities.insert(capability.to_string());
        self
    }

    pub fn with_subscription(mut self, topic: &str) -> Self {
        self.subscriptions.insert(topic.to_string());
        self
    }

    pub fn with_dependency(mut self, capability: &str) -> Self {
        self.dependencies.insert(capability.to_string());
        self
    }

    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }

    fn error_count(&self) -> u64 {
        self.metrics
            .as_ref()
            .and_then(|m| m.get("errors"))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }
}

/// Result of a health sweep.
#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    pub healthy: Vec<String>,
    pub unhealthy: Vec<String>,
    pub unreachable: Vec<String>,
}

struct RegistryState {
    agents: HashMap<String, AgentRecord>,
    by_capability: HashMap<String, BTreeSet<String>>,
    by_subscription: HashMap<String, BTreeSet<String>>,
    by_dependency: HashMap<String, BTreeSet<String>>,
    last_health_check: Option<Instant>,
    last_report: HealthReport,
    last_save: Instant,
}

impl RegistryState {
    fn index(&mut self, record: &AgentRecord) {
        for cap in &record.capabilities {
            self.by_capability
                .entry(cap.clone())
                .or_default()
                .insert(record.agent_id.clone());
        }
        for topic in &record.subscriptions {
            self.by_subscription
                .entry(topic.clone())
                .or_default()
                .insert(record.agent_id.clone());
        }
        for dep in &record.dependencies {
            self.by_dependency
                .entry(dep.clone())
                .or_default()
                .insert(record.agent_id.clone());
        }
    }

    fn unindex(&mut self, record: &AgentRecord) {
        for (index, keys) in [
            (&mut self.by_capability, &record.capabilities),
            (&mut self.by_subscription, &record.subscriptions),
            (&mut self.by_dependency, &record.dependencies),
        ] {
            for key in keys {
                if let Some(set) = index.get_mut(key) {
                    set.remove(&record.agent_id);
                    if set.is_empty() {
                        index.remove(key);
                    }
                }
            }
        }
    }
}

/// Registry of agents with capability, subscription, and dependency indices.
pub struct AgentManager {
    cfg: AgentsConfig,
    state_path: Option<PathBuf>,
    state: RwLock<RegistryState>,
}

impl AgentManager {
    /// Create a manager, restoring prior state from `state_path` if present.
    pub fn new(cfg: AgentsConfig, state_path: Option<PathBuf>) -> Self {
        let mut state = RegistryState {
            agents: HashMap::new(),
            by_capability: HashMap::new(),
            by_subscription: HashMap::new(),
            by_dependency: HashMap::new(),
            last_health_check: None,
            last_report: HealthReport::default(),
            last_save: Instant::now(),
        };

        if let Some(ref path) = state_path {
            match std::fs::read_to_string(path) {
                Ok(raw) => match serde_json::from_str::<StoredState>(&raw) {
                    Ok(stored) => {
                        info!("restored {} agents from {}", stored.agents.len(), path.display());
                        for record in stored.agents {
                            state.index(&record);
                            state.agents.insert(record.agent_id.clone(), record);
                        }
                    }
                    Err(e) => warn!("ignoring corrupt agent state {}: {e}", path.display()),
                },
                Err(_) => debug!("no agent state at {}", path.display()),
            }
        }

        Self {
            cfg,
            state_path,
            state: RwLock::new(state),
        }
    }

    /// Register an agent. Returns false (and changes nothing) if the id is
    /// already registered.
    pub async fn register(&self, mut record: AgentRecord) -> bool {
        let mut state = self.state.write().await;
        if state.agents.contains_key(&record.agent_id) {
            debug!(agent_id = %record.agent_id, "duplicate registration rejected");
            return false;
        }

        let now = Utc::now();
        record.registered_at = now;
        record.last_update = now;

        state.index(&record);
        info!(agent_id = %record.agent_id, kind = %record.kind, "agent registered");
        state.agents.insert(record.agent_id.clone(), record);
        self.persist(&mut state);
        true
    }

    /// Remove an agent and every index entry referencing it.
    pub async fn deregister(&self, agent_id: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(record) = state.agents.remove(agent_id) else {
            return false;
        };
        state.unindex(&record);
        info!(agent_id, "agent deregistered");
        self.persist(&mut state);
        true
    }

    /// Update an agent's status and optionally its metrics. Persists
    /// immediately for terminal-ish statuses, otherwise at most once per
    /// minute.
    pub async fn update_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        metrics: Option<Map<String, Value>>,
    ) -> bool {
        let mut state = self.state.write().await;
        let Some(record) = state.agents.get_mut(agent_id) else {
            return false;
        };
        record.status = status;
        record.last_update = Utc::now();
        if let Some(m) = metrics {
            record.metrics = Some(m);
        }

        if status.persists_immediately() || state.last_save.elapsed().as_secs() >= 60 {
            self.persist(&mut state);
        }
        true
    }

    // ============ Lookups ============

    pub async fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        self.state.read().await.agents.get(agent_id).cloned()
    }

    pub async fn all(&self) -> Vec<AgentRecord> {
        self.state.read().await.agents.values().cloned().collect()
    }

    pub async fn agent_ids(&self) -> Vec<String> {
        self.state.read().await.agents.keys().cloned().collect()
    }

    /// All providers of a capability, live or dead. Callers filter by status.
    pub async fn by_capability(&self, capability: &str) -> Vec<AgentRecord> {
        let state = self.state.read().await;
        state
            .by_capability
            .get(capability)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.agents.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn by_status(&self, status: AgentStatus) -> Vec<AgentRecord> {
        self.state
            .read()
            .await
            .agents
            .values()
            .filter(|a| a.status == status)
            .cloned()
            .collect()
    }

    pub async fn by_subscription(&self, topic: &str) -> Vec<AgentRecord> {
        let state = self.state.read().await;
        state
            .by_subscription
            .get(topic)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.agents.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// First ACTIVE provider of a capability, if any.
    pub async fn active_provider(&self, capability: &str) -> Option<AgentRecord> {
        self.by_capability(capability)
            .await
            .into_iter()
            .find(|a| a.status == AgentStatus::Active)
    }

    pub async fn count_by_status(&self) -> HashMap<String, usize> {
        let state = self.state.read().await;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for agent in state.agents.values() {
            *counts.entry(agent.status.as_str().to_string()).or_default() += 1;
        }
        counts
    }

    // ============ Health and dependencies ============

    /// Sweep ACTIVE agents: stale `last_update` flips them to UNREACHABLE,
    /// a nonzero `metrics.errors` marks them unhealthy. Rate-limited by
    /// `health_check_interval`; early calls return the previous report.
    pub async fn check_health(&self) -> HealthReport {
        let mut state = self.state.write().await;
        if let Some(last) = state.last_health_check {
            if last.elapsed().as_secs_f64() < self.cfg.health_check_interval {
                return state.last_report.clone();
            }
        }

        let now = Utc::now();
        let timeout = self.cfg.agent_timeout;
        let mut report = HealthReport::default();
        let mut stale: Vec<String> = Vec::new();

        for record in state.agents.values() {
            if record.status != AgentStatus::Active {
                continue;
            }
            let silent_for = now
                .signed_duration_since(record.last_update)
                .num_milliseconds() as f64
                / 1000.0;
            if silent_for > timeout {
                stale.push(record.agent_id.clone());
                report.unreachable.push(record.agent_id.clone());
            } else if record.error_count() > 0 {
                report.unhealthy.push(record.agent_id.clone());
            } else {
                report.healthy.push(record.agent_id.clone());
            }
        }

        for agent_id in &stale {
            if let Some(record) = state.agents.get_mut(agent_id) {
                warn!(agent_id, "agent unreachable, no update within timeout");
                record.status = AgentStatus::Unreachable;
            }
        }
        if !stale.is_empty() {
            self.persist(&mut state);
        }

        state.last_health_check = Some(Instant::now());
        state.last_report = report.clone();
        report
    }

    /// Map of agent id to its unmet dependencies. A dependency is met iff at
    /// least one provider of that capability is currently ACTIVE.
    pub async fn check_dependencies(&self) -> HashMap<String, Vec<String>> {
        let state = self.state.read().await;
        let mut missing: HashMap<String, Vec<String>> = HashMap::new();

        for record in state.agents.values() {
            for dep in &record.dependencies {
                let met = state
                    .by_capability
                    .get(dep)
                    .map(|providers| {
                        providers.iter().any(|id| {
                            state
                                .agents
                                .get(id)
                                .map(|a| a.status == AgentStatus::Active)
                                .unwrap_or(false)
                        })
                    })
                    .unwrap_or(false);
                if !met {
                    missing
                        .entry(record.agent_id.clone())
                        .or_default()
                        .push(dep.clone());
                }
            }
        }
        missing
    }

    /// Write the registry to disk now, regardless of rate limits.
    pub async fn force_save(&self) {
        let mut state = self.state.write().await;
        self.persist(&mut state);
    }

    fn persist(&self, state: &mut RegistryState) {
        let Some(ref path) = self.state_path else {
            return;
        };
        let mut agents: Vec<&AgentRecord> = state.agents.values().collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        let doc = serde_json::json!({
            "saved_at": Utc::now(),
            "agents": agents,
        });
        if let Err(e) = write_json_atomic(path, &doc) {
            warn!("failed to persist agent state to {}: {e:#}", path.display());
        }
        state.last_save = Instant::now();
    }
}

#[derive(Deserialize)]
struct StoredState {
    agents: Vec<AgentRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> AgentManager {
        AgentManager::new(AgentsConfig::default(), None)
    }

    #[tokio::test]
    async fn test_registration_is_idempotent() {
        let mgr = manager();
        let record = AgentRecord::new("a1", "worker").with_capability("X");

        assert!(mgr.register(record.clone()).await);
        assert!(!mgr.register(record).await);

        // State equals the state after a single registration.
        assert_eq!(mgr.all().await.len(), 1);
        assert_eq!(mgr.by_capability("X").await.len(), 1);
    }

    #[tokio::test]
    async fn test_deregister_cleans_every_index() {
        let mgr = manager();
        mgr.register(
            AgentRecord::new("a1", "worker")
                .with_capability("X")
                .with_subscription("alerts")
                .with_dependency("Y"),
        )
        .await;

        assert!(mgr.deregister("a1").await);
        assert!(!mgr.deregister("a1").await);

        assert!(mgr.by_capability("X").await.is_empty());
        assert!(mgr.by_subscription("alerts").await.is_empty());
        assert!(mgr.get("a1").await.is_none());
    }

    #[tokio::test]
    async fn test_capability_index_consistency() {
        let mgr = manager();
        mgr.register(AgentRecord::new("a1", "worker").with_capability("X")).await;
        mgr.register(
            AgentRecord::new("a2", "worker")
                .with_capability("X")
                .with_capability("Y"),
        )
        .await;

        let x = mgr.by_capability("X").await;
        assert_eq!(x.len(), 2);
        let y = mgr.by_capability("Y").await;
        assert_eq!(y.len(), 1);
        assert_eq!(y[0].agent_id, "a2");
        assert!(mgr.by_capability("Z").await.is_empty());
    }

    #[tokio::test]
    async fn test_default_status_is_inactive() {
        let mgr = manager();
        mgr.register(AgentRecord::new("a1", "worker")).await;
        assert_eq!(mgr.get("a1").await.unwrap().status, AgentStatus::Inactive);
    }

    #[tokio::test]
    async fn test_dependency_resolution() {
        let mgr = manager();
        mgr.register(
            AgentRecord::new("a1", "worker")
                .with_capability("X")
                .with_dependency("Y"),
        )
        .await;
        mgr.register(
            AgentRecord::new("b1", "worker")
                .with_capability("Y")
                .with_status(AgentStatus::Active),
        )
        .await;

        assert!(mgr.check_dependencies().await.is_empty());

        mgr.deregister("b1").await;
        let missing = mgr.check_dependencies().await;
        assert_eq!(missing.get("a1"), Some(&vec!["Y".to_string()]));
    }

    #[tokio::test]
    async fn test_inactive_provider_does_not_meet_dependency() {
        let mgr = manager();
        mgr.register(AgentRecord::new("a1", "worker").with_dependency("Y")).await;
        mgr.register(AgentRecord::new("b1", "worker").with_capability("Y")).await;

        // Provider exists but is INACTIVE.
        let missing = mgr.check_dependencies().await;
        assert_eq!(missing.get("a1"), Some(&vec!["Y".to_string()]));

        mgr.update_status("b1", AgentStatus::Active, None).await;
        assert!(mgr.check_dependencies().await.is_empty());
    }

    #[tokio::test]
    async fn test_health_check_marks_stale_agents_unreachable() {
        let cfg = AgentsConfig {
            agent_timeout: 0.05,
            health_check_interval: 0.0,
        };
        let mgr = AgentManager::new(cfg, None);
        mgr.register(AgentRecord::new("a1", "worker").with_status(AgentStatus::Active)).await;
        mgr.update_status("a1", AgentStatus::Active, None).await;

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        let report = mgr.check_health().await;

        assert_eq!(report.unreachable, vec!["a1".to_string()]);
        assert_eq!(mgr.get("a1").await.unwrap().status, AgentStatus::Unreachable);
    }

    #[tokio::test]
    async fn test_health_check_flags_error_metrics() {
        let cfg = AgentsConfig {
            agent_timeout: 60.0,
            health_check_interval: 0.0,
        };
        let mgr = AgentManager::new(cfg, None);
        mgr.register(AgentRecord::new("a1", "worker")).await;
        let mut metrics = Map::new();
        metrics.insert("errors".into(), Value::from(3));
        mgr.update_status("a1", AgentStatus::Active, Some(metrics)).await;

        let report = mgr.check_health().await;
        assert_eq!(report.unhealthy, vec!["a1".to_string()]);
        assert!(report.healthy.is_empty());
    }

    #[tokio::test]
    async fn test_health_check_is_rate_limited() {
        let cfg = AgentsConfig {
            agent_timeout: 60.0,
            health_check_interval: 3600.0,
        };
        let mgr = AgentManager::new(cfg, None);
        mgr.register(AgentRecord::new("a1", "worker").with_status(AgentStatus::Active)).await;
        mgr.update_status("a1", AgentStatus::Active, None).await;

        let first = mgr.check_health().await;
        assert_eq!(first.healthy.len(), 1);

        // Registering another active agent does not show up until the
        // interval elapses; the cached report is returned.
        mgr.register(AgentRecord::new("a2", "worker")).await;
        mgr.update_status("a2", AgentStatus::Active, None).await;
        let second = mgr.check_health().await;
        assert_eq!(second.healthy.len(), 1);
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents.json");

        {
            let mgr = AgentManager::new(AgentsConfig::default(), Some(path.clone()));
            mgr.register(
                AgentRecord::new("a1", "worker")
                    .with_capability("X")
                    .with_subscription("alerts"),
            )
            .await;
        }

        let restored = AgentManager::new(AgentsConfig::default(), Some(path));
        assert_eq!(restored.get("a1").await.unwrap().kind, "worker");
        assert_eq!(restored.by_capability("X").await.len(), 1);
        assert_eq!(restored.by_subscription("alerts").await.len(), 1);
    }
}
