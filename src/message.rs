//! Message Envelopes
//!
//! Typed envelopes for inter-agent communication. Every unit of traffic
//! through the hub is an [`Envelope`]: a globally unique id, source and
//! target agent ids, an event kind discriminator, a structured payload,
//! a delivery priority, and an optional TTL.
//!
//! Envelopes are immutable after construction except for metadata the hub
//! stamps during dispatch (`original_message_id`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Reserved target id for fan-out to all agents.
pub const BROADCAST_TARGET: &str = "broadcast";

/// Command name the hub broadcasts on master-prompt refresh.
pub const MASTER_PROMPT_COMMAND: &str = "update_master_prompt";

/// Event kind discriminator. The enum is closed; new kinds are a code change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Command,
    Query,
    Response,
    Event,
    Error,
    StatusUpdate,
    AssistanceRequest,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Command => "COMMAND",
            EventKind::Query => "QUERY",
            EventKind::Response => "RESPONSE",
            EventKind::Event => "EVENT",
            EventKind::Error => "ERROR",
            EventKind::StatusUpdate => "STATUS_UPDATE",
            EventKind::AssistanceRequest => "ASSISTANCE_REQUEST",
        }
    }

    /// Key used to look up this kind's channel in the communication config.
    pub fn channel_key(&self) -> &'static str {
        match self {
            EventKind::Command => "command",
            EventKind::Query => "query",
            EventKind::Response => "response",
            EventKind::Event => "event",
            EventKind::Error => "error",
            EventKind::StatusUpdate => "status_update",
            EventKind::AssistanceRequest => "assistance_request",
        }
    }
}

/// Delivery priority. Lower ordinal is delivered earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn ordinal(&self) -> usize {
        *self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "CRITICAL",
            Priority::High => "HIGH",
            Priority::Medium => "MEDIUM",
            Priority::Low => "LOW",
        }
    }

    /// Map an assistance-request urgency to a delivery priority.
    pub fn from_urgency(urgency: &str) -> Self {
        match urgency {
            "critical" => Priority::Critical,
            "high" => Priority::High,
            "low" => Priority::Low,
            _ => Priority::Medium,
        }
    }
}

/// One unit of inter-agent communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Globally unique id, assigned at construction.
    pub message_id: String,

    /// Links a response or assistance round-trip to its originator.
    #[serde(default)]
    pub correlation_id: Option<String>,

    pub source_agent_id: String,
    pub target_agent_id: String,

    pub event_kind: EventKind,
    pub priority: Priority,

    /// Wall-clock creation time, UTC.
    pub created_at: DateTime<Utc>,

    /// Envelope is expired once `now - created_at > ttl_seconds`.
    #[serde(default)]
    pub ttl_seconds: Option<f64>,

    /// Kind-dependent structured payload.
    #[serde(default)]
    pub payload: Map<String, Value>,

    /// Open-ended map; the hub may stamp `original_message_id`.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Envelope {
    /// Create an envelope with default MEDIUM priority and no TTL.
    pub fn new(
        source: &str,
        target: &str,
        kind: EventKind,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            correlation_id: None,
            source_agent_id: source.to_string(),
            target_agent_id: target.to_string(),
            event_kind: kind,
            priority: Priority::Medium,
            created_at: Utc::now(),
            ttl_seconds: None,
            payload,
            metadata: Map::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl_seconds: f64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    pub fn with_correlation(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_string());
        self
    }

    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    // ============ Per-kind constructors ============

    /// COMMAND: invoke a named operation on the target.
    pub fn command(source: &str, target: &str, command_name: &str, parameters: Value) -> Self {
        let mut payload = Map::new();
        payload.insert("command_name".into(), Value::String(command_name.to_string()));
        payload.insert("parameters".into(), parameters);
        Self::new(source, target, EventKind::Command, payload)
    }

    /// QUERY: read-only request; the target must produce a RESPONSE.
    pub fn query(source: &str, target: &str, query_name: &str, parameters: Value) -> Self {
        let mut payload = Map::new();
        payload.insert("query_name".into(), Value::String(query_name.to_string()));
        payload.insert("parameters".into(), parameters);
        Self::new(source, target, EventKind::Query, payload)
    }

    /// EVENT: fire-and-forget to subscribers of `topic`.
    pub fn event(source: &str, topic: Option<&str>, payload: Map<String, Value>) -> Self {
        let mut env = Self::new(source, BROADCAST_TARGET, EventKind::Event, payload);
        if let Some(t) = topic {
            env.metadata.insert("topic".into(), Value::String(t.to_string()));
        }
        env
    }

    /// RESPONSE to `origin`, stamped with its correlation.
    pub fn response_to(origin: &Envelope, source: &str, success: bool, result: Value) -> Self {
        let mut payload = Map::new();
        let status = if success { "success" } else { "failure" };
        payload.insert("status".into(), Value::String(status.to_string()));
        payload.insert("result".into(), result);
        Self::new(source, &origin.source_agent_id, EventKind::Response, payload)
            .with_correlation(&origin.message_id)
    }

    /// ERROR terminating the exchange started by `origin`.
    pub fn error_reply(
        origin: &Envelope,
        source: &str,
        error_code: &str,
        error_message: &str,
        details: Option<Value>,
    ) -> Self {
        let mut payload = Map::new();
        payload.insert("error_code".into(), Value::String(error_code.to_string()));
        payload.insert("error_message".into(), Value::String(error_message.to_string()));
        if let Some(d) = details {
            payload.insert("details".into(), d);
        }
        Self::new(source, &origin.source_agent_id, EventKind::Error, payload)
            .with_correlation(&origin.message_id)
            .with_priority(Priority::High)
            .with_meta("original_message_id", Value::String(origin.message_id.clone()))
    }

    /// STATUS_UPDATE applied to the source agent's record; never forwarded.
    pub fn status_update(source: &str, hub: &str, status: &str, metrics: Option<Value>) -> Self {
        let mut payload = Map::new();
        payload.insert("status".into(), Value::String(status.to_string()));
        if let Some(m) = metrics {
            payload.insert("metrics".into(), m);
        }
        Self::new(source, hub, EventKind::StatusUpdate, payload)
    }

    /// ASSISTANCE_REQUEST routed by the hub to a capable provider.
    ///
    /// Priority defaults from urgency: low, normal, high, critical.
    pub fn assistance_request(
        source: &str,
        hub: &str,
        capability: Option<&str>,
        context: Value,
        urgency: &str,
    ) -> Self {
        let mut payload = Map::new();
        if let Some(cap) = capability {
            payload.insert("capability".into(), Value::String(cap.to_string()));
        }
        payload.insert("context".into(), context);
        payload.insert("urgency".into(), Value::String(urgency.to_string()));
        Self::new(source, hub, EventKind::AssistanceRequest, payload)
            .with_priority(Priority::from_urgency(urgency))
    }

    // ============ Accessors ============

    /// Seconds since this envelope was created.
    pub fn age_seconds(&self) -> f64 {
        let elapsed = Utc::now().signed_duration_since(self.created_at);
        elapsed.num_milliseconds() as f64 / 1000.0
    }

    /// True once the wall clock has advanced past the TTL.
    pub fn is_expired(&self) -> bool {
        match self.ttl_seconds {
            Some(ttl) => self.age_seconds() > ttl,
            None => false,
        }
    }

    /// The id of the envelope this one answers, if any.
    pub fn in_reply_to(&self) -> Option<&str> {
        if let Some(ref id) = self.correlation_id {
            return Some(id.as_str());
        }
        self.metadata.get("original_message_id").and_then(Value::as_str)
    }

    /// Explicit event topic, falling back to the event kind name.
    pub fn topic(&self) -> String {
        self.metadata
            .get("topic")
            .and_then(Value::as_str)
            .unwrap_or(self.event_kind.as_str())
            .to_string()
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Structural check of the kind-dependent payload contract.
    pub fn validate(&self) -> Result<(), String> {
        let need = |key: &str| -> Result<(), String> {
            if self.payload.contains_key(key) {
                Ok(())
            } else {
                Err(format!("{} payload missing '{}'", self.event_kind.as_str(), key))
            }
        };
        match self.event_kind {
            EventKind::Command => {
                need("command_name")?;
                need("parameters")
            }
            EventKind::Query => {
                need("query_name")?;
                need("parameters")
            }
            EventKind::Response => {
                need("status")?;
                need("result")?;
                if self.in_reply_to().is_none() {
                    return Err("RESPONSE must reference its originating message".into());
                }
                Ok(())
            }
            EventKind::Error => {
                need("error_code")?;
                need("error_message")?;
                if self.in_reply_to().is_none() {
                    return Err("ERROR must reference its originating message".into());
                }
                Ok(())
            }
            EventKind::StatusUpdate => need("status"),
            EventKind::AssistanceRequest | EventKind::Event => Ok(()),
        }
    }

    // ============ Wire form ============

    /// Serialize to the JSON wire form carried by transports.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Reconstruct an envelope from its wire form.
    pub fn from_wire(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Medium);
        assert!(Priority::Medium < Priority::Low);
        assert_eq!(Priority::Critical.ordinal(), 0);
        assert_eq!(Priority::Low.ordinal(), 3);
    }

    #[test]
    fn test_urgency_mapping() {
        assert_eq!(Priority::from_urgency("low"), Priority::Low);
        assert_eq!(Priority::from_urgency("normal"), Priority::Medium);
        assert_eq!(Priority::from_urgency("high"), Priority::High);
        assert_eq!(Priority::from_urgency("critical"), Priority::Critical);
        assert_eq!(Priority::from_urgency("bogus"), Priority::Medium);
    }

    #[test]
    fn test_unique_message_ids() {
        let a = Envelope::command("a", "b", "noop", json!({}));
        let b = Envelope::command("a", "b", "noop", json!({}));
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn test_wire_round_trip() {
        let env = Envelope::command("a1", "b1", "reindex", json!({"shard": 3}))
            .with_priority(Priority::High)
            .with_ttl(30.0);

        let wire = env.to_wire().unwrap();
        assert!(wire.contains("\"COMMAND\""));
        assert!(wire.contains("\"HIGH\""));

        let back = Envelope::from_wire(&wire).unwrap();
        assert_eq!(back.message_id, env.message_id);
        assert_eq!(back.event_kind, EventKind::Command);
        assert_eq!(back.priority, Priority::High);
        assert_eq!(back.ttl_seconds, Some(30.0));
        assert_eq!(back.payload_str("command_name"), Some("reindex"));
    }

    #[test]
    fn test_expiry() {
        let fresh = Envelope::command("a", "b", "noop", json!({})).with_ttl(60.0);
        assert!(!fresh.is_expired());

        let mut stale = Envelope::command("a", "b", "noop", json!({})).with_ttl(0.05);
        stale.created_at = Utc::now() - chrono::Duration::milliseconds(200);
        assert!(stale.is_expired());

        let no_ttl = Envelope::command("a", "b", "noop", json!({}));
        assert!(!no_ttl.is_expired());
    }

    #[test]
    fn test_response_carries_correlation() {
        let query = Envelope::query("a1", "b1", "lookup", json!({"key": "k"}));
        let response = Envelope::response_to(&query, "b1", true, json!({"value": 7}));

        assert_eq!(response.target_agent_id, "a1");
        assert_eq!(response.correlation_id.as_deref(), Some(query.message_id.as_str()));
        assert!(response.validate().is_ok());
    }

    #[test]
    fn test_error_reply_references_origin() {
        let cmd = Envelope::command("a1", "ghost", "noop", json!({}));
        let err = Envelope::error_reply(&cmd, "hub", "RESOURCE_NOT_FOUND", "no such agent", None);

        assert_eq!(err.target_agent_id, "a1");
        assert_eq!(err.in_reply_to(), Some(cmd.message_id.as_str()));
        assert_eq!(err.priority, Priority::High);
        assert!(err.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        let env = Envelope::new("a", "b", EventKind::Command, Map::new());
        assert!(env.validate().is_err());

        let mut resp = Envelope::new("a", "b", EventKind::Response, Map::new());
        resp.payload.insert("status".into(), json!("success"));
        resp.payload.insert("result".into(), json!({}));
        // No correlation and no original_message_id.
        assert!(resp.validate().is_err());
    }

    #[test]
    fn test_event_topic_defaults_to_kind() {
        let explicit = Envelope::event("a", Some("alerts"), Map::new());
        assert_eq!(explicit.topic(), "alerts");

        let implicit = Envelope::event("a", None, Map::new());
        assert_eq!(implicit.topic(), "EVENT");
        assert_eq!(implicit.target_agent_id, BROADCAST_TARGET);
    }

    #[test]
    fn test_assistance_priority_from_urgency() {
        let env = Envelope::assistance_request("a1", "hub", Some("V"), json!({}), "critical");
        assert_eq!(env.priority, Priority::Critical);
        assert_eq!(env.payload_str("capability"), Some("V"));
    }
}
