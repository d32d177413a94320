//! Configuration management
//!
//! Layered configuration: a built-in default tree, deep-merged with an
//! optional JSON or YAML file. Lookup and assignment use dotted paths
//! (`core.master_prompt_refresh_interval`); each subsystem gets a typed
//! accessor struct deserialized from its subtree.
//!
//! A missing file keeps the defaults with a warning; an unrecognized file
//! extension is an error. Unrecognized keys are retained in the tree.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

static DEFAULTS: Lazy<Value> = Lazy::new(|| {
    json!({
        "core": {
            "name": "corehub",
            "version": env!("CARGO_PKG_VERSION"),
            "data_dir": "data",
            "master_prompt_refresh_interval": 300.0,
            "tick_interval": 1.0,
            "state_save_every": 15,
            "max_errors": 1000
        },
        "logging": {
            "level": "info",
            "console": { "enabled": true, "json": false },
            "file": {
                "enabled": false,
                "path": "logs/corehub.log",
                "max_bytes": 10485760,
                "backups": 5
            }
        },
        "communication": {
            "protocol": "memory",
            "redis_url": "redis://127.0.0.1:6379",
            "channels": {
                "command": "corehub:command",
                "query": "corehub:query",
                "response": "corehub:response",
                "event": "corehub:event",
                "error": "corehub:error",
                "status_update": "corehub:status",
                "assistance_request": "corehub:assist"
            },
            "broadcast_channel": "corehub:broadcast",
            "topic_prefix": "corehub:agent:",
            "callback_ttl_secs": 300.0,
            "drain_quantum_ms": 10
        },
        "agents": {
            "agent_timeout": 120.0,
            "health_check_interval": 60.0
        },
        "replay_buffer": {
            "type": "memory",
            "capacity": 10000,
            "alpha": 0.6,
            "beta": 0.4,
            "beta_increment": 0.001,
            "file": { "save_dir": "data/experiences" },
            "remote": { "url": "redis://127.0.0.1:6379", "prefix": "corehub:replay" }
        },
        "dashboard": { "enabled": false },
        "master_prompt": ""
    })
});

/// The merged configuration tree.
#[derive(Debug, Clone)]
pub struct ConfigTree {
    root: Value,
}

impl ConfigTree {
    /// Built-in defaults only.
    pub fn defaults() -> Self {
        Self {
            root: DEFAULTS.clone(),
        }
    }

    /// Merge a user-supplied tree onto the defaults.
    pub fn from_value(overlay: Value) -> Self {
        let mut tree = Self::defaults();
        deep_merge(&mut tree.root, overlay);
        tree
    }

    /// Load a JSON (`.json`) or YAML (`.yaml`/`.yml`) file and merge it onto
    /// the defaults. A missing file keeps the defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!("config file {} not found, using defaults", path.display());
            return Ok(Self::defaults());
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        let overlay: Value = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in {}", path.display()))?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&raw)
                .with_context(|| format!("invalid YAML in {}", path.display()))?,
            other => bail!(
                "unsupported config extension {:?} for {}",
                other,
                path.display()
            ),
        };

        Ok(Self::from_value(overlay))
    }

    /// Dotted-path lookup.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut node = &self.root;
        for part in path.split('.') {
            node = node.as_object()?.get(part)?;
        }
        Some(node)
    }

    /// Dotted-path lookup with a typed fallback.
    pub fn get_or<T: serde::de::DeserializeOwned>(&self, path: &str, default: T) -> T {
        self.get(path)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(default)
    }

    /// Dotted-path assignment, creating intermediate objects as needed.
    pub fn set(&mut self, path: &str, value: Value) {
        let mut node = &mut self.root;
        let parts: Vec<&str> = path.split('.').collect();
        for (i, part) in parts.iter().enumerate() {
            if i == parts.len() - 1 {
                if let Some(obj) = node.as_object_mut() {
                    obj.insert(part.to_string(), value);
                }
                return;
            }
            let has_child = node
                .as_object()
                .map(|o| o.contains_key(*part))
                .unwrap_or(false);
            if !has_child {
                if let Some(obj) = node.as_object_mut() {
                    obj.insert(part.to_string(), json!({}));
                }
            }
            match node.as_object_mut().and_then(|o| o.get_mut(*part)) {
                Some(next) => node = next,
                None => return,
            }
        }
    }

    // ============ Typed accessors ============

    pub fn core(&self) -> CoreConfig {
        self.section("core")
    }

    pub fn logging(&self) -> LoggingConfig {
        self.section("logging")
    }

    pub fn communication(&self) -> CommConfig {
        self.section("communication")
    }

    pub fn agents(&self) -> AgentsConfig {
        self.section("agents")
    }

    pub fn replay_buffer(&self) -> ReplayConfig {
        self.section("replay_buffer")
    }

    pub fn master_prompt(&self) -> String {
        self.get_or("master_prompt", String::new())
    }

    fn section<T: serde::de::DeserializeOwned + Default>(&self, key: &str) -> T {
        self.get(key)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }
}

impl Default for ConfigTree {
    fn default() -> Self {
        Self::defaults()
    }
}

/// Recursively merge `overlay` onto `base`. Objects merge key by key;
/// scalars and arrays replace.
fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}

// ============ Typed sections ============

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub name: String,
    pub version: String,
    pub data_dir: PathBuf,
    pub master_prompt_refresh_interval: f64,
    pub tick_interval: f64,
    pub state_save_every: u32,
    pub max_errors: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            name: "corehub".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            data_dir: PathBuf::from("data"),
            master_prompt_refresh_interval: 300.0,
            tick_interval: 1.0,
            state_save_every: 15,
            max_errors: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub console: ConsoleSinkConfig,
    pub file: FileSinkConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsoleSinkConfig {
    pub enabled: bool,
    pub json: bool,
}

impl Default for ConsoleSinkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            json: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileSinkConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub max_bytes: u64,
    pub backups: usize,
}

impl Default for FileSinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("logs/corehub.log"),
            max_bytes: 10 * 1024 * 1024,
            backups: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommConfig {
    pub protocol: String,
    pub redis_url: String,
    pub channels: HashMap<String, String>,
    pub broadcast_channel: String,
    pub topic_prefix: String,
    pub callback_ttl_secs: f64,
    pub drain_quantum_ms: u64,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            protocol: "memory".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            channels: HashMap::new(),
            broadcast_channel: "corehub:broadcast".to_string(),
            topic_prefix: "corehub:agent:".to_string(),
            callback_ttl_secs: 300.0,
            drain_quantum_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub agent_timeout: f64,
    pub health_check_interval: f64,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            agent_timeout: 120.0,
            health_check_interval: 60.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    #[serde(rename = "type")]
    pub backend: String,
    pub capacity: usize,
    pub alpha: f64,
    pub beta: f64,
    pub beta_increment: f64,
    /// Pins the sampling RNG; used by tests.
    pub seed: Option<u64>,
    pub file: FileBackendConfig,
    pub remote: RemoteBackendConfig,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            capacity: 10000,
            alpha: 0.6,
            beta: 0.4,
            beta_increment: 0.001,
            seed: None,
            file: FileBackendConfig::default(),
            remote: RemoteBackendConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileBackendConfig {
    pub save_dir: PathBuf,
}

impl Default for FileBackendConfig {
    fn default() -> Self {
        Self {
            save_dir: PathBuf::from("data/experiences"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteBackendConfig {
    pub url: String,
    pub prefix: String,
}

impl Default for RemoteBackendConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            prefix: "corehub:replay".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_expose_every_section() {
        let cfg = ConfigTree::defaults();
        assert_eq!(cfg.core().name, "corehub");
        assert_eq!(cfg.communication().protocol, "memory");
        assert_eq!(cfg.replay_buffer().backend, "memory");
        assert!((cfg.agents().agent_timeout - 120.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_deep_merge_preserves_siblings() {
        let cfg = ConfigTree::from_value(json!({
            "core": { "name": "levyhub" },
            "custom_section": { "anything": true }
        }));

        // Overridden key.
        assert_eq!(cfg.core().name, "levyhub");
        // Sibling defaults survive the merge.
        assert!((cfg.core().tick_interval - 1.0).abs() < f64::EPSILON);
        // Unrecognized keys are retained.
        assert_eq!(cfg.get("custom_section.anything"), Some(&json!(true)));
    }

    #[test]
    fn test_dotted_get_set() {
        let mut cfg = ConfigTree::defaults();
        assert_eq!(
            cfg.get("communication.channels.command"),
            Some(&json!("corehub:command"))
        );
        assert_eq!(cfg.get("no.such.path"), None);

        cfg.set("core.master_prompt_refresh_interval", json!(0.5));
        assert!((cfg.core().master_prompt_refresh_interval - 0.5).abs() < f64::EPSILON);

        cfg.set("brand.new.key", json!("value"));
        assert_eq!(cfg.get("brand.new.key"), Some(&json!("value")));
    }

    #[test]
    fn test_load_missing_file_keeps_defaults() {
        let cfg = ConfigTree::load("/nonexistent/corehub.json").unwrap();
        assert_eq!(cfg.core().name, "corehub");
    }

    #[test]
    fn test_load_rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "x = 1").unwrap();
        assert!(ConfigTree::load(&path).is_err());
    }

    #[test]
    fn test_load_json_and_yaml() {
        let dir = tempfile::tempdir().unwrap();

        let json_path = dir.path().join("config.json");
        std::fs::write(&json_path, r#"{"master_prompt": "P"}"#).unwrap();
        let cfg = ConfigTree::load(&json_path).unwrap();
        assert_eq!(cfg.master_prompt(), "P");

        let yaml_path = dir.path().join("config.yaml");
        std::fs::write(&yaml_path, "communication:\n  protocol: pubsub\n").unwrap();
        let cfg = ConfigTree::load(&yaml_path).unwrap();
        assert_eq!(cfg.communication().protocol, "pubsub");
    }
}
