//! Experience Replay
//!
//! Prioritized replay buffer for agent experiences with three
//! interchangeable backends selected by config:
//! - **memory**: parallel arrays, no persistence
//! - **file**: one JSON file per experience in a directory
//! - **remote-kv**: redis list + sorted set + per-id blobs
//!
//! Sampling is proportional to `priority^alpha`, corrected by
//! importance-sampling weights `(N * p)^-beta` normalized so the largest
//! weight is 1. `beta` anneals toward 1 by `beta_increment` per sample.

mod file;
mod memory;
mod remote;

pub use file::FileReplayBuffer;
pub use memory::MemoryReplayBuffer;
pub use remote::RemoteReplayBuffer;

use std::collections::HashMap;

use anyhow::bail;
use chrono::{DateTime, Utc};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::ReplayConfig;

/// Floor for stored priorities; updates clamp to this.
pub const MIN_PRIORITY: f64 = 1e-6;

/// One (state, action, result, next_state) record. The maps are opaque to
/// the buffer; the sampling priority lives in `metadata.priority`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experience {
    pub experience_id: String,
    pub agent_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub state: Map<String, Value>,
    #[serde(default)]
    pub action: Map<String, Value>,
    #[serde(default)]
    pub result: Map<String, Value>,
    #[serde(default)]
    pub next_state: Map<String, Value>,
    pub reward: Option<f64>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Experience {
    pub fn new(agent_id: &str) -> Self {
        Self {
            experience_id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            created_at: Utc::now(),
            state: Map::new(),
            action: Map::new(),
            result: Map::new(),
            next_state: Map::new(),
            reward: None,
            metadata: Map::new(),
        }
    }

    pub fn with_id(mut self, experience_id: &str) -> Self {
        self.experience_id = experience_id.to_string();
        self
    }

    pub fn with_state(mut self, state: Map<String, Value>) -> Self {
        self.state = state;
        self
    }

    pub fn with_action(mut self, action: Map<String, Value>) -> Self {
        self.action = action;
        self
    }

    pub fn with_result(mut self, result: Map<String, Value>) -> Self {
        self.result = result;
        self
    }

    pub fn with_next_state(mut self, next_state: Map<String, Value>) -> Self {
        self.next_state = next_state;
        self
    }

    pub fn with_reward(mut self, reward: f64) -> Self {
        self.reward = Some(reward);
        self
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.set_priority(priority);
        self
    }

    /// Explicit sampling priority, if one was assigned.
    pub fn priority(&self) -> Option<f64> {
        self.metadata.get("priority").and_then(Value::as_f64)
    }

    pub fn set_priority(&mut self, priority: f64) {
        let clamped = priority.max(MIN_PRIORITY);
        self.metadata
            .insert("priority".into(), Value::from(clamped));
    }
}

/// Result of one prioritized draw.
#[derive(Debug, Clone)]
pub struct SampleBatch {
    pub experiences: Vec<Experience>,
    pub indices: Vec<usize>,
    pub weights: Vec<f64>,
}

/// Aggregate buffer statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BufferStats {
    pub size: usize,
    pub capacity: usize,
    pub per_agent: HashMap<String, usize>,
    pub reward_min: Option<f64>,
    pub reward_avg: Option<f64>,
    pub reward_max: Option<f64>,
    pub beta: f64,
    /// True when computed from a scaled sub-sample.
    pub approximate: bool,
}

/// Shared interface over the three backends.
pub trait ReplayBuffer: Send {
    /// Store an experience, evicting FIFO when at capacity. An entry with no
    /// explicit priority inherits the current maximum.
    fn add(&mut self, exp: Experience) -> bool;

    /// Draw `min(batch_size, len)` experiences with replacement,
    /// proportional to priority; returns None when empty.
    fn sample(&mut self, batch_size: usize) -> Option<SampleBatch>;

    /// Reassign priorities at the given indices, clamped to [`MIN_PRIORITY`].
    fn update_priorities(&mut self, indices: &[usize], priorities: &[f64]);

    /// Look up an experience by id.
    fn get(&mut self, experience_id: &str) -> Option<Experience>;

    /// Rewrite an experience in place (matched by id). Returns false when
    /// the id is not present.
    fn update(&mut self, exp: Experience) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stats(&mut self) -> BufferStats;
}

/// Build the configured backend. Unknown types are a startup error.
pub fn create_replay_buffer(cfg: &ReplayConfig) -> anyhow::Result<Box<dyn ReplayBuffer>> {
    match cfg.backend.as_str() {
        "memory" => Ok(Box::new(MemoryReplayBuffer::new(cfg))),
        "file" => Ok(Box::new(FileReplayBuffer::open(cfg)?)),
        "remote-kv" => Ok(Box::new(RemoteReplayBuffer::connect(cfg)?)),
        other => bail!("unknown replay_buffer.type '{other}'"),
    }
}

/// Shared annealing/sampling state for all backends.
pub(crate) struct Sampler {
    pub alpha: f64,
    pub beta: f64,
    pub beta_increment: f64,
    pub rng: StdRng,
}

impl Sampler {
    pub fn new(cfg: &ReplayConfig) -> Self {
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            alpha: cfg.alpha,
            beta: cfg.beta,
            beta_increment: cfg.beta_increment,
            rng,
        }
    }

    /// Draw indices and importance weights over the given priorities, then
    /// anneal beta. Empty input yields None.
    pub fn draw(&mut self, priorities: &[f64], batch_size: usize) -> Option<(Vec<usize>, Vec<f64>)> {
        let n = priorities.len();
        if n == 0 || batch_size == 0 {
            return None;
        }

        let scaled: Vec<f64> = priorities
            .iter()
            .map(|p| p.max(MIN_PRIORITY).powf(self.alpha))
            .collect();
        let total: f64 = scaled.iter().sum();
        let dist = WeightedIndex::new(&scaled).ok()?;

        let count = batch_size.min(n);
        let indices: Vec<usize> = (0..count).map(|_| dist.sample(&mut self.rng)).collect();

        let mut weights: Vec<f64> = indices
            .iter()
            .map(|&i| {
                let p = scaled[i] / total;
                (n as f64 * p).powf(-self.beta)
            })
            .collect();
        let max = weights.iter().cloned().fold(f64::MIN, f64::max);
        if max > 0.0 {
            for w in &mut weights {
                *w /= max;
            }
        }

        self.beta = (self.beta + self.beta_increment).min(1.0);
        Some((indices, weights))
    }
}

/// Priority for a new entry: its own if set, else the running maximum so
/// recent entries are never starved.
pub(crate) fn entry_priority(exp: &Experience, existing: &[f64]) -> f64 {
    match exp.priority() {
        Some(p) => p.max(MIN_PRIORITY),
        None if existing.is_empty() => 1.0,
        None => existing
            .iter()
            .cloned()
            .fold(f64::MIN, f64::max)
            .max(MIN_PRIORITY),
    }
}

/// Exact stats over an iterator of (agent_id, reward) pairs.
pub(crate) fn compute_stats<'a>(
    entries: impl Iterator<Item = (&'a str, Option<f64>)>,
    size: usize,
    capacity: usize,
    beta: f64,
    approximate: bool,
) -> BufferStats {
    let mut per_agent: HashMap<String, usize> = HashMap::new();
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut sum = 0.0;
    let mut rewarded = 0usize;

    for (agent_id, reward) in entries {
        *per_agent.entry(agent_id.to_string()).or_default() += 1;
        if let Some(r) = reward {
            min = min.min(r);
            max = max.max(r);
            sum += r;
            rewarded += 1;
        }
    }

    let (reward_min, reward_avg, reward_max) = if rewarded > 0 {
        (Some(min), Some(sum / rewarded as f64), Some(max))
    } else {
        (None, None, None)
    };

    BufferStats {
        size,
        capacity,
        per_agent,
        reward_min,
        reward_avg,
        reward_max,
        beta,
        approximate,
    }
}
