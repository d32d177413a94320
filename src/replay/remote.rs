//! Redis-backed replay backend.
//!
//! Key scheme under the configured prefix:
//! - `{prefix}:ids`      list of experience ids, oldest first
//! - `{prefix}:prio`     sorted set of id -> priority
//! - `{prefix}:exp:{id}` JSON blob per experience
//!
//! Eviction pops the list head. Calls are synchronous on the caller's
//! thread; redis failures degrade to a logged warning and a false/None
//! return rather than propagating.

use std::collections::HashMap;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rand::Rng;
use redis::{Commands, Connection};
use tracing::warn;

use super::{
    compute_stats, BufferStats, Experience, ReplayBuffer, SampleBatch, Sampler, MIN_PRIORITY,
};
use crate::config::ReplayConfig;

/// Above this size, stats are computed from a scaled sub-sample.
const STATS_SCAN_LIMIT: usize = 512;

pub struct RemoteReplayBuffer {
    conn: Mutex<Connection>,
    prefix: String,
    capacity: usize,
    sampler: Sampler,
}

impl RemoteReplayBuffer {
    pub fn connect(cfg: &ReplayConfig) -> Result<Self> {
        let client = redis::Client::open(cfg.remote.url.as_str())
            .with_context(|| format!("invalid redis url {}", cfg.remote.url))?;
        let conn = client
            .get_connection()
            .with_context(|| format!("failed to connect to redis at {}", cfg.remote.url))?;
        Ok(Self {
            conn: Mutex::new(conn),
            prefix: cfg.remote.prefix.clone(),
            capacity: cfg.capacity.max(1),
            sampler: Sampler::new(cfg),
        })
    }

    fn ids_key(&self) -> String {
        format!("{}:ids", self.prefix)
    }

    fn prio_key(&self) -> String {
        format!("{}:prio", self.prefix)
    }

    fn exp_key(&self, id: &str) -> String {
        format!("{}:exp:{}", self.prefix, id)
    }

    fn ids(&self) -> Result<Vec<String>> {
        Ok(self.conn.lock().lrange(self.ids_key(), 0, -1)?)
    }

    /// Priorities in list order, defaulting entries missing from the sorted
    /// set to 1.0.
    fn priorities_for(&self, ids: &[String]) -> Result<Vec<f64>> {
        let scored: Vec<(String, f64)> = self
            .conn
            .lock()
            .zrange_withscores(self.prio_key(), 0, -1)?;
        let scores: HashMap<String, f64> = scored.into_iter().collect();
        Ok(ids
            .iter()
            .map(|id| scores.get(id).copied().unwrap_or(1.0))
            .collect())
    }

    fn load(&self, id: &str) -> Result<Option<Experience>> {
        let raw: Option<String> = self.conn.lock().get(self.exp_key(id))?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn store(&self, exp: &Experience, priority: f64) -> Result<()> {
        let json = serde_json::to_string(exp)?;
        let mut conn = self.conn.lock();
        conn.set::<_, _, ()>(self.exp_key(&exp.experience_id), json)?;
        conn.zadd::<_, _, _, ()>(self.prio_key(), exp.experience_id.as_str(), priority)?;
        Ok(())
    }
}

impl ReplayBuffer for RemoteReplayBuffer {
    fn add(&mut self, mut exp: Experience) -> bool {
        let result: Result<()> = (|| {
            let existing = self.ids()?;
            let priorities = self.priorities_for(&existing)?;
            let priority = super::entry_priority(&exp, &priorities);
            exp.set_priority(priority);

            if existing.len() >= self.capacity {
                let mut conn = self.conn.lock();
                let evicted: Option<String> = conn.lpop(self.ids_key(), None)?;
                if let Some(id) = evicted {
                    conn.zrem::<_, _, ()>(self.prio_key(), id.as_str())?;
                    conn.del::<_, ()>(self.exp_key(&id))?;
                }
            }

            self.store(&exp, priority)?;
            self.conn
                .lock()
                .rpush::<_, _, ()>(self.ids_key(), exp.experience_id.as_str())?;
            Ok(())
        })();

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("remote replay add failed: {e:#}");
                false
            }
        }
    }

    fn sample(&mut self, batch_size: usize) -> Option<SampleBatch> {
        let ids = match self.ids() {
            Ok(ids) => ids,
            Err(e) => {
                warn!("remote replay sample failed: {e:#}");
                return None;
            }
        };
        let priorities = match self.priorities_for(&ids) {
            Ok(p) => p,
            Err(e) => {
                warn!("remote replay sample failed: {e:#}");
                return None;
            }
        };

        let (indices, weights) = self.sampler.draw(&priorities, batch_size)?;
        let mut experiences = Vec::with_capacity(indices.len());
        for &i in &indices {
            match self.load(&ids[i]) {
                Ok(Some(exp)) => experiences.push(exp),
                Ok(None) => {
                    warn!("experience {} missing from redis", ids[i]);
                    return None;
                }
                Err(e) => {
                    warn!("remote replay load failed: {e:#}");
                    return None;
                }
            }
        }
        Some(SampleBatch {
            experiences,
            indices,
            weights,
        })
    }

    fn update_priorities(&mut self, indices: &[usize], priorities: &[f64]) {
        let ids = match self.ids() {
            Ok(ids) => ids,
            Err(e) => {
                warn!("remote replay update_priorities failed: {e:#}");
                return;
            }
        };
        for (&index, &priority) in indices.iter().zip(priorities) {
            let Some(id) = ids.get(index) else {
                continue;
            };
            let clamped = priority.max(MIN_PRIORITY);
            if let Err(e) = self
                .conn
                .lock()
                .zadd::<_, _, _, ()>(self.prio_key(), id.as_str(), clamped)
            {
                warn!("remote replay priority write failed: {e:#}");
            }
        }
    }

    fn get(&mut self, experience_id: &str) -> Option<Experience> {
        self.load(experience_id).ok().flatten()
    }

    fn update(&mut self, exp: Experience) -> bool {
        match self.load(&exp.experience_id) {
            Ok(Some(_)) => {
                let priority = exp.priority().unwrap_or(1.0).max(MIN_PRIORITY);
                match self.store(&exp, priority) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("remote replay update failed: {e:#}");
                        false
                    }
                }
            }
            _ => false,
        }
    }

    fn len(&self) -> usize {
        self.conn
            .lock()
            .llen::<_, usize>(self.ids_key())
            .unwrap_or(0)
    }

    fn stats(&mut self) -> BufferStats {
        let ids = self.ids().unwrap_or_default();
        let size = ids.len();

        // Bounded scan: over the limit, read a uniform sub-sample and scale.
        let (scan_ids, approximate) = if size > STATS_SCAN_LIMIT {
            let mut picked = Vec::with_capacity(STATS_SCAN_LIMIT);
            for _ in 0..STATS_SCAN_LIMIT {
                picked.push(ids[self.sampler.rng.gen_range(0..size)].clone());
            }
            (picked, true)
        } else {
            (ids, false)
        };

        let mut entries: Vec<(String, Option<f64>)> = Vec::with_capacity(scan_ids.len());
        for id in &scan_ids {
            if let Ok(Some(exp)) = self.load(id) {
                entries.push((exp.agent_id, exp.reward));
            }
        }

        let mut stats = compute_stats(
            entries.iter().map(|(a, r)| (a.as_str(), *r)),
            size,
            self.capacity,
            self.sampler.beta,
            approximate,
        );

        if approximate && !entries.is_empty() {
            let scale = size as f64 / entries.len() as f64;
            for count in stats.per_agent.values_mut() {
                *count = (*count as f64 * scale).round() as usize;
            }
        }
        stats
    }
}
