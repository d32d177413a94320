//! In-memory replay backend: parallel arrays of experiences and priorities.

use super::{
    compute_stats, entry_priority, BufferStats, Experience, ReplayBuffer, SampleBatch, Sampler,
    MIN_PRIORITY,
};
use crate::config::ReplayConfig;

pub struct MemoryReplayBuffer {
    capacity: usize,
    experiences: Vec<Experience>,
    priorities: Vec<f64>,
    sampler: Sampler,
}

impl MemoryReplayBuffer {
    pub fn new(cfg: &ReplayConfig) -> Self {
        Self {
            capacity: cfg.capacity.max(1),
            experiences: Vec::new(),
            priorities: Vec::new(),
            sampler: Sampler::new(cfg),
        }
    }
}

impl ReplayBuffer for MemoryReplayBuffer {
    fn add(&mut self, mut exp: Experience) -> bool {
        let priority = entry_priority(&exp, &self.priorities);
        exp.set_priority(priority);

        if self.experiences.len() >= self.capacity {
            self.experiences.remove(0);
            self.priorities.remove(0);
        }
        self.experiences.push(exp);
        self.priorities.push(priority);
        true
    }

    fn sample(&mut self, batch_size: usize) -> Option<SampleBatch> {
        let (indices, weights) = self.sampler.draw(&self.priorities, batch_size)?;
        let experiences = indices
            .iter()
            .map(|&i| self.experiences[i].clone())
            .collect();
        Some(SampleBatch {
            experiences,
            indices,
            weights,
        })
    }

    fn update_priorities(&mut self, indices: &[usize], priorities: &[f64]) {
        for (&index, &priority) in indices.iter().zip(priorities) {
            if let Some(slot) = self.priorities.get_mut(index) {
                let clamped = priority.max(MIN_PRIORITY);
                *slot = clamped;
                self.experiences[index].set_priority(clamped);
            }
        }
    }

    fn get(&mut self, experience_id: &str) -> Option<Experience> {
        self.experiences
            .iter()
            .find(|e| e.experience_id == experience_id)
            .cloned()
    }

    fn update(&mut self, exp: Experience) -> bool {
        let Some(index) = self
            .experiences
            .iter()
            .position(|e| e.experience_id == exp.experience_id)
        else {
            return false;
        };
        let priority = exp.priority().unwrap_or(self.priorities[index]);
        self.priorities[index] = priority.max(MIN_PRIORITY);
        self.experiences[index] = exp;
        true
    }

    fn len(&self) -> usize {
        self.experiences.len()
    }

    fn stats(&mut self) -> BufferStats {
        compute_stats(
            self.experiences
                .iter()
                .map(|e| (e.agent_id.as_str(), e.reward)),
            self.experiences.len(),
            self.capacity,
            self.sampler.beta,
            false,
        )
    }
}
