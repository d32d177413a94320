//! File-backed replay backend.
//!
//! One JSON file per experience, named
//! `YYYYMMDD_HHMMSS_<agent>_<experience_id>.json` so a directory listing
//! sorts oldest first. The in-memory index holds paths and priorities in
//! parallel; startup rescans the directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

use super::{
    compute_stats, entry_priority, BufferStats, Experience, ReplayBuffer, SampleBatch, Sampler,
    MIN_PRIORITY,
};
use crate::config::ReplayConfig;

struct FileEntry {
    path: PathBuf,
    experience_id: String,
    agent_id: String,
    reward: Option<f64>,
}

pub struct FileReplayBuffer {
    dir: PathBuf,
    capacity: usize,
    entries: Vec<FileEntry>,
    priorities: Vec<f64>,
    sampler: Sampler,
}

impl FileReplayBuffer {
    /// Open the buffer directory, creating it if needed, and rebuild the
    /// index from existing files (oldest first by name).
    pub fn open(cfg: &ReplayConfig) -> Result<Self> {
        let dir = cfg.file.save_dir.clone();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create replay dir {}", dir.display()))?;

        let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|x| x.to_str()) == Some("json"))
            .collect();
        paths.sort();

        let mut entries = Vec::new();
        let mut priorities = Vec::new();
        for path in paths {
            match read_experience(&path) {
                Ok(exp) => {
                    priorities.push(exp.priority().unwrap_or(1.0).max(MIN_PRIORITY));
                    entries.push(FileEntry {
                        path,
                        experience_id: exp.experience_id,
                        agent_id: exp.agent_id,
                        reward: exp.reward,
                    });
                }
                Err(e) => warn!("skipping unreadable experience {}: {e:#}", path.display()),
            }
        }

        Ok(Self {
            dir,
            capacity: cfg.capacity.max(1),
            entries,
            priorities,
            sampler: Sampler::new(cfg),
        })
    }

    fn file_name(exp: &Experience) -> String {
        format!(
            "{}_{}_{}.json",
            exp.created_at.format("%Y%m%d_%H%M%S"),
            exp.agent_id,
            exp.experience_id
        )
    }

    fn write(&self, path: &Path, exp: &Experience) -> Result<()> {
        std::fs::write(path, serde_json::to_vec_pretty(exp)?)
            .with_context(|| format!("failed to write experience {}", path.display()))?;
        Ok(())
    }

    fn position(&self, experience_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.experience_id == experience_id)
    }
}

fn read_experience(path: &Path) -> Result<Experience> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

impl ReplayBuffer for FileReplayBuffer {
    fn add(&mut self, mut exp: Experience) -> bool {
        let priority = entry_priority(&exp, &self.priorities);
        exp.set_priority(priority);

        let path = self.dir.join(Self::file_name(&exp));
        if let Err(e) = self.write(&path, &exp) {
            warn!("dropping experience {}: {e:#}", exp.experience_id);
            return false;
        }

        if self.entries.len() >= self.capacity {
            let oldest = self.entries.remove(0);
            self.priorities.remove(0);
            std::fs::remove_file(&oldest.path).ok();
        }

        self.entries.push(FileEntry {
            path,
            experience_id: exp.experience_id,
            agent_id: exp.agent_id,
            reward: exp.reward,
        });
        self.priorities.push(priority);
        true
    }

    fn sample(&mut self, batch_size: usize) -> Option<SampleBatch> {
        let (indices, weights) = self.sampler.draw(&self.priorities, batch_size)?;
        let mut experiences = Vec::with_capacity(indices.len());
        for &i in &indices {
            match read_experience(&self.entries[i].path) {
                Ok(exp) => experiences.push(exp),
                Err(e) => {
                    warn!(
                        "failed to load experience {}: {e:#}",
                        self.entries[i].path.display()
                    );
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
        for (&index, &priority) in indices.iter().zip(priorities) {
            let Some(slot) = self.priorities.get_mut(index) else {
                continue;
            };
            let clamped = priority.max(MIN_PRIORITY);
            *slot = clamped;

            // Keep the on-disk copy in sync with the index.
            let path = self.entries[index].path.clone();
            if let Ok(mut exp) = read_experience(&path) {
                exp.set_priority(clamped);
                if let Err(e) = self.write(&path, &exp) {
                    warn!("failed to rewrite {}: {e:#}", path.display());
                }
            }
        }
    }

    fn get(&mut self, experience_id: &str) -> Option<Experience> {
        let index = self.position(experience_id)?;
        read_experience(&self.entries[index].path).ok()
    }

    fn update(&mut self, exp: Experience) -> bool {
        let Some(index) = self.position(&exp.experience_id) else {
            return false;
        };
        let priority = exp.priority().unwrap_or(self.priorities[index]).max(MIN_PRIORITY);
        self.priorities[index] = priority;
        self.entries[index].reward = exp.reward;

        let path = self.entries[index].path.clone();
        if let Err(e) = self.write(&path, &exp) {
            warn!("failed to rewrite {}: {e:#}", path.display());
            return false;
        }
        true
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn stats(&mut self) -> BufferStats {
        compute_stats(
            self.entries.iter().map(|e| (e.agent_id.as_str(), e.reward)),
            self.entries.len(),
            self.capacity,
            self.sampler.beta,
            false,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path, capacity: usize) -> ReplayConfig {
        let mut cfg = ReplayConfig {
            capacity,
            seed: Some(9),
            ..Default::default()
        };
        cfg.file.save_dir = dir.to_path_buf();
        cfg
    }

    #[test]
    fn test_add_writes_one_file_per_experience() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = FileReplayBuffer::open(&config(dir.path(), 10)).unwrap();

        buf.add(Experience::new("a1").with_id("e1"));
        buf.add(Experience::new("a2").with_id("e2"));

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 2);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_eviction_deletes_oldest_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = FileReplayBuffer::open(&config(dir.path(), 2)).unwrap();

        buf.add(Experience::new("a1").with_id("e1"));
        buf.add(Experience::new("a1").with_id("e2"));
        buf.add(Experience::new("a1").with_id("e3"));

        assert_eq!(buf.len(), 2);
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 2);
        assert!(buf.get("e1").is_none());
        assert!(buf.get("e3").is_some());
    }

    #[test]
    fn test_rescan_restores_index() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut buf = FileReplayBuffer::open(&config(dir.path(), 10)).unwrap();
            buf.add(Experience::new("a1").with_id("e1").with_priority(2.0).with_reward(0.5));
        }

        let mut restored = FileReplayBuffer::open(&config(dir.path(), 10)).unwrap();
        assert_eq!(restored.len(), 1);
        let exp = restored.get("e1").unwrap();
        assert_eq!(exp.priority(), Some(2.0));
        assert_eq!(exp.reward, Some(0.5));
    }

    #[test]
    fn test_update_priorities_rewrites_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = FileReplayBuffer::open(&config(dir.path(), 10)).unwrap();
        buf.add(Experience::new("a1").with_id("e1").with_priority(1.0));

        buf.update_priorities(&[0], &[-3.0]);
        assert_eq!(buf.priorities[0], MIN_PRIORITY);

        // The clamped priority survives a rescan.
        let mut restored = FileReplayBuffer::open(&config(dir.path(), 10)).unwrap();
        assert_eq!(restored.get("e1").unwrap().priority(), Some(MIN_PRIORITY));
    }

    #[test]
    fn test_sample_loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = FileReplayBuffer::open(&config(dir.path(), 10)).unwrap();
        for i in 0..3 {
            buf.add(Experience::new("a1").with_id(&format!("e{i}")));
        }

        let batch = buf.sample(2).unwrap();
        assert_eq!(batch.experiences.len(), 2);
        assert!(batch.experiences.iter().all(|e| e.agent_id == "a1"));
    }
}
