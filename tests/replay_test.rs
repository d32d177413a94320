//! Replay Buffer Integration Tests
//!
//! Exercises the factory, the prioritized-sampling contract, and the file
//! backend's persistence across reopen.

use corehub::config::ReplayConfig;
use corehub::{create_replay_buffer, ConfigTree, Experience};
use serde_json::json;

fn memory_config(capacity: usize, seed: u64) -> ReplayConfig {
    ConfigTree::from_value(json!({
        "replay_buffer": {
            "type": "memory",
            "capacity": capacity,
            "alpha": 0.6,
            "beta": 0.4,
            "beta_increment": 0.1,
            "seed": seed,
        }
    }))
    .replay_buffer()
}

#[test]
fn test_factory_rejects_unknown_backend() {
    let cfg = ConfigTree::from_value(json!({
        "replay_buffer": { "type": "quantum" }
    }))
    .replay_buffer();
    assert!(create_replay_buffer(&cfg).is_err());
}

#[test]
fn test_sample_soundness() {
    let mut buf = create_replay_buffer(&memory_config(100, 5)).unwrap();
    for i in 0..7 {
        buf.add(Experience::new("a1").with_id(&format!("e{i}")));
    }

    // Exactly min(k, len) experiences come back.
    let batch = buf.sample(3).unwrap();
    assert_eq!(batch.experiences.len(), 3);
    let batch = buf.sample(50).unwrap();
    assert_eq!(batch.experiences.len(), 7);

    // Weights are in (0, 1] and normalized to max 1.
    for batch in [buf.sample(4).unwrap(), buf.sample(7).unwrap()] {
        let max = batch.weights.iter().cloned().fold(f64::MIN, f64::max);
        assert!((max - 1.0).abs() < 1e-12);
        assert!(batch.weights.iter().all(|&w| w > 0.0 && w <= 1.0));
    }

    // Beta rises monotonically and saturates at 1.
    let mut last = 0.0;
    for _ in 0..20 {
        buf.sample(1).unwrap();
        let beta = buf.stats().beta;
        assert!(beta >= last);
        assert!(beta <= 1.0);
        last = beta;
    }
}

#[test]
fn test_prioritized_sampling_ratio() {
    // Capacity 3, alpha 0.6, beta 0.4, increment 0.1, fixed seed.
    let mut buf = create_replay_buffer(&memory_config(3, 99)).unwrap();
    buf.add(Experience::new("a1").with_id("p1").with_priority(1.0));
    buf.add(Experience::new("a1").with_id("p2").with_priority(2.0));
    buf.add(Experience::new("a1").with_id("p4").with_priority(4.0));

    let mut counts = [0usize; 3];
    for _ in 0..1000 {
        let batch = buf.sample(2).unwrap();
        for &i in &batch.indices {
            counts[i] += 1;
        }
    }

    // Expected frequency ratio is (4/1)^0.6, about 2.3.
    let ratio = counts[2] as f64 / counts[0] as f64;
    assert!(ratio > 2.0, "ratio {ratio} below expected bias, counts {counts:?}");
}

#[test]
fn test_priority_clamp_property() {
    let mut buf = create_replay_buffer(&memory_config(10, 3)).unwrap();
    for i in 0..4 {
        buf.add(Experience::new("a1").with_id(&format!("e{i}")).with_priority(1.0));
    }

    buf.update_priorities(&[0, 1, 2, 3], &[-1.0, 0.0, 1e-12, 5.0]);
    let batch = buf.sample(4).unwrap();

    // Sampling still works and every drawn weight is finite, which requires
    // every stored priority to be at least the clamp floor.
    assert!(batch.weights.iter().all(|w| w.is_finite() && *w > 0.0));
}

#[test]
fn test_fifo_eviction_keeps_newest() {
    let mut buf = create_replay_buffer(&memory_config(2, 1)).unwrap();
    buf.add(Experience::new("a1").with_id("first"));
    buf.add(Experience::new("a1").with_id("second"));
    buf.add(Experience::new("a1").with_id("third"));

    assert_eq!(buf.len(), 2);
    assert!(buf.get("first").is_none());
    assert!(buf.get("second").is_some());
    assert!(buf.get("third").is_some());
}

#[test]
fn test_file_backend_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = ConfigTree::from_value(json!({
        "replay_buffer": {
            "type": "file",
            "capacity": 10,
            "seed": 4,
            "file": { "save_dir": dir.path().join("exp").to_str().unwrap() },
        }
    }))
    .replay_buffer();

    {
        let mut buf = create_replay_buffer(&cfg).unwrap();
        let mut action = serde_json::Map::new();
        action.insert("capability".into(), json!("V"));
        buf.add(
            Experience::new("a1")
                .with_id("e1")
                .with_action(action)
                .with_reward(0.5)
                .with_priority(1.5),
        );
        buf.add(Experience::new("b1").with_id("e2"));
    }

    let mut buf = create_replay_buffer(&cfg).unwrap();
    assert_eq!(buf.len(), 2);

    let exp = buf.get("e1").unwrap();
    assert_eq!(exp.agent_id, "a1");
    assert_eq!(exp.reward, Some(0.5));
    assert_eq!(exp.priority(), Some(1.5));
    assert_eq!(exp.action["capability"], json!("V"));

    let stats = buf.stats();
    assert_eq!(stats.size, 2);
    assert_eq!(stats.per_agent["a1"], 1);
    assert_eq!(stats.per_agent["b1"], 1);
}

#[test]
fn test_update_rewrites_reward_in_place() {
    let mut buf = create_replay_buffer(&memory_config(10, 8)).unwrap();
    buf.add(Experience::new("a1").with_id("assist").with_reward(0.5));

    let mut exp = buf.get("assist").unwrap();
    exp.reward = Some(1.0);
    assert!(buf.update(exp));

    assert_eq!(buf.get("assist").unwrap().reward, Some(1.0));
    assert_eq!(buf.len(), 1);
}
