//! Integration tests for the learning core
//!
//! These tests drive learners, the registry and the in-memory store together.

#![allow(clippy::float_cmp)]
#![allow(clippy::cast_precision_loss)]

use std::sync::Arc;

use serde_json::json;

use qfleet_core::{ActionId, ExecutionMetadata, LearnerConfig, StateFingerprint};
use qfleet_rl::{LearnerRegistry, MemoryStore, QLearner, QValueStore, StateEncoder};

fn fp(s: &str) -> StateFingerprint {
    StateFingerprint::from_raw(s)
}

fn actions(names: &[&str]) -> Vec<ActionId> {
    names.iter().map(|s| (*s).to_string()).collect()
}

/// Two-step chain: s0 --good--> s1 --good--> end (+10), `bad` ends early
fn chain_step(state: &str, action: &str) -> (f64, Option<&'static str>) {
    match (state, action) {
        ("s0", "good") => (0.0, Some("s1")),
        ("s0", _) => (-1.0, None),
        ("s1", "good") => (10.0, None),
        _ => (0.0, None),
    }
}

#[tokio::test]
async fn test_converges_on_deterministic_chain() {
    let config = LearnerConfig::default()
        .with_learning_rate(0.1)
        .with_discount(0.95)
        .with_epsilon(1.0, 1.0, 1.0);
    let learner = QLearner::new("test-generator", config).unwrap().with_seed(42);
    let space = actions(&["good", "bad"]);

    for _ in 0..2000 {
        let mut state = "s0";
        loop {
            let action = learner.select_action(&fp(state), &space).await.unwrap();
            let (reward, next) = chain_step(state, &action);
            match next {
                Some(next_state) => {
                    learner
                        .update(&fp(state), &action, reward, Some(&fp(next_state)), &space)
                        .await
                        .unwrap();
                    state = next_state;
                }
                None => {
                    learner.update(&fp(state), &action, reward, None, &[]).await.unwrap();
                    break;
                }
            }
        }
    }

    let s1 = learner.values_for(&fp("s1"), &space).await.unwrap();
    let s0 = learner.values_for(&fp("s0"), &space).await.unwrap();
    assert!((s1[0] - 10.0).abs() < 0.05, "Q(s1, good) = {}", s1[0]);
    assert!(s1[1].abs() < 0.05);
    assert!((s0[0] - 9.5).abs() < 0.05, "Q(s0, good) = {}", s0[0]);
    assert!((s0[1] + 1.0).abs() < 0.05);
}

/// Run one episode of the chain, returning the number of updates applied
async fn run_chain_episode(learner: &QLearner, space: &[ActionId]) -> usize {
    let mut state = "s0";
    let mut steps = 0;
    loop {
        let action = learner.select_action(&fp(state), space).await.unwrap();
        let (reward, next) = chain_step(state, &action);
        steps += 1;
        match next {
            Some(next_state) => {
                learner
                    .update(&fp(state), &action, reward, Some(&fp(next_state)), space)
                    .await
                    .unwrap();
                state = next_state;
            }
            None => {
                learner.update(&fp(state), &action, reward, None, &[]).await.unwrap();
                return steps;
            }
        }
    }
}

#[tokio::test]
async fn test_policy_converges_as_epsilon_decays() {
    let min_epsilon = 0.05;
    let config = LearnerConfig::default()
        .with_learning_rate(0.1)
        .with_discount(0.95)
        .with_epsilon(1.0, min_epsilon, 0.995);
    let learner = QLearner::new("test-generator", config).unwrap().with_seed(7);
    let space = actions(&["bad", "good"]);

    let mut updates = 0;
    for _ in 0..3000 {
        updates += run_chain_episode(&learner, &space).await;
    }
    assert!(updates >= 3000);
    assert!((learner.epsilon().await - min_epsilon).abs() < 1e-12);

    let s0 = learner.values_for(&fp("s0"), &space).await.unwrap();
    let s1 = learner.values_for(&fp("s1"), &space).await.unwrap();
    assert!((s1[1] - 10.0).abs() < 0.1, "Q(s1, good) = {}", s1[1]);
    assert!((s0[1] - 9.5).abs() < 0.1, "Q(s0, good) = {}", s0[1]);
    assert!(s0[1] > s0[0] && s1[1] > s1[0]);

    // At the exploration floor the policy follows the optimal path
    for state in ["s0", "s1"] {
        let mut good = 0;
        for _ in 0..200 {
            if learner.select_action(&fp(state), &space).await.unwrap() == "good" {
                good += 1;
            }
        }
        assert!(good >= 180, "{state}: picked good {good}/200 times");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_match_serial_reference() {
    let config = LearnerConfig::greedy().with_flush_interval(10_000);
    let shared = Arc::new(QLearner::new("test-generator", config.clone()).unwrap());

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let learner = shared.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    learner.update(&fp("s"), "a", 1.0, None, &[]).await.unwrap();
                }
            })
        })
        .collect();
    for result in futures::future::join_all(tasks).await {
        result.unwrap();
    }

    let serial = QLearner::new("test-generator", config).unwrap();
    for _ in 0..400 {
        serial.update(&fp("s"), "a", 1.0, None, &[]).await.unwrap();
    }

    let concurrent = shared.entry(&fp("s"), "a").await.unwrap();
    let reference = serial.entry(&fp("s"), "a").await.unwrap();
    assert_eq!(concurrent.visit_count, 400);
    assert!((concurrent.q_value - reference.q_value).abs() < 1e-12);
    assert_eq!(shared.stats().await.total_updates, 400);
    assert_eq!(shared.epsilon().await, 0.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_instances_do_not_lose_visits() {
    let store = Arc::new(MemoryStore::new());
    let config = LearnerConfig::greedy().with_flush_interval(10_000);
    let a = QLearner::new("test-generator", config.clone()).unwrap().with_store(store.clone());
    let b = QLearner::new("test-generator", config).unwrap().with_store(store.clone());

    for _ in 0..30 {
        a.update(&fp("s"), "a", 1.0, None, &[]).await.unwrap();
    }
    for _ in 0..20 {
        b.update(&fp("s"), "a", 2.0, None, &[]).await.unwrap();
    }

    let (ra, rb) = tokio::join!(a.flush(), b.flush());
    assert_eq!(ra.unwrap().written, 1);
    assert_eq!(rb.unwrap().written, 1);

    let rows = store
        .get_entries("test-generator", &fp("s"), &actions(&["a"]))
        .await
        .unwrap();
    assert_eq!(rows["a"].visit_count, 50);
    assert_eq!(rows["a"].version, 2);
}

#[tokio::test]
async fn test_flush_without_changes_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let learner = QLearner::new("test-generator", LearnerConfig::greedy())
        .unwrap()
        .with_store(store.clone());

    learner.update(&fp("s"), "a", 4.0, None, &[]).await.unwrap();
    assert_eq!(learner.flush().await.unwrap().written, 1);
    let first = store.get("test-generator", &fp("s"), "a").await.unwrap();

    assert_eq!(learner.flush().await.unwrap().written, 0);
    let second = store.get("test-generator", &fp("s"), "a").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(store.row_count().await, 1);
}

#[tokio::test]
async fn test_cold_start_selects_first_action() {
    let store = Arc::new(MemoryStore::new());
    let learner = QLearner::new("coverage-analyzer", LearnerConfig::greedy())
        .unwrap()
        .with_store(store);

    let space = actions(&["scan_critical", "scan_all", "skip"]);
    for _ in 0..5 {
        assert_eq!(learner.select_action(&fp("new"), &space).await.unwrap(), "scan_critical");
    }
}

#[tokio::test]
async fn test_store_outage_for_100_cycles() {
    let store = Arc::new(MemoryStore::new());
    store.set_available(false);

    let registry = LearnerRegistry::new(LearnerConfig::default().with_flush_interval(10))
        .with_store(store.clone())
        .with_seed(3);
    let space = actions(&["generate_unit", "generate_integration", "generate_property"]);

    for i in 0..100 {
        let before = json!({"coverage": 40 + (i % 50), "framework": "jest"});
        let after = json!({"coverage": 41 + (i % 50), "framework": "jest"});
        let session = registry.begin("test-generator", &before, &space).await.unwrap();
        session
            .complete(&after, &space, ExecutionMetadata::succeeded(2.0))
            .await
            .unwrap();
    }

    let stats = registry.stats().await;
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].total_updates, 100);
    assert!(stats[0].dirty_entries > 0);
    assert_eq!(stats[0].pending_trajectories, 100);
    let health = stats[0].store.clone().unwrap();
    assert!(!health.available);
    assert!(health.consecutive_failures > 0);

    // Recovery: the next flush writes everything kept in memory
    store.set_available(true);
    let reports = registry.flush_all().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].1.trajectories, 100);
    assert_eq!(store.trajectory_count().await, 100);
    assert!(store.row_count().await > 0);

    let stats = registry.stats().await;
    assert_eq!(stats[0].dirty_entries, 0);
    assert!(stats[0].store.as_ref().unwrap().available);
}

#[tokio::test]
async fn test_knowledge_is_shared_across_instances() {
    let store = Arc::new(MemoryStore::new());
    let space = actions(&["retry_isolated", "quarantine", "bisect"]);

    let first = QLearner::new("flaky-test-hunter", LearnerConfig::greedy())
        .unwrap()
        .with_store(store.clone());
    for _ in 0..50 {
        first.update(&fp("suite"), "bisect", 20.0, None, &[]).await.unwrap();
    }
    first.flush().await.unwrap();

    // A fresh instance has an empty table and learns from the store
    let second = QLearner::new("flaky-test-hunter", LearnerConfig::greedy())
        .unwrap()
        .with_store(store.clone());
    assert_eq!(second.stats().await.table_size, 0);
    assert_eq!(second.select_action(&fp("suite"), &space).await.unwrap(), "bisect");

    let loaded = second.entry(&fp("suite"), "bisect").await.unwrap();
    assert_eq!(loaded.visit_count, 50);

    // Continuing from the loaded value, not from zero
    let outcome = second.update(&fp("suite"), "bisect", 20.0, None, &[]).await.unwrap();
    assert!(outcome.new_value > loaded.q_value);
}

#[tokio::test]
async fn test_trajectory_retention() {
    let store = Arc::new(MemoryStore::new());
    let registry = LearnerRegistry::new(LearnerConfig::greedy())
        .with_store(store.clone())
        .with_trajectory_ttl_days(30);

    let space = actions(&["scan"]);
    let session = registry
        .begin("coverage-analyzer", &json!({"coverage": 55, "language": "rust"}), &space)
        .await
        .unwrap();
    session
        .complete(&json!({"coverage": 60}), &[], ExecutionMetadata::succeeded(1.0))
        .await
        .unwrap();
    registry.flush_all().await;
    assert_eq!(store.trajectory_count().await, 1);

    // Fresh trajectories survive cleanup
    assert_eq!(registry.cleanup_trajectories().await.unwrap(), 0);
    assert_eq!(store.trajectory_count().await, 1);
}

#[test]
fn test_encoding_is_stable_under_key_order() {
    let encoder = StateEncoder::new();
    let a: serde_json::Value =
        serde_json::from_str(r#"{"coverage": 61.5, "framework": "Jest", "complexity": 0.42}"#).unwrap();
    let b: serde_json::Value =
        serde_json::from_str(r#"{"complexity": 0.42, "framework": "jest", "coverage": 61.5}"#).unwrap();

    let ea = encoder.encode("test-generator", &a).unwrap();
    let eb = encoder.encode("test-generator", &b).unwrap();
    assert_eq!(ea.fingerprint, eb.fingerprint);
    assert_eq!(ea.fingerprint.as_str().len(), 64);
}
