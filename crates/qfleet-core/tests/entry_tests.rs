//! Q-entry statistics, trajectory retention and feature canonicalization

use chrono::{Duration, Utc};

use qfleet_core::entry::{confidence_score, CONFIDENCE_VISIT_SATURATION};
use qfleet_core::{ExecutionMetadata, FeatureValue, QEntry, StateFeatures, StateFingerprint, Trajectory};

fn entry() -> QEntry {
    QEntry::new("test-generator", StateFingerprint::from_raw("abc123"), "generate_unit")
}

#[test]
fn test_bellman_step_moves_towards_target() {
    let mut entry = entry();
    assert_eq!(entry.apply_bellman(10.0, 0.5), 5.0);
    assert_eq!(entry.apply_bellman(10.0, 0.5), 7.5);
    assert_eq!(entry.visit_count, 2);
}

#[test]
fn test_target_variance_matches_sample_variance() {
    let mut entry = entry();
    for target in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
        entry.observe(target);
    }
    assert_eq!(entry.visit_count, 8);
    assert!((entry.target_mean - 5.0).abs() < 1e-12);
    assert!((entry.variance() - 32.0 / 7.0).abs() < 1e-12);
}

#[test]
fn test_confidence_grows_with_consistent_visits() {
    let mut entry = entry();
    entry.observe(3.0);
    let early = entry.confidence;
    for _ in 0..20 {
        entry.observe(3.0);
    }
    assert!(entry.confidence > early);
    assert!(entry.confidence <= 1.0);

    assert_eq!(confidence_score(CONFIDENCE_VISIT_SATURATION * 5, 0.0), 1.0);
    assert!(confidence_score(10, 25.0) < confidence_score(10, 0.5));
}

#[test]
fn test_persisted_entry_keeps_variance() {
    let mut original = entry();
    for target in [1.0, 3.0, 8.0] {
        original.apply_bellman(target, 0.1);
    }

    let restored = QEntry::from_persisted(
        original.agent_kind.clone(),
        original.state_hash.clone(),
        original.action.clone(),
        original.q_value,
        original.visit_count,
        original.variance(),
        4,
    );
    assert_eq!(restored.key(), original.key());
    assert_eq!(restored.version, 4);
    assert!((restored.variance() - original.variance()).abs() < 1e-9);
    assert!((restored.confidence - original.confidence).abs() < 1e-9);
}

#[test]
fn test_trajectory_expiry() {
    let trajectory = Trajectory::new(
        "coverage-analyzer",
        StateFingerprint::from_raw("s0"),
        "scan_modules",
        12.0,
        None,
        ExecutionMetadata::succeeded(1.5),
        Duration::days(30),
    );

    assert!(!trajectory.is_expired_at(Utc::now()));
    assert!(trajectory.is_expired_at(Utc::now() + Duration::days(31)));
}

#[test]
fn test_canonical_json_ignores_insertion_order() {
    let a = StateFeatures::new()
        .with("framework", FeatureValue::Label("jest".into()))
        .with("coverage_gap", FeatureValue::Bucket(4));
    let b = StateFeatures::new()
        .with("coverage_gap", FeatureValue::Bucket(4))
        .with("framework", FeatureValue::Label("jest".into()));

    assert_eq!(a.canonical_json(), b.canonical_json());
    assert_eq!(a.canonical_json(), r#"{"coverage_gap":4,"framework":"jest"}"#);
}
