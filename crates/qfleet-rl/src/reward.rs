//! Multi-objective reward function
//!
//! Scores a `(before, action, after, metadata)` transition as a weighted sum
//! of five sub-rewards plus a failure penalty and a terminal bonus, clamped to
//! a symmetric bound so Bellman updates stay numerically stable.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use qfleet_core::{ExecutionMetadata, RewardWeights};

use crate::state::agent_kinds;

/// Bound applied to every sub-reward before weighting
const SUB_REWARD_BOUND: f64 = 100.0;

/// Coverage gain per percentage point
const COVERAGE_SCALE: f64 = 10.0;

/// Quality gain per unit of a 0..1 quality score
const QUALITY_SCALE: f64 = 100.0;

/// Efficiency sub-rewards per unit of `expected / actual - 1`
const EFFICIENCY_SCALE: f64 = 50.0;

/// Magnitude of the reused-pattern sub-reward
const PATTERN_REWARD: f64 = 50.0;

/// Default upper bound for agent-kind adjustments
pub const DEFAULT_ADJUSTMENT_BOUND: f64 = 10.0;

/// Agent-kind specific bonus/penalty term added on top of the base reward
pub trait RewardAdjuster: Send + Sync {
    fn adjust(&self, before: &Value, action: &str, after: &Value, metadata: &ExecutionMetadata) -> f64;

    /// Absolute bound on the adjustment
    fn bound(&self) -> f64 {
        DEFAULT_ADJUSTMENT_BOUND
    }
}

/// F1 of reported precision/recall, centred on 0.5
pub struct DetectionQualityAdjuster;

impl RewardAdjuster for DetectionQualityAdjuster {
    fn adjust(&self, _: &Value, _: &str, _: &Value, metadata: &ExecutionMetadata) -> f64 {
        let (Some(precision), Some(recall)) =
            (metadata.signal_f64("precision"), metadata.signal_f64("recall"))
        else {
            return 0.0;
        };
        if precision + recall <= 0.0 {
            return -self.bound();
        }
        let f1 = 2.0 * precision * recall / (precision + recall);
        (f1 - 0.5) * 20.0
    }
}

/// Rewards measured latency improvements reported by the performance tester
pub struct LatencyImprovementAdjuster;

impl RewardAdjuster for LatencyImprovementAdjuster {
    fn adjust(&self, _: &Value, _: &str, _: &Value, metadata: &ExecutionMetadata) -> f64 {
        metadata
            .signal_f64("latency_improvement_pct")
            .map_or(0.0, |pct| pct * 0.2)
    }
}

/// Individual terms of one reward computation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RewardBreakdown {
    pub coverage: f64,
    pub quality: f64,
    pub time: f64,
    pub pattern: f64,
    pub cost: f64,
    pub failure_penalty: f64,
    pub terminal_bonus: f64,
    pub adjustment: f64,
    pub total: f64,
}

/// Pure reward function for one agent kind
#[derive(Clone)]
pub struct RewardCalculator {
    weights: RewardWeights,
    adjuster: Option<Arc<dyn RewardAdjuster>>,
}

impl RewardCalculator {
    pub fn new(weights: RewardWeights) -> Self {
        Self {
            weights,
            adjuster: None,
        }
    }

    /// Calculator with the built-in adjuster for `agent_kind`, if any
    pub fn for_agent_kind(agent_kind: &str, weights: RewardWeights) -> Self {
        let calculator = Self::new(weights);
        match agent_kind.trim().to_lowercase().as_str() {
            agent_kinds::FLAKY_TEST_HUNTER => calculator.with_adjuster(DetectionQualityAdjuster),
            agent_kinds::PERFORMANCE_TESTER => calculator.with_adjuster(LatencyImprovementAdjuster),
            _ => calculator,
        }
    }

    pub fn with_adjuster(mut self, adjuster: impl RewardAdjuster + 'static) -> Self {
        self.adjuster = Some(Arc::new(adjuster));
        self
    }

    pub fn weights(&self) -> &RewardWeights {
        &self.weights
    }

    /// Scalar reward in `[-max_abs_reward, max_abs_reward]`
    pub fn score(&self, before: &Value, action: &str, after: &Value, metadata: &ExecutionMetadata) -> f64 {
        self.breakdown(before, action, after, metadata).total
    }

    pub fn breakdown(
        &self,
        before: &Value,
        action: &str,
        after: &Value,
        metadata: &ExecutionMetadata,
    ) -> RewardBreakdown {
        let w = &self.weights;

        let coverage = delta(before, after, "coverage").map_or(0.0, |d| bounded(d * COVERAGE_SCALE));
        let quality = delta(before, after, "quality_score").map_or(0.0, |d| bounded(d * QUALITY_SCALE));
        let time = efficiency(metadata.expected_duration_seconds, metadata.duration_seconds);
        let cost = efficiency(metadata.expected_cost, metadata.cost);
        let pattern = if metadata.pattern_reused {
            match metadata.pattern_confirmed {
                Some(true) => PATTERN_REWARD,
                Some(false) => -PATTERN_REWARD,
                None => 0.0,
            }
        } else {
            0.0
        };

        let failure_penalty = if metadata.task_failed() { -w.failure_penalty } else { 0.0 };
        let terminal_bonus = if reached_terminal(after, w.terminal_threshold) {
            w.terminal_bonus
        } else {
            0.0
        };

        let adjustment = self.adjuster.as_ref().map_or(0.0, |adjuster| {
            let bound = adjuster.bound().abs();
            finite_or_zero(adjuster.adjust(before, action, after, metadata)).clamp(-bound, bound)
        });

        let raw = w.coverage * coverage
            + w.quality * quality
            + w.time * time
            + w.pattern * pattern
            + w.cost * cost
            + failure_penalty
            + terminal_bonus
            + adjustment;

        RewardBreakdown {
            coverage,
            quality,
            time,
            pattern,
            cost,
            failure_penalty,
            terminal_bonus,
            adjustment,
            total: finite_or_zero(raw).clamp(-w.max_abs_reward, w.max_abs_reward),
        }
    }
}

impl Default for RewardCalculator {
    fn default() -> Self {
        Self::new(RewardWeights::default())
    }
}

fn metric(state: &Value, key: &str) -> Option<f64> {
    state.get(key).and_then(Value::as_f64).filter(|v| v.is_finite())
}

fn delta(before: &Value, after: &Value, key: &str) -> Option<f64> {
    Some(metric(after, key)? - metric(before, key)?)
}

fn bounded(value: f64) -> f64 {
    finite_or_zero(value).clamp(-SUB_REWARD_BOUND, SUB_REWARD_BOUND)
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// `(expected / actual - 1) * scale`; zero when either side is unknown
fn efficiency(expected: Option<f64>, actual: f64) -> f64 {
    match expected {
        Some(expected) if expected > 0.0 && actual > 0.0 => {
            bounded((expected / actual - 1.0) * EFFICIENCY_SCALE)
        }
        _ => 0.0,
    }
}

fn reached_terminal(after: &Value, threshold: f64) -> bool {
    let target = metric(after, "target_coverage").unwrap_or(100.0);
    metric(after, "coverage").is_some_and(|coverage| coverage >= threshold * target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_coverage_gain_is_weighted() {
        let calc = RewardCalculator::default();
        let reward = calc.score(
            &json!({"coverage": 60.0}),
            "generate_unit",
            &json!({"coverage": 65.0}),
            &ExecutionMetadata::succeeded(10.0),
        );
        // 5pp * 10 = 50 sub-reward, weighted 0.30
        assert!((reward - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_failure_penalty() {
        let calc = RewardCalculator::default();
        let reward = calc.score(
            &json!({"coverage": 60.0}),
            "generate_unit",
            &json!({"coverage": 60.0}),
            &ExecutionMetadata::failed(10.0),
        );
        assert!((reward + 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_terminal_bonus() {
        let calc = RewardCalculator::default();
        let breakdown = calc.breakdown(
            &json!({"coverage": 91.0}),
            "a",
            &json!({"coverage": 91.0}),
            &ExecutionMetadata::succeeded(1.0),
        );
        assert_eq!(breakdown.terminal_bonus, 20.0);

        let breakdown = calc.breakdown(
            &json!({}),
            "a",
            &json!({"coverage": 70.0, "target_coverage": 80.0}),
            &ExecutionMetadata::succeeded(1.0),
        );
        assert_eq!(breakdown.terminal_bonus, 0.0);
    }

    #[test]
    fn test_time_efficiency_can_be_negative() {
        let calc = RewardCalculator::default();
        let slow = calc.breakdown(
            &json!({}),
            "a",
            &json!({}),
            &ExecutionMetadata::succeeded(20.0).with_expected_duration(10.0),
        );
        assert!((slow.time + 25.0).abs() < 1e-9);

        let fast = calc.breakdown(
            &json!({}),
            "a",
            &json!({}),
            &ExecutionMetadata::succeeded(5.0).with_expected_duration(10.0),
        );
        assert!((fast.time - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_pattern_reuse() {
        let calc = RewardCalculator::default();
        let meta = ExecutionMetadata::succeeded(1.0);
        assert_eq!(calc.breakdown(&json!({}), "a", &json!({}), &meta).pattern, 0.0);
        assert_eq!(
            calc.breakdown(&json!({}), "a", &json!({}), &meta.clone().with_pattern(true)).pattern,
            50.0
        );
        assert_eq!(
            calc.breakdown(&json!({}), "a", &json!({}), &meta.with_pattern(false)).pattern,
            -50.0
        );
    }

    #[test]
    fn test_reward_is_clamped() {
        let calc = RewardCalculator::default();
        let huge = calc.score(
            &json!({"coverage": 0.0, "quality_score": 0.0}),
            "a",
            &json!({"coverage": 100.0, "quality_score": 1.0}),
            &ExecutionMetadata::succeeded(0.001)
                .with_expected_duration(1000.0)
                .with_cost(0.001, 1000.0)
                .with_pattern(true),
        );
        assert!(huge <= 100.0);

        let awful = calc.score(
            &json!({"coverage": 100.0, "quality_score": 1.0}),
            "a",
            &json!({"coverage": 0.0, "quality_score": 0.0}),
            &ExecutionMetadata::failed(1000.0)
                .with_expected_duration(1.0)
                .with_cost(1000.0, 1.0)
                .with_pattern(false),
        );
        assert!((awful + 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_detection_quality_adjuster() {
        let calc = RewardCalculator::for_agent_kind(agent_kinds::FLAKY_TEST_HUNTER, RewardWeights::default());
        let perfect = calc.breakdown(
            &json!({}),
            "rerun_isolated",
            &json!({}),
            &ExecutionMetadata::succeeded(1.0)
                .with_signal("precision", 1.0)
                .with_signal("recall", 1.0),
        );
        assert!((perfect.adjustment - 10.0).abs() < 1e-9);

        let blind = calc.breakdown(
            &json!({}),
            "rerun_isolated",
            &json!({}),
            &ExecutionMetadata::succeeded(1.0)
                .with_signal("precision", 0.0)
                .with_signal("recall", 0.0),
        );
        assert!((blind.adjustment + 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_adjustment_is_bounded() {
        let calc = RewardCalculator::for_agent_kind(agent_kinds::PERFORMANCE_TESTER, RewardWeights::default());
        let breakdown = calc.breakdown(
            &json!({}),
            "tune_pool",
            &json!({}),
            &ExecutionMetadata::succeeded(1.0).with_signal("latency_improvement_pct", 500.0),
        );
        assert_eq!(breakdown.adjustment, DEFAULT_ADJUSTMENT_BOUND);
    }

    #[test]
    fn test_non_finite_inputs_are_ignored() {
        let calc = RewardCalculator::default();
        let reward = calc.score(
            &json!({"coverage": 50.0}),
            "a",
            &json!({"coverage": 50.0}),
            &ExecutionMetadata::succeeded(f64::NAN).with_expected_duration(10.0),
        );
        assert_eq!(reward, 0.0);
    }
}
