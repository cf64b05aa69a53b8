//! Per-agent-kind learner configuration

use serde::{Deserialize, Serialize};

use crate::error::{QFleetError, Result};

/// Immutable configuration of one learning core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnerConfig {
    /// Step size alpha, in (0, 1]
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// Discount gamma, in [0, 1]
    #[serde(default = "default_discount_factor")]
    pub discount_factor: f64,

    #[serde(default = "default_initial_epsilon")]
    pub initial_epsilon: f64,

    #[serde(default = "default_min_epsilon")]
    pub min_epsilon: f64,

    /// Multiplicative decay applied after every update
    #[serde(default = "default_epsilon_decay")]
    pub epsilon_decay: f64,

    /// Updates between persistence syncs
    #[serde(default = "default_flush_interval")]
    pub flush_interval: u64,

    #[serde(default)]
    pub reward: RewardWeights,
}

fn default_learning_rate() -> f64 {
    0.1
}
fn default_discount_factor() -> f64 {
    0.95
}
fn default_initial_epsilon() -> f64 {
    0.3
}
fn default_min_epsilon() -> f64 {
    0.01
}
fn default_epsilon_decay() -> f64 {
    0.995
}
fn default_flush_interval() -> u64 {
    10
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            discount_factor: default_discount_factor(),
            initial_epsilon: default_initial_epsilon(),
            min_epsilon: default_min_epsilon(),
            epsilon_decay: default_epsilon_decay(),
            flush_interval: default_flush_interval(),
            reward: RewardWeights::default(),
        }
    }
}

impl LearnerConfig {
    /// Greedy configuration with no exploration, mostly useful in tests
    pub fn greedy() -> Self {
        Self {
            initial_epsilon: 0.0,
            min_epsilon: 0.0,
            ..Self::default()
        }
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_discount(mut self, discount_factor: f64) -> Self {
        self.discount_factor = discount_factor;
        self
    }

    pub fn with_epsilon(mut self, initial: f64, min: f64, decay: f64) -> Self {
        self.initial_epsilon = initial;
        self.min_epsilon = min;
        self.epsilon_decay = decay;
        self
    }

    pub fn with_flush_interval(mut self, flush_interval: u64) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Reject parameters outside their documented ranges
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0 && self.learning_rate <= 1.0) {
            return Err(QFleetError::Config(format!(
                "learning_rate must be in (0, 1], got {}",
                self.learning_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.discount_factor) {
            return Err(QFleetError::Config(format!(
                "discount_factor must be in [0, 1], got {}",
                self.discount_factor
            )));
        }
        if !(0.0..=1.0).contains(&self.min_epsilon) || !(0.0..=1.0).contains(&self.initial_epsilon) {
            return Err(QFleetError::Config(
                "epsilon values must be in [0, 1]".to_string(),
            ));
        }
        if self.min_epsilon > self.initial_epsilon {
            return Err(QFleetError::Config(format!(
                "min_epsilon ({}) exceeds initial_epsilon ({})",
                self.min_epsilon, self.initial_epsilon
            )));
        }
        if !(self.epsilon_decay > 0.0 && self.epsilon_decay <= 1.0) {
            return Err(QFleetError::Config(format!(
                "epsilon_decay must be in (0, 1], got {}",
                self.epsilon_decay
            )));
        }
        if self.flush_interval == 0 {
            return Err(QFleetError::Config("flush_interval must be at least 1".to_string()));
        }
        self.reward.validate()
    }
}

/// Weights and bonus/penalty constants of the reward function.
///
/// These are empirically chosen defaults, not derived values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardWeights {
    pub coverage: f64,
    pub quality: f64,
    pub time: f64,
    pub pattern: f64,
    pub cost: f64,
    /// Subtracted when the task failed
    pub failure_penalty: f64,
    /// Added when the terminal quality threshold is reached
    pub terminal_bonus: f64,
    /// Fraction of the target coverage that counts as terminal
    pub terminal_threshold: f64,
    /// Rewards are clamped to `[-max_abs_reward, max_abs_reward]`
    pub max_abs_reward: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            coverage: 0.30,
            quality: 0.25,
            time: 0.20,
            pattern: 0.15,
            cost: 0.10,
            failure_penalty: 50.0,
            terminal_bonus: 20.0,
            terminal_threshold: 0.9,
            max_abs_reward: 100.0,
        }
    }
}

/// Largest magnitude a scalar reward may be configured to reach
pub const MAX_REWARD_BOUND: f64 = 100.0;

impl RewardWeights {
    pub fn validate(&self) -> Result<()> {
        let weights = [self.coverage, self.quality, self.time, self.pattern, self.cost];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(QFleetError::Config(
                "reward weights must be finite and non-negative".to_string(),
            ));
        }
        if !(self.max_abs_reward > 0.0 && self.max_abs_reward <= MAX_REWARD_BOUND) {
            return Err(QFleetError::Config(format!(
                "max_abs_reward must be in (0, {MAX_REWARD_BOUND}], got {}",
                self.max_abs_reward
            )));
        }
        for (name, value) in [
            ("failure_penalty", self.failure_penalty),
            ("terminal_bonus", self.terminal_bonus),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(QFleetError::Config(format!(
                    "{name} must be finite and non-negative, got {value}"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.terminal_threshold) {
            return Err(QFleetError::Config(
                "terminal_threshold must be in [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}
