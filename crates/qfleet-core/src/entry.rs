//! Q-value entries - the unit of learned knowledge

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ActionId, QKey, StateFingerprint};

/// Visits after which the visit term of the confidence score saturates
pub const CONFIDENCE_VISIT_SATURATION: u64 = 100;

/// Learned value of one (state, action) pair for one agent kind.
///
/// The variance is tracked with Welford's online algorithm over the Bellman
/// targets observed for this pair, so it reflects how noisy the returns are
/// rather than how far the estimate has moved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QEntry {
    pub agent_kind: String,
    pub state_hash: StateFingerprint,
    pub state_data: serde_json::Value,
    pub action: ActionId,
    pub action_data: serde_json::Value,
    pub q_value: f64,
    pub visit_count: u64,
    /// Running mean of observed targets
    pub target_mean: f64,
    /// Running sum of squared deviations from the mean
    pub target_m2: f64,
    pub confidence: f64,
    /// Persisted row version last seen by this copy
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl QEntry {
    /// Fresh entry for a first visit: value 0, no observations
    pub fn new(
        agent_kind: impl Into<String>,
        state_hash: StateFingerprint,
        action: impl Into<ActionId>,
    ) -> Self {
        Self {
            agent_kind: agent_kind.into(),
            state_hash,
            state_data: serde_json::Value::Null,
            action: action.into(),
            action_data: serde_json::Value::Null,
            q_value: 0.0,
            visit_count: 0,
            target_mean: 0.0,
            target_m2: 0.0,
            confidence: 0.0,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    /// Rebuild an entry from persisted columns.
    ///
    /// Only the variance is stored, so M2 is reconstructed from it and the
    /// stored value stands in for the running mean.
    pub fn from_persisted(
        agent_kind: impl Into<String>,
        state_hash: StateFingerprint,
        action: impl Into<ActionId>,
        q_value: f64,
        visit_count: u64,
        variance: f64,
        version: i64,
    ) -> Self {
        let mut entry = Self::new(agent_kind, state_hash, action);
        entry.q_value = q_value;
        entry.visit_count = visit_count;
        entry.target_mean = q_value;
        entry.target_m2 = if visit_count > 1 {
            variance.max(0.0) * (visit_count - 1) as f64
        } else {
            0.0
        };
        entry.version = version;
        entry.confidence = confidence_score(visit_count, entry.variance());
        entry
    }

    pub fn key(&self) -> QKey {
        QKey::new(self.state_hash.clone(), self.action.clone())
    }

    /// Sample variance of observed targets (0 until two observations exist)
    pub fn variance(&self) -> f64 {
        if self.visit_count < 2 {
            0.0
        } else {
            self.target_m2 / (self.visit_count - 1) as f64
        }
    }

    /// Record one observed target in the running statistics
    pub fn observe(&mut self, target: f64) {
        self.visit_count += 1;
        let delta = target - self.target_mean;
        self.target_mean += delta / self.visit_count as f64;
        let delta2 = target - self.target_mean;
        self.target_m2 += delta * delta2;
        self.confidence = confidence_score(self.visit_count, self.variance());
        self.updated_at = Utc::now();
    }

    /// Apply `Q <- Q + alpha * (target - Q)` and record the visit.
    ///
    /// Returns the new value.
    pub fn apply_bellman(&mut self, target: f64, learning_rate: f64) -> f64 {
        self.q_value += learning_rate * (target - self.q_value);
        self.observe(target);
        self.q_value
    }
}

/// `(min(visits, 100) / 100 + 1 / (1 + variance)) / 2`
pub fn confidence_score(visit_count: u64, variance: f64) -> f64 {
    let visit_term = visit_count.min(CONFIDENCE_VISIT_SATURATION) as f64
        / CONFIDENCE_VISIT_SATURATION as f64;
    let variance_term = 1.0 / (1.0 + variance.max(0.0));
    (visit_term + variance_term) / 2.0
}
