//! Trajectory records and execution metadata

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ActionId, StateFingerprint};

/// Default trajectory retention window
pub const DEFAULT_TRAJECTORY_TTL_DAYS: i64 = 30;

/// What the caller reports back after executing an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionMetadata {
    pub duration_seconds: f64,
    pub expected_duration_seconds: Option<f64>,
    pub cost: f64,
    pub expected_cost: Option<f64>,
    pub success: bool,
    /// A stored pattern was reused for this execution
    pub pattern_reused: bool,
    /// The reused pattern was later confirmed to have worked
    pub pattern_confirmed: Option<bool>,
    pub episode_id: Option<Uuid>,
    /// Agent-kind specific signals (e.g. precision/recall)
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for ExecutionMetadata {
    fn default() -> Self {
        Self {
            duration_seconds: 0.0,
            expected_duration_seconds: None,
            cost: 0.0,
            expected_cost: None,
            success: true,
            pattern_reused: false,
            pattern_confirmed: None,
            episode_id: None,
            extra: serde_json::Map::new(),
        }
    }
}

impl ExecutionMetadata {
    pub fn succeeded(duration_seconds: f64) -> Self {
        Self {
            duration_seconds,
            ..Self::default()
        }
    }

    pub fn failed(duration_seconds: f64) -> Self {
        Self {
            duration_seconds,
            success: false,
            ..Self::default()
        }
    }

    pub fn with_expected_duration(mut self, seconds: f64) -> Self {
        self.expected_duration_seconds = Some(seconds);
        self
    }

    pub fn with_cost(mut self, cost: f64, expected: f64) -> Self {
        self.cost = cost;
        self.expected_cost = Some(expected);
        self
    }

    pub fn with_pattern(mut self, confirmed: bool) -> Self {
        self.pattern_reused = true;
        self.pattern_confirmed = Some(confirmed);
        self
    }

    pub fn with_episode(mut self, episode_id: Uuid) -> Self {
        self.episode_id = Some(episode_id);
        self
    }

    pub fn with_signal(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }

    pub fn task_failed(&self) -> bool {
        !self.success
    }

    pub fn signal_f64(&self, name: &str) -> Option<f64> {
        self.extra.get(name).and_then(serde_json::Value::as_f64)
    }
}

/// Immutable record of one state -> action -> reward -> next-state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub id: Uuid,
    pub agent_kind: String,
    pub state_hash: StateFingerprint,
    pub action: ActionId,
    pub reward: f64,
    /// `None` for terminal transitions
    pub next_state_hash: Option<StateFingerprint>,
    pub metadata: ExecutionMetadata,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Trajectory {
    pub fn new(
        agent_kind: impl Into<String>,
        state_hash: StateFingerprint,
        action: impl Into<ActionId>,
        reward: f64,
        next_state_hash: Option<StateFingerprint>,
        metadata: ExecutionMetadata,
        ttl: Duration,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            id: Uuid::new_v4(),
            agent_kind: agent_kind.into(),
            state_hash,
            action: action.into(),
            reward,
            next_state_hash,
            metadata,
            created_at,
            expires_at: created_at + ttl,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
