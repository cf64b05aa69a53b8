//! One task execution: encode, select, then score and learn on completion

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use qfleet_core::{ActionId, ExecutionMetadata, Result, StateFingerprint, Trajectory};

use crate::learner::{FlushReport, QLearner};
use crate::reward::{RewardBreakdown, RewardCalculator};
use crate::state::{EncodedState, StateEncoder};

/// What the caller gets back after completing a session
#[derive(Debug, Clone, Serialize)]
pub struct TransitionReport {
    pub episode_id: Uuid,
    pub action: ActionId,
    pub reward: f64,
    pub breakdown: RewardBreakdown,
    pub new_value: f64,
    pub epsilon: f64,
    pub next_state: Option<StateFingerprint>,
    pub flushed: bool,
    /// Counts of the batched write, when one completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flush: Option<FlushReport>,
}

/// Pending transition created by `LearnerRegistry::begin`
pub struct LearningSession {
    learner: Arc<QLearner>,
    encoder: Arc<StateEncoder>,
    calculator: RewardCalculator,
    before: Value,
    state: EncodedState,
    action: ActionId,
    episode_id: Uuid,
    trajectory_ttl: chrono::Duration,
}

impl LearningSession {
    pub(crate) fn new(
        learner: Arc<QLearner>,
        encoder: Arc<StateEncoder>,
        calculator: RewardCalculator,
        before: Value,
        state: EncodedState,
        action: ActionId,
        trajectory_ttl: chrono::Duration,
    ) -> Self {
        Self {
            learner,
            encoder,
            calculator,
            before,
            state,
            action,
            episode_id: Uuid::new_v4(),
            trajectory_ttl,
        }
    }

    /// Selected action
    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn state(&self) -> &EncodedState {
        &self.state
    }

    pub fn episode_id(&self) -> Uuid {
        self.episode_id
    }

    /// Attach to an existing episode instead of the generated one
    pub fn with_episode(mut self, episode_id: Uuid) -> Self {
        self.episode_id = episode_id;
        self
    }

    /// Score the execution, apply the update and queue the trajectory.
    ///
    /// An empty `next_actions` marks the transition terminal.
    pub async fn complete(
        self,
        after: &Value,
        next_actions: &[ActionId],
        mut metadata: ExecutionMetadata,
    ) -> Result<TransitionReport> {
        let kind = self.learner.agent_kind().to_string();
        let next = if next_actions.is_empty() {
            None
        } else {
            Some(self.encoder.encode(&kind, after)?)
        };
        let next_state = next.map(|n| n.fingerprint);

        let breakdown = self
            .calculator
            .breakdown(&self.before, &self.action, after, &metadata);

        let outcome = self
            .learner
            .update_with_data(
                &self.state.fingerprint,
                Some(self.state.features.to_value()),
                &self.action,
                breakdown.total,
                next_state.as_ref(),
                next_actions,
            )
            .await?;

        metadata.episode_id.get_or_insert(self.episode_id);
        self.learner.record_trajectory(Trajectory::new(
            kind.clone(),
            self.state.fingerprint.clone(),
            self.action.clone(),
            breakdown.total,
            next_state.clone(),
            metadata,
            self.trajectory_ttl,
        ));

        debug!(
            "{}: {} in {} -> reward {:.2}, Q {:.3}",
            kind,
            self.action,
            self.state.fingerprint.short(),
            breakdown.total,
            outcome.new_value
        );

        Ok(TransitionReport {
            episode_id: self.episode_id,
            action: self.action,
            reward: breakdown.total,
            breakdown,
            new_value: outcome.new_value,
            epsilon: outcome.epsilon,
            next_state,
            flushed: outcome.flushed,
            flush: outcome.flush,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LearnerRegistry;
    use qfleet_core::{LearnerConfig, QFleetError};
    use serde_json::json;

    fn actions() -> Vec<ActionId> {
        vec!["generate_unit".into(), "generate_integration".into()]
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let registry = LearnerRegistry::new(LearnerConfig::greedy());
        let before = json!({"coverage": 60.0, "framework": "jest", "complexity": 0.4});
        let session = registry.begin("test-generator", &before, &actions()).await.unwrap();
        assert_eq!(session.action(), "generate_unit");

        let after = json!({"coverage": 70.0, "framework": "jest", "complexity": 0.4});
        let report = session
            .complete(&after, &actions(), ExecutionMetadata::succeeded(5.0))
            .await
            .unwrap();

        // +10 points of coverage -> 100 bounded, weighted 0.30
        assert!((report.breakdown.coverage - 100.0).abs() < 1e-9);
        assert!((report.reward - 30.0).abs() < 1e-9);
        assert!(report.next_state.is_some());
        assert!(report.new_value > 0.0);

        let learner = registry.learner("test-generator").await.unwrap();
        let stats = learner.stats().await;
        assert_eq!(stats.total_updates, 1);
        assert_eq!(stats.pending_trajectories, 1);
    }

    #[tokio::test]
    async fn test_terminal_completion_skips_next_encoding() {
        let registry = LearnerRegistry::new(LearnerConfig::greedy());
        let session = registry
            .begin("coverage-analyzer", &json!({"coverage": 80}), &["scan".to_string()])
            .await
            .unwrap();

        // The after-context would not encode, but terminal transitions never need it
        let report = session
            .complete(&json!({}), &[], ExecutionMetadata::failed(1.0))
            .await
            .unwrap();
        assert!(report.next_state.is_none());
        assert!(report.reward < 0.0);
    }

    #[tokio::test]
    async fn test_invalid_context_is_rejected() {
        let registry = LearnerRegistry::default();
        let err = registry
            .begin("coverage-analyzer", &json!({"language": "rust"}), &actions())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, QFleetError::InvalidContext { .. }));
    }
}
