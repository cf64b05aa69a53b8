//! Learner registry - one shared learner per agent kind
//!
//! Learners are created lazily on first use from the default configuration,
//! or from a per-agent-kind override when one is registered.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

use qfleet_core::trajectory::DEFAULT_TRAJECTORY_TTL_DAYS;
use qfleet_core::{ActionId, LearnerConfig, QFleetError, Result, StateFingerprint};

use crate::learner::{FlushReport, LearnerStats, QLearner, UpdateOutcome};
use crate::reward::RewardCalculator;
use crate::session::LearningSession;
use crate::state::StateEncoder;
use crate::store::QValueStore;

/// Canonical form of an agent kind: learners, stored rows and metric labels are keyed by it
pub fn normalize_agent_kind(agent_kind: &str) -> String {
    agent_kind.trim().to_lowercase()
}

pub struct LearnerRegistry {
    defaults: LearnerConfig,
    overrides: HashMap<String, LearnerConfig>,
    store: Option<Arc<dyn QValueStore>>,
    encoder: Arc<StateEncoder>,
    trajectory_ttl: chrono::Duration,
    seed: Option<u64>,
    learners: RwLock<HashMap<String, Arc<QLearner>>>,
}

impl LearnerRegistry {
    pub fn new(defaults: LearnerConfig) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            store: None,
            encoder: Arc::new(StateEncoder::new()),
            trajectory_ttl: chrono::Duration::days(DEFAULT_TRAJECTORY_TTL_DAYS),
            seed: None,
            learners: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn QValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_override(mut self, agent_kind: &str, config: LearnerConfig) -> Self {
        self.overrides.insert(normalize_agent_kind(agent_kind), config);
        self
    }

    pub fn with_encoder(mut self, encoder: StateEncoder) -> Self {
        self.encoder = Arc::new(encoder);
        self
    }

    pub fn with_trajectory_ttl_days(mut self, days: i64) -> Self {
        self.trajectory_ttl = chrono::Duration::days(days.max(1));
        self
    }

    /// Seed every learner created from now on (each gets a distinct stream)
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Check the defaults and every override up front
    pub fn validate(&self) -> Result<()> {
        self.defaults.validate()?;
        for (kind, config) in &self.overrides {
            config
                .validate()
                .map_err(|e| QFleetError::Config(format!("learning.agents.{kind}: {e}")))?;
        }
        Ok(())
    }

    pub fn encoder(&self) -> &StateEncoder {
        &self.encoder
    }

    pub fn store(&self) -> Option<&Arc<dyn QValueStore>> {
        self.store.as_ref()
    }

    pub fn config_for(&self, agent_kind: &str) -> &LearnerConfig {
        self.overrides
            .get(&normalize_agent_kind(agent_kind))
            .unwrap_or(&self.defaults)
    }

    pub fn reward_calculator(&self, agent_kind: &str) -> RewardCalculator {
        RewardCalculator::for_agent_kind(agent_kind, self.config_for(agent_kind).reward.clone())
    }

    /// Shared learner for `agent_kind`, created on first use
    pub async fn learner(&self, agent_kind: &str) -> Result<Arc<QLearner>> {
        let kind = normalize_agent_kind(agent_kind);
        if let Some(learner) = self.learners.read().await.get(&kind) {
            return Ok(learner.clone());
        }

        let mut learners = self.learners.write().await;
        if let Some(learner) = learners.get(&kind) {
            return Ok(learner.clone());
        }

        let mut learner = QLearner::new(kind.clone(), self.config_for(&kind).clone())?;
        if let Some(store) = &self.store {
            learner = learner.with_store(store.clone());
        }
        if let Some(seed) = self.seed {
            learner = learner.with_seed(seed.wrapping_add(learners.len() as u64));
        }

        info!("Registered learner for agent kind {}", kind);
        let learner = Arc::new(learner);
        learners.insert(kind, learner.clone());
        Ok(learner)
    }

    /// All learners created so far, ordered by agent kind
    pub async fn learners(&self) -> Vec<Arc<QLearner>> {
        let mut learners: Vec<_> = self.learners.read().await.values().cloned().collect();
        learners.sort_by(|a, b| a.agent_kind().cmp(b.agent_kind()));
        learners
    }

    pub async fn select_action(
        &self,
        agent_kind: &str,
        state: &StateFingerprint,
        actions: &[ActionId],
    ) -> Result<ActionId> {
        self.learner(agent_kind).await?.select_action(state, actions).await
    }

    pub async fn update(
        &self,
        agent_kind: &str,
        state: &StateFingerprint,
        action: &str,
        reward: f64,
        next_state: Option<&StateFingerprint>,
        next_actions: &[ActionId],
    ) -> Result<UpdateOutcome> {
        self.learner(agent_kind)
            .await?
            .update(state, action, reward, next_state, next_actions)
            .await
    }

    /// Encode `context`, pick an action and return a session to complete after execution
    pub async fn begin(&self, agent_kind: &str, context: &Value, actions: &[ActionId]) -> Result<LearningSession> {
        let state = self.encoder.encode(agent_kind, context)?;
        let learner = self.learner(agent_kind).await?;
        let action = learner.select_action(&state.fingerprint, actions).await?;

        Ok(LearningSession::new(
            learner,
            self.encoder.clone(),
            self.reward_calculator(agent_kind),
            context.clone(),
            state,
            action,
            self.trajectory_ttl,
        ))
    }

    /// Session for an action chosen by an earlier `select_action` call
    pub async fn resume(&self, agent_kind: &str, context: &Value, action: &str) -> Result<LearningSession> {
        if action.trim().is_empty() {
            return Err(QFleetError::invalid_context(agent_kind, "action is empty"));
        }
        let state = self.encoder.encode(agent_kind, context)?;
        let learner = self.learner(agent_kind).await?;

        Ok(LearningSession::new(
            learner,
            self.encoder.clone(),
            self.reward_calculator(agent_kind),
            context.clone(),
            state,
            action.to_string(),
            self.trajectory_ttl,
        ))
    }

    /// Flush every learner; failures are logged and left for the next cycle
    pub async fn flush_all(&self) -> Vec<(String, FlushReport)> {
        let mut reports = Vec::new();
        for learner in self.learners().await {
            match learner.flush().await {
                Ok(report) => reports.push((learner.agent_kind().to_string(), report)),
                Err(e) => warn!("Flush of {} failed: {}", learner.agent_kind(), e),
            }
        }
        reports
    }

    pub async fn stats(&self) -> Vec<LearnerStats> {
        let mut stats = Vec::new();
        for learner in self.learners().await {
            stats.push(learner.stats().await);
        }
        stats
    }

    /// Delete trajectories past the retention window
    pub async fn cleanup_trajectories(&self) -> Result<u64> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let removed = store.cleanup(Utc::now() - self.trajectory_ttl).await?;
        if removed > 0 {
            info!("Removed {} expired trajectories", removed);
        }
        Ok(removed)
    }
}

impl Default for LearnerRegistry {
    fn default() -> Self {
        Self::new(LearnerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_learner_is_shared_per_kind() {
        let registry = LearnerRegistry::default();
        let a = registry.learner("test-generator").await.unwrap();
        let b = registry.learner(" Test-Generator ").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        registry.learner("coverage-analyzer").await.unwrap();
        let kinds: Vec<_> = registry
            .learners()
            .await
            .iter()
            .map(|l| l.agent_kind().to_string())
            .collect();
        assert_eq!(kinds, vec!["coverage-analyzer", "test-generator"]);
    }

    #[tokio::test]
    async fn test_override_applies_to_kind() {
        let registry = LearnerRegistry::default()
            .with_override("flaky-test-hunter", LearnerConfig::default().with_learning_rate(0.5));
        assert!(registry.validate().is_ok());

        let flaky = registry.learner("flaky-test-hunter").await.unwrap();
        let other = registry.learner("test-generator").await.unwrap();
        assert_eq!(flaky.config().learning_rate, 0.5);
        assert_eq!(other.config().learning_rate, 0.1);
    }

    #[tokio::test]
    async fn test_invalid_override_is_reported() {
        let registry = LearnerRegistry::default()
            .with_override("test-generator", LearnerConfig::default().with_flush_interval(0));
        let err = registry.validate().unwrap_err();
        assert!(err.to_string().contains("learning.agents.test-generator"));
        assert!(registry.learner("test-generator").await.is_err());
    }

    #[tokio::test]
    async fn test_resume_uses_given_action() {
        let registry = LearnerRegistry::new(LearnerConfig::greedy());
        let context = serde_json::json!({"coverage": 50});
        let session = registry
            .resume("coverage-analyzer", &context, "scan_all")
            .await
            .unwrap();
        assert_eq!(session.action(), "scan_all");
        assert!(registry.resume("coverage-analyzer", &context, " ").await.is_err());
    }

    #[tokio::test]
    async fn test_cleanup_without_store() {
        let registry = LearnerRegistry::default();
        assert_eq!(registry.cleanup_trajectories().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_flush_all_reports_each_learner() {
        let store = Arc::new(MemoryStore::new());
        let registry = LearnerRegistry::default().with_store(store.clone());
        let fp = StateFingerprint::from_raw("s");

        registry.update("test-generator", &fp, "a", 1.0, None, &[]).await.unwrap();
        registry.update("coverage-analyzer", &fp, "b", 1.0, None, &[]).await.unwrap();

        let reports = registry.flush_all().await;
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|(_, r)| r.written == 1));
        assert_eq!(store.row_count().await, 2);
    }
}
