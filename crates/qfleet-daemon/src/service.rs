//! Learning service - connects the learner registry with the store and metrics
//!
//! This module provides:
//! - Action selection and transition recording for callers over HTTP
//! - Store-backed inspection queries
//! - Flush and retention jobs with metrics

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use qfleet_core::{ActionId, ExecutionMetadata, QEntry, Result, StateFingerprint};
use qfleet_rl::{
    normalize_agent_kind, AggregateStats, FlushReport, LearnerRegistry, LearnerStats, QTableExport, QValueStore,
    TransitionReport,
};

use crate::config::Config;
use crate::metrics;

/// Selection request: raw context plus the candidate actions
#[derive(Debug, Clone, Deserialize)]
pub struct SelectRequest {
    pub context: Value,
    pub actions: Vec<ActionId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Selection {
    pub action: ActionId,
    pub state_hash: StateFingerprint,
    pub epsilon: f64,
}

/// Completed execution of a previously selected action
#[derive(Debug, Clone, Deserialize)]
pub struct TransitionRequest {
    pub before: Value,
    pub action: ActionId,
    pub after: Value,
    /// Empty for terminal transitions
    #[serde(default)]
    pub next_actions: Vec<ActionId>,
    #[serde(default)]
    pub metadata: ExecutionMetadata,
}

/// Learning service shared by the API and background jobs
pub struct LearningService {
    registry: LearnerRegistry,
    store: Arc<dyn QValueStore>,
}

impl LearningService {
    pub fn new(config: &Config, store: Arc<dyn QValueStore>) -> Result<Self> {
        let mut registry = LearnerRegistry::new(config.learning.defaults.clone())
            .with_store(store.clone())
            .with_trajectory_ttl_days(config.retention.trajectory_ttl_days);
        for (kind, learner) in &config.learning.agents {
            registry = registry.with_override(kind, learner.clone());
        }
        registry.validate()?;

        info!(
            "Learning service initialized ({} agent kind override(s))",
            config.learning.agents.len()
        );

        Ok(Self { registry, store })
    }

    pub fn registry(&self) -> &LearnerRegistry {
        &self.registry
    }

    /// Encode the context and pick an action for `agent_kind`
    pub async fn select(&self, agent_kind: &str, request: &SelectRequest) -> Result<Selection> {
        let agent_kind = normalize_agent_kind(agent_kind);
        let state = self.registry.encoder().encode(&agent_kind, &request.context)?;
        let learner = self.registry.learner(&agent_kind).await?;
        let action = learner.select_action(&state.fingerprint, &request.actions).await?;

        Ok(Selection {
            action,
            state_hash: state.fingerprint,
            epsilon: learner.epsilon().await,
        })
    }

    /// Score and learn from one completed execution
    pub async fn record_transition(&self, agent_kind: &str, request: TransitionRequest) -> Result<TransitionReport> {
        let agent_kind = normalize_agent_kind(agent_kind);
        let session = self
            .registry
            .resume(&agent_kind, &request.before, &request.action)
            .await?;
        let report = session
            .complete(&request.after, &request.next_actions, request.metadata)
            .await?;

        metrics::record_update(&agent_kind, Some(report.reward), report.epsilon);
        if let Some(flush) = &report.flush {
            metrics::record_flush(&agent_kind, true, flush.written, flush.conflicts);
        }
        self.refresh_availability().await;
        Ok(report)
    }

    /// Flush every learner and record the outcome
    pub async fn flush_all(&self) -> Vec<(String, FlushReport)> {
        let reports = self.registry.flush_all().await;

        for learner in self.registry.learners().await {
            let kind = learner.agent_kind();
            match reports.iter().find(|(k, _)| k == kind) {
                Some((_, report)) => metrics::record_flush(kind, true, report.written, report.conflicts),
                None => metrics::record_flush(kind, false, 0, 0),
            }
        }
        self.refresh_availability().await;
        reports
    }

    pub async fn learners(&self) -> Vec<LearnerStats> {
        let stats = self.registry.stats().await;
        for learner in &stats {
            metrics::EPSILON
                .with_label_values(&[learner.agent_kind.as_str()])
                .set(learner.epsilon);
        }
        stats
    }

    pub async fn top_entries(&self, agent_kind: &str, limit: usize) -> Result<Vec<QEntry>> {
        self.store.top_entries(&normalize_agent_kind(agent_kind), limit).await
    }

    /// Aggregates over entries updated in the last `window_hours` (all entries when `None`)
    pub async fn aggregate_stats(&self, agent_kind: &str, window_hours: Option<u32>) -> Result<AggregateStats> {
        let since = window_hours.map(|hours| Utc::now() - Duration::hours(i64::from(hours)));
        self.store.aggregate_stats(&normalize_agent_kind(agent_kind), since).await
    }

    pub async fn export(&self, agent_kind: &str) -> Result<QTableExport> {
        self.store.export(&normalize_agent_kind(agent_kind)).await
    }

    /// Delete trajectories past the retention window
    pub async fn run_cleanup(&self) -> Result<u64> {
        let removed = self.registry.cleanup_trajectories().await?;
        metrics::record_trajectories_cleaned(removed);
        Ok(removed)
    }

    /// Probe the store and publish the result to the availability gauge
    pub async fn check_store(&self) -> bool {
        let available = match self.store.health_check().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Store health check failed: {}", e);
                false
            }
        };
        metrics::set_store_available(available);
        available
    }

    /// Availability as seen by the learners (no store round trip)
    async fn refresh_availability(&self) {
        let degraded = self
            .registry
            .stats()
            .await
            .iter()
            .any(|s| s.store.as_ref().is_some_and(|h| !h.available));
        metrics::set_store_available(!degraded);
    }
}
