//! Persistent store abstraction for Q-values and trajectories
//!
//! The learning core talks to storage only through [`QValueStore`]. The
//! PostgreSQL implementation lives in the daemon crate; [`MemoryStore`] is an
//! in-process implementation with fault injection used by tests and offline
//! runs.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use qfleet_core::entry::confidence_score;
use qfleet_core::{ActionId, QEntry, QFleetError, QKey, Result, StateFingerprint, Trajectory};

/// One entry of a batched write.
///
/// `visits` is the number of visits accumulated since the last successful
/// write of this entry, so concurrent writers add rather than overwrite.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpsertEntry {
    pub agent_kind: String,
    pub state_hash: StateFingerprint,
    pub state_data: serde_json::Value,
    pub action: ActionId,
    pub action_data: serde_json::Value,
    pub q_value: f64,
    pub visits: u64,
    pub variance: f64,
}

impl UpsertEntry {
    pub fn from_entry(entry: &QEntry, visits: u64) -> Self {
        Self {
            agent_kind: entry.agent_kind.clone(),
            state_hash: entry.state_hash.clone(),
            state_data: entry.state_data.clone(),
            action: entry.action.clone(),
            action_data: entry.action_data.clone(),
            q_value: entry.q_value,
            visits,
            variance: entry.variance(),
        }
    }

    pub fn key(&self) -> QKey {
        QKey::new(self.state_hash.clone(), self.action.clone())
    }
}

/// Merged row values computed from the current row and an incoming write.
///
/// The incoming value wins (it already incorporates the persisted value via
/// cache-miss loading); visits accumulate and variances are pooled by visits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergedRow {
    pub q_value: f64,
    pub visit_count: u64,
    pub variance: f64,
    pub confidence: f64,
}

pub fn merge_row(current: Option<(u64, f64)>, incoming: &UpsertEntry) -> MergedRow {
    let (old_visits, old_variance) = current.unwrap_or((0, 0.0));
    let visit_count = old_visits + incoming.visits;
    let variance = if visit_count == 0 {
        incoming.variance
    } else {
        (old_variance * old_visits as f64 + incoming.variance * incoming.visits as f64)
            / visit_count as f64
    };
    MergedRow {
        q_value: incoming.q_value,
        visit_count,
        variance,
        confidence: confidence_score(visit_count, variance),
    }
}

/// Result of a batched write
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchUpsertOutcome {
    pub written: Vec<QKey>,
    pub conflicts: Vec<QKey>,
}

impl BatchUpsertOutcome {
    pub fn success_count(&self) -> usize {
        self.written.len()
    }
}

/// Aggregate statistics for one agent kind over a time window
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateStats {
    pub agent_kind: String,
    pub since: Option<DateTime<Utc>>,
    pub entry_count: i64,
    pub avg_q_value: f64,
    pub avg_confidence: f64,
    pub total_visits: i64,
}

/// Full export of one agent kind's Q-table
#[derive(Debug, Clone, Serialize)]
pub struct QTableExport {
    pub agent_kind: String,
    pub exported_at: DateTime<Utc>,
    pub entry_count: usize,
    pub entries: Vec<QEntry>,
}

impl QTableExport {
    pub fn new(agent_kind: impl Into<String>, entries: Vec<QEntry>) -> Self {
        Self {
            agent_kind: agent_kind.into(),
            exported_at: Utc::now(),
            entry_count: entries.len(),
            entries,
        }
    }
}

/// Backing store shared across learning-core instances
#[async_trait]
pub trait QValueStore: Send + Sync {
    /// Persisted value of one pair, `None` when absent
    async fn get(&self, agent_kind: &str, state_hash: &StateFingerprint, action: &str) -> Result<Option<f64>> {
        Ok(self
            .get_entries(agent_kind, state_hash, &[action.to_string()])
            .await?
            .remove(action)
            .map(|entry| entry.q_value))
    }

    /// Persisted entries for several actions of one state, in one round trip
    async fn get_entries(
        &self,
        agent_kind: &str,
        state_hash: &StateFingerprint,
        actions: &[ActionId],
    ) -> Result<HashMap<ActionId, QEntry>>;

    /// Optimistic-concurrency upsert; returns the new row version
    async fn upsert(&self, entry: &UpsertEntry) -> Result<i64>;

    /// Write a batch, continuing past per-entry conflicts.
    ///
    /// Any other error aborts the batch.
    async fn batch_upsert(&self, entries: &[UpsertEntry]) -> Result<BatchUpsertOutcome> {
        let mut outcome = BatchUpsertOutcome::default();
        for entry in entries {
            match self.upsert(entry).await {
                Ok(_) => outcome.written.push(entry.key()),
                Err(QFleetError::ConcurrentUpdateConflict { .. }) => outcome.conflicts.push(entry.key()),
                Err(e) => return Err(e),
            }
        }
        Ok(outcome)
    }

    async fn append_trajectory(&self, trajectory: &Trajectory) -> Result<()>;

    /// Delete trajectories created before `older_than` or already expired
    async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Highest-valued entries of one agent kind
    async fn top_entries(&self, agent_kind: &str, limit: usize) -> Result<Vec<QEntry>>;

    async fn aggregate_stats(&self, agent_kind: &str, since: Option<DateTime<Utc>>) -> Result<AggregateStats>;

    async fn export(&self, agent_kind: &str) -> Result<QTableExport>;

    async fn health_check(&self) -> Result<()>;
}

/// Bounded retry with jittered exponential backoff for version conflicts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1`: base * 2^(attempt-1), plus up to 100% jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1));
        let jitter = rand::thread_rng().gen_range(0.0..=1.0);
        base.mul_f64(1.0 + jitter)
    }
}

/// Run `attempt` until it reports a version match (`Some`) or retries run out.
///
/// `attempt` returns `Ok(None)` when the conditional write lost a race.
pub async fn retry_on_conflict<T, F, Fut>(policy: RetryPolicy, entry: &UpsertEntry, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<Option<T>>> + Send,
    T: Send,
{
    let attempts = policy.max_attempts.max(1);
    for n in 1..=attempts {
        if let Some(value) = attempt().await? {
            return Ok(value);
        }
        debug!(
            "Version conflict on {}/{}/{} (attempt {}/{})",
            entry.agent_kind,
            entry.state_hash.short(),
            entry.action,
            n,
            attempts
        );
        if n < attempts {
            tokio::time::sleep(policy.delay_for(n)).await;
        }
    }

    Err(QFleetError::ConcurrentUpdateConflict {
        agent_kind: entry.agent_kind.clone(),
        state_hash: entry.state_hash.to_string(),
        action: entry.action.clone(),
        attempts,
    })
}

// ============================================================================
// In-memory store
// ============================================================================

type RowKey = (String, QKey);

#[derive(Default)]
struct MemoryTables {
    q_values: HashMap<RowKey, QEntry>,
    trajectories: Vec<Trajectory>,
}

/// In-process store with outage, conflict and latency injection
pub struct MemoryStore {
    tables: RwLock<MemoryTables>,
    available: AtomicBool,
    schema_present: AtomicBool,
    injected_conflicts: AtomicU32,
    upsert_attempts: AtomicU64,
    latency_ms: AtomicU64,
    /// Zero disables the limit
    command_timeout_ms: AtomicU64,
    retry: RetryPolicy,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(MemoryTables::default()),
            available: AtomicBool::new(true),
            schema_present: AtomicBool::new(true),
            injected_conflicts: AtomicU32::new(0),
            upsert_attempts: AtomicU64::new(0),
            latency_ms: AtomicU64::new(0),
            command_timeout_ms: AtomicU64::new(0),
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
            },
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Simulate missing tables
    pub fn drop_schema(&self) {
        self.schema_present.store(false, Ordering::SeqCst);
    }

    /// Make the next `count` conditional writes lose their race
    pub fn inject_conflicts(&self, count: u32) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// Delay every command by `latency` (zero clears it)
    pub fn inject_latency(&self, latency: Duration) {
        self.latency_ms.store(millis(latency), Ordering::SeqCst);
    }

    /// Fail commands that take longer than `timeout` with [`QFleetError::Timeout`]
    pub fn set_command_timeout(&self, timeout: Duration) {
        self.command_timeout_ms.store(millis(timeout), Ordering::SeqCst);
    }

    pub fn upsert_attempts(&self) -> u64 {
        self.upsert_attempts.load(Ordering::SeqCst)
    }

    pub async fn row_count(&self) -> usize {
        self.tables.read().await.q_values.len()
    }

    pub async fn trajectory_count(&self) -> usize {
        self.tables.read().await.trajectories.len()
    }

    async fn check(&self) -> Result<()> {
        let latency = Duration::from_millis(self.latency_ms.load(Ordering::SeqCst));
        let limit = Duration::from_millis(self.command_timeout_ms.load(Ordering::SeqCst));
        if !latency.is_zero() {
            let delay = tokio::time::sleep(latency);
            if limit.is_zero() {
                delay.await;
            } else if tokio::time::timeout(limit, delay).await.is_err() {
                return Err(QFleetError::Timeout(format!(
                    "memory store command exceeded {}ms",
                    limit.as_millis()
                )));
            }
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(QFleetError::StoreUnavailable(
                "memory store is offline".to_string(),
            ));
        }
        if !self.schema_present.load(Ordering::SeqCst) {
            return Err(QFleetError::SchemaMismatch(
                "relation \"q_values\" does not exist".to_string(),
            ));
        }
        Ok(())
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// One optimistic attempt: read the version, merge, write if unchanged
    async fn try_upsert(&self, entry: &UpsertEntry) -> Result<Option<i64>> {
        self.upsert_attempts.fetch_add(1, Ordering::SeqCst);
        let row_key = (entry.agent_kind.clone(), entry.key());

        let (expected_version, current) = {
            let tables = self.tables.read().await;
            match tables.q_values.get(&row_key) {
                Some(row) => (Some(row.version), Some((row.visit_count, row.variance()))),
                None => (None, None),
            }
        };
        let merged = merge_row(current, entry);

        let mut tables = self.tables.write().await;
        let actual_version = tables.q_values.get(&row_key).map(|row| row.version);
        if actual_version != expected_version || self.take_injected_conflict() {
            return Ok(None);
        }

        let version = expected_version.map_or(1, |v| v + 1);
        let mut row = QEntry::from_persisted(
            entry.agent_kind.clone(),
            entry.state_hash.clone(),
            entry.action.clone(),
            merged.q_value,
            merged.visit_count,
            merged.variance,
            version,
        );
        row.state_data = entry.state_data.clone();
        row.action_data = entry.action_data.clone();
        tables.q_values.insert(row_key, row);
        Ok(Some(version))
    }

    async fn rows_for(&self, agent_kind: &str) -> Vec<QEntry> {
        self.tables
            .read()
            .await
            .q_values
            .iter()
            .filter(|((kind, _), _)| kind == agent_kind)
            .map(|(_, row)| row.clone())
            .collect()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QValueStore for MemoryStore {
    async fn get_entries(
        &self,
        agent_kind: &str,
        state_hash: &StateFingerprint,
        actions: &[ActionId],
    ) -> Result<HashMap<ActionId, QEntry>> {
        self.check().await?;
        let tables = self.tables.read().await;
        Ok(actions
            .iter()
            .filter_map(|action| {
                let key = (agent_kind.to_string(), QKey::new(state_hash.clone(), action.clone()));
                tables.q_values.get(&key).map(|row| (action.clone(), row.clone()))
            })
            .collect())
    }

    async fn upsert(&self, entry: &UpsertEntry) -> Result<i64> {
        self.check().await?;
        retry_on_conflict(self.retry, entry, || self.try_upsert(entry)).await
    }

    async fn append_trajectory(&self, trajectory: &Trajectory) -> Result<()> {
        self.check().await?;
        self.tables.write().await.trajectories.push(trajectory.clone());
        Ok(())
    }

    async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<u64> {
        self.check().await?;
        let now = Utc::now();
        let mut tables = self.tables.write().await;
        let before = tables.trajectories.len();
        tables
            .trajectories
            .retain(|t| t.created_at >= older_than && !t.is_expired_at(now));
        Ok((before - tables.trajectories.len()) as u64)
    }

    async fn top_entries(&self, agent_kind: &str, limit: usize) -> Result<Vec<QEntry>> {
        self.check().await?;
        let mut rows = self.rows_for(agent_kind).await;
        rows.sort_by(|a, b| b.q_value.total_cmp(&a.q_value));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn aggregate_stats(&self, agent_kind: &str, since: Option<DateTime<Utc>>) -> Result<AggregateStats> {
        self.check().await?;
        let rows: Vec<QEntry> = self
            .rows_for(agent_kind)
            .await
            .into_iter()
            .filter(|row| since.map_or(true, |since| row.updated_at >= since))
            .collect();

        let count = rows.len();
        let mean = |f: fn(&QEntry) -> f64| {
            if count == 0 {
                0.0
            } else {
                rows.iter().map(f).sum::<f64>() / count as f64
            }
        };

        Ok(AggregateStats {
            agent_kind: agent_kind.to_string(),
            since,
            entry_count: count as i64,
            avg_q_value: mean(|r| r.q_value),
            avg_confidence: mean(|r| r.confidence),
            total_visits: rows.iter().map(|r| r.visit_count as i64).sum(),
        })
    }

    async fn export(&self, agent_kind: &str) -> Result<QTableExport> {
        self.check().await?;
        let mut rows = self.rows_for(agent_kind).await;
        rows.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(QTableExport::new(agent_kind, rows))
    }

    async fn health_check(&self) -> Result<()> {
        self.check().await
    }
}
