//! Learning core - one shared Q-table per agent kind
//!
//! The table lives in memory behind a `tokio::sync::RwLock`. Reads fall back
//! to the store on a miss, updates are applied in memory and written back in
//! batches every `flush_interval` updates. Transient store failures degrade
//! the learner to memory-only operation and never fail a learning call; reads
//! go back to the store once the retry interval has passed. A schema mismatch
//! is returned to the caller.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use qfleet_core::{
    ActionId, LearnerConfig, QEntry, QFleetError, QKey, Result, StateFingerprint, Trajectory,
};

use crate::store::{QValueStore, UpsertEntry};

/// Trajectories kept in memory while the store is unreachable
pub const MAX_PENDING_TRAJECTORIES: usize = 10_000;

/// Time a degraded learner waits before reading from the store again
pub const STORE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Result of one `update` call
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UpdateOutcome {
    pub new_value: f64,
    pub epsilon: f64,
    /// A batched write to the store completed during this call
    pub flushed: bool,
    pub flush: Option<FlushReport>,
}

/// Result of one flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FlushReport {
    pub written: usize,
    pub conflicts: usize,
    pub trajectories: usize,
    /// Another flush was already running
    pub skipped: bool,
}

/// Store availability as seen by one learner
#[derive(Debug, Default)]
pub struct StoreHealth {
    degraded: AtomicBool,
    consecutive_failures: AtomicU64,
    last_error: Mutex<Option<String>>,
    failed_at: Mutex<Option<Instant>>,
}

/// Point-in-time copy of [`StoreHealth`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub available: bool,
    pub consecutive_failures: u64,
    pub last_error: Option<String>,
}

impl StoreHealth {
    pub fn is_available(&self) -> bool {
        !self.degraded.load(Ordering::SeqCst)
    }

    /// Whether a store read should be attempted: always when healthy,
    /// otherwise once `retry_after` has passed since the last failure
    pub fn should_attempt(&self, retry_after: Duration) -> bool {
        if self.is_available() {
            return true;
        }
        let failed_at = *self.failed_at.lock().unwrap_or_else(PoisonError::into_inner);
        failed_at.map_or(true, |at| at.elapsed() >= retry_after)
    }

    pub fn record_success(&self) {
        if self.degraded.swap(false, Ordering::SeqCst) {
            info!("Store reachable again, leaving degraded mode");
        }
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Only recoverable errors enter degraded mode; the rest are surfaced to the caller
    pub fn record_failure(&self, err: &QFleetError) {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
        if !err.is_recoverable() {
            return;
        }
        *self.failed_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!("Store failure, continuing in memory only: {}", err);
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            available: self.is_available(),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

/// Learner statistics
#[derive(Debug, Clone, Serialize)]
pub struct LearnerStats {
    pub agent_kind: String,
    pub table_size: usize,
    pub dirty_entries: usize,
    pub total_updates: u64,
    pub epsilon: f64,
    pub pending_trajectories: usize,
    pub store: Option<HealthSnapshot>,
}

#[derive(Debug, Default, Clone, Copy)]
struct DirtyMark {
    /// Table revision of the last modification
    revision: u64,
    /// Visits not yet written to the store
    pending_visits: u64,
}

struct TableState {
    entries: HashMap<QKey, QEntry>,
    dirty: HashMap<QKey, DirtyMark>,
    epsilon: f64,
    updates_since_flush: u64,
    total_updates: u64,
    revision: u64,
}

impl TableState {
    fn value(&self, key: &QKey) -> Option<f64> {
        self.entries.get(key).map(|e| e.q_value)
    }

    fn mark_dirty(&mut self, key: QKey, visits: u64) {
        self.revision += 1;
        let mark = self.dirty.entry(key).or_default();
        mark.revision = self.revision;
        mark.pending_visits += visits;
    }
}

/// Shared tabular Q-learner for one agent kind
pub struct QLearner {
    agent_kind: String,
    config: LearnerConfig,
    state: RwLock<TableState>,
    store: Option<Arc<dyn QValueStore>>,
    health: StoreHealth,
    store_retry: Duration,
    rng: Mutex<StdRng>,
    flush_gate: tokio::sync::Mutex<()>,
    pending_trajectories: Mutex<VecDeque<Trajectory>>,
}

impl QLearner {
    pub fn new(agent_kind: impl Into<String>, config: LearnerConfig) -> Result<Self> {
        config.validate()?;
        let agent_kind = agent_kind.into();
        if agent_kind.trim().is_empty() {
            return Err(QFleetError::invalid_context(agent_kind, "agent kind is empty"));
        }

        debug!(
            "Creating learner for {} (alpha={}, gamma={}, epsilon={})",
            agent_kind, config.learning_rate, config.discount_factor, config.initial_epsilon
        );

        Ok(Self {
            state: RwLock::new(TableState {
                entries: HashMap::new(),
                dirty: HashMap::new(),
                epsilon: config.initial_epsilon,
                updates_since_flush: 0,
                total_updates: 0,
                revision: 0,
            }),
            agent_kind,
            config,
            store: None,
            health: StoreHealth::default(),
            store_retry: STORE_RETRY_INTERVAL,
            rng: Mutex::new(StdRng::from_entropy()),
            flush_gate: tokio::sync::Mutex::new(()),
            pending_trajectories: Mutex::new(VecDeque::new()),
        })
    }

    /// Back the table with a shared store
    pub fn with_store(mut self, store: Arc<dyn QValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Wait `interval` after a store failure before reading from the store again
    pub fn with_store_retry(mut self, interval: Duration) -> Self {
        self.store_retry = interval;
        self
    }

    /// Seed exploration for reproducible runs
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn agent_kind(&self) -> &str {
        &self.agent_kind
    }

    pub fn config(&self) -> &LearnerConfig {
        &self.config
    }

    pub fn health(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    pub async fn epsilon(&self) -> f64 {
        self.state.read().await.epsilon
    }

    /// Epsilon-greedy choice over `actions`.
    ///
    /// Ties in the greedy branch go to the earliest action in `actions`.
    pub async fn select_action(&self, state: &StateFingerprint, actions: &[ActionId]) -> Result<ActionId> {
        if actions.is_empty() {
            return Err(QFleetError::EmptyActionSpace);
        }

        let epsilon = self.epsilon().await;
        if let Some(index) = self.roll_exploration(epsilon, actions.len()) {
            debug!("{}: exploring action {}", self.agent_kind, actions[index]);
            return Ok(actions[index].clone());
        }

        let values = self.values_for(state, actions).await?;
        let mut best = 0;
        for (i, value) in values.iter().enumerate().skip(1) {
            if *value > values[best] {
                best = i;
            }
        }
        Ok(actions[best].clone())
    }

    fn roll_exploration(&self, epsilon: f64, action_count: usize) -> Option<usize> {
        if epsilon <= 0.0 {
            return None;
        }
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        if rng.gen::<f64>() < epsilon {
            Some(rng.gen_range(0..action_count))
        } else {
            None
        }
    }

    /// Current values of `actions` in `state`: memory, then store, then 0.0.
    ///
    /// Only non-recoverable store errors are returned.
    pub async fn values_for(&self, state: &StateFingerprint, actions: &[ActionId]) -> Result<Vec<f64>> {
        let (mut values, missing) = {
            let table = self.state.read().await;
            let mut missing = Vec::new();
            let values: Vec<Option<f64>> = actions
                .iter()
                .map(|action| {
                    let value = table.value(&QKey::new(state.clone(), action.clone()));
                    if value.is_none() {
                        missing.push(action.clone());
                    }
                    value
                })
                .collect();
            (values, missing)
        };

        if !missing.is_empty() {
            if let Some(loaded) = self.load(state, &missing).await? {
                let mut table = self.state.write().await;
                for (action, entry) in loaded {
                    table
                        .entries
                        .entry(QKey::new(state.clone(), action))
                        .or_insert(entry);
                }
                for (value, action) in values.iter_mut().zip(actions) {
                    if value.is_none() {
                        *value = table.value(&QKey::new(state.clone(), action.clone()));
                    }
                }
            }
        }

        Ok(values.into_iter().map(|v| v.unwrap_or(0.0)).collect())
    }

    /// `Ok(None)` is a cache miss: no store, degraded, or a transient failure
    async fn load(
        &self,
        state: &StateFingerprint,
        actions: &[ActionId],
    ) -> Result<Option<HashMap<ActionId, QEntry>>> {
        let Some(store) = self.store.as_ref() else {
            return Ok(None);
        };
        if !self.health.should_attempt(self.store_retry) {
            return Ok(None);
        }
        match store.get_entries(&self.agent_kind, state, actions).await {
            Ok(entries) => {
                self.health.record_success();
                Ok(Some(entries))
            }
            Err(e) => {
                self.health.record_failure(&e);
                if e.is_recoverable() {
                    Ok(None)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Apply one Bellman update for `(state, action)`.
    ///
    /// `next_state` is `None` (or `next_actions` empty) for terminal transitions.
    pub async fn update(
        &self,
        state: &StateFingerprint,
        action: &str,
        reward: f64,
        next_state: Option<&StateFingerprint>,
        next_actions: &[ActionId],
    ) -> Result<UpdateOutcome> {
        self.update_with_data(state, None, action, reward, next_state, next_actions)
            .await
    }

    /// Same as [`QLearner::update`], attaching the encoded state features to the entry
    pub async fn update_with_data(
        &self,
        state: &StateFingerprint,
        state_data: Option<serde_json::Value>,
        action: &str,
        reward: f64,
        next_state: Option<&StateFingerprint>,
        next_actions: &[ActionId],
    ) -> Result<UpdateOutcome> {
        if action.is_empty() {
            return Err(QFleetError::invalid_context(&self.agent_kind, "action is empty"));
        }
        if !reward.is_finite() {
            return Err(QFleetError::invalid_context(
                &self.agent_kind,
                format!("reward must be finite, got {reward}"),
            ));
        }

        // Warm the cache outside the write lock so the RMW below never waits on I/O
        let next_state = next_state.filter(|_| !next_actions.is_empty());
        if let Some(next) = next_state {
            self.values_for(next, next_actions).await?;
        }
        self.values_for(state, &[action.to_string()]).await?;

        let key = QKey::new(state.clone(), action);
        let (new_value, epsilon, should_flush) = {
            let mut table = self.state.write().await;

            let max_next = next_state.map_or(0.0, |next| {
                next_actions
                    .iter()
                    .map(|a| table.value(&QKey::new(next.clone(), a.clone())).unwrap_or(0.0))
                    .fold(f64::NEG_INFINITY, f64::max)
            });
            let target = reward + self.config.discount_factor * max_next;

            let entry = table
                .entries
                .entry(key.clone())
                .or_insert_with(|| QEntry::new(self.agent_kind.clone(), state.clone(), action));
            if let Some(data) = state_data {
                entry.state_data = data;
            }
            let new_value = entry.apply_bellman(target, self.config.learning_rate);
            table.mark_dirty(key, 1);

            table.epsilon = (table.epsilon * self.config.epsilon_decay).max(self.config.min_epsilon);
            table.total_updates += 1;
            table.updates_since_flush += 1;
            let should_flush = table.updates_since_flush >= self.config.flush_interval;
            if should_flush {
                table.updates_since_flush = 0;
            }
            (new_value, table.epsilon, should_flush)
        };

        let mut flush = None;
        if should_flush && self.store.is_some() {
            match self.flush().await {
                Ok(report) if !report.skipped => flush = Some(report),
                Ok(_) => {}
                Err(e) if e.is_recoverable() => {
                    debug!("{}: flush deferred to next cycle: {}", self.agent_kind, e);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(UpdateOutcome {
            new_value,
            epsilon,
            flushed: flush.is_some(),
            flush,
        })
    }

    /// Queue a trajectory for the next flush
    pub fn record_trajectory(&self, trajectory: Trajectory) {
        let mut pending = self
            .pending_trajectories
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if pending.len() >= MAX_PENDING_TRAJECTORIES {
            pending.pop_front();
            warn!("{}: trajectory backlog full, dropping oldest", self.agent_kind);
        }
        pending.push_back(trajectory);
    }

    fn take_trajectories(&self) -> Vec<Trajectory> {
        self.pending_trajectories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    fn requeue_trajectories(&self, unwritten: Vec<Trajectory>) {
        let mut pending = self
            .pending_trajectories
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for trajectory in unwritten.into_iter().rev() {
            pending.push_front(trajectory);
        }
        while pending.len() > MAX_PENDING_TRAJECTORIES {
            pending.pop_front();
        }
    }

    /// Write dirty entries and queued trajectories to the store.
    ///
    /// Entries modified while the write was in flight stay dirty.
    pub async fn flush(&self) -> Result<FlushReport> {
        let Some(store) = self.store.as_ref() else {
            return Ok(FlushReport::default());
        };
        let Ok(_gate) = self.flush_gate.try_lock() else {
            return Ok(FlushReport {
                skipped: true,
                ..FlushReport::default()
            });
        };

        let (batch, marks): (Vec<UpsertEntry>, Vec<(QKey, DirtyMark)>) = {
            let table = self.state.read().await;
            table
                .dirty
                .iter()
                .filter_map(|(key, mark)| {
                    table
                        .entries
                        .get(key)
                        .map(|entry| (UpsertEntry::from_entry(entry, mark.pending_visits), (key.clone(), *mark)))
                })
                .unzip()
        };

        let mut report = FlushReport::default();
        if !batch.is_empty() {
            let outcome = match store.batch_upsert(&batch).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.health.record_failure(&e);
                    return Err(e);
                }
            };

            let marks: HashMap<QKey, DirtyMark> = marks.into_iter().collect();
            let mut table = self.state.write().await;
            for key in &outcome.written {
                let Some(flushed) = marks.get(key) else { continue };
                let unchanged = table.dirty.get(key).map(|current| current.revision == flushed.revision);
                match unchanged {
                    Some(true) => {
                        table.dirty.remove(key);
                    }
                    Some(false) => {
                        if let Some(current) = table.dirty.get_mut(key) {
                            current.pending_visits = current.pending_visits.saturating_sub(flushed.pending_visits);
                        }
                    }
                    None => {}
                }
            }
            report.written = outcome.written.len();
            report.conflicts = outcome.conflicts.len();
            if report.conflicts > 0 {
                warn!(
                    "{}: {} entries kept dirty after version conflicts",
                    self.agent_kind, report.conflicts
                );
            }
        }
        self.health.record_success();

        let trajectories = self.take_trajectories();
        for (i, trajectory) in trajectories.iter().enumerate() {
            if let Err(e) = store.append_trajectory(trajectory).await {
                self.health.record_failure(&e);
                self.requeue_trajectories(trajectories[i..].to_vec());
                return Err(e);
            }
            report.trajectories += 1;
        }

        debug!(
            "{}: flushed {} entries, {} trajectories",
            self.agent_kind, report.written, report.trajectories
        );
        Ok(report)
    }

    /// In-memory copy of one entry
    pub async fn entry(&self, state: &StateFingerprint, action: &str) -> Option<QEntry> {
        self.state
            .read()
            .await
            .entries
            .get(&QKey::new(state.clone(), action))
            .cloned()
    }

    /// All in-memory entries
    pub async fn snapshot(&self) -> Vec<QEntry> {
        self.state.read().await.entries.values().cloned().collect()
    }

    /// Blend another table into this one: `q <- (1 - weight) * q + weight * other`.
    ///
    /// Entries missing here are adopted as-is. Returns the number of entries touched.
    pub async fn blend(&self, entries: &[QEntry], weight: f64) -> usize {
        let weight = weight.clamp(0.0, 1.0);
        let mut table = self.state.write().await;
        for source in entries {
            let key = source.key();
            match table.entries.get_mut(&key) {
                Some(entry) => {
                    entry.q_value = (1.0 - weight) * entry.q_value + weight * source.q_value;
                    entry.updated_at = chrono::Utc::now();
                }
                None => {
                    let mut adopted = QEntry::from_persisted(
                        self.agent_kind.clone(),
                        source.state_hash.clone(),
                        source.action.clone(),
                        source.q_value,
                        0,
                        0.0,
                        0,
                    );
                    adopted.state_data = source.state_data.clone();
                    adopted.action_data = source.action_data.clone();
                    table.entries.insert(key.clone(), adopted);
                }
            }
            table.mark_dirty(key, 0);
        }
        entries.len()
    }

    pub async fn stats(&self) -> LearnerStats {
        let table = self.state.read().await;
        LearnerStats {
            agent_kind: self.agent_kind.clone(),
            table_size: table.entries.len(),
            dirty_entries: table.dirty.len(),
            total_updates: table.total_updates,
            epsilon: table.epsilon,
            pending_trajectories: self
                .pending_trajectories
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            store: self.store.as_ref().map(|_| self.health.snapshot()),
        }
    }
}
