//! PostgreSQL integration for the QFleet daemon
//!
//! Provides the connection pool and [`PgQValueStore`], the shared store used
//! by every learner in every daemon instance. Upserts are optimistic: the row
//! is read and locked, merged, then written conditioned on its version.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Executor, FromRow};
use tracing::{debug, info};

use qfleet_core::{ActionId, QEntry, QFleetError, Result, StateFingerprint, Trajectory};
use qfleet_rl::store::{merge_row, retry_on_conflict};
use qfleet_rl::{AggregateStats, QTableExport, QValueStore, RetryPolicy, UpsertEntry};

use crate::config::PostgresConfig;
use crate::metrics;

/// Columns the store reads and writes, per table
const REQUIRED_COLUMNS: &[(&str, &[&str])] = &[
    (
        "q_values",
        &[
            "agent_kind",
            "state_hash",
            "state_data",
            "action",
            "action_data",
            "q_value",
            "visit_count",
            "value_variance",
            "confidence_score",
            "version",
            "updated_at",
        ],
    ),
    (
        "trajectories",
        &[
            "id",
            "agent_kind",
            "state_hash",
            "action",
            "reward",
            "next_state_hash",
            "metadata",
            "created_at",
            "expires_at",
        ],
    ),
];

/// PostgreSQL database connection pool
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    pub async fn new(config: &PostgresConfig) -> anyhow::Result<Self> {
        info!("Connecting to PostgreSQL at {}", redact_url(&config.url));

        let statement_timeout = config.statement_timeout_ms;
        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    conn.execute(format!("SET statement_timeout = {statement_timeout}").as_str())
                        .await?;
                    Ok(())
                })
            })
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        // Test connection
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .context("Failed to execute test query")?;

        if config.run_migrations {
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context("Failed to run migrations")?;
            info!("Database migrations applied");
        }

        info!(
            "PostgreSQL connection established (connections: {}..{}, statement timeout: {}ms)",
            config.min_connections, config.max_connections, config.statement_timeout_ms
        );

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

/// Classify a driver error into the store error taxonomy
pub fn map_sqlx_error(err: sqlx::Error) -> QFleetError {
    match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
            QFleetError::StoreUnavailable(err.to_string())
        }
        sqlx::Error::ColumnNotFound(column) => {
            QFleetError::SchemaMismatch(format!("column '{column}' not found"))
        }
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // undefined_table, undefined_column
            Some("42P01" | "42703") => QFleetError::SchemaMismatch(db.message().to_string()),
            // query_canceled (statement_timeout)
            Some("57014") => QFleetError::Timeout(db.message().to_string()),
            // admin/crash shutdown, cannot_connect_now
            Some("57P01" | "57P02" | "57P03") => QFleetError::StoreUnavailable(db.message().to_string()),
            _ => QFleetError::Database(err.to_string()),
        },
        _ => QFleetError::Database(err.to_string()),
    }
}

// ============================================================================
// Q-value store
// ============================================================================

/// Persisted Q-value row
#[derive(Debug, Clone, FromRow)]
pub struct QValueRecord {
    pub agent_kind: String,
    pub state_hash: String,
    pub state_data: serde_json::Value,
    pub action: String,
    pub action_data: serde_json::Value,
    pub q_value: f64,
    pub visit_count: i64,
    pub value_variance: f64,
    pub confidence_score: f64,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl From<QValueRecord> for QEntry {
    fn from(record: QValueRecord) -> Self {
        let mut entry = QEntry::from_persisted(
            record.agent_kind,
            StateFingerprint::from_raw(record.state_hash),
            record.action,
            record.q_value,
            u64::try_from(record.visit_count).unwrap_or(0),
            record.value_variance,
            record.version,
        );
        entry.state_data = record.state_data;
        entry.action_data = record.action_data;
        entry.confidence = record.confidence_score;
        entry.updated_at = record.updated_at;
        entry
    }
}

const SELECT_Q_VALUES: &str = r"
    SELECT agent_kind, state_hash, state_data, action, action_data, q_value,
           visit_count, value_variance, confidence_score, version, updated_at
    FROM q_values
";

/// [`QValueStore`] backed by PostgreSQL
pub struct PgQValueStore {
    pool: PgPool,
    retry: RetryPolicy,
    query_timeout: Duration,
}

impl PgQValueStore {
    pub fn new(pool: PgPool, query_timeout: Duration) -> Self {
        Self {
            pool,
            retry: RetryPolicy::default(),
            query_timeout,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Fail with `SchemaMismatch` unless every table and column the store uses exists
    pub async fn verify_schema(&self) -> Result<()> {
        let tables: Vec<String> = REQUIRED_COLUMNS.iter().map(|(t, _)| (*t).to_string()).collect();
        let present: Vec<(String, String)> = self
            .timed("verify_schema", async {
                sqlx::query_as(
                    r"
                    SELECT table_name::TEXT, column_name::TEXT
                    FROM information_schema.columns
                    WHERE table_schema = current_schema() AND table_name = ANY($1)
                    ",
                )
                .bind(&tables)
                .fetch_all(&self.pool)
                .await
            })
            .await?;

        let present: HashSet<(String, String)> = present.into_iter().collect();
        let missing: Vec<String> = REQUIRED_COLUMNS
            .iter()
            .flat_map(|(table, columns)| columns.iter().map(move |column| (*table, *column)))
            .filter(|(table, column)| !present.contains(&((*table).to_string(), (*column).to_string())))
            .map(|(table, column)| format!("{table}.{column}"))
            .collect();

        if missing.is_empty() {
            info!("Store schema verified");
            Ok(())
        } else {
            Err(QFleetError::SchemaMismatch(format!(
                "missing columns: {}",
                missing.join(", ")
            )))
        }
    }

    /// Run one query under the command timeout, recording metrics
    async fn timed<T, F>(&self, query_type: &str, query: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, sqlx::Error>> + Send,
    {
        let start = Instant::now();
        let result = match tokio::time::timeout(self.query_timeout, query).await {
            Ok(result) => result.map_err(map_sqlx_error),
            Err(_) => Err(QFleetError::Timeout(format!(
                "{query_type} exceeded {}ms",
                self.query_timeout.as_millis()
            ))),
        };
        metrics::record_store_query(query_type, result.is_ok(), start.elapsed().as_secs_f64());
        result
    }

    /// One optimistic attempt; `Ok(None)` when the version moved underneath us
    async fn try_upsert(&self, entry: &UpsertEntry) -> Result<Option<i64>> {
        self.timed("upsert", async {
            let mut tx = self.pool.begin().await?;

            let current: Option<(i64, i64, f64)> = sqlx::query_as(
                r"
                SELECT version, visit_count, value_variance
                FROM q_values
                WHERE agent_kind = $1 AND state_hash = $2 AND action = $3
                FOR UPDATE
                ",
            )
            .bind(&entry.agent_kind)
            .bind(entry.state_hash.as_str())
            .bind(&entry.action)
            .fetch_optional(&mut *tx)
            .await?;

            let merged = merge_row(
                current.map(|(_, visits, variance)| (u64::try_from(visits).unwrap_or(0), variance)),
                entry,
            );
            let visit_count = i64::try_from(merged.visit_count).unwrap_or(i64::MAX);

            let written = match current {
                Some((version, _, _)) => {
                    let result = sqlx::query(
                        r"
                        UPDATE q_values
                        SET q_value = $4, visit_count = $5, value_variance = $6,
                            confidence_score = $7, state_data = $8, action_data = $9,
                            version = version + 1, updated_at = NOW()
                        WHERE agent_kind = $1 AND state_hash = $2 AND action = $3 AND version = $10
                        ",
                    )
                    .bind(&entry.agent_kind)
                    .bind(entry.state_hash.as_str())
                    .bind(&entry.action)
                    .bind(merged.q_value)
                    .bind(visit_count)
                    .bind(merged.variance)
                    .bind(merged.confidence)
                    .bind(&entry.state_data)
                    .bind(&entry.action_data)
                    .bind(version)
                    .execute(&mut *tx)
                    .await?;
                    (result.rows_affected() == 1).then_some(version + 1)
                }
                None => {
                    let result = sqlx::query(
                        r"
                        INSERT INTO q_values (agent_kind, state_hash, state_data, action, action_data,
                                              q_value, visit_count, value_variance, confidence_score, version)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 1)
                        ON CONFLICT (agent_kind, state_hash, action) DO NOTHING
                        ",
                    )
                    .bind(&entry.agent_kind)
                    .bind(entry.state_hash.as_str())
                    .bind(&entry.state_data)
                    .bind(&entry.action)
                    .bind(&entry.action_data)
                    .bind(merged.q_value)
                    .bind(visit_count)
                    .bind(merged.variance)
                    .bind(merged.confidence)
                    .execute(&mut *tx)
                    .await?;
                    (result.rows_affected() == 1).then_some(1)
                }
            };

            if written.is_some() {
                tx.commit().await?;
            } else {
                tx.rollback().await?;
            }
            Ok::<_, sqlx::Error>(written)
        })
        .await
    }
}

#[async_trait]
impl QValueStore for PgQValueStore {
    async fn get_entries(
        &self,
        agent_kind: &str,
        state_hash: &StateFingerprint,
        actions: &[ActionId],
    ) -> Result<HashMap<ActionId, QEntry>> {
        let sql = format!("{SELECT_Q_VALUES} WHERE agent_kind = $1 AND state_hash = $2 AND action = ANY($3)");
        let records: Vec<QValueRecord> = self
            .timed("get_entries", async {
                sqlx::query_as(&sql)
                    .bind(agent_kind)
                    .bind(state_hash.as_str())
                    .bind(actions)
                    .fetch_all(&self.pool)
                    .await
            })
            .await?;

        Ok(records
            .into_iter()
            .map(|record| (record.action.clone(), QEntry::from(record)))
            .collect())
    }

    async fn upsert(&self, entry: &UpsertEntry) -> Result<i64> {
        retry_on_conflict(self.retry, entry, || self.try_upsert(entry)).await
    }

    async fn append_trajectory(&self, trajectory: &Trajectory) -> Result<()> {
        let metadata = serde_json::to_value(&trajectory.metadata)?;
        self.timed("append_trajectory", async {
            sqlx::query(
                r"
                INSERT INTO trajectories (id, agent_kind, state_hash, action, reward,
                                          next_state_hash, metadata, created_at, expires_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (id) DO NOTHING
                ",
            )
            .bind(trajectory.id)
            .bind(&trajectory.agent_kind)
            .bind(trajectory.state_hash.as_str())
            .bind(&trajectory.action)
            .bind(trajectory.reward)
            .bind(trajectory.next_state_hash.as_ref().map(StateFingerprint::as_str))
            .bind(&metadata)
            .bind(trajectory.created_at)
            .bind(trajectory.expires_at)
            .execute(&self.pool)
            .await
        })
        .await?;

        debug!("Stored trajectory {} for {}", trajectory.id, trajectory.agent_kind);
        Ok(())
    }

    async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = self
            .timed("cleanup", async {
                sqlx::query("DELETE FROM trajectories WHERE created_at < $1 OR expires_at < NOW()")
                    .bind(older_than)
                    .execute(&self.pool)
                    .await
            })
            .await?;
        Ok(result.rows_affected())
    }

    async fn top_entries(&self, agent_kind: &str, limit: usize) -> Result<Vec<QEntry>> {
        let sql = format!("{SELECT_Q_VALUES} WHERE agent_kind = $1 ORDER BY q_value DESC LIMIT $2");
        let records: Vec<QValueRecord> = self
            .timed("top_entries", async {
                sqlx::query_as(&sql)
                    .bind(agent_kind)
                    .bind(i64::try_from(limit).unwrap_or(i64::MAX))
                    .fetch_all(&self.pool)
                    .await
            })
            .await?;
        Ok(records.into_iter().map(QEntry::from).collect())
    }

    async fn aggregate_stats(&self, agent_kind: &str, since: Option<DateTime<Utc>>) -> Result<AggregateStats> {
        let (entry_count, avg_q_value, avg_confidence, total_visits): (i64, f64, f64, i64) = self
            .timed("aggregate_stats", async {
                sqlx::query_as(
                    r"
                    SELECT COUNT(*)::BIGINT,
                           COALESCE(AVG(q_value), 0)::FLOAT8,
                           COALESCE(AVG(confidence_score), 0)::FLOAT8,
                           COALESCE(SUM(visit_count), 0)::BIGINT
                    FROM q_values
                    WHERE agent_kind = $1 AND ($2::TIMESTAMPTZ IS NULL OR updated_at >= $2)
                    ",
                )
                .bind(agent_kind)
                .bind(since)
                .fetch_one(&self.pool)
                .await
            })
            .await?;

        Ok(AggregateStats {
            agent_kind: agent_kind.to_string(),
            since,
            entry_count,
            avg_q_value,
            avg_confidence,
            total_visits,
        })
    }

    async fn export(&self, agent_kind: &str) -> Result<QTableExport> {
        let sql = format!("{SELECT_Q_VALUES} WHERE agent_kind = $1 ORDER BY state_hash, action");
        let records: Vec<QValueRecord> = self
            .timed("export", async {
                sqlx::query_as(&sql).bind(agent_kind).fetch_all(&self.pool).await
            })
            .await?;
        Ok(QTableExport::new(
            agent_kind,
            records.into_iter().map(QEntry::from).collect(),
        ))
    }

    async fn health_check(&self) -> Result<()> {
        self.timed("health_check", async {
            sqlx::query("SELECT 1").execute(&self.pool).await
        })
        .await?;
        Ok(())
    }
}
