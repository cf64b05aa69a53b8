//! QFleet daemon: HTTP binding of the learning service plus background jobs

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use qfleet_core::{QEntry, QFleetError};
use qfleet_rl::{AggregateStats, FlushReport, LearnerStats, MemoryStore, QTableExport, QValueStore, TransitionReport};

use crate::config::Config;
use crate::metrics;
use crate::postgres::{Database, PgQValueStore};
use crate::service::{LearningService, SelectRequest, Selection, TransitionRequest};

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Default and maximum row count for `top` queries
const DEFAULT_TOP_LIMIT: usize = 20;
const MAX_TOP_LIMIT: usize = 500;

/// Shared daemon state for API handlers
#[derive(Clone)]
pub struct DaemonState {
    pub service: Arc<LearningService>,
    pub started_at: DateTime<Utc>,
}

impl DaemonState {
    pub fn new(service: Arc<LearningService>) -> Self {
        Self {
            service,
            started_at: Utc::now(),
        }
    }
}

/// Main QFleet daemon
pub struct QFleetDaemon {
    config: Config,
    state: DaemonState,
    shutdown: tokio::sync::broadcast::Sender<()>,
}

impl QFleetDaemon {
    /// Connect the configured store and build the learning service
    pub async fn new(config: Config) -> Result<Self> {
        let store: Arc<dyn QValueStore> = if config.postgres.enabled {
            let database = Database::new(&config.postgres).await?;
            let store = PgQValueStore::new(
                database.pool().clone(),
                Duration::from_millis(config.postgres.statement_timeout_ms),
            );
            store
                .verify_schema()
                .await
                .context("Q-value schema check failed")?;
            Arc::new(store)
        } else {
            warn!("PostgreSQL disabled; learned values live in process memory only");
            Arc::new(MemoryStore::new())
        };

        Self::with_store(config, store)
    }

    /// Build a daemon over an already constructed store
    pub fn with_store(config: Config, store: Arc<dyn QValueStore>) -> Result<Self> {
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        let service = LearningService::new(&config, store).context("Invalid learning configuration")?;
        metrics::set_store_available(true);

        Ok(Self {
            config,
            state: DaemonState::new(Arc::new(service)),
            shutdown: shutdown_tx,
        })
    }

    pub fn state(&self) -> &DaemonState {
        &self.state
    }

    /// Run the API server and the retention job until shutdown
    pub async fn run(&self) -> Result<()> {
        info!("QFleet daemon running on {}", self.config.daemon.bind_address);

        let addr: std::net::SocketAddr = self
            .config
            .daemon
            .bind_address
            .parse()
            .context("Invalid daemon.bind_address")?;

        self.spawn_retention_job();

        let app = create_router(self.state.clone());
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let mut shutdown_rx = self.shutdown.subscribe();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }

    /// Stop serving and write every pending entry and trajectory
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down daemon...");
        let _ = self.shutdown.send(());

        for (kind, report) in self.state.service.flush_all().await {
            info!(
                "Final flush for {}: {} written, {} conflicts, {} trajectories",
                kind, report.written, report.conflicts, report.trajectories
            );
        }

        info!("Daemon shutdown complete");
        Ok(())
    }

    fn spawn_retention_job(&self) {
        let interval_secs = self.config.retention.cleanup_interval_secs;
        if interval_secs == 0 {
            info!("Trajectory cleanup disabled");
            return;
        }

        let service = self.state.service.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = service.run_cleanup().await {
                            error!("Trajectory cleanup failed: {}", e);
                        }
                        service.flush_all().await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }
}

type ApiError = (StatusCode, Json<serde_json::Value>);
type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

fn status_for(error: &QFleetError) -> StatusCode {
    match error {
        QFleetError::InvalidContext { .. } | QFleetError::EmptyActionSpace => StatusCode::BAD_REQUEST,
        QFleetError::ConcurrentUpdateConflict { .. } => StatusCode::CONFLICT,
        QFleetError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        QFleetError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(error: QFleetError) -> ApiError {
    let status = status_for(&error);
    if status.is_server_error() {
        warn!("Request failed: {}", error);
    }
    (
        status,
        Json(json!({
            "error": error.to_string(),
            "recoverable": error.is_recoverable(),
        })),
    )
}

/// Create the API router with state
pub fn create_router(state: DaemonState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/api/v1/learners", get(list_learners))
        .route("/api/v1/learners/:agent_kind/select", post(select_action))
        .route("/api/v1/learners/:agent_kind/transitions", post(record_transition))
        .route("/api/v1/flush", post(flush_all))
        .route("/api/v1/qvalues/:agent_kind/top", get(top_entries))
        .route("/api/v1/qvalues/:agent_kind/stats", get(aggregate_stats))
        .route("/api/v1/qvalues/:agent_kind/export", get(export_table))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES)),
        )
        .with_state(state)
}

async fn health_check(State(state): State<DaemonState>) -> (StatusCode, Json<serde_json::Value>) {
    let store_available = state.service.check_store().await;
    let status = if store_available { "healthy" } else { "degraded" };
    (
        StatusCode::OK,
        Json(json!({
            "status": status,
            "store_available": store_available,
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": (Utc::now() - state.started_at).num_seconds(),
        })),
    )
}

async fn get_metrics() -> String {
    metrics::encode_metrics()
}

async fn list_learners(State(state): State<DaemonState>) -> Json<Vec<LearnerStats>> {
    Json(state.service.learners().await)
}

async fn select_action(
    State(state): State<DaemonState>,
    Path(agent_kind): Path<String>,
    Json(request): Json<SelectRequest>,
) -> ApiResult<Selection> {
    state
        .service
        .select(&agent_kind, &request)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn record_transition(
    State(state): State<DaemonState>,
    Path(agent_kind): Path<String>,
    Json(request): Json<TransitionRequest>,
) -> ApiResult<TransitionReport> {
    state
        .service
        .record_transition(&agent_kind, request)
        .await
        .map(Json)
        .map_err(api_error)
}

#[derive(Debug, Serialize)]
pub struct FlushResponse {
    pub agent_kind: String,
    #[serde(flatten)]
    pub report: FlushReport,
}

async fn flush_all(State(state): State<DaemonState>) -> Json<Vec<FlushResponse>> {
    let reports = state.service.flush_all().await;
    Json(
        reports
            .into_iter()
            .map(|(agent_kind, report)| FlushResponse { agent_kind, report })
            .collect(),
    )
}

#[derive(Debug, Default, Deserialize)]
pub struct TopQuery {
    pub limit: Option<usize>,
}

async fn top_entries(
    State(state): State<DaemonState>,
    Path(agent_kind): Path<String>,
    Query(query): Query<TopQuery>,
) -> ApiResult<Vec<QEntry>> {
    let limit = query.limit.unwrap_or(DEFAULT_TOP_LIMIT).clamp(1, MAX_TOP_LIMIT);
    state
        .service
        .top_entries(&agent_kind, limit)
        .await
        .map(Json)
        .map_err(api_error)
}

#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    pub window_hours: Option<u32>,
}

async fn aggregate_stats(
    State(state): State<DaemonState>,
    Path(agent_kind): Path<String>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<AggregateStats> {
    state
        .service
        .aggregate_stats(&agent_kind, query.window_hours)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn export_table(
    State(state): State<DaemonState>,
    Path(agent_kind): Path<String>,
) -> ApiResult<QTableExport> {
    state
        .service
        .export(&agent_kind)
        .await
        .map(Json)
        .map_err(api_error)
}
