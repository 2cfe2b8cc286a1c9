//! HTTP admin API over the [`AutomationController`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::controller::{AutomationController, AutomationState};
use crate::error::{EngineError, Result};
use crate::health::SystemHealth;
use crate::history::CalculationHistoryEntry;
use crate::scheduler::{EnqueueOutcome, Job, JobId, Priority};
use crate::snapshot::{Snapshot, SnapshotMeta};
use crate::standings::{Game, StandingsTable, TableKey};

const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Clone)]
pub struct DashboardState {
    pub controller: Arc<AutomationController>,
}

/// Engine errors rendered as `{"error": kind, "message": text}`.
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::AlreadyProcessing(_) => StatusCode::CONFLICT,
            EngineError::AutomationStopped => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::InvalidInput(_)
            | EngineError::EmptyInput
            | EngineError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            EngineError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            EngineError::StorageError(_) | EngineError::Io(_) | EngineError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Admin request failed");
        }
        let body = ErrorBody {
            error: self.0.kind(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

#[derive(Serialize)]
struct StateResponse {
    state: AutomationState,
}

#[derive(Deserialize)]
struct RecalculateRequest {
    league: String,
    season: String,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Serialize)]
struct RecalculateResponse {
    job_id: JobId,
}

#[derive(Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum GameEventRequest {
    Saved {
        game: Game,
    },
    Created {
        game: Game,
    },
    Deleted {
        league: String,
        season: String,
        game_id: String,
    },
}

#[derive(Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct PruneResponse {
    removed: usize,
}

pub fn router(state: DashboardState) -> Router {
    Router::new()
        .route("/api/automation", get(automation_state_handler))
        .route("/api/automation/start", post(start_handler))
        .route("/api/automation/pause", post(pause_handler))
        .route("/api/automation/resume", post(resume_handler))
        .route("/api/automation/stop", post(stop_handler))
        .route("/api/recalculate", post(recalculate_handler))
        .route("/api/events/game", post(game_event_handler))
        .route("/api/queue", get(queue_status_handler))
        .route("/api/queue/jobs", get(pending_jobs_handler))
        .route("/api/jobs/:id", get(get_job_handler).delete(cancel_job_handler))
        .route(
            "/api/leagues/:league/seasons/:season/table",
            get(live_table_handler),
        )
        .route(
            "/api/leagues/:league/seasons/:season/snapshots",
            get(list_snapshots_handler),
        )
        .route("/api/leagues/:league/history", get(history_handler))
        .route("/api/snapshots/prune", post(prune_snapshots_handler))
        .route(
            "/api/snapshots/:id",
            get(get_snapshot_handler).delete(delete_snapshot_handler),
        )
        .route("/api/snapshots/:id/rollback", post(rollback_handler))
        .route("/api/health", get(health_handler))
        .with_state(state)
}

/// Serve the admin API until `shutdown` is cancelled.
pub async fn run_dashboard(
    addr: SocketAddr,
    state: DashboardState,
    shutdown: CancellationToken,
) -> Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = router(state).layer(cors);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Admin API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    tracing::info!("Admin API stopped");
    Ok(())
}

async fn automation_state_handler(State(state): State<DashboardState>) -> Json<StateResponse> {
    Json(StateResponse {
        state: state.controller.state(),
    })
}

async fn start_handler(State(state): State<DashboardState>) -> ApiResult<StateResponse> {
    state.controller.start().await?;
    Ok(Json(StateResponse {
        state: state.controller.state(),
    }))
}

async fn pause_handler(State(state): State<DashboardState>) -> ApiResult<StateResponse> {
    state.controller.pause()?;
    Ok(Json(StateResponse {
        state: state.controller.state(),
    }))
}

async fn resume_handler(State(state): State<DashboardState>) -> ApiResult<StateResponse> {
    state.controller.resume()?;
    Ok(Json(StateResponse {
        state: state.controller.state(),
    }))
}

async fn stop_handler(State(state): State<DashboardState>) -> Json<StateResponse> {
    state.controller.stop();
    Json(StateResponse {
        state: state.controller.state(),
    })
}

async fn recalculate_handler(
    State(state): State<DashboardState>,
    Json(req): Json<RecalculateRequest>,
) -> ApiResult<RecalculateResponse> {
    let job_id = state
        .controller
        .trigger_recalculation(&req.league, &req.season, req.priority, req.description)
        .await?;
    Ok(Json(RecalculateResponse { job_id }))
}

async fn game_event_handler(
    State(state): State<DashboardState>,
    Json(event): Json<GameEventRequest>,
) -> ApiResult<EnqueueOutcome> {
    let controller = &state.controller;
    let outcome = match event {
        GameEventRequest::Saved { game } => controller.game_saved(&game).await?,
        GameEventRequest::Created { game } => controller.game_created(&game).await?,
        GameEventRequest::Deleted {
            league,
            season,
            game_id,
        } => {
            controller
                .game_deleted(TableKey::new(league, season), &game_id)
                .await?
        }
    };
    Ok(Json(outcome))
}

async fn queue_status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.controller.queue_status().await)
}

async fn pending_jobs_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.controller.pending_jobs().await)
}

async fn get_job_handler(
    State(state): State<DashboardState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Job> {
    Ok(Json(state.controller.job(&id).await?))
}

async fn cancel_job_handler(
    State(state): State<DashboardState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Job> {
    Ok(Json(state.controller.cancel(&id).await?))
}

async fn live_table_handler(
    State(state): State<DashboardState>,
    Path((league, season)): Path<(String, String)>,
) -> ApiResult<StandingsTable> {
    let table = state
        .controller
        .live_table(&TableKey::new(league, season))
        .await?;
    Ok(Json(table.as_ref().clone()))
}

async fn list_snapshots_handler(
    State(state): State<DashboardState>,
    Path((league, season)): Path<(String, String)>,
) -> ApiResult<Vec<SnapshotMeta>> {
    let metas = state
        .controller
        .list_snapshots(&TableKey::new(league, season))
        .await?;
    Ok(Json(metas))
}

async fn get_snapshot_handler(
    State(state): State<DashboardState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Snapshot> {
    Ok(Json(state.controller.snapshot(&id).await?))
}

async fn delete_snapshot_handler(
    State(state): State<DashboardState>,
    Path(id): Path<Uuid>,
) -> std::result::Result<StatusCode, ApiError> {
    state.controller.delete_snapshot(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn rollback_handler(
    State(state): State<DashboardState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StandingsTable> {
    let table = state.controller.rollback(&id).await?;
    Ok(Json(table.as_ref().clone()))
}

async fn prune_snapshots_handler(State(state): State<DashboardState>) -> ApiResult<PruneResponse> {
    let removed = state.controller.prune_snapshots().await?;
    Ok(Json(PruneResponse { removed }))
}

async fn health_handler(
    State(state): State<DashboardState>,
) -> ApiResult<SystemHealth> {
    Ok(Json(state.controller.health().await?))
}

async fn history_handler(
    State(state): State<DashboardState>,
    Path(league): Path<String>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Vec<CalculationHistoryEntry>> {
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    Ok(Json(state.controller.history(&league, limit).await?))
}
