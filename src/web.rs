use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::info;
use serde_json::{json, Value};
use std::time::Duration;

use crate::error::SyncError;
use crate::sync::worker::BatchOutcome;
use crate::sync::{planner, worker};
use crate::AppState;

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        ApiError {
            status,
            message: message.into(),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Single capability gate used by every sync route: the out-of-scope auth
/// layer fronting this service injects the owner identity as a header.
fn authenticated_owner(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|owner| !owner.is_empty())
        .map(String::from)
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "missing x-user-id header"))
}

/// POST /sync — run the planner for the caller and create a job from a
/// non-empty delta. An up-to-date mailbox creates nothing.
async fn create_sync_job(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let owner = authenticated_owner(&headers)?;
    let net_timeout = Duration::from_secs(state.sync.network_timeout_secs);

    let plan = planner::plan(&state.store, &state.vault, &owner, net_timeout).await?;
    let plan = match plan {
        Some(plan) => plan,
        None => return Ok(Json(json!({ "message": "No new emails." }))),
    };

    let (job, pending) = {
        let store = state.store.lock().expect("store mutex poisoned");
        let job = store.create_job(&owner, &plan)?;
        let pending = store.pending_map(job.id)?;
        (job, pending)
    };
    info!(
        "created sync job {} for {} ({} messages)",
        job.id, owner, job.total_count
    );
    Ok(Json(json!({ "job": job, "uids_to_process": pending })))
}

/// POST /sync/process — one batch worker invocation. Used for the initial
/// trigger; continuation happens in-process.
async fn process_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authenticated_owner(&headers)?;

    let body = match worker::process_batch(state).await? {
        BatchOutcome::Idle => json!({ "message": "No pending sync jobs." }),
        BatchOutcome::Processed {
            job_id,
            attempted,
            finished,
        } => json!({
            "message": format!("Processed {} messages for job {}.", attempted, job_id),
            "finished": finished,
        }),
        BatchOutcome::Failed { job_id, error } => json!({
            "message": format!("Job {} failed: {}", job_id, error),
        }),
    };
    Ok(Json(body))
}

/// GET /sync/jobs/:id — progress polling for the triggering UI.
async fn get_sync_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let owner = authenticated_owner(&headers)?;

    let (job, pending) = {
        let store = state.store.lock().expect("store mutex poisoned");
        (store.get_job(job_id)?, store.pending_map(job_id)?)
    };
    let job = job
        .filter(|job| job.owner_id == owner)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("no sync job {}", job_id)))?;

    Ok(Json(json!({ "job": job, "uids_to_process": pending })))
}

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/sync", post(create_sync_job))
        .route("/sync/process", post(process_batch))
        .route("/sync/jobs/:job_id", get(get_sync_job))
        .with_state(state)
}

pub async fn start_web_server(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    info!("Server running on http://{}:{}", host, port);
    axum::serve(listener, router).await?;
    Ok(())
}
