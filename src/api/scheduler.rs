use crate::api::{require_actor, AppState};
use crate::error::AppError;
use crate::scheduler::SchedulerStatus;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};

/// Timer control is admin-only; status is open to any authenticated actor.
async fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let actor = require_actor(state, headers).await?;
    if actor.is_admin() {
        Ok(())
    } else {
        Err(AppError::Forbidden)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub interval_minutes: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub success: bool,
    /// False when a timer was already running and was left untouched.
    pub started: bool,
    pub status: SchedulerStatus,
}

pub async fn start(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<StartRequest>,
) -> Result<Json<StartResponse>, AppError> {
    require_admin(&state, &headers).await?;

    if request.interval_minutes == 0 {
        return Err(AppError::validation("intervalMinutes", "must be at least 1"));
    }

    let started = state.scheduler.start(request.interval_minutes).await;
    Ok(Json(StartResponse {
        success: true,
        started,
        status: state.scheduler.status().await,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopResponse {
    pub success: bool,
    /// False when no timer was running.
    pub stopped: bool,
    pub status: SchedulerStatus,
}

pub async fn stop(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<StopResponse>, AppError> {
    require_admin(&state, &headers).await?;

    let stopped = state.scheduler.stop().await;
    Ok(Json(StopResponse {
        success: true,
        stopped,
        status: state.scheduler.status().await,
    }))
}

pub async fn run_once(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    require_admin(&state, &headers).await?;

    let report = state.scheduler.run_once().await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "report": report,
    })))
}

pub async fn reset_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    require_admin(&state, &headers).await?;

    state.scheduler.reset_stats().await;
    Ok(Json(serde_json::json!({"success": true})))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub success: bool,
    #[serde(flatten)]
    pub status: SchedulerStatus,
}

pub async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, AppError> {
    require_actor(&state, &headers).await?;

    Ok(Json(StatusResponse {
        success: true,
        status: state.scheduler.status().await,
    }))
}
