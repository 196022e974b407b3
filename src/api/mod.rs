pub mod health;
pub mod positions;
pub mod scheduler;

use crate::access::AccessDirectory;
use crate::db::Repository;
use crate::domain::Actor;
use crate::engine::{ModificationPipeline, SettlementPipeline};
use crate::error::AppError;
use crate::scheduler::AutoCloseScheduler;
use axum::http::{header, HeaderMap};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<Repository>,
    pub settlement: Arc<SettlementPipeline>,
    pub modification: Arc<ModificationPipeline>,
    pub scheduler: Arc<AutoCloseScheduler>,
    pub access: Arc<dyn AccessDirectory>,
}

impl AppState {
    pub fn new(
        repo: Arc<Repository>,
        settlement: Arc<SettlementPipeline>,
        modification: Arc<ModificationPipeline>,
        scheduler: Arc<AutoCloseScheduler>,
        access: Arc<dyn AccessDirectory>,
    ) -> Self {
        Self {
            repo,
            settlement,
            modification,
            scheduler,
            access,
        }
    }
}

/// Resolve the `Authorization: Bearer` token to an actor.
///
/// # Errors
/// `Unauthorized` when the header is missing, malformed, or the token is
/// unknown to the session service.
pub(crate) async fn require_actor(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Actor, AppError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
        .ok_or(AppError::Unauthorized)?;

    state
        .access
        .resolve_session(token)
        .await?
        .ok_or(AppError::Unauthorized)
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health))
        .route("/positions", get(positions::list_positions))
        .route("/positions/:id", get(positions::get_position))
        .route("/positions/:id/close", post(positions::close_position))
        .route("/positions/:id/modify", post(positions::modify_position))
        .route("/scheduler/start", post(scheduler::start))
        .route("/scheduler/stop", post(scheduler::stop))
        .route("/scheduler/run-once", post(scheduler::run_once))
        .route("/scheduler/reset-stats", post(scheduler::reset_stats))
        .route("/scheduler/status", get(scheduler::status))
        .layer(cors)
        .with_state(state)
}
