use crate::api::{require_actor, AppState};
use crate::domain::{Actor, Money, PositionStatus, TradePosition};
use crate::engine::{CloseOverrides, FieldChangeRequest, Settlement};
use crate::error::AppError;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPositionsQuery {
    pub status: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPositionsResponse {
    pub success: bool,
    pub positions: Vec<TradePosition>,
}

/// Which account scope the caller may list.
///
/// Traders see their own positions; mentors must name an account they are
/// assigned to; admins see everything.
async fn list_scope(
    state: &AppState,
    actor: &Actor,
    requested: Option<&str>,
) -> Result<Option<String>, AppError> {
    if actor.is_admin() {
        return Ok(requested.map(str::to_string));
    }
    if actor.is_mentor() {
        let account_id = requested.ok_or_else(|| {
            AppError::validation("userId", "mentors must name an account to list")
        })?;
        if !state.access.is_mentor_assigned(&actor.id, account_id).await? {
            return Err(AppError::Forbidden);
        }
        return Ok(Some(account_id.to_string()));
    }
    match requested {
        Some(id) if id != actor.id => Err(AppError::Forbidden),
        _ => Ok(Some(actor.id.clone())),
    }
}

pub async fn list_positions(
    Query(params): Query<ListPositionsQuery>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ListPositionsResponse>, AppError> {
    let actor = require_actor(&state, &headers).await?;

    let status = match params.status.as_deref() {
        Some(s) => Some(
            PositionStatus::from_str(s).map_err(|e| AppError::validation("status", e))?,
        ),
        None => None,
    };

    let account_id = list_scope(&state, &actor, params.user_id.as_deref()).await?;
    let positions = state
        .repo
        .list_positions(status, account_id.as_deref())
        .await?;

    Ok(Json(ListPositionsResponse {
        success: true,
        positions,
    }))
}

/// Owner, admin, or a mentor assigned to the owning account.
async fn authorize_position_access(
    state: &AppState,
    actor: &Actor,
    position: &TradePosition,
) -> Result<(), AppError> {
    if actor.is_admin() || actor.id == position.account_id {
        return Ok(());
    }
    if actor.is_mentor()
        && state
            .access
            .is_mentor_assigned(&actor.id, &position.account_id)
            .await?
    {
        return Ok(());
    }
    Err(AppError::Forbidden)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionResponse {
    pub success: bool,
    pub position: TradePosition,
}

pub async fn get_position(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<PositionResponse>, AppError> {
    let actor = require_actor(&state, &headers).await?;

    let position = state
        .repo
        .get_position(&id)
        .await?
        .ok_or_else(|| AppError::NotFound("position".to_string()))?;
    authorize_position_access(&state, &actor, &position).await?;

    Ok(Json(PositionResponse {
        success: true,
        position,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseRequest {
    pub close_price: Option<Money>,
    pub profit: Option<Money>,
    pub amount: Option<Money>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseResponse {
    pub success: bool,
    pub already_closed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement: Option<Settlement>,
}

pub async fn close_position(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<CloseRequest>>,
) -> Result<Json<CloseResponse>, AppError> {
    let actor = require_actor(&state, &headers).await?;
    let request = body.map(|Json(r)| r).unwrap_or_default();

    if let Some(price) = request.close_price {
        if !price.is_positive() {
            return Err(AppError::validation("closePrice", "must be positive"));
        }
    }
    if let Some(amount) = request.amount {
        if !amount.is_positive() {
            return Err(AppError::validation("amount", "must be positive"));
        }
    }

    let position = state
        .repo
        .get_position(&id)
        .await?
        .ok_or_else(|| AppError::NotFound("position".to_string()))?;
    authorize_position_access(&state, &actor, &position).await?;

    // Closing an already-closed position is not an error; the caller's goal
    // is satisfied.
    if !position.status.is_open() {
        return Ok(Json(CloseResponse {
            success: true,
            already_closed: true,
            settlement: None,
        }));
    }

    let overrides = CloseOverrides {
        close_price: request.close_price,
        profit: request.profit,
        amount: request.amount,
    };
    let settlement = state
        .settlement
        .settle_manual(&position, overrides, &actor)
        .await?;

    // None means a concurrent close won the status CAS.
    Ok(Json(CloseResponse {
        success: true,
        already_closed: settlement.is_none(),
        settlement,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifyRequest {
    pub modifications: Vec<FieldChangeRequest>,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifyResponse {
    pub success: bool,
    pub fields_changed: usize,
    pub position: TradePosition,
}

pub async fn modify_position(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ModifyRequest>,
) -> Result<Json<ModifyResponse>, AppError> {
    let actor = require_actor(&state, &headers).await?;

    let updated = state
        .modification
        .modify(&id, &request.modifications, &request.reason, &actor)
        .await?;

    Ok(Json(ModifyResponse {
        success: true,
        fields_changed: request.modifications.len(),
        position: updated,
    }))
}
