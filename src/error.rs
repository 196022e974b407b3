//! Top-level API error type and its HTTP mapping.

use crate::access::AccessError;
use crate::engine::{ModifyError, SettleError};
use crate::pricing::PriceError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Everything a handler can fail with, mapped onto the response taxonomy.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{message}")]
    Validation { field: Option<String>, message: String },
    #[error("authentication required")]
    Unauthorized,
    #[error("not allowed")]
    Forbidden,
    #[error("{0} not found")]
    NotFound(String),
    #[error("{message}")]
    Conflict { message: String },
    #[error("no price source available")]
    PriceUnavailable,
    #[error("internal error")]
    Internal(anyhow::Error),
}

impl AppError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::Validation {
            field: Some(field.into()),
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        AppError::Validation {
            field: None,
            message: message.into(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation { .. } => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict { .. } => StatusCode::CONFLICT,
            AppError::PriceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Internal(err) = &self {
            error!(error = %err, "request failed");
        }

        let mut body = json!({
            "success": false,
            "message": self.to_string(),
        });
        if let AppError::Validation {
            field: Some(field), ..
        } = &self
        {
            body["field"] = json!(field);
        }

        (self.status(), Json(body)).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Internal(err.into())
    }
}

impl From<AccessError> for AppError {
    fn from(err: AccessError) -> Self {
        AppError::Internal(err.into())
    }
}

impl From<PriceError> for AppError {
    fn from(err: PriceError) -> Self {
        match err {
            PriceError::Unavailable { .. } => AppError::PriceUnavailable,
            other => AppError::Internal(other.into()),
        }
    }
}

impl From<SettleError> for AppError {
    fn from(err: SettleError) -> Self {
        match err {
            SettleError::Price(e) => e.into(),
            SettleError::Persistence(e) => e.into(),
        }
    }
}

impl From<ModifyError> for AppError {
    fn from(err: ModifyError) -> Self {
        match err {
            ModifyError::NotFound => AppError::NotFound("position".to_string()),
            ModifyError::Validation { field, message } => AppError::validation(field, message),
            ModifyError::Conflict { field } => AppError::Conflict {
                message: format!("value for {} is stale", field),
            },
            ModifyError::Forbidden => AppError::Forbidden,
            ModifyError::Persistence(e) => e.into(),
            ModifyError::Access(e) => e.into(),
        }
    }
}
