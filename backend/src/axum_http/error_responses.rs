use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::usecases::subscriptions::SubscriptionError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: u16,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Upstream failure: {0}")]
    Upstream(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl From<SubscriptionError> for AppError {
    fn from(err: SubscriptionError) -> Self {
        let status = err.status_code();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %err, "http: request failed");
        } else {
            warn!(status = status.as_u16(), error = %err, "http: request rejected");
        }

        match err {
            SubscriptionError::Validation(message) => AppError::BadRequest(message),
            SubscriptionError::NotFound(message) => AppError::NotFound(message.to_string()),
            SubscriptionError::Forbidden => AppError::Forbidden(err.to_string()),
            SubscriptionError::Conflict { .. } | SubscriptionError::InvalidState(_) => {
                AppError::Conflict(err.to_string())
            }
            SubscriptionError::Upstream(_) => AppError::Upstream(err.to_string()),
            SubscriptionError::Internal(inner) => AppError::Internal(inner),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Upstream(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::Internal(_) => {
                // Don't leak internal error detail to client
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = Json(ErrorResponse {
            code: status.as_u16(),
            message,
        });

        (status, body).into_response()
    }
}
