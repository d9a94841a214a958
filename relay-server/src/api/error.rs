use super::handlers::ApiResponse;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use common::RelayError;
use thiserror::Error;
use tracing::{error, warn};

/// HTTP 层错误
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Relay(#[from] RelayError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Relay(e) => match e {
                RelayError::ClientNotFound(_) | RelayError::ModelNotFound(_) => StatusCode::NOT_FOUND,
                RelayError::InvalidModelConfig(_) => StatusCode::UNPROCESSABLE_ENTITY,
                RelayError::ModelExists(_) => StatusCode::CONFLICT,
                RelayError::ProtocolError(_) => StatusCode::BAD_REQUEST,
                RelayError::CallTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("✗ {}", self);
        } else {
            warn!("⚠️  {}", self);
        }
        (status, Json(ApiResponse::<()>::error(self.to_string()))).into_response()
    }
}
