use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::error::RenewalError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
}

/// Handler error wrapper so `RenewalError` can be returned straight from axum handlers.
#[derive(Debug)]
pub struct ApiError(pub RenewalError);

impl From<RenewalError> for ApiError {
    fn from(err: RenewalError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            RenewalError::SystemNotFound(_) | RenewalError::PointNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            RenewalError::Extraction(_) => (StatusCode::UNPROCESSABLE_ENTITY, "extraction_failed"),
            RenewalError::ConcurrencyConflict(_) => (StatusCode::CONFLICT, "conflict"),
            RenewalError::Config(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            RenewalError::StaleSnapshot(_) => (StatusCode::SERVICE_UNAVAILABLE, "stale_snapshot"),
            RenewalError::PartnerApi { .. } | RenewalError::Http(_) => (StatusCode::BAD_GATEWAY, "partner_unavailable"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }

        let body = ErrorResponse {
            error: code,
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
