//! Common types for REST API responses and errors

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::model::CoreType;
use crate::Error;

/// API error response
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub message: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        ApiError {
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
        (StatusCode::BAD_REQUEST, Json(ApiError::new(message)))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(self)).into_response()
    }
}

/// HTTP status for a control-plane error
pub fn status_of(err: &Error) -> StatusCode {
    match err {
        Error::Config(_) | Error::Parse(_) | Error::Validation { .. } | Error::Unsupported(_) => {
            StatusCode::BAD_REQUEST
        }
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Conflict(_) | Error::AlreadyRunning(_) => StatusCode::CONFLICT,
        Error::NotRunning(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Api(_) => StatusCode::BAD_GATEWAY,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::Io(_) | Error::Process { .. } | Error::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::new(err.to_string())
    }
}

/// Convert a control-plane error into an API error tuple.
pub fn api_error(err: Error) -> (StatusCode, Json<ApiError>) {
    (status_of(&err), Json(ApiError::from(err)))
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

/// `?force=` on restart endpoints
#[derive(Debug, Default, Deserialize)]
pub struct ForceParams {
    #[serde(default)]
    pub force: bool,
}

/// `?reset=` on traffic endpoints
#[derive(Debug, Default, Deserialize)]
pub struct ResetParams {
    #[serde(default)]
    pub reset: bool,
}

/// `?core=` on the node config endpoint
#[derive(Debug, Deserialize)]
pub struct CoreParams {
    #[serde(default)]
    pub core: CoreType,
}

/// Core switch request body
#[derive(Debug, Deserialize)]
pub struct SwitchRequest {
    #[serde(rename = "type")]
    pub core: String,
}
