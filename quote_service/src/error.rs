//! HTTP error mapping.
//!
//! Store and dispatcher errors travel unchanged up to the handlers; this is
//! the only place they become status codes.

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::{dispatcher::DispatchError, store::StoreError};

/// Error returned by every handler
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),
}

/// Error response body
#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Store(StoreError::NotFound) => StatusCode::NOT_FOUND,
            ApiError::MalformedInput(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Dispatch(DispatchError::Saturated { .. }) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Dispatch(DispatchError::Cancelled { .. })
            | ApiError::Dispatch(DispatchError::TimedOut { .. }) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Dispatch(DispatchError::TaskFailed(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Dispatch(DispatchError::Closed) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Store(StoreError::NotFound) => "NOT_FOUND",
            ApiError::MalformedInput(_) => "MALFORMED_INPUT",
            ApiError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            ApiError::Dispatch(DispatchError::Saturated { .. }) => "SATURATED",
            ApiError::Dispatch(DispatchError::Cancelled { .. })
            | ApiError::Dispatch(DispatchError::TimedOut { .. }) => "TIMED_OUT",
            ApiError::Dispatch(DispatchError::TaskFailed(_)) => "TASK_FAILED",
            ApiError::Dispatch(DispatchError::Closed) => "SERVICE_UNAVAILABLE",
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        // A body cut off by the size limit surfaces here when no Content-Length was sent.
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge(rejection.body_text())
        } else {
            ApiError::MalformedInput(rejection.body_text())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }

        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
