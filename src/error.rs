use std::panic::Location;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

/// Logs `source` with the call-site location and the current span trace.
///
/// Every error that crosses a component boundary is logged once, here,
/// before it is classified and handed back to the caller.
#[inline]
#[track_caller]
pub fn log(source: &dyn std::error::Error) {
    let location = Location::caller();
    let span_trace = tracing_error::SpanTrace::capture();

    error!(
        target: "metabindd",
        %location,
        error = %source,
        "span trace:\n{span_trace}"
    );
}

/// The error taxonomy from the instance-binding contract (kinds, not concrete types).
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,

    #[error("bad request")]
    BadRequest(Vec<FieldMessage>),

    #[error("upstream returned unexpected status {0}")]
    Upstream(u16),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("request was cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldMessage {
    pub field: String,
    pub message: String,
}

impl FieldMessage {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl ApiError {
    pub fn internal(err: impl std::error::Error) -> Self {
        log(&err);
        ApiError::Internal(err.to_string())
    }

    pub fn storage(err: impl std::error::Error) -> Self {
        log(&err);
        ApiError::Storage(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    fields: Option<Vec<FieldMessage>>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, fields) = match &self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, None),
            ApiError::BadRequest(fields) => (StatusCode::BAD_REQUEST, Some(fields.clone())),
            ApiError::Upstream(_) => (StatusCode::INTERNAL_SERVER_ERROR, None),
            ApiError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, None),
            // Cancellation is never meant to reach a client (spec: "the
            // response is simply not sent"); handlers that observe it
            // should drop the connection rather than call into_response.
            // This arm exists so the type remains total.
            ApiError::Cancelled => (StatusCode::INTERNAL_SERVER_ERROR, None),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };

        let body = ErrorBody {
            error: self.to_string(),
            fields,
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Unwraps a `Result`, logging and converting the error into
/// `ApiError::Storage` on failure. Named and shaped after the upstream
/// service's `try_!` macro: log once at the source, then propagate.
macro_rules! try_storage {
    ($result:expr) => {
        match $result {
            Ok(val) => val,
            Err(err) => {
                crate::error::log(&err);
                return Err(crate::error::ApiError::Storage(err.to_string()));
            }
        }
    };
}

pub(crate) use try_storage;
