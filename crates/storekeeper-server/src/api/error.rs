//! API error type and the JSON error envelope.
//!
//! Two kinds of failure leave the API: *operational* errors carry a stable
//! code and a status the caller can act on; everything unexpected maps to
//! `INTERNAL_SERVER_ERROR`. Every error response serializes as
//!
//! ```json
//! { "error": { "code": "<CODE>", "message": "<human text>" } }
//! ```
//!
//! Outside production, 500 responses additionally include a `stack` field
//! with the debug rendering of the underlying error; in production the
//! message is fixed and nothing leaks.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Stable machine-readable error codes of the REST contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// `name` missing or empty after trim.
    MissingStoreName,
    /// `name` outside the 2-100 character bounds.
    InvalidStoreName,
    /// Unknown engine tag.
    InvalidEngine,
    /// Engine failed its availability check.
    EngineUnavailable,
    /// Active store count reached the configured maximum.
    QuotaExceeded,
    /// Per-IP rate limit tripped.
    RateLimitExceeded,
    /// No such store (or no such route).
    NotFound,
    /// The requested operation is not valid from the store's status.
    InvalidStateTransition,
    /// Another lifecycle operation is running against the store.
    OperationInProgress,
    /// The request body is not valid JSON.
    InvalidJson,
    /// Anything unexpected.
    InternalServerError,
}

impl ErrorCode {
    /// Wire form of the code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MissingStoreName => "MISSING_STORE_NAME",
            Self::InvalidStoreName => "INVALID_STORE_NAME",
            Self::InvalidEngine => "INVALID_ENGINE",
            Self::EngineUnavailable => "ENGINE_UNAVAILABLE",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::InvalidStateTransition => "INVALID_STATE_TRANSITION",
            Self::OperationInProgress => "OPERATION_IN_PROGRESS",
            Self::InvalidJson => "INVALID_JSON",
            Self::InternalServerError => "INTERNAL_SERVER_ERROR",
        }
    }
}

/// An operational API error: status, stable code, human message.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: ErrorCode,
    message: String,
    stack: Option<String>,
}

impl ApiError {
    /// Builds an error from its parts.
    #[must_use]
    pub fn new(status: StatusCode, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            stack: None,
        }
    }

    /// 400 `MISSING_STORE_NAME`.
    #[must_use]
    pub fn missing_store_name() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            ErrorCode::MissingStoreName,
            "Store name is required",
        )
    }

    /// 400 `INVALID_STORE_NAME`.
    #[must_use]
    pub fn invalid_store_name() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidStoreName,
            "Store name must be between 2 and 100 characters",
        )
    }

    /// 400 `INVALID_ENGINE`.
    #[must_use]
    pub fn invalid_engine(engine: &str) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidEngine,
            format!("Unknown engine: {engine}"),
        )
    }

    /// 400 `ENGINE_UNAVAILABLE`.
    #[must_use]
    pub fn engine_unavailable(reason: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            ErrorCode::EngineUnavailable,
            reason,
        )
    }

    /// 429 `QUOTA_EXCEEDED`.
    #[must_use]
    pub fn quota_exceeded(max_stores: u32) -> Self {
        Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::QuotaExceeded,
            format!("Maximum number of active stores ({max_stores}) reached"),
        )
    }

    /// 429 `RATE_LIMIT_EXCEEDED`.
    #[must_use]
    pub fn rate_limited() -> Self {
        Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::RateLimitExceeded,
            "Too many requests, please try again later",
        )
    }

    /// 404 `NOT_FOUND` for a store id.
    #[must_use]
    pub fn store_not_found(id: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            ErrorCode::NotFound,
            format!("Store not found: {id}"),
        )
    }

    /// 404 `NOT_FOUND` for an unknown route.
    #[must_use]
    pub fn route_not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, ErrorCode::NotFound, "Not found")
    }

    /// 409 `INVALID_STATE_TRANSITION`.
    #[must_use]
    pub fn invalid_state_transition(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::CONFLICT,
            ErrorCode::InvalidStateTransition,
            message,
        )
    }

    /// 409 `OPERATION_IN_PROGRESS`.
    #[must_use]
    pub fn operation_in_progress(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, ErrorCode::OperationInProgress, message)
    }

    /// 400 `INVALID_JSON`.
    #[must_use]
    pub fn invalid_json(detail: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidJson,
            format!("Invalid JSON body: {}", detail.into()),
        )
    }

    /// 500 `INTERNAL_SERVER_ERROR`.
    ///
    /// In production the message is fixed and no detail is attached;
    /// otherwise the raw message and a debug rendering travel with the
    /// response for debuggability.
    #[must_use]
    pub fn internal<E>(error: &E, production: bool) -> Self
    where
        E: std::fmt::Display + std::fmt::Debug,
    {
        if production {
            Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::InternalServerError,
                "An unexpected error occurred",
            )
        } else {
            Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: ErrorCode::InternalServerError,
                message: error.to_string(),
                stack: Some(format!("{error:?}")),
            }
        }
    }

    /// The HTTP status of this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// The stable code of this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        self.code
    }

    /// The human-readable message of this error.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    code: &'static str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stack: Option<&'a str>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.as_str(),
                message: &self.message,
                stack: self.stack.as_deref(),
            },
        };
        (self.status, Json(&body)).into_response()
    }
}
