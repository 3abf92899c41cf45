//! HTTP error mapping.
//!
//! Handlers return [`ApiError`]; engine reports are classified by their
//! current context so callers get a status code they can act on while the
//! full report goes to the log.

use autorule_workflow::EngineError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rootcause::prelude::Report;
use serde_json::json;
use std::fmt;

/// Errors returned by API handlers.
#[derive(Debug)]
pub enum ApiError {
    /// Malformed path, query or body.
    BadRequest(String),
    NotFound(String),
    /// Well-formed but rejected, e.g. a completion naming an unknown port.
    Unprocessable(String),
    /// Journal or rule store failure.
    Unavailable(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "bad request: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Unprocessable(msg) => write!(f, "unprocessable: {msg}"),
            Self::Unavailable(msg) => write!(f, "unavailable: {msg}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<Report<EngineError>> for ApiError {
    fn from(report: Report<EngineError>) -> Self {
        match report.current_context() {
            EngineError::RunNotFound { .. }
            | EngineError::RuleNotFound { .. }
            | EngineError::NodeNotFound { .. } => Self::NotFound(report.current_context().to_string()),
            EngineError::UnknownPort { .. } => {
                Self::Unprocessable(report.current_context().to_string())
            }
            EngineError::Matching(_) | EngineError::Orchestration(_) => {
                tracing::error!(error = %report, "engine request failed");
                Self::Unavailable(report.current_context().to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            Self::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
