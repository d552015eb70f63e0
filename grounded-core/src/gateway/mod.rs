//! # HTTP Gateway
//!
//! JSON and server-sent-event endpoints over the query engine, the streaming
//! coordinator and the eval harness. Error bodies are `{"error": "..."}` and
//! never carry internal detail.

mod server;

pub use server::{AppState, SharedState, router, run};

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::error::{DatasetError, GroundedError, ValidationError};

/// Body of `POST /api/eval`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalRequest {
    /// Run history key. Defaults to `"api"`.
    #[serde(default)]
    pub dataset: Option<String>,
    pub cases: Vec<Value>,
    #[serde(default)]
    pub k: Option<usize>,
    /// Include per-case results in the response.
    #[serde(default)]
    pub include_cases: bool,
}

/// Error returned by handlers.
#[derive(Debug)]
pub enum ApiError {
    /// The request itself is wrong; the message is safe to show.
    BadRequest(String),
    /// Anything else. Details go to the log only.
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            ),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<DatasetError> for ApiError {
    fn from(err: DatasetError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<GroundedError> for ApiError {
    fn from(err: GroundedError) -> Self {
        match err {
            GroundedError::Validation(e) => e.into(),
            GroundedError::Dataset(e) => e.into(),
            other => {
                error!(error = %other, "Request failed");
                ApiError::Internal
            }
        }
    }
}
