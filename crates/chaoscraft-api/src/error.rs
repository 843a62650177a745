//! ---
//! cc_section: "05-networking-external-interfaces"
//! cc_subsection: "module"
//! cc_type: "source"
//! cc_scope: "code"
//! cc_description: "Mapping of lifecycle errors onto HTTP responses."
//! cc_version: "v0.1.0"
//! cc_owner: "tbd"
//! ---
use std::time::Duration;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chaoscraft_core::{ConflictReason, ErrorKind, LifecycleError};
use chaoscraft_store::Experiment;
use serde::Serialize;
use tracing::error;

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: ErrorKind,
    message: String,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<ConflictReason>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    problems: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    experiment: Option<Box<Experiment>>,
}

/// Error returned by every handler.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                error: ErrorBody {
                    kind,
                    message: message.into(),
                    retryable: false,
                    reason: None,
                    problems: Vec::new(),
                },
                experiment: None,
            },
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, ErrorKind::NotFound, message)
    }

    pub fn validation(problems: Vec<String>) -> Self {
        let mut err = Self::new(
            StatusCode::BAD_REQUEST,
            ErrorKind::Validation,
            format!("invalid request: {}", problems.join("; ")),
        );
        err.body.error.problems = problems;
        err
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::InternalInconsistency,
            message,
        )
    }

    /// The handler did not finish within `deadline`. A start or stop keeps
    /// running on its own task, so the caller should poll the experiment.
    pub fn timeout(deadline: Duration) -> Self {
        let mut err = Self::new(
            StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Timeout,
            format!(
                "request did not complete within {:?}; a started transition still settles, poll the experiment for its outcome",
                deadline
            ),
        );
        err.body.error.retryable = true;
        err
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Effect => StatusCode::BAD_GATEWAY,
        ErrorKind::StoreTransient => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::StoreFatal | ErrorKind::InternalInconsistency => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        let kind = err.kind();
        let status = status_for(kind);
        if status.is_server_error() && kind != ErrorKind::StoreTransient {
            error!(kind = kind.as_str(), error = %err, "request failed");
        }
        let retryable = err.is_retryable();
        let reason = err.conflict_reason();
        let message = err.to_string();
        let (problems, experiment) = match err {
            LifecycleError::Validation(problems) => (problems, None),
            LifecycleError::Effect { experiment, .. } => (Vec::new(), Some(experiment)),
            _ => (Vec::new(), None),
        };
        Self {
            status,
            body: ErrorResponse {
                error: ErrorBody {
                    kind,
                    message,
                    retryable,
                    reason,
                    problems,
                },
                experiment,
            },
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::validation(vec![rejection.body_text()])
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::validation(vec![rejection.body_text()])
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
