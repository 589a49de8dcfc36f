//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common::InstanceId;
use projections::ProjectionError;
use saga_engine::{EngineError, FailureKind};
use saga_log::SagaLogError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Engine error, including refused commands.
    Engine(EngineError),
    /// Transaction log error.
    Log(SagaLogError),
    /// Read model error.
    Projection(ProjectionError),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, instance_id) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            ApiError::Engine(err) => engine_error_to_response(err),
            ApiError::Log(err) => log_error_to_response(err),
            ApiError::Projection(err) => match err {
                ProjectionError::Log(err) => log_error_to_response(err),
                other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string(), None),
            },
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, None),
        };

        if status.is_server_error() {
            tracing::error!(error = %message, "internal server error");
        }

        let body = serde_json::json!({ "error": message, "instance_id": instance_id });
        (status, axum::Json(body)).into_response()
    }
}

fn engine_error_to_response(err: EngineError) -> (StatusCode, String, Option<InstanceId>) {
    match err {
        EngineError::Log(err) => log_error_to_response(err),
        EngineError::CommandFailed(failure) => {
            let status = match failure.kind {
                FailureKind::Conflict => StatusCode::CONFLICT,
                FailureKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
            };
            (status, failure.reason, Some(failure.instance_id))
        }
        EngineError::TemplateNotFound(_) => (StatusCode::NOT_FOUND, err.to_string(), None),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string(), None),
    }
}

fn log_error_to_response(err: SagaLogError) -> (StatusCode, String, Option<InstanceId>) {
    match &err {
        SagaLogError::InstanceNotFound(id) => (StatusCode::NOT_FOUND, err.to_string(), Some(*id)),
        SagaLogError::TransactionNotFound { instance_id, .. } => {
            (StatusCode::NOT_FOUND, err.to_string(), Some(*instance_id))
        }
        SagaLogError::DuplicateTransaction { instance_id, .. } => {
            (StatusCode::CONFLICT, err.to_string(), Some(*instance_id))
        }
        SagaLogError::InvalidStatusTransition { .. } => (StatusCode::CONFLICT, err.to_string(), None),
        SagaLogError::UnknownTransactionKind(_)
        | SagaLogError::EmptyBatch
        | SagaLogError::CounterOutOfRange(_) => {
            (StatusCode::BAD_REQUEST, err.to_string(), None)
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string(), None),
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::Engine(err)
    }
}

impl From<SagaLogError> for ApiError {
    fn from(err: SagaLogError) -> Self {
        ApiError::Log(err)
    }
}

impl From<ProjectionError> for ApiError {
    fn from(err: ProjectionError) -> Self {
        ApiError::Projection(err)
    }
}
