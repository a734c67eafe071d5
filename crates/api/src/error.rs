//! API error types with HTTP response mapping.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use projections::ProjectionError;
use saga::SagaError;

/// API-level error type that maps to HTTP responses.
///
/// The body is always `{"error": "<message>", "code": "<CODE>"}`.
#[derive(Debug)]
pub enum ApiError {
    /// Bad request from the client.
    BadRequest(String),
    /// Engine error; protocol errors keep their code.
    Saga(SagaError),
    /// Read-side catch-up failed.
    Projection(ProjectionError),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Saga(err) => {
                let status = match err {
                    SagaError::UnknownCorrelation(_)
                    | SagaError::InstanceNotFound(_)
                    | SagaError::UnknownDefinition(_) => StatusCode::NOT_FOUND,
                    SagaError::ExpiredToken(_) => StatusCode::GONE,
                    SagaError::StaleVersion { .. }
                    | SagaError::InvalidState { .. }
                    | SagaError::DuplicateCorrelation(_) => StatusCode::CONFLICT,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.code())
            }
            ApiError::Projection(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = match self {
            ApiError::BadRequest(msg) => msg,
            ApiError::Saga(err) => err.to_string(),
            ApiError::Projection(err) => err.to_string(),
        };
        metrics::counter!("api_errors_total", "code" => code).increment(1);
        if status.is_server_error() {
            tracing::error!(error = %message, code, "internal server error");
        }

        let body = serde_json::json!({ "error": message, "code": code });
        (status, axum::Json(body)).into_response()
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

impl From<ProjectionError> for ApiError {
    fn from(err: ProjectionError) -> Self {
        ApiError::Projection(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}
