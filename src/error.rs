use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// Failures of the decision engine itself, independent of transport.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("stale transition for {entity} {id}: {from} -> {to}")]
    StaleTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },
    #[error("transaction {transaction_id} is waiting for connection {connection_id}")]
    UnroutableReference {
        transaction_id: String,
        connection_id: String,
    },
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),
    #[error("already decided: {0}")]
    AlreadyDecided(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl EngineError {
    pub fn validation<E: std::fmt::Display>(err: E) -> Self {
        Self::Validation(err.to_string())
    }

    /// Stored text did not decode into a known enum value.
    pub fn corrupt<E: std::fmt::Display>(err: E) -> Self {
        Self::Storage(sqlx::Error::Decode(err.to_string().into()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::Internal(err.to_string())
    }

    pub fn bad_request<E: std::fmt::Display>(err: E) -> Self {
        Self::BadRequest(err.to_string())
    }
}

#[derive(Serialize)]
struct ProblemResponse<'a> {
    code: &'a str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "dependency_unavailable", msg)
            }
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", msg),
        };

        (status, Json(ProblemResponse { code, message })).into_response()
    }
}

impl From<EngineError> for AppError {
    fn from(value: EngineError) -> Self {
        match value {
            EngineError::Validation(msg) => AppError::BadRequest(msg),
            EngineError::NotFound(msg) => AppError::NotFound(msg),
            EngineError::AlreadyDecided(msg) | EngineError::AlreadyExists(msg) => {
                AppError::Conflict(msg)
            }
            err @ (EngineError::StaleTransition { .. }
            | EngineError::UnroutableReference { .. }) => AppError::Conflict(err.to_string()),
            EngineError::DependencyUnavailable(msg) => AppError::ServiceUnavailable(msg),
            err @ (EngineError::Configuration(_) | EngineError::Storage(_)) => {
                AppError::internal(err)
            }
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(value: sqlx::Error) -> Self {
        AppError::internal(value)
    }
}

#[cfg(test)]
mod tests {
    use axum::{http::StatusCode, response::IntoResponse};

    use super::{AppError, EngineError};

    #[test]
    fn engine_errors_map_to_review_api_status_codes() {
        let cases = [
            (EngineError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (EngineError::AlreadyDecided("x".into()), StatusCode::CONFLICT),
            (EngineError::AlreadyExists("x".into()), StatusCode::CONFLICT),
            (EngineError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (
                EngineError::DependencyUnavailable("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                EngineError::Configuration("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, status) in cases {
            let response = AppError::from(err).into_response();
            assert_eq!(response.status(), status);
        }
    }
}
