use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::engine::EngineError;

/// Errors a handler can return. Rejected booking forms are not errors: they come back
/// as a normal response carrying the field errors.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("authentication required")]
    Unauthorized,

    #[error("not allowed")]
    Forbidden,

    #[error("{0}")]
    BadRequest(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Engine(e) => match e {
                EngineError::InvalidInput { .. }
                | EngineError::PastDateTime
                | EngineError::InvalidPartySize(_)
                | EngineError::InvalidCapacity(_) => StatusCode::UNPROCESSABLE_ENTITY,
                EngineError::InsufficientCapacity { .. }
                | EngineError::TableUnavailable(_)
                | EngineError::TableInUse(_)
                | EngineError::DuplicateTableNumber(_) => StatusCode::CONFLICT,
                EngineError::NotFound(_) => StatusCode::NOT_FOUND,
                EngineError::LimitExceeded(_) => StatusCode::PAYLOAD_TOO_LARGE,
                EngineError::WalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden => "forbidden",
            AppError::BadRequest(_) => "bad_request",
            AppError::Engine(e) => e.reason(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            AppError::Engine(EngineError::WalError(e)) => {
                tracing::error!(error = %e, "request failed to persist");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        let field = match &self {
            AppError::Engine(e) => e.field(),
            _ => None,
        };
        let body = json!({
            "code": self.code(),
            "message": message,
            "field": field,
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn engine_errors_map_to_statuses() {
        let cases = [
            (EngineError::PastDateTime, StatusCode::UNPROCESSABLE_ENTITY),
            (
                EngineError::InsufficientCapacity { available: 1, needed: 2 },
                StatusCode::CONFLICT,
            ),
            (EngineError::NotFound(Ulid::new()), StatusCode::NOT_FOUND),
            (EngineError::WalError("disk".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status(), status);
        }
    }

    #[test]
    fn persistence_details_stay_internal() {
        let resp = AppError::from(EngineError::WalError("/var/lib/parkking: EIO".into())).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
