use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use thiserror::Error;

use crate::repository::errors::RepositoryError;
use crate::usecase::feed::FeedClosed;

#[derive(Debug, Error)]
pub enum UsecaseError {
    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl From<RepositoryError> for UsecaseError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::Timeout(_) => UsecaseError::Unavailable(e.to_string()),
            RepositoryError::DatabaseError(msg) => UsecaseError::Internal(msg),
        }
    }
}

impl From<FeedClosed> for UsecaseError {
    fn from(e: FeedClosed) -> Self {
        UsecaseError::Conflict(e.to_string())
    }
}

impl IntoResponse for UsecaseError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            UsecaseError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            UsecaseError::Validation(_) => StatusCode::BAD_REQUEST,
            UsecaseError::Conflict(_) => StatusCode::CONFLICT,
            UsecaseError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            UsecaseError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        match &self {
            UsecaseError::Internal(_) => {
                tracing::error!(error = %self, "internal error");
            }
            UsecaseError::Unauthorized(_) => {
                tracing::warn!(error = %self, "unauthorized");
            }
            _ => {
                tracing::debug!(error = %self);
            }
        }

        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}
