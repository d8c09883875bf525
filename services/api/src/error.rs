use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use memoir_core::{MemoirError, UserFacingError};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("missing x-user-id header")]
    MissingUser,
    #[error(transparent)]
    Core(#[from] MemoirError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingUser => StatusCode::UNAUTHORIZED,
            ApiError::Core(err) => match err {
                MemoirError::Validation(_) => StatusCode::BAD_REQUEST,
                MemoirError::Busy { .. } | MemoirError::NoActiveSession => StatusCode::CONFLICT,
                MemoirError::NotFound { .. } => StatusCode::NOT_FOUND,
                MemoirError::Service { .. } | MemoirError::Connection { .. } => {
                    StatusCode::BAD_GATEWAY
                }
                MemoirError::Persistence(_) | MemoirError::Config(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    fn user_facing(&self) -> UserFacingError {
        match self {
            ApiError::MissingUser => UserFacingError {
                title: "Not signed in".to_string(),
                description: "Sign in to continue.".to_string(),
            },
            ApiError::Core(err) => err.user_facing(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("request failed: {self}");
        }
        (status, Json(self.user_facing())).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
