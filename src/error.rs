use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IllegalState {
    #[error("session not running")]
    NotRunning,
    #[error("answer is for the wrong question")]
    WrongQuestion,
    #[error("too late, question already ended")]
    TooLate,
    #[error("lobby already started or closed")]
    AlreadyStarted,
}

#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(&'static str),
    #[error(transparent)]
    IllegalState(#[from] IllegalState),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("topic has {available} questions, {needed} needed")]
    InsufficientContent { needed: i32, available: i32 },
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl LiveError {
    pub fn session_not_found(session_id: Uuid) -> Self {
        LiveError::NotFound(format!("session {session_id}"))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LiveError::NotFound(_) => "NOT_FOUND",
            LiveError::Forbidden(_) => "FORBIDDEN",
            LiveError::IllegalState(_) => "ILLEGAL_STATE",
            LiveError::InvalidArgument(_) => "INVALID_ARGUMENT",
            LiveError::InsufficientContent { .. } => "INSUFFICIENT_CONTENT",
            LiveError::Internal(_) => "INTERNAL",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            LiveError::NotFound(_) => StatusCode::NOT_FOUND,
            LiveError::Forbidden(_) => StatusCode::FORBIDDEN,
            LiveError::IllegalState(_) => StatusCode::CONFLICT,
            LiveError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            LiveError::InsufficientContent { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            LiveError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for LiveError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            LiveError::Internal(e) => {
                tracing::error!("Live quiz request failed: {:#}", e);
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "error": self.kind(), "message": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_distinct_statuses() {
        let too_late = LiveError::from(IllegalState::TooLate);
        assert_eq!(too_late.kind(), "ILLEGAL_STATE");
        assert_eq!(too_late.status_code(), StatusCode::CONFLICT);
        assert_eq!(too_late.to_string(), "too late, question already ended");

        let forbidden = LiveError::Forbidden("not a participant");
        assert_eq!(forbidden.status_code(), StatusCode::FORBIDDEN);

        let content = LiveError::InsufficientContent { needed: 10, available: 3 };
        assert_eq!(content.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(content.to_string(), "topic has 3 questions, 10 needed");
    }

    #[test]
    fn internal_errors_hide_details() {
        let err = LiveError::Internal(anyhow::anyhow!("connection refused"));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
