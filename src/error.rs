use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Error taxonomy for the agent server. Tool-level failures never appear
/// here: the dispatcher folds them into result envelopes the model can see.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Configuration(String),
    #[error("{0}")]
    NotFound(String),
    #[error("model provider error: {0}")]
    Upstream(String),
    #[error("tool loop did not finish within {0} rounds")]
    MaxRoundsExceeded(usize),
    #[error("storage error: {0}")]
    Store(#[from] sqlx::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AgentError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Configuration(_) | Self::Store(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Upstream(_) | Self::MaxRoundsExceeded(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            AgentError::Validation("message is required".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AgentError::NotFound("conversation not found".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AgentError::Upstream("rate limited".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AgentError::MaxRoundsExceeded(10).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
