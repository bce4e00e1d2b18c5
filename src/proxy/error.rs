use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failures the proxy reports to the caller itself, as opposed to relayed
/// origin responses
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("route '{0}' not found")]
    RouteNotFound(String),

    #[error("origin unreachable: {0}")]
    UpstreamUnreachable(#[source] reqwest::Error),

    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("invalid origin target '{0}'")]
    InvalidTarget(String),

    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::UpstreamUnreachable(_) | ProxyError::InvalidTarget(_) => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let message = match &self {
            ProxyError::UpstreamUnreachable(_) => "origin unreachable".to_string(),
            ProxyError::Storage(_) => "internal server error".to_string(),
            other => other.to_string(),
        };

        (self.status_code(), Json(json!({ "error": message }))).into_response()
    }
}
