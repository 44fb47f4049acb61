//! Error taxonomy for request handling.
//!
//! Validation and not-found failures are detected before any persistence or
//! upstream call; everything after the user message has been persisted is
//! reported without undoing that write.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChatError>;

#[derive(Error, Debug)]
pub enum ChatError {
    /// Missing or malformed request fields.
    #[error("{0}")]
    Validation(String),

    /// Referenced session does not exist.
    #[error("{0}")]
    NotFound(String),

    /// No API key could be resolved from user config, system config, or the
    /// environment.
    #[error("no OpenAI API key configured; set one in settings or via OPENAI_API_KEY")]
    CredentialMissing,

    /// The completion provider rejected or failed the call.
    #[error("upstream completion request failed: {0}")]
    Upstream(String),

    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl ChatError {
    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::CredentialMissing | ChatError::Upstream(_) | ChatError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("request failed: {:#}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
