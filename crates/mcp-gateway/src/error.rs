use std::{borrow::Cow, time::Duration};

use crate::model::SessionId;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Unified error type for everything the gateway core can fail with.
///
/// Client-visible output must go through [`GatewayError::sanitized`] — raw
/// error text (which may embed upstream URLs or IO detail) stays in the logs.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("session expired: {0}")]
    SessionExpired(SessionId),
    #[error("upstream server unavailable: {0}")]
    ServerUnavailable(Cow<'static, str>),
    #[error("failed to establish upstream connection: {0}")]
    UpstreamConnectionFailed(Cow<'static, str>),
    #[error("upstream call timed out after {0:?}")]
    UpstreamTimeout(Duration),
    #[error("failed to start process `{command}`: {reason}")]
    ProcessStartFailed { command: String, reason: String },
    #[error("no supervised process for server: {0}")]
    ProcessNotFound(String),
    #[error("circuit open for server: {0}")]
    CircuitOpen(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid endpoint URL: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
}

impl GatewayError {
    /// Short, stable message safe to forward to a client channel.
    pub fn sanitized(&self) -> &'static str {
        match self {
            GatewayError::SessionNotFound(_) => "session not found",
            GatewayError::SessionExpired(_) => "session expired",
            GatewayError::ServerUnavailable(_) => "upstream server unavailable",
            GatewayError::UpstreamConnectionFailed(_) => "failed to connect upstream",
            GatewayError::UpstreamTimeout(_) => "upstream call timed out",
            GatewayError::ProcessStartFailed { .. } => "failed to start local server process",
            GatewayError::ProcessNotFound(_) => "local server process not found",
            GatewayError::CircuitOpen(_) => "service temporarily unavailable",
            GatewayError::Io(_) => "upstream IO error",
            GatewayError::Json(_) => "invalid message payload",
            GatewayError::Http(_) => "upstream request failed",
            GatewayError::InvalidEndpoint(_) => "invalid upstream endpoint",
        }
    }
}
