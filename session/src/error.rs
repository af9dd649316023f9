//! Error taxonomy for the WebSocket session.

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::state::SessionState;

/// Application-level rejection reported by the exchange inside a response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub code: i64,
    pub message: String,
}

impl ApiError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Error types for a WebSocket session.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// The session is not in the `Ready` state.
    #[error("Not connected")]
    NotConnected,
    /// Lifecycle operation attempted from a state that does not allow it.
    #[error("Invalid state for operation: {0}")]
    InvalidState(SessionState),
    /// Dialing the endpoint or completing the WebSocket handshake failed.
    #[error("Dial error: {0}")]
    Dial(String),
    /// Writing a frame to the socket failed; the request never left the client.
    #[error("Write error: {0}")]
    Write(String),
    /// The exchange rejected the authentication handshake.
    #[error("Authentication error: {0}")]
    Auth(String),
    /// The post-authentication hook failed.
    #[error("After-connect hook failed: {0}")]
    AfterConnect(String),
    /// The connection dropped while the request was outstanding. The exchange
    /// may or may not have processed it.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    /// The session was closed while the request was outstanding.
    #[error("Session closed")]
    Closed,
    /// The exchange explicitly rejected the request.
    #[error("Exchange error {code}: {message}")]
    Api { code: i64, message: String },
    /// Another request with the same correlation id is still in flight.
    #[error("Duplicate correlation id: {0}")]
    DuplicateId(String),
    /// The request carried no correlation id and none could be assigned.
    #[error("Request has no correlation id")]
    MissingId,
    /// No response arrived within the caller's deadline.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    /// JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(String),
}

impl SessionError {
    /// Transport-level failures where the request is known not to have been
    /// delivered, or where trying again later is reasonable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::NotConnected
                | SessionError::Dial(_)
                | SessionError::Write(_)
                | SessionError::Timeout(_)
        )
    }

    /// Failures where the exchange may have executed the request. Callers must
    /// reconcile with a state query instead of assuming it was rejected.
    pub fn is_ambiguous(&self) -> bool {
        matches!(
            self,
            SessionError::ConnectionLost(_) | SessionError::Closed | SessionError::Timeout(_)
        )
    }

    /// Error code for exchange rejections.
    pub fn api_code(&self) -> Option<i64> {
        match self {
            SessionError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<ApiError> for SessionError {
    fn from(err: ApiError) -> Self {
        SessionError::Api {
            code: err.code,
            message: err.message,
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(error: serde_json::Error) -> Self {
        Self::Json(error.to_string())
    }
}

impl From<tungstenite::Error> for SessionError {
    fn from(error: tungstenite::Error) -> Self {
        Self::Write(error.to_string())
    }
}

/// Result type alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
