use tokio_tungstenite::tungstenite;

use crate::models::SessionId;

/// Errors produced by the chat client core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    #[error("authentication required")]
    AuthRequired,

    #[error("a connection attempt is already in flight")]
    AlreadyConnecting,

    #[error("not connected")]
    NotConnected,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("{message}")]
    Remote {
        message: String,
        code: Option<String>,
    },

    #[error("failed to send message: {reason}")]
    SendFailed { reason: String },

    #[error("a message is already in flight for session {0}")]
    Busy(SessionId),

    #[error("session {0} is not the active session")]
    SessionNotActive(SessionId),

    #[error("connection lost before the response completed")]
    ConnectionLost,

    #[error("exchange aborted by session teardown")]
    Aborted,

    #[error("server returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("request failed: {0}")]
    Http(String),

    #[error("chat client has been disposed")]
    Closed,

    #[error("configuration error: {0}")]
    Config(String),
}

impl ChatError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::Api {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => Self::Http(err.to_string()),
        }
    }

    /// Classify a handshake or socket error. Everything is a transport-level
    /// anomaly; the message is kept for logging.
    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) if response.status().as_u16() == 401 => {
                Self::AuthRequired
            }
            other => Self::ProtocolViolation(other.to_string()),
        }
    }

    /// Whether this error should be shown to the user.
    pub fn is_user_visible(&self) -> bool {
        !matches!(
            self,
            ChatError::AlreadyConnecting | ChatError::NotConnected | ChatError::ProtocolViolation(_)
        )
    }
}

/// Failure of a `send_user_message` call.
///
/// When the optimistic message was rolled back, `restored_text` carries the
/// text so the user can retry without retyping it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{error}")]
pub struct SendError {
    #[source]
    pub error: ChatError,
    pub restored_text: Option<String>,
}

impl SendError {
    pub fn rolled_back(error: ChatError, text: String) -> Self {
        Self {
            error,
            restored_text: Some(text),
        }
    }

    pub fn kept(error: ChatError) -> Self {
        Self {
            error,
            restored_text: None,
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
