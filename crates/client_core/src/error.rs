use thiserror::Error;

/// Failures surfaced by the conversation session layer.
///
/// `Clone` so errors can be fanned out over the session event channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// No local credential; the user has to log in again.
    #[error("not authenticated: no stored session credential")]
    NotAuthenticated,
    /// The backend rejected the credential.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Connection-level failure; recoverable by reconnecting or retrying.
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("local storage error: {0}")]
    Storage(String),
    #[error("malformed payload: {0}")]
    Serialization(String),
}

impl ChatError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
