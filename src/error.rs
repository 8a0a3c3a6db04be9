use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

/// Distinguishes between retryable and permanent errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Retryable,
    Permanent,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("a user may not start a conversation with themself")]
    InvalidConversation,

    #[error("message content cannot be empty")]
    EmptyContent,

    #[error("sender is not a participant of this conversation")]
    Unauthorized,

    #[error("conversation not found")]
    ConversationNotFound,

    #[error("transport is not authenticated")]
    NotAuthenticated,

    #[error("transport authentication rejected: {0}")]
    AuthRejected(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transport disconnected")]
    Disconnected,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("delivery failed for message; retries exhausted")]
    DeliveryFailed,
}

impl ChatError {
    /// Returns whether this error is retryable (e.g., database connection timeout)
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::Database(e) => match e {
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                    ErrorKind::Retryable
                }
                _ => ErrorKind::Permanent,
            },
            ChatError::Transport(_) | ChatError::Disconnected => ErrorKind::Retryable,
            _ => ErrorKind::Permanent,
        }
    }
}
