use thiserror::Error;

/// Application-wide error types for Catcher.
#[derive(Error, Debug)]
pub enum AppError {
    /// Network failure before a response arrived (connect, reset, DNS).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Request timed out.
    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    /// The remote service is rate-limiting this caller.
    #[error("Throttled by remote service (HTTP {0})")]
    Throttled(u16),

    /// A human-verification challenge is blocking the session.
    #[error("Verification challenge detected")]
    Challenge,

    /// The item is no longer available or this caller is not eligible.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Unexpected HTTP status.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Response body could not be interpreted.
    #[error("Parse error: {0}")]
    Parse(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Local shared store could not be read or written.
    #[error("Store error: {0}")]
    Store(String),

    /// Remote coordination signal service failed.
    #[error("Signal service error: {0}")]
    Signal(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Transport(_) | AppError::Timeout(_) | AppError::Throttled(_) => true,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            AppError::Signal(_) | AppError::Store(_) => true,
            _ => false,
        }
    }

    /// Returns true for failures that count towards a scanner's consecutive
    /// error streak (everything that is neither a throttle nor a challenge).
    pub fn is_transport(&self) -> bool {
        !matches!(
            self,
            AppError::Throttled(_) | AppError::Challenge | AppError::Rejected(_)
        )
    }
}
