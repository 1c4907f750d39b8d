/// Error types for timeline-service
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum TimelineError {
    #[error("User {0} cannot follow themselves")]
    SelfFollow(Uuid),

    #[error("Author not found: {0}")]
    AuthorNotFound(Uuid),

    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("Fan-out engine is shutting down")]
    ShuttingDown,

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TimelineError {
    /// Validation failures are the caller's fault and are never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            TimelineError::SelfFollow(_)
                | TimelineError::AuthorNotFound(_)
                | TimelineError::InvalidCursor(_)
        )
    }
}

/// Result type alias for timeline operations
pub type Result<T> = std::result::Result<T, TimelineError>;
