use satchel_api::StorageError;

use crate::orchestrator::Operation;

#[derive(Debug, thiserror::Error)]
pub enum SatchelError {
    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("orchestrator busy: {0} in progress")]
    Busy(Operation),

    #[error("session task failed: {0}")]
    Task(String),
}

impl SatchelError {
    /// Add context to the error.
    ///
    /// For `Storage` the context goes into the inner `StorageError`.
    /// `Config` and `Task` get it prepended to the message.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            SatchelError::Storage(e) => SatchelError::Storage(e.with_context(ctx)),
            SatchelError::Config(msg) => SatchelError::Config(format!("{ctx}: {msg}")),
            SatchelError::Task(msg) => SatchelError::Task(format!("{ctx}: {msg}")),
            other => other,
        }
    }
}

impl From<tokio::task::JoinError> for SatchelError {
    fn from(e: tokio::task::JoinError) -> Self {
        SatchelError::Task(e.to_string())
    }
}
