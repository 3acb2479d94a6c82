use std::fmt;

/// Failure of the durable message store.
///
/// Storage failures are fatal to the session that hits them: once an append
/// or read has failed the bag contents past that point cannot be trusted.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("bag not found: {0}")]
    NotFound(String),

    #[error("bag already exists: {0}")]
    AlreadyExists(String),

    #[error("metadata missing for '{0}' (run reindex to reconstruct it)")]
    MissingMetadata(String),

    #[error("channel '{0}' was not registered before its first message")]
    UnknownChannel(String),

    #[error("corrupt record in {location}: {detail}")]
    Corrupt { location: String, detail: String },

    #[error("storage closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl StorageError {
    /// Add context to the error.
    ///
    /// Io keeps its source error; the other string-carrying variants get the
    /// context prepended.
    pub fn with_context(self, ctx: impl fmt::Display) -> Self {
        match self {
            StorageError::Io(e) => StorageError::Io(std::io::Error::new(e.kind(), format!("{ctx}: {e}"))),
            StorageError::Other(msg) => StorageError::Other(format!("{ctx}: {msg}")),
            StorageError::Corrupt { location, detail } => StorageError::Corrupt {
                location: format!("{ctx}: {location}"),
                detail,
            },
            other => other,
        }
    }
}

/// Failure of the pub/sub transport.
///
/// Generally non-fatal: a failed subscribe skips one channel, a failed
/// publish skips one record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("channel '{channel}' has type '{existing}', requested '{requested}'")]
    TypeMismatch {
        channel: String,
        existing: String,
        requested: String,
    },

    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("subscribe to '{channel}' failed: {detail}")]
    Subscribe { channel: String, detail: String },

    #[error("publish on '{channel}' failed: {detail}")]
    Publish { channel: String, detail: String },

    #[error("transport shut down")]
    Shutdown,
}
