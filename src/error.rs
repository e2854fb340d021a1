use thiserror::Error;

/// Failure taxonomy for the sync subsystem.
///
/// Duplicate-key collisions on the message table are deliberately not a
/// variant: re-ingesting an already stored identifier is expected under
/// at-least-once batch semantics, and the store reports it as a
/// non-inserted success instead.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Missing or invalid process configuration (master key, mail account
    /// settings). Fatal, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Credential decryption failed its integrity check, or the server
    /// rejected the login. Terminal for the current job; the owner has to
    /// re-enter credentials.
    #[error("credential error: {0}")]
    Credential(String),

    /// TCP/TLS/timeout failure talking to the mail server. Terminal for the
    /// current job; a manual retry starts from a fresh plan.
    #[error("connection error: {0}")]
    Connection(String),

    /// A single raw message could not be normalized. Local to one
    /// identifier; the batch continues past it.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("storage error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("blob storage error: {0}")]
    Blob(#[from] std::io::Error),
}

impl SyncError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        SyncError::Configuration(msg.into())
    }

    pub fn credential(msg: impl Into<String>) -> Self {
        SyncError::Credential(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        SyncError::Connection(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
