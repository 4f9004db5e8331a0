//! Error types for locks and elections.

/// Errors surfaced by lock and election futures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordError {
    /// The pending operation was cancelled by termination.
    #[error("operation cancelled")]
    Cancelled,

    /// The lock region or election group has been terminated.
    #[error("coordination service terminated")]
    Terminated,

    /// The lock channel failed to deliver a request or a reply.
    #[error("lock channel error: {0}")]
    Channel(String),

    /// The topology has no node that could manage the lock.
    #[error("no lock manager available")]
    NoManager,

    /// The lock manager gave up, or retries ran out.
    #[error("lock operation timed out")]
    Timeout,

    /// This lock handle already has an acquisition in progress.
    #[error("lock acquisition already in progress")]
    InProgress,

    /// Configuration could not be parsed or is inconsistent.
    #[error("invalid coordination configuration: {0}")]
    Configuration(String),
}

impl CoordError {
    /// Returns true if retrying the operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoordError::Channel(_) | CoordError::NoManager | CoordError::Timeout
        )
    }
}

impl From<toml::de::Error> for CoordError {
    fn from(e: toml::de::Error) -> Self {
        CoordError::Configuration(e.to_string())
    }
}
