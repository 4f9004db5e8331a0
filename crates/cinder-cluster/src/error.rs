//! Error types for cluster membership operations.

/// Errors that can occur while joining or running cluster membership.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Configuration could not be parsed or is inconsistent.
    #[error("invalid cluster configuration: {0}")]
    Configuration(String),

    /// An address could not be parsed or is unusable.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The gossip driver has stopped.
    #[error("cluster service terminated")]
    Terminated,
}

impl From<toml::de::Error> for ClusterError {
    fn from(e: toml::de::Error) -> Self {
        ClusterError::Configuration(e.to_string())
    }
}
