//! Error types for scheduling and removal operations.

/// Error type for scheduling and removal operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transactional substrate could not open a batch.
    #[error("Failed to begin removal batch: {0}")]
    Batch(String),

    /// The scheduler configuration is invalid.
    #[error("Invalid scheduler configuration: {0}")]
    Config(String),

    /// An idle timeout was configured outside a tokio runtime.
    #[error("No tokio runtime to drive expiration: {0}")]
    Runtime(String),
}

/// Result type for scheduling and removal operations.
pub type Result<T> = std::result::Result<T, Error>;
