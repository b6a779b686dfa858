//! Error types for the bus and store contracts.

/// Error type for bus and store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Key was empty or otherwise unusable.
    #[error("invalid key: {0:?}")]
    InvalidKey(String),

    /// The backing broker or store failed.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Result type alias for bus and store operations.
pub type Result<T> = std::result::Result<T, Error>;
