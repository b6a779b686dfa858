//! Error types for arbiter-core

use thiserror::Error;

/// Error type for engine operations
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bus or key-value store failure
    #[error("Store error: {0}")]
    Store(#[from] arbiter_bus::Error),

    /// A payload or stored record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A payload decoded but failed validation
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Engine constructed without any experts
    #[error("At least one expert is required")]
    NoExperts,
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::InvalidConfig("batch_size must be positive".into());
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_error_from_bus() {
        let bus_err = arbiter_bus::Error::Backend("down".into());
        let err: CoreError = bus_err.into();
        assert!(matches!(err, CoreError::Store(_)));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<u32>("not a number").unwrap_err();
        let err: CoreError = json_err.into();
        assert!(matches!(err, CoreError::Serialization(_)));
    }
}
