use thiserror::Error;

/// Veil-specific error types
#[derive(Debug, Error)]
pub enum VeilError {
    #[error("Unknown client: {client_id}")]
    UnknownClient { client_id: u64 },

    #[error("Client already registered: {client_id}")]
    DuplicateClient { client_id: u64 },

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timeout: {operation}")]
    Timeout { operation: String },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl VeilError {
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        VeilError::Protocol(msg.into())
    }

    pub fn storage<S: Into<String>>(msg: S) -> Self {
        VeilError::Storage(msg.into())
    }

    pub fn network<S: Into<String>>(msg: S) -> Self {
        VeilError::NetworkError(msg.into())
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        VeilError::Timeout {
            operation: operation.into(),
        }
    }

    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        VeilError::ConfigurationError(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        VeilError::Internal(msg.into())
    }
}

/// Result type for Veil operations
pub type VeilResult<T> = Result<T, VeilError>;
