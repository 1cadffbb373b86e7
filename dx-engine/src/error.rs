//! Engine error types

use thiserror::Error;

/// Engine errors
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// A peer request timed out
    #[error("Network timeout: {0}")]
    NetworkTimeout(String),

    /// A command handler failed in a way worth retrying
    #[error("Command execution failed: {0}")]
    CommandExecution(String),

    /// Dataset does not match the committed Merkle root
    #[error("Integrity verification failed for operation {operation_id}: {reason}")]
    IntegrityVerification { operation_id: String, reason: String },

    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    /// Command name missing from the handler registry
    #[error("Unknown command handler: {0}")]
    UnknownCommandHandler(String),

    #[error("No peers available: {0}")]
    NoPeersAvailable(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Merkle worker pool unavailable
    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    #[error("Core error: {0}")]
    Core(String),
}

impl EngineError {
    /// Whether the scheduler may run the failed command again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::NetworkTimeout(_)
                | EngineError::CommandExecution(_)
                | EngineError::NoPeersAvailable(_)
                | EngineError::Network(_)
                | EngineError::Storage(_)
        )
    }

    pub fn integrity(operation_id: impl ToString, reason: impl Into<String>) -> Self {
        EngineError::IntegrityVerification {
            operation_id: operation_id.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<dx_core::CoreError> for EngineError {
    fn from(err: dx_core::CoreError) -> Self {
        match err {
            dx_core::CoreError::InvalidTransition { from, to } => Self::InvalidTransition { from, to },
            other => Self::Core(other.to_string()),
        }
    }
}

impl From<dx_network::NetworkError> for EngineError {
    fn from(err: dx_network::NetworkError) -> Self {
        match err {
            dx_network::NetworkError::Timeout(msg) => Self::NetworkTimeout(msg),
            other => Self::Network(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
