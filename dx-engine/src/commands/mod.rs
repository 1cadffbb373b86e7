//! Built-in command handlers
//!
//! - `replicate`: fans an operation out to peers in batches
//! - `operation_timeout`: fails operations that outlive their deadline
//! - `replica_audit`: challenges replicas of a completed publish

pub mod audit;
pub mod replicate;
pub mod timeout;

use serde::de::DeserializeOwned;
use std::sync::Arc;

use dx_core::Command;

use crate::error::{EngineError, EngineResult};
use crate::scheduler::HandlerRegistry;

pub use audit::ReplicaAuditHandler;
pub use replicate::ReplicateHandler;
pub use timeout::OperationTimeoutHandler;

/// Registry with every built-in handler
pub fn default_handlers() -> HandlerRegistry {
    HandlerRegistry::new()
        .register(Arc::new(ReplicateHandler))
        .register(Arc::new(OperationTimeoutHandler))
        .register(Arc::new(ReplicaAuditHandler))
}

fn parse_payload<T: DeserializeOwned>(command: &Command) -> EngineResult<T> {
    serde_json::from_value(command.payload.clone()).map_err(|e| {
        EngineError::InvalidPayload(format!("{} command {}: {}", command.name, command.id, e))
    })
}
