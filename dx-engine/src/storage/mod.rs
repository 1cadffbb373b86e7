//! Engine storage
//!
//! Durable state of the engine: commands, operations, the per-operation
//! response log and finality acks.
//!
//! # Rules
//!
//! - rows are never deleted; terminal commands and operations stay as audit trail
//! - operation status only moves forward, checked inside the write
//! - an ack upsert and the finality recount happen in one atomic step

pub mod memory;
pub mod sled;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use dx_core::{
    AckOutcome, Command, CommandId, CommandStatus, FinalityAck, FinalityState, Locator, Operation,
    OperationId, OperationResponse, OperationStatus, Timestamp,
};

use crate::error::{EngineError, EngineResult};

pub use self::memory::MemoryStorage;
pub use self::sled::SledStorage;

/// Status change applied to an operation
#[derive(Debug, Clone, PartialEq)]
pub struct OperationUpdate {
    pub status: OperationStatus,
    pub data: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

impl OperationUpdate {
    pub fn status(status: OperationStatus) -> Self {
        Self {
            status,
            data: None,
            error_message: None,
        }
    }

    pub fn completed(data: serde_json::Value) -> Self {
        Self {
            status: OperationStatus::Completed,
            data: Some(data),
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: OperationStatus::Failed,
            data: None,
            error_message: Some(message.into()),
        }
    }

    /// Apply to `operation`, refusing anything but a forward move
    pub fn apply(&self, operation: &mut Operation) -> EngineResult<()> {
        if !operation.status.can_transition_to(self.status) {
            return Err(EngineError::InvalidTransition {
                from: operation.status.to_string(),
                to: self.status.to_string(),
            });
        }
        operation.status = self.status;
        if self.data.is_some() {
            operation.data = self.data.clone();
        }
        if self.error_message.is_some() {
            operation.error_message = self.error_message.clone();
        }
        operation.updated_at = Timestamp::now();
        Ok(())
    }
}

/// Engine storage interface
#[async_trait]
pub trait EngineStorage: Send + Sync {
    // ==================== Commands ====================

    /// Persist a new command; fails if the id exists
    async fn insert_command(&self, command: &Command) -> EngineResult<()>;

    /// Overwrite an existing command
    async fn update_command(&self, command: &Command) -> EngineResult<()>;

    async fn get_command(&self, command_id: &CommandId) -> EngineResult<Option<Command>>;

    /// Dispatchable commands with `due_at <= now`, in dispatch order
    async fn list_due_commands(&self, now: Timestamp) -> EngineResult<Vec<Command>>;

    async fn list_commands_by_status(&self, statuses: &[CommandStatus]) -> EngineResult<Vec<Command>>;

    async fn list_commands_for_operation(&self, operation_id: &OperationId) -> EngineResult<Vec<Command>>;

    // ==================== Operations ====================

    /// Persist a new operation; fails if the id exists
    async fn insert_operation(&self, operation: &Operation) -> EngineResult<()>;

    async fn get_operation(&self, operation_id: &OperationId) -> EngineResult<Option<Operation>>;

    /// Atomically read, check and write a status change
    async fn transition_operation(
        &self,
        operation_id: &OperationId,
        update: OperationUpdate,
    ) -> EngineResult<Operation>;

    async fn list_operations(&self, status: Option<OperationStatus>) -> EngineResult<Vec<Operation>>;

    // ==================== Responses ====================

    async fn append_response(&self, response: &OperationResponse) -> EngineResult<()>;

    /// Responses of an operation in arrival order
    async fn list_responses(&self, operation_id: &OperationId) -> EngineResult<Vec<OperationResponse>>;

    // ==================== Finality ====================

    /// Insert the ack unless (locator, peer) is known, then recount and
    /// re-evaluate quorum against `required`, all in one atomic step
    async fn upsert_finality_ack(&self, ack: &FinalityAck, required: u32) -> EngineResult<AckOutcome>;

    async fn get_finality_state(&self, locator: &Locator) -> EngineResult<FinalityState>;

    async fn list_finality_acks(&self, locator: &Locator) -> EngineResult<Vec<FinalityAck>>;

    // ==================== Stats ====================

    async fn get_stats(&self) -> EngineResult<StorageStats>;
}

/// Storage statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    pub total_commands: u64,
    pub pending_commands: u64,
    pub failed_commands: u64,
    pub total_operations: u64,
    pub in_progress_operations: u64,
    pub total_responses: u64,
    pub finality_acks: u64,
}

impl StorageStats {
    fn count_command(&mut self, command: &Command) {
        self.total_commands += 1;
        if command.status.is_dispatchable() || command.status == CommandStatus::Processing {
            self.pending_commands += 1;
        }
        if command.status == CommandStatus::Failed {
            self.failed_commands += 1;
        }
    }

    fn count_operation(&mut self, operation: &Operation) {
        self.total_operations += 1;
        if operation.status == OperationStatus::InProgress {
            self.in_progress_operations += 1;
        }
    }
}

/// Order due commands: priority descending, then `due_at` ascending
pub fn sort_for_dispatch(commands: &mut [Command]) {
    commands.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.due_at.cmp(&b.due_at))
            .then(a.created_at.cmp(&b.created_at))
    });
}
