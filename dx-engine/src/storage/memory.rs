//! In-memory storage
//!
//! Used by tests and by nodes that do not need to survive restarts.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use dx_core::{
    AckOutcome, Command, CommandId, CommandStatus, FinalityAck, FinalityState, Locator, Operation,
    OperationId, OperationResponse, OperationStatus, PeerId, Timestamp,
};

use super::{sort_for_dispatch, EngineStorage, OperationUpdate, StorageStats};
use crate::error::{EngineError, EngineResult};

/// Acks and states share one lock so an upsert and its recount are atomic
#[derive(Default)]
struct FinalityTables {
    acks: HashMap<(Locator, PeerId), FinalityAck>,
    states: HashMap<Locator, FinalityState>,
}

/// In-memory storage
#[derive(Clone, Default)]
pub struct MemoryStorage {
    commands: Arc<RwLock<HashMap<CommandId, Command>>>,
    operations: Arc<RwLock<HashMap<OperationId, Operation>>>,
    responses: Arc<RwLock<HashMap<OperationId, Vec<OperationResponse>>>>,
    finality: Arc<RwLock<FinalityTables>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EngineStorage for MemoryStorage {
    // ==================== Commands ====================

    async fn insert_command(&self, command: &Command) -> EngineResult<()> {
        let mut commands = self.commands.write().await;
        if commands.contains_key(&command.id) {
            return Err(EngineError::Storage(format!("command {} already exists", command.id)));
        }
        commands.insert(command.id, command.clone());
        Ok(())
    }

    async fn update_command(&self, command: &Command) -> EngineResult<()> {
        let mut commands = self.commands.write().await;
        match commands.get_mut(&command.id) {
            Some(existing) => {
                *existing = command.clone();
                Ok(())
            }
            None => Err(EngineError::CommandNotFound(command.id.to_string())),
        }
    }

    async fn get_command(&self, command_id: &CommandId) -> EngineResult<Option<Command>> {
        let commands = self.commands.read().await;
        Ok(commands.get(command_id).cloned())
    }

    async fn list_due_commands(&self, now: Timestamp) -> EngineResult<Vec<Command>> {
        let commands = self.commands.read().await;
        let mut due: Vec<Command> = commands.values().filter(|c| c.is_due(now)).cloned().collect();
        sort_for_dispatch(&mut due);
        Ok(due)
    }

    async fn list_commands_by_status(&self, statuses: &[CommandStatus]) -> EngineResult<Vec<Command>> {
        let commands = self.commands.read().await;
        Ok(commands
            .values()
            .filter(|c| statuses.contains(&c.status))
            .cloned()
            .collect())
    }

    async fn list_commands_for_operation(&self, operation_id: &OperationId) -> EngineResult<Vec<Command>> {
        let commands = self.commands.read().await;
        let mut owned: Vec<Command> = commands
            .values()
            .filter(|c| c.owner_operation_id.as_ref() == Some(operation_id))
            .cloned()
            .collect();
        owned.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(owned)
    }

    // ==================== Operations ====================

    async fn insert_operation(&self, operation: &Operation) -> EngineResult<()> {
        let mut operations = self.operations.write().await;
        if operations.contains_key(&operation.operation_id) {
            return Err(EngineError::Storage(format!(
                "operation {} already exists",
                operation.operation_id
            )));
        }
        operations.insert(operation.operation_id, operation.clone());
        Ok(())
    }

    async fn get_operation(&self, operation_id: &OperationId) -> EngineResult<Option<Operation>> {
        let operations = self.operations.read().await;
        Ok(operations.get(operation_id).cloned())
    }

    async fn transition_operation(
        &self,
        operation_id: &OperationId,
        update: OperationUpdate,
    ) -> EngineResult<Operation> {
        let mut operations = self.operations.write().await;
        let operation = operations
            .get_mut(operation_id)
            .ok_or_else(|| EngineError::OperationNotFound(operation_id.to_string()))?;
        update.apply(operation)?;
        Ok(operation.clone())
    }

    async fn list_operations(&self, status: Option<OperationStatus>) -> EngineResult<Vec<Operation>> {
        let operations = self.operations.read().await;
        let mut listed: Vec<Operation> = operations
            .values()
            .filter(|op| status.map(|s| op.status == s).unwrap_or(true))
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(listed)
    }

    // ==================== Responses ====================

    async fn append_response(&self, response: &OperationResponse) -> EngineResult<()> {
        let mut responses = self.responses.write().await;
        responses
            .entry(response.operation_id)
            .or_default()
            .push(response.clone());
        Ok(())
    }

    async fn list_responses(&self, operation_id: &OperationId) -> EngineResult<Vec<OperationResponse>> {
        let responses = self.responses.read().await;
        Ok(responses.get(operation_id).cloned().unwrap_or_default())
    }

    // ==================== Finality ====================

    async fn upsert_finality_ack(&self, ack: &FinalityAck, required: u32) -> EngineResult<AckOutcome> {
        let mut tables = self.finality.write().await;
        let FinalityTables { acks, states } = &mut *tables;

        let state = states
            .entry(ack.locator.clone())
            .or_insert_with(|| FinalityState::empty(ack.locator.clone()));

        let key = (ack.locator.clone(), ack.peer_id.clone());
        if acks.contains_key(&key) {
            return Ok(AckOutcome::DuplicateIgnored { state: state.clone() });
        }
        acks.insert(key, ack.clone());

        let quorum_reached_now = state.apply_distinct_ack(required, Timestamp::now());
        Ok(AckOutcome::Recorded {
            state: state.clone(),
            quorum_reached_now,
        })
    }

    async fn get_finality_state(&self, locator: &Locator) -> EngineResult<FinalityState> {
        let tables = self.finality.read().await;
        Ok(tables
            .states
            .get(locator)
            .cloned()
            .unwrap_or_else(|| FinalityState::empty(locator.clone())))
    }

    async fn list_finality_acks(&self, locator: &Locator) -> EngineResult<Vec<FinalityAck>> {
        let tables = self.finality.read().await;
        let mut acks: Vec<FinalityAck> = tables
            .acks
            .values()
            .filter(|ack| &ack.locator == locator)
            .cloned()
            .collect();
        acks.sort_by(|a, b| a.acked_at.cmp(&b.acked_at).then(a.peer_id.cmp(&b.peer_id)));
        Ok(acks)
    }

    // ==================== Stats ====================

    async fn get_stats(&self) -> EngineResult<StorageStats> {
        let mut stats = StorageStats::default();
        for command in self.commands.read().await.values() {
            stats.count_command(command);
        }
        for operation in self.operations.read().await.values() {
            stats.count_operation(operation);
        }
        stats.total_responses = self.responses.read().await.values().map(|r| r.len() as u64).sum();
        stats.finality_acks = self.finality.read().await.acks.len() as u64;
        Ok(stats)
    }
}
