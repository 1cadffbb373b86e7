//! Sled persistent storage

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use std::path::Path;

use dx_core::{
    AckOutcome, Command, CommandId, CommandStatus, FinalityAck, FinalityState, Locator, Operation,
    OperationId, OperationResponse, OperationStatus, Timestamp,
};

use super::{sort_for_dispatch, EngineStorage, OperationUpdate, StorageStats};
use crate::error::{EngineError, EngineResult};

const COMMANDS_TREE: &str = "commands";
const OPERATIONS_TREE: &str = "operations";
const RESPONSES_TREE: &str = "responses";
const FINALITY_ACKS_TREE: &str = "finality_acks";
const FINALITY_STATES_TREE: &str = "finality_states";

/// Sled persistent storage
#[derive(Debug, Clone)]
pub struct SledStorage {
    db: sled::Db,
    commands: sled::Tree,
    operations: sled::Tree,
    /// Key: operation id ++ big-endian sequence, so a prefix scan yields arrival order
    responses: sled::Tree,
    /// Key: locator ++ 0x00 ++ peer id
    finality_acks: sled::Tree,
    finality_states: sled::Tree,
}

impl SledStorage {
    /// Open or create the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let db = sled::open(path).map_err(|e| EngineError::Storage(format!("Failed to open sled db: {}", e)))?;
        Self::from_db(db)
    }

    /// Throwaway database that is removed on drop
    pub fn temporary() -> EngineResult<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| EngineError::Storage(format!("Failed to open temporary sled db: {}", e)))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> EngineResult<Self> {
        let open = |name: &str| {
            db.open_tree(name)
                .map_err(|e| EngineError::Storage(format!("Failed to open {} tree: {}", name, e)))
        };

        Ok(Self {
            commands: open(COMMANDS_TREE)?,
            operations: open(OPERATIONS_TREE)?,
            responses: open(RESPONSES_TREE)?,
            finality_acks: open(FINALITY_ACKS_TREE)?,
            finality_states: open(FINALITY_STATES_TREE)?,
            db,
        })
    }

    /// Flush to disk
    pub fn flush(&self) -> EngineResult<()> {
        self.db
            .flush()
            .map_err(|e| EngineError::Storage(format!("Failed to flush db: {}", e)))?;
        Ok(())
    }

    // ==================== Helpers ====================

    fn serialize<T: Serialize>(value: &T) -> EngineResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| EngineError::Serialization(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> EngineResult<T> {
        serde_json::from_slice(bytes).map_err(|e| EngineError::Serialization(e.to_string()))
    }

    fn locator_prefix(locator: &Locator) -> Vec<u8> {
        let mut key = locator.as_str().as_bytes().to_vec();
        key.push(0);
        key
    }

    fn ack_key(locator: &Locator, peer_id: &str) -> Vec<u8> {
        let mut key = Self::locator_prefix(locator);
        key.extend_from_slice(peer_id.as_bytes());
        key
    }

    fn scan_commands<F>(&self, mut keep: F) -> EngineResult<Vec<Command>>
    where
        F: FnMut(&Command) -> bool,
    {
        let mut commands = Vec::new();
        for item in self.commands.iter() {
            let (_, value) = item.map_err(|e| EngineError::Storage(format!("Failed to iterate commands: {}", e)))?;
            let command: Command = Self::deserialize(&value)?;
            if keep(&command) {
                commands.push(command);
            }
        }
        Ok(commands)
    }

    fn abort<T>(err: EngineError) -> Result<T, ConflictableTransactionError<EngineError>> {
        Err(ConflictableTransactionError::Abort(err))
    }

    fn map_transaction_error(err: TransactionError<EngineError>) -> EngineError {
        match err {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => EngineError::Storage(format!("Transaction failed: {}", e)),
        }
    }
}

#[async_trait]
impl EngineStorage for SledStorage {
    // ==================== Commands ====================

    async fn insert_command(&self, command: &Command) -> EngineResult<()> {
        let value = Self::serialize(command)?;
        self.commands
            .compare_and_swap(command.id.as_bytes(), None as Option<&[u8]>, Some(value))
            .map_err(|e| EngineError::Storage(format!("Failed to insert command: {}", e)))?
            .map_err(|_| EngineError::Storage(format!("command {} already exists", command.id)))
    }

    async fn update_command(&self, command: &Command) -> EngineResult<()> {
        let key = command.id.as_bytes();
        let exists = self
            .commands
            .contains_key(key)
            .map_err(|e| EngineError::Storage(format!("Failed to get command: {}", e)))?;
        if !exists {
            return Err(EngineError::CommandNotFound(command.id.to_string()));
        }
        let value = Self::serialize(command)?;
        self.commands
            .insert(key, value)
            .map_err(|e| EngineError::Storage(format!("Failed to update command: {}", e)))?;
        Ok(())
    }

    async fn get_command(&self, command_id: &CommandId) -> EngineResult<Option<Command>> {
        match self
            .commands
            .get(command_id.as_bytes())
            .map_err(|e| EngineError::Storage(format!("Failed to get command: {}", e)))?
        {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list_due_commands(&self, now: Timestamp) -> EngineResult<Vec<Command>> {
        let mut due = self.scan_commands(|c| c.is_due(now))?;
        sort_for_dispatch(&mut due);
        Ok(due)
    }

    async fn list_commands_by_status(&self, statuses: &[CommandStatus]) -> EngineResult<Vec<Command>> {
        self.scan_commands(|c| statuses.contains(&c.status))
    }

    async fn list_commands_for_operation(&self, operation_id: &OperationId) -> EngineResult<Vec<Command>> {
        let mut owned = self.scan_commands(|c| c.owner_operation_id.as_ref() == Some(operation_id))?;
        owned.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(owned)
    }

    // ==================== Operations ====================

    async fn insert_operation(&self, operation: &Operation) -> EngineResult<()> {
        let value = Self::serialize(operation)?;
        self.operations
            .compare_and_swap(
                operation.operation_id.as_bytes(),
                None as Option<&[u8]>,
                Some(value),
            )
            .map_err(|e| EngineError::Storage(format!("Failed to insert operation: {}", e)))?
            .map_err(|_| {
                EngineError::Storage(format!("operation {} already exists", operation.operation_id))
            })
    }

    async fn get_operation(&self, operation_id: &OperationId) -> EngineResult<Option<Operation>> {
        match self
            .operations
            .get(operation_id.as_bytes())
            .map_err(|e| EngineError::Storage(format!("Failed to get operation: {}", e)))?
        {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn transition_operation(
        &self,
        operation_id: &OperationId,
        update: OperationUpdate,
    ) -> EngineResult<Operation> {
        let key = operation_id.as_bytes();

        self.operations
            .transaction(|tx| {
                let bytes = match tx.get(key)? {
                    Some(bytes) => bytes,
                    None => return Self::abort(EngineError::OperationNotFound(operation_id.to_string())),
                };
                let mut operation: Operation = match Self::deserialize(&bytes) {
                    Ok(operation) => operation,
                    Err(e) => return Self::abort(e),
                };
                if let Err(e) = update.apply(&mut operation) {
                    return Self::abort(e);
                }
                let value = match Self::serialize(&operation) {
                    Ok(value) => value,
                    Err(e) => return Self::abort(e),
                };
                tx.insert(&key[..], value)?;
                Ok(operation)
            })
            .map_err(Self::map_transaction_error)
    }

    async fn list_operations(&self, status: Option<OperationStatus>) -> EngineResult<Vec<Operation>> {
        let mut operations = Vec::new();
        for item in self.operations.iter() {
            let (_, value) = item.map_err(|e| EngineError::Storage(format!("Failed to iterate operations: {}", e)))?;
            let operation: Operation = Self::deserialize(&value)?;
            if status.map(|s| operation.status == s).unwrap_or(true) {
                operations.push(operation);
            }
        }
        operations.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(operations)
    }

    // ==================== Responses ====================

    async fn append_response(&self, response: &OperationResponse) -> EngineResult<()> {
        let seq = self
            .db
            .generate_id()
            .map_err(|e| EngineError::Storage(format!("Failed to generate response id: {}", e)))?;
        let mut key = response.operation_id.as_bytes().to_vec();
        key.extend_from_slice(&seq.to_be_bytes());

        let value = Self::serialize(response)?;
        self.responses
            .insert(key, value)
            .map_err(|e| EngineError::Storage(format!("Failed to append response: {}", e)))?;
        Ok(())
    }

    async fn list_responses(&self, operation_id: &OperationId) -> EngineResult<Vec<OperationResponse>> {
        let mut responses = Vec::new();
        for item in self.responses.scan_prefix(operation_id.as_bytes()) {
            let (_, value) = item.map_err(|e| EngineError::Storage(format!("Failed to iterate responses: {}", e)))?;
            responses.push(Self::deserialize(&value)?);
        }
        Ok(responses)
    }

    // ==================== Finality ====================

    async fn upsert_finality_ack(&self, ack: &FinalityAck, required: u32) -> EngineResult<AckOutcome> {
        let ack_key = Self::ack_key(&ack.locator, &ack.peer_id);
        let state_key = ack.locator.as_str().as_bytes();
        let ack_value = Self::serialize(ack)?;

        (&self.finality_acks, &self.finality_states)
            .transaction(|(acks, states)| {
                let mut state = match states.get(state_key)? {
                    Some(bytes) => match Self::deserialize::<FinalityState>(&bytes) {
                        Ok(state) => state,
                        Err(e) => return Self::abort(e),
                    },
                    None => FinalityState::empty(ack.locator.clone()),
                };

                if acks.get(&ack_key[..])?.is_some() {
                    return Ok(AckOutcome::DuplicateIgnored { state });
                }
                acks.insert(&ack_key[..], ack_value.clone())?;

                let quorum_reached_now = state.apply_distinct_ack(required, Timestamp::now());
                let state_value = match Self::serialize(&state) {
                    Ok(value) => value,
                    Err(e) => return Self::abort(e),
                };
                states.insert(state_key, state_value)?;

                Ok(AckOutcome::Recorded {
                    state,
                    quorum_reached_now,
                })
            })
            .map_err(Self::map_transaction_error)
    }

    async fn get_finality_state(&self, locator: &Locator) -> EngineResult<FinalityState> {
        match self
            .finality_states
            .get(locator.as_str().as_bytes())
            .map_err(|e| EngineError::Storage(format!("Failed to get finality state: {}", e)))?
        {
            Some(bytes) => Self::deserialize(&bytes),
            None => Ok(FinalityState::empty(locator.clone())),
        }
    }

    async fn list_finality_acks(&self, locator: &Locator) -> EngineResult<Vec<FinalityAck>> {
        let mut acks: Vec<FinalityAck> = Vec::new();
        for item in self.finality_acks.scan_prefix(Self::locator_prefix(locator)) {
            let (_, value) = item.map_err(|e| EngineError::Storage(format!("Failed to iterate acks: {}", e)))?;
            acks.push(Self::deserialize(&value)?);
        }
        acks.sort_by(|a, b| a.acked_at.cmp(&b.acked_at).then(a.peer_id.cmp(&b.peer_id)));
        Ok(acks)
    }

    // ==================== Stats ====================

    async fn get_stats(&self) -> EngineResult<StorageStats> {
        let mut stats = StorageStats::default();
        for command in self.scan_commands(|_| true)? {
            stats.count_command(&command);
        }
        for operation in self.list_operations(None).await? {
            stats.count_operation(&operation);
        }
        stats.total_responses = self.responses.len() as u64;
        stats.finality_acks = self.finality_acks.len() as u64;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dx_core::{OperationType, PeerResponseStatus};
    use serde_json::json;

    fn locator(s: &str) -> Locator {
        Locator::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_commands_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let command = Command::new("replicate", json!({"batch": 1})).with_retries(2);

        {
            let storage = SledStorage::open(dir.path()).unwrap();
            storage.insert_command(&command).await.unwrap();
            storage.flush().unwrap();
        }

        let storage = SledStorage::open(dir.path()).unwrap();
        let loaded = storage.get_command(&command.id).await.unwrap().unwrap();
        assert_eq!(loaded, command);
        assert!(storage.insert_command(&command).await.is_err());
    }

    #[tokio::test]
    async fn test_operation_transition() {
        let storage = SledStorage::temporary().unwrap();
        let operation = Operation::new(OperationType::Publish, locator("u"));
        storage.insert_operation(&operation).await.unwrap();
        let id = operation.operation_id;

        storage
            .transition_operation(&id, OperationUpdate::status(OperationStatus::InProgress))
            .await
            .unwrap();
        let done = storage
            .transition_operation(&id, OperationUpdate::completed(json!({"replicas": 3})))
            .await
            .unwrap();
        assert_eq!(done.status, OperationStatus::Completed);

        let err = storage
            .transition_operation(&id, OperationUpdate::failed("late"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        let stored = storage.get_operation(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Completed);

        let err = storage
            .transition_operation(&OperationId::new(), OperationUpdate::failed("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::OperationNotFound(_)));
    }

    #[tokio::test]
    async fn test_finality_acks_scoped_by_locator() {
        let storage = SledStorage::temporary().unwrap();
        let op = OperationId::new();

        // "u" must not pick up acks stored under "u1"
        for peer in ["p1", "p2"] {
            storage.upsert_finality_ack(&FinalityAck::new(locator("u1"), peer, op), 3).await.unwrap();
        }
        let outcome = storage.upsert_finality_ack(&FinalityAck::new(locator("u"), "p1", op), 3).await.unwrap();
        assert_eq!(outcome.state().distinct_ack_count, 1);

        let dup = storage.upsert_finality_ack(&FinalityAck::new(locator("u"), "p1", op), 3).await.unwrap();
        assert!(dup.is_duplicate());

        assert_eq!(storage.list_finality_acks(&locator("u")).await.unwrap().len(), 1);
        assert_eq!(storage.list_finality_acks(&locator("u1")).await.unwrap().len(), 2);
        assert_eq!(storage.get_finality_state(&locator("u1")).await.unwrap().distinct_ack_count, 2);
    }

    #[tokio::test]
    async fn test_concurrent_acks_flip_once() {
        let storage = std::sync::Arc::new(SledStorage::temporary().unwrap());
        let op = OperationId::new();
        let u = locator("u");

        let mut handles = Vec::new();
        for i in 0..24 {
            let storage = storage.clone();
            let u = u.clone();
            handles.push(tokio::spawn(async move {
                storage
                    .upsert_finality_ack(&FinalityAck::new(u, format!("p{}", i % 6), op), 3)
                    .await
                    .unwrap()
            }));
        }

        let mut flips = 0;
        for handle in handles {
            if handle.await.unwrap().quorum_reached_now() {
                flips += 1;
            }
        }
        assert_eq!(flips, 1);
        assert_eq!(storage.get_finality_state(&u).await.unwrap().distinct_ack_count, 6);
    }

    #[tokio::test]
    async fn test_responses_keep_arrival_order() {
        let storage = SledStorage::temporary().unwrap();
        let id = OperationId::new();
        let other = OperationId::new();

        for peer in ["p3", "p1", "p2"] {
            storage
                .append_response(&OperationResponse::new(id, peer, PeerResponseStatus::Ack, None))
                .await
                .unwrap();
        }
        storage
            .append_response(&OperationResponse::new(other, "p9", PeerResponseStatus::Nack, None))
            .await
            .unwrap();

        let peers: Vec<String> = storage
            .list_responses(&id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.peer_id)
            .collect();
        assert_eq!(peers, vec!["p3", "p1", "p2"]);

        let stats = storage.get_stats().await.unwrap();
        assert_eq!(stats.total_responses, 4);
    }
}
