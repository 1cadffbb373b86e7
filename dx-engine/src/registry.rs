//! Operation registry
//!
//! Owns the lifecycle of client operations and decides when they are done.
//!
//! # State machine
//!
//! ```text
//! PENDING ──► IN_PROGRESS ──► COMPLETED
//!    │             │
//!    └─────────────┴────────► FAILED
//! ```
//!
//! Terminal states are absorbing. Replication operations (publish, update)
//! complete when their locator reaches quorum and the cached dataset still
//! matches the claimed Merkle root. Read operations (get, ask, search)
//! complete on the first ACK.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use dx_core::{
    digest_from_hex, AckOutcome, Locator, Operation, OperationId, OperationPayload, OperationResponse,
    OperationStatus, OperationStatusView, OperationType, PeerId, PeerResponseStatus, ResponseSummary,
    Timestamp,
};

use crate::cache::{CachedOperation, OperationCache};
use crate::commands;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::finality::{FinalityListener, FinalityTracker};
use crate::scheduler::CommandScheduler;
use crate::storage::{EngineStorage, OperationUpdate};
use crate::verify::IntegrityVerifier;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Status change of an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationEvent {
    pub operation_id: OperationId,
    pub operation_type: OperationType,
    pub locator: Locator,
    pub status: OperationStatus,
    pub at: Timestamp,
}

impl From<&Operation> for OperationEvent {
    fn from(operation: &Operation) -> Self {
        Self {
            operation_id: operation.operation_id,
            operation_type: operation.operation_type,
            locator: operation.locator.clone(),
            status: operation.status,
            at: operation.updated_at,
        }
    }
}

/// What happened to an appended peer response
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    /// Logged; the operation is unaffected
    Recorded,
    /// Replication ack passed to finality tracking
    Ack(AckOutcome),
    /// The response decided the operation
    Finalized(OperationStatus),
    /// Operation already terminal; logged only
    Late(OperationStatus),
}

/// Operation registry
pub struct OperationRegistry {
    config: EngineConfig,
    storage: Arc<dyn EngineStorage>,
    cache: Arc<OperationCache>,
    scheduler: Arc<CommandScheduler>,
    finality: Arc<FinalityTracker>,
    verifier: Arc<IntegrityVerifier>,
    events: broadcast::Sender<OperationEvent>,
}

impl OperationRegistry {
    pub fn new(
        config: EngineConfig,
        storage: Arc<dyn EngineStorage>,
        cache: Arc<OperationCache>,
        scheduler: Arc<CommandScheduler>,
        finality: Arc<FinalityTracker>,
        verifier: Arc<IntegrityVerifier>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            storage,
            cache,
            scheduler,
            finality,
            verifier,
            events,
        }
    }

    /// Stream of status changes
    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.events.subscribe()
    }

    // ==================== Lifecycle ====================

    /// Register a new operation and start its fan-out
    pub async fn create_operation(
        &self,
        operation_type: OperationType,
        locator: Locator,
        payload: OperationPayload,
    ) -> EngineResult<OperationId> {
        validate_payload(operation_type, &payload)?;

        let operation = Operation::new(operation_type, locator.clone());
        let operation_id = operation.operation_id;
        self.storage.insert_operation(&operation).await?;
        self.publish(&operation);

        self.cache
            .insert(operation_id, CachedOperation::new(operation_type, locator.clone(), payload))
            .await;

        let operation = self
            .storage
            .transition_operation(&operation_id, OperationUpdate::status(OperationStatus::InProgress))
            .await?;
        self.publish(&operation);

        let fan_out = commands::replicate::command(operation_id, self.config.command_retry_max);
        if let Err(e) = self.scheduler.schedule(fan_out).await {
            self.fail_operation(&operation_id, format!("failed to schedule fan-out: {}", e))
                .await?;
            return Err(e);
        }
        self.scheduler
            .schedule(commands::timeout::command(operation_id, self.config.operation_timeout_ms))
            .await?;

        info!(
            operation_id = %operation_id,
            operation_type = %operation_type,
            locator = %locator,
            "Operation created"
        );
        Ok(operation_id)
    }

    /// Log a peer's reply and act on it.
    ///
    /// Responses for terminal operations are stored but change nothing.
    pub async fn append_peer_response(
        &self,
        operation_id: &OperationId,
        peer_id: &PeerId,
        status: PeerResponseStatus,
        message: Option<String>,
        data: Option<serde_json::Value>,
    ) -> EngineResult<ResponseOutcome> {
        let operation = self.load(operation_id).await?;

        let response = OperationResponse::new(*operation_id, peer_id.clone(), status, message);
        self.storage.append_response(&response).await?;

        if operation.status.is_terminal() {
            debug!(
                operation_id = %operation_id,
                peer_id = %peer_id,
                status = %operation.status,
                "Late response ignored"
            );
            return Ok(ResponseOutcome::Late(operation.status));
        }

        if !status.is_ack() {
            debug!(operation_id = %operation_id, peer_id = %peer_id, response = %status, "Peer response recorded");
            return Ok(ResponseOutcome::Recorded);
        }

        if !operation.operation_type.requires_replication() {
            let status = self.complete_read(&operation, peer_id, data).await?;
            return Ok(ResponseOutcome::Finalized(status));
        }

        let outcome = self
            .finality
            .record_ack(&operation.locator, peer_id, operation_id)
            .await?;

        // The locator was already final before this operation acked it
        if outcome.state().min_acks_reached && !outcome.quorum_reached_now() {
            self.finalize(operation_id).await?;
        }

        Ok(ResponseOutcome::Ack(outcome))
    }

    /// Close a replication operation whose locator reached quorum.
    ///
    /// Returns the resulting status; a no-op for terminal operations or
    /// while quorum is still missing.
    pub async fn finalize(&self, operation_id: &OperationId) -> EngineResult<OperationStatus> {
        let operation = self.load(operation_id).await?;
        if operation.status.is_terminal() {
            return Ok(operation.status);
        }

        let state = self.finality.get_state(&operation.locator).await?;
        if !state.min_acks_reached {
            debug!(
                operation_id = %operation_id,
                count = state.distinct_ack_count,
                "Quorum not reached yet"
            );
            return Ok(operation.status);
        }

        let cached = match self.cache.get(operation_id).await {
            Some(cached) => cached,
            None => return self.fail_integrity(operation_id, "cached payload unavailable").await,
        };
        let claimed_root = match cached.payload.merkle_root.as_deref().map(digest_from_hex) {
            Some(Ok(root)) => root,
            Some(Err(e)) => return self.fail_integrity(operation_id, e.to_string()).await,
            None => return self.fail_integrity(operation_id, "no claimed merkle root").await,
        };

        let report = self
            .verifier
            .verify_dataset(cached.payload.dataset.clone(), claimed_root)
            .await?;
        if !report.valid {
            let reason = report.reason.unwrap_or_else(|| "dataset rejected".to_string());
            return self.fail_integrity(operation_id, reason).await;
        }

        let data = json!({
            "locator": operation.locator,
            "merkle_root": report.computed_root,
            "replicas": state.distinct_ack_count,
            "challenged_leaf": report.challenged_index,
        });
        let status = self.settle(operation_id, OperationUpdate::completed(data)).await?;

        if status == OperationStatus::Completed {
            info!(
                operation_id = %operation_id,
                locator = %operation.locator,
                replicas = state.distinct_ack_count,
                "Operation completed"
            );
            self.schedule_audit(&operation, &report.computed_root, cached.payload.dataset.len())
                .await;
        }
        Ok(status)
    }

    /// Move a non-terminal operation to FAILED
    pub async fn fail_operation(
        &self,
        operation_id: &OperationId,
        reason: impl Into<String>,
    ) -> EngineResult<OperationStatus> {
        let reason = reason.into();
        let status = self.settle(operation_id, OperationUpdate::failed(reason.clone())).await?;
        if status == OperationStatus::Failed {
            warn!(operation_id = %operation_id, error = %reason, "Operation failed");
        }
        Ok(status)
    }

    pub async fn cancel_operation(&self, operation_id: &OperationId) -> EngineResult<OperationStatus> {
        self.fail_operation(operation_id, "cancelled").await
    }

    // ==================== Queries ====================

    pub async fn get_status(&self, operation_id: &OperationId) -> EngineResult<OperationStatusView> {
        let operation = self.load(operation_id).await?;
        Ok(OperationStatusView::from(&operation))
    }

    pub async fn get_operation(&self, operation_id: &OperationId) -> EngineResult<Operation> {
        self.load(operation_id).await
    }

    pub async fn responses(&self, operation_id: &OperationId) -> EngineResult<Vec<OperationResponse>> {
        self.load(operation_id).await?;
        self.storage.list_responses(operation_id).await
    }

    pub async fn response_summary(&self, operation_id: &OperationId) -> EngineResult<ResponseSummary> {
        let responses = self.responses(operation_id).await?;
        Ok(ResponseSummary::from_responses(&responses))
    }

    /// Request of an open operation
    pub async fn cached(&self, operation_id: &OperationId) -> Option<CachedOperation> {
        self.cache.get(operation_id).await
    }

    // ==================== Internals ====================

    async fn load(&self, operation_id: &OperationId) -> EngineResult<Operation> {
        self.storage
            .get_operation(operation_id)
            .await?
            .ok_or_else(|| EngineError::OperationNotFound(operation_id.to_string()))
    }

    async fn complete_read(
        &self,
        operation: &Operation,
        peer_id: &PeerId,
        data: Option<serde_json::Value>,
    ) -> EngineResult<OperationStatus> {
        let operation_id = &operation.operation_id;
        let cached = match self.cache.get(operation_id).await {
            Some(cached) => cached,
            None => return self.fail_integrity(operation_id, "cached payload unavailable").await,
        };

        // Only a get answers with the whole leaf set; ask and search replies
        // were matched against the claimed root during fan-out.
        let claimed_root = match operation.operation_type {
            OperationType::Get => cached.payload.merkle_root.as_deref(),
            _ => None,
        };
        if let Some(root) = claimed_root {
            let root = match digest_from_hex(root) {
                Ok(root) => root,
                Err(e) => return self.fail_integrity(operation_id, e.to_string()).await,
            };
            let leaves: Vec<String> = match data.clone().map(serde_json::from_value) {
                Some(Ok(leaves)) => leaves,
                _ => return self.fail_integrity(operation_id, "answer is not a list of leaves").await,
            };
            let report = self.verifier.verify_dataset(leaves, root).await?;
            if !report.valid {
                let reason = report.reason.unwrap_or_else(|| "answer rejected".to_string());
                return self.fail_integrity(operation_id, reason).await;
            }
        }

        let status = self
            .settle(operation_id, OperationUpdate::completed(data.unwrap_or(serde_json::Value::Null)))
            .await?;
        if status == OperationStatus::Completed {
            info!(operation_id = %operation_id, peer_id = %peer_id, "Read operation answered");
        }
        Ok(status)
    }

    async fn fail_integrity(&self, operation_id: &OperationId, reason: impl Into<String>) -> EngineResult<OperationStatus> {
        let err = EngineError::integrity(operation_id, reason);
        warn!(operation_id = %operation_id, error = %err, "Integrity check failed");
        self.fail_operation(operation_id, err.to_string()).await
    }

    /// Apply a terminal update; a concurrent winner's status is returned
    /// instead of an error
    async fn settle(&self, operation_id: &OperationId, update: OperationUpdate) -> EngineResult<OperationStatus> {
        match self.storage.transition_operation(operation_id, update).await {
            Ok(operation) => {
                self.cache.remove(operation_id).await;
                self.publish(&operation);
                Ok(operation.status)
            }
            Err(EngineError::InvalidTransition { .. }) => {
                let current = self.load(operation_id).await?;
                debug!(operation_id = %operation_id, status = %current.status, "Operation already settled");
                Ok(current.status)
            }
            Err(e) => Err(e),
        }
    }

    async fn schedule_audit(&self, operation: &Operation, merkle_root: &str, leaf_count: usize) {
        let Some(interval_ms) = self.config.replica_audit_interval_ms else {
            return;
        };
        if !operation.operation_type.requires_replication() {
            return;
        }

        let audit = commands::audit::command(
            operation.locator.clone(),
            merkle_root.to_string(),
            leaf_count,
            interval_ms,
        );
        if let Err(e) = self.scheduler.schedule(audit).await {
            warn!(locator = %operation.locator, error = %e, "Failed to schedule replica audit");
        }
    }

    fn publish(&self, operation: &Operation) {
        // No subscribers is fine
        let _ = self.events.send(OperationEvent::from(operation));
    }
}

#[async_trait]
impl FinalityListener for OperationRegistry {
    async fn on_quorum_reached(&self, locator: &Locator, operation_id: &OperationId) {
        if let Err(e) = self.finalize(operation_id).await {
            error!(locator = %locator, operation_id = %operation_id, error = %e, "Finalization failed");
        }
    }
}

fn validate_payload(operation_type: OperationType, payload: &OperationPayload) -> EngineResult<()> {
    if let Some(root) = payload.merkle_root.as_deref() {
        digest_from_hex(root).map_err(|e| EngineError::InvalidPayload(e.to_string()))?;
    }
    if operation_type.requires_replication() {
        if payload.dataset.is_empty() {
            return Err(EngineError::InvalidPayload(format!(
                "{} requires a non-empty dataset",
                operation_type
            )));
        }
        if payload.merkle_root.is_none() {
            return Err(EngineError::InvalidPayload(format!(
                "{} requires a claimed merkle root",
                operation_type
            )));
        }
    }
    Ok(())
}
