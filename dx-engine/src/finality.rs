//! Finality tracking
//!
//! Counts distinct replica acks per locator. A locator is final for
//! replication once `replication_factor` different peers acked it; that
//! flag never goes back to false.
//!
//! ```text
//! record_ack(U, p1) -> count 1
//! record_ack(U, p2) -> count 2
//! record_ack(U, p1) -> duplicate, count 2
//! record_ack(U, p3) -> count 3, quorum reached -> listener
//! ```

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::{debug, info};

use dx_core::{AckOutcome, FinalityAck, FinalityState, Locator, OperationId, PeerId};

use crate::error::EngineResult;
use crate::storage::EngineStorage;

/// Notified when a locator reaches quorum
#[async_trait]
pub trait FinalityListener: Send + Sync {
    async fn on_quorum_reached(&self, locator: &Locator, operation_id: &OperationId);
}

/// Distinct-ack counter on top of [`EngineStorage`]
pub struct FinalityTracker {
    storage: Arc<dyn EngineStorage>,
    replication_factor: u32,
    listener: RwLock<Option<Weak<dyn FinalityListener>>>,
}

impl FinalityTracker {
    pub fn new(storage: Arc<dyn EngineStorage>, replication_factor: u32) -> Self {
        Self {
            storage,
            replication_factor,
            listener: RwLock::new(None),
        }
    }

    pub fn replication_factor(&self) -> u32 {
        self.replication_factor
    }

    /// Listener held weakly; the registry owns the tracker
    pub async fn set_listener(&self, listener: Weak<dyn FinalityListener>) {
        *self.listener.write().await = Some(listener);
    }

    /// Record that `peer_id` holds `locator`.
    ///
    /// Duplicates from the same peer are ignored. The listener runs only
    /// for the ack that flips quorum.
    pub async fn record_ack(
        &self,
        locator: &Locator,
        peer_id: &PeerId,
        operation_id: &OperationId,
    ) -> EngineResult<AckOutcome> {
        let ack = FinalityAck::new(locator.clone(), peer_id.clone(), *operation_id);
        let outcome = self
            .storage
            .upsert_finality_ack(&ack, self.replication_factor)
            .await?;

        match &outcome {
            AckOutcome::DuplicateIgnored { state } => {
                debug!(
                    locator = %locator,
                    peer_id = %peer_id,
                    count = state.distinct_ack_count,
                    "Duplicate ack ignored"
                );
            }
            AckOutcome::Recorded { state, quorum_reached_now } => {
                debug!(
                    locator = %locator,
                    peer_id = %peer_id,
                    count = state.distinct_ack_count,
                    required = self.replication_factor,
                    "Ack recorded"
                );
                if *quorum_reached_now {
                    info!(
                        locator = %locator,
                        operation_id = %operation_id,
                        count = state.distinct_ack_count,
                        "Replication quorum reached"
                    );
                    self.notify(locator, operation_id).await;
                }
            }
        }

        Ok(outcome)
    }

    pub async fn get_state(&self, locator: &Locator) -> EngineResult<FinalityState> {
        self.storage.get_finality_state(locator).await
    }

    pub async fn acks(&self, locator: &Locator) -> EngineResult<Vec<FinalityAck>> {
        self.storage.list_finality_acks(locator).await
    }

    async fn notify(&self, locator: &Locator, operation_id: &OperationId) {
        let listener = self.listener.read().await.as_ref().and_then(Weak::upgrade);
        match listener {
            Some(listener) => listener.on_quorum_reached(locator, operation_id).await,
            None => debug!(locator = %locator, "No finality listener attached"),
        }
    }
}
