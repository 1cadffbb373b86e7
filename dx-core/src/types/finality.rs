//! Finality - per-locator replica acknowledgments and quorum state

use serde::{Deserialize, Serialize};

use super::common::*;

/// One peer's acknowledgment for a locator, unique on (locator, peer_id)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalityAck {
    pub locator: Locator,
    pub peer_id: PeerId,
    /// Operation that produced the first ack from this peer
    pub operation_id: OperationId,
    pub acked_at: Timestamp,
}

impl FinalityAck {
    pub fn new(locator: Locator, peer_id: impl Into<PeerId>, operation_id: OperationId) -> Self {
        Self {
            locator,
            peer_id: peer_id.into(),
            operation_id,
            acked_at: Timestamp::now(),
        }
    }
}

/// Aggregate view of the acks recorded for a locator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalityState {
    pub locator: Locator,
    pub distinct_ack_count: u32,
    /// Once true, never reset
    pub min_acks_reached: bool,
    pub reached_at: Option<Timestamp>,
}

impl FinalityState {
    /// State of a locator nobody acked yet
    pub fn empty(locator: Locator) -> Self {
        Self {
            locator,
            distinct_ack_count: 0,
            min_acks_reached: false,
            reached_at: None,
        }
    }

    /// Count one more distinct ack and re-evaluate quorum.
    ///
    /// Returns true only on the false -> true transition.
    pub fn apply_distinct_ack(&mut self, required: u32, now: Timestamp) -> bool {
        self.distinct_ack_count += 1;
        if !self.min_acks_reached && self.distinct_ack_count >= required {
            self.min_acks_reached = true;
            self.reached_at = Some(now);
            return true;
        }
        false
    }
}

/// Result of recording an ack
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    /// First ack from this peer for the locator
    Recorded {
        state: FinalityState,
        quorum_reached_now: bool,
    },
    /// The peer had already acked; nothing changed
    DuplicateIgnored { state: FinalityState },
}

impl AckOutcome {
    pub fn state(&self) -> &FinalityState {
        match self {
            Self::Recorded { state, .. } | Self::DuplicateIgnored { state } => state,
        }
    }

    pub fn quorum_reached_now(&self) -> bool {
        matches!(self, Self::Recorded { quorum_reached_now: true, .. })
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateIgnored { .. })
    }
}
