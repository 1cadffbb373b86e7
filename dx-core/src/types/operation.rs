//! Operation - one client-level request
//!
//! ```text
//! pending ──→ in_progress ──┬──→ completed
//!                           └──→ failed
//! ```
//!
//! Status only moves forward and operations are never deleted.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::common::*;

/// Kind of client request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Publish,
    Get,
    Update,
    Ask,
    Search,
}

impl OperationType {
    /// Replication operations need a quorum of distinct replica acks;
    /// read operations finish on the first usable answer.
    pub fn requires_replication(&self) -> bool {
        matches!(self, Self::Publish | Self::Update)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publish => "PUBLISH",
            Self::Get => "GET",
            Self::Update => "UPDATE",
            Self::Ask => "ASK",
            Self::Search => "SEARCH",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationType {
    type Err = crate::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PUBLISH" => Ok(Self::Publish),
            "GET" => Ok(Self::Get),
            "UPDATE" => Ok(Self::Update),
            "ASK" => Ok(Self::Ask),
            "SEARCH" => Ok(Self::Search),
            other => Err(crate::CoreError::InvalidId(format!(
                "unknown operation type: {}",
                other
            ))),
        }
    }
}

/// Operation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, target: OperationStatus) -> bool {
        use OperationStatus::*;
        matches!(
            (self, target),
            (Pending, InProgress) | (Pending, Failed) | (InProgress, Completed) | (InProgress, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted operation record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Operation {
    pub operation_id: OperationId,
    pub operation_type: OperationType,
    pub status: OperationStatus,
    pub locator: Locator,
    /// Result data once completed
    pub data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Operation {
    pub fn new(operation_type: OperationType, locator: Locator) -> Self {
        let now = Timestamp::now();
        Self {
            operation_id: OperationId::new(),
            operation_type,
            status: OperationStatus::Pending,
            locator,
            data: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Input of `create_operation`, kept in the ephemeral cache until the
/// operation ends
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OperationPayload {
    /// Canonical dataset leaves (publish / update)
    #[serde(default)]
    pub dataset: Vec<String>,

    /// Hex root the dataset is claimed to hash to
    #[serde(default)]
    pub merkle_root: Option<String>,

    /// Free-form query for ask / search
    #[serde(default)]
    pub query: Option<String>,
}

impl OperationPayload {
    /// Payload for a publish or update of `dataset` committed to `merkle_root`
    pub fn dataset(dataset: Vec<String>, merkle_root: impl Into<String>) -> Self {
        Self {
            dataset,
            merkle_root: Some(merkle_root.into()),
            query: None,
        }
    }

    pub fn query(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..Self::default()
        }
    }

    pub fn with_merkle_root(mut self, merkle_root: impl Into<String>) -> Self {
        self.merkle_root = Some(merkle_root.into());
        self
    }
}

/// Kind of a peer reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerResponseStatus {
    /// Peer accepted the request
    Ack,
    /// Peer refused the request
    Nack,
    /// Peer is overloaded
    Busy,
    /// No usable reply (timeout, transport error)
    Failed,
}

impl PeerResponseStatus {
    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Ack)
    }
}

impl fmt::Display for PeerResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Busy => "BUSY",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// One peer's reply, append-only
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationResponse {
    pub operation_id: OperationId,
    pub peer_id: PeerId,
    pub status: PeerResponseStatus,
    pub message: Option<String>,
    pub timestamp: Timestamp,
}

impl OperationResponse {
    pub fn new(
        operation_id: OperationId,
        peer_id: impl Into<PeerId>,
        status: PeerResponseStatus,
        message: Option<String>,
    ) -> Self {
        Self {
            operation_id,
            peer_id: peer_id.into(),
            status,
            message,
            timestamp: Timestamp::now(),
        }
    }
}

/// Per-status response counts for one operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSummary {
    pub ack: u32,
    pub nack: u32,
    pub busy: u32,
    pub failed: u32,
}

impl ResponseSummary {
    pub fn from_responses<'a>(responses: impl IntoIterator<Item = &'a OperationResponse>) -> Self {
        let mut summary = Self::default();
        for response in responses {
            match response.status {
                PeerResponseStatus::Ack => summary.ack += 1,
                PeerResponseStatus::Nack => summary.nack += 1,
                PeerResponseStatus::Busy => summary.busy += 1,
                PeerResponseStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> u32 {
        self.ack + self.nack + self.busy + self.failed
    }
}

/// What callers see when polling an operation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationStatusView {
    pub operation_id: OperationId,
    pub status: OperationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Operation> for OperationStatusView {
    fn from(operation: &Operation) -> Self {
        Self {
            operation_id: operation.operation_id,
            status: operation.status,
            data: operation.data.clone(),
            error: operation.error_message.clone(),
        }
    }
}
