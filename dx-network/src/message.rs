//! Network message types
//!
//! Messages exchanged between nodes while executing operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dx_core::{Locator, MerkleProof, OperationId, OperationPayload, OperationType};

/// Unique message identifier
pub type MessageId = String;

/// Node identifier
pub type NodeId = String;

pub const PING: &str = "Ping";
pub const PONG: &str = "Pong";
pub const PROTOCOL_REQUEST: &str = "ProtocolRequest";
pub const ACK: &str = "Ack";
pub const NACK: &str = "Nack";
pub const BUSY: &str = "Busy";
pub const CHALLENGE: &str = "Challenge";
pub const CHALLENGE_RESPONSE: &str = "ChallengeResponse";

/// Network message envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkMessage {
    pub message_id: MessageId,
    pub from: NodeId,
    pub to: NodeId,
    pub timestamp: DateTime<Utc>,
    pub payload: MessagePayload,
    /// Request this message answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<MessageId>,
}

impl NetworkMessage {
    pub fn new(from: NodeId, to: NodeId, payload: MessagePayload) -> Self {
        Self {
            message_id: generate_message_id(),
            from,
            to,
            timestamp: Utc::now(),
            payload,
            in_reply_to: None,
        }
    }

    /// Reply to `request`, addressed back to its sender
    pub fn reply(request: &NetworkMessage, payload: MessagePayload) -> Self {
        let mut message = Self::new(request.to.clone(), request.from.clone(), payload);
        message.in_reply_to = Some(request.message_id.clone());
        message
    }

    pub fn is_reply(&self) -> bool {
        self.in_reply_to.is_some()
    }
}

/// Message payload types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum MessagePayload {
    /// Liveness check
    Ping(PingPayload),
    Pong(PongPayload),
    /// Ask a replica to take part in an operation
    ProtocolRequest(ProtocolRequestPayload),
    /// Request accepted
    Ack(AckPayload),
    /// Request refused
    Nack(NackPayload),
    /// Replica overloaded, try later
    Busy(BusyPayload),
    /// Prove possession of one leaf of a stored dataset
    Challenge(ChallengePayload),
    ChallengeResponse(ChallengeResponsePayload),
}

impl MessagePayload {
    pub fn message_type(&self) -> &'static str {
        match self {
            MessagePayload::Ping(_) => PING,
            MessagePayload::Pong(_) => PONG,
            MessagePayload::ProtocolRequest(_) => PROTOCOL_REQUEST,
            MessagePayload::Ack(_) => ACK,
            MessagePayload::Nack(_) => NACK,
            MessagePayload::Busy(_) => BUSY,
            MessagePayload::Challenge(_) => CHALLENGE,
            MessagePayload::ChallengeResponse(_) => CHALLENGE_RESPONSE,
        }
    }

    pub fn nack(operation_id: Option<OperationId>, reason: impl Into<String>) -> Self {
        MessagePayload::Nack(NackPayload {
            operation_id,
            reason: reason.into(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PingPayload {
    pub nonce: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PongPayload {
    pub nonce: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolRequestPayload {
    pub operation_id: OperationId,
    pub operation_type: OperationType,
    pub locator: Locator,
    pub payload: OperationPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AckPayload {
    pub operation_id: Option<OperationId>,
    /// Root the replica computed over what it stored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merkle_root: Option<String>,
    /// Answer of read operations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NackPayload {
    pub operation_id: Option<OperationId>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusyPayload {
    pub operation_id: Option<OperationId>,
    #[serde(default)]
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChallengePayload {
    pub locator: Locator,
    pub leaf_index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChallengeResponsePayload {
    pub locator: Locator,
    pub leaf_index: usize,
    pub leaf: String,
    pub proof: MerkleProof,
}

/// Generate a unique message ID
fn generate_message_id() -> MessageId {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let seq = COUNTER.fetch_add(1, Ordering::SeqCst);
    let timestamp = Utc::now().timestamp_micros();
    format!("msg_{:016x}_{:08x}", timestamp, seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_ids_unique() {
        let a = NetworkMessage::new("a".into(), "b".into(), MessagePayload::Ping(PingPayload { nonce: 1 }));
        let b = NetworkMessage::new("a".into(), "b".into(), MessagePayload::Ping(PingPayload { nonce: 1 }));
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn test_reply_swaps_endpoints() {
        let request = NetworkMessage::new(
            "node_a".into(),
            "node_b".into(),
            MessagePayload::Ping(PingPayload { nonce: 9 }),
        );
        let reply = NetworkMessage::reply(&request, MessagePayload::Pong(PongPayload { nonce: 9 }));
        assert_eq!(reply.from, "node_b");
        assert_eq!(reply.to, "node_a");
        assert_eq!(reply.in_reply_to.as_deref(), Some(request.message_id.as_str()));
        assert!(reply.is_reply());
    }

    #[test]
    fn test_payload_tagging() {
        let payload = MessagePayload::nack(None, "unknown locator");
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "Nack");
        assert_eq!(json["data"]["reason"], "unknown locator");
        assert_eq!(payload.message_type(), NACK);
    }
}
