//! Replica side of the protocol
//!
//! Serves other nodes' requests: stores published datasets after checking
//! their root, answers reads from what it stores and answers audit
//! challenges with inclusion proofs. Datasets live in memory.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use dx_core::merkle::{self, MerkleTree};
use dx_core::{digest_from_hex, digest_to_hex, Digest32, Locator, OperationType, Timestamp};
use dx_network::{
    AckPayload, ChallengePayload, ChallengeResponsePayload, MessageHandler, MessagePayload, NetworkError,
    NetworkGateway, NetworkMessage, NetworkResult, NodeId, ProtocolRequestPayload, CHALLENGE, PROTOCOL_REQUEST,
};

/// Dataset held for a locator
#[derive(Debug, Clone)]
pub struct StoredDataset {
    pub leaves: Vec<String>,
    pub root: Digest32,
    pub stored_at: Timestamp,
}

pub struct ReplicaService {
    node_id: NodeId,
    datasets: RwLock<HashMap<Locator, StoredDataset>>,
}

impl ReplicaService {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            datasets: RwLock::new(HashMap::new()),
        }
    }

    /// Serve protocol requests and challenges arriving on `gateway`
    pub async fn register(self: &Arc<Self>, gateway: &Arc<dyn NetworkGateway>) {
        gateway.register_handler(PROTOCOL_REQUEST, self.clone()).await;
        gateway.register_handler(CHALLENGE, self.clone()).await;
    }

    pub async fn stored(&self, locator: &Locator) -> Option<StoredDataset> {
        self.datasets.read().await.get(locator).cloned()
    }

    pub async fn dataset_count(&self) -> usize {
        self.datasets.read().await.len()
    }

    /// Forget a dataset
    pub async fn evict(&self, locator: &Locator) -> bool {
        self.datasets.write().await.remove(locator).is_some()
    }

    async fn on_request(&self, request: ProtocolRequestPayload) -> MessagePayload {
        let operation_id = Some(request.operation_id);
        match request.operation_type {
            OperationType::Publish | OperationType::Update => {
                let claimed = match request.payload.merkle_root.as_deref().map(digest_from_hex) {
                    Some(Ok(root)) => root,
                    _ => return MessagePayload::nack(operation_id, "missing or malformed merkle root"),
                };
                let root = merkle::compute_root(&request.payload.dataset);
                if root != claimed {
                    return MessagePayload::nack(operation_id, "merkle root mismatch");
                }

                let previous = self.datasets.write().await.insert(
                    request.locator.clone(),
                    StoredDataset {
                        leaves: request.payload.dataset,
                        root,
                        stored_at: Timestamp::now(),
                    },
                );
                info!(
                    node_id = %self.node_id,
                    locator = %request.locator,
                    replaced = previous.is_some(),
                    "Dataset stored"
                );

                MessagePayload::Ack(AckPayload {
                    operation_id,
                    merkle_root: Some(digest_to_hex(&root)),
                    data: None,
                })
            }
            OperationType::Get | OperationType::Ask | OperationType::Search => {
                let stored = match self.stored(&request.locator).await {
                    Some(stored) => stored,
                    None => return MessagePayload::nack(operation_id, format!("unknown locator {}", request.locator)),
                };
                let data = match request.operation_type {
                    OperationType::Get => json!(stored.leaves),
                    OperationType::Ask => json!({ "known": true, "leaf_count": stored.leaves.len() }),
                    _ => {
                        let query = request.payload.query.unwrap_or_default();
                        let hits: Vec<&String> = stored.leaves.iter().filter(|leaf| leaf.contains(&query)).collect();
                        json!(hits)
                    }
                };
                MessagePayload::Ack(AckPayload {
                    operation_id,
                    merkle_root: Some(digest_to_hex(&stored.root)),
                    data: Some(data),
                })
            }
        }
    }

    async fn on_challenge(&self, challenge: ChallengePayload) -> MessagePayload {
        let stored = match self.stored(&challenge.locator).await {
            Some(stored) => stored,
            None => return MessagePayload::nack(None, format!("unknown locator {}", challenge.locator)),
        };

        let tree = MerkleTree::build(&stored.leaves);
        match (stored.leaves.get(challenge.leaf_index), tree.proof(challenge.leaf_index)) {
            (Some(leaf), Some(proof)) => MessagePayload::ChallengeResponse(ChallengeResponsePayload {
                locator: challenge.locator,
                leaf_index: challenge.leaf_index,
                leaf: leaf.clone(),
                proof,
            }),
            _ => MessagePayload::nack(None, format!("leaf {} out of range", challenge.leaf_index)),
        }
    }
}

#[async_trait]
impl MessageHandler for ReplicaService {
    async fn handle(&self, from: NodeId, message: NetworkMessage) -> NetworkResult<Option<MessagePayload>> {
        debug!(node_id = %self.node_id, from = %from, message_type = message.payload.message_type(), "Replica request");
        let reply = match message.payload {
            MessagePayload::ProtocolRequest(request) => self.on_request(request).await,
            MessagePayload::Challenge(challenge) => self.on_challenge(challenge).await,
            other => {
                return Err(NetworkError::InvalidMessage(format!(
                    "replica cannot serve {}",
                    other.message_type()
                )))
            }
        };
        Ok(Some(reply))
    }
}
