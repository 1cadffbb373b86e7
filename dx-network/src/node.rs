//! Peer tracking and the transport contract

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::NetworkResult;
use crate::message::{NetworkMessage, NodeId};

/// Node connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Peer node information
#[derive(Debug, Clone)]
pub struct PeerNode {
    pub node_id: NodeId,
    pub address: String,
    pub state: ConnectionState,
    pub last_seen: DateTime<Utc>,
    /// Consecutive failed requests
    pub failure_count: u32,
}

impl PeerNode {
    pub fn new(node_id: NodeId, address: String) -> Self {
        Self {
            node_id,
            address,
            state: ConnectionState::Disconnected,
            last_seen: Utc::now(),
            failure_count: 0,
        }
    }

    pub fn is_online(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Transport trait for sending messages
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message to a specific node
    async fn send(&self, to: &NodeId, message: &NetworkMessage) -> NetworkResult<()>;

    /// Connect to a node
    async fn connect(&self, address: &str) -> NetworkResult<NodeId>;

    /// Disconnect from a node
    async fn disconnect(&self, node_id: &NodeId) -> NetworkResult<()>;
}

/// Node manager for tracking peer nodes
pub struct NodeManager {
    /// Our node ID
    pub node_id: NodeId,
    peers: Arc<RwLock<HashMap<NodeId, PeerNode>>>,
    max_peers: usize,
}

impl NodeManager {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            peers: Arc::new(RwLock::new(HashMap::new())),
            max_peers: 100,
        }
    }

    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }

    /// Add or update a peer node
    pub async fn upsert_peer(&self, peer: PeerNode) {
        let node_id = peer.node_id.clone();

        let mut peers = self.peers.write().await;
        if peers.len() >= self.max_peers && !peers.contains_key(&node_id) {
            // Evict the oldest disconnected peer
            let oldest = peers
                .iter()
                .filter(|(_, p)| p.state == ConnectionState::Disconnected)
                .min_by_key(|(_, p)| p.last_seen)
                .map(|(id, _)| id.clone());
            if let Some(old_id) = oldest {
                peers.remove(&old_id);
            }
        }
        peers.insert(node_id, peer);
    }

    pub async fn remove_peer(&self, node_id: &NodeId) {
        let mut peers = self.peers.write().await;
        peers.remove(node_id);
    }

    pub async fn get_peer(&self, node_id: &NodeId) -> Option<PeerNode> {
        let peers = self.peers.read().await;
        peers.get(node_id).cloned()
    }

    /// Connected peers ordered by node id
    pub async fn connected_peers(&self) -> Vec<PeerNode> {
        let peers = self.peers.read().await;
        let mut online: Vec<PeerNode> = peers.values().filter(|p| p.is_online()).cloned().collect();
        online.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        online
    }

    pub async fn update_peer_state(&self, node_id: &NodeId, state: ConnectionState) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(node_id) {
            peer.state = state;
            if state == ConnectionState::Connected {
                peer.failure_count = 0;
                peer.last_seen = Utc::now();
            } else if state == ConnectionState::Failed {
                peer.failure_count += 1;
            }
        }
    }

    /// Note a reply from `node_id`
    pub async fn record_success(&self, node_id: &NodeId) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(node_id) {
            peer.failure_count = 0;
            peer.last_seen = Utc::now();
        }
    }

    /// Note a failed request without changing the connection state
    pub async fn record_failure(&self, node_id: &NodeId) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(node_id) {
            peer.failure_count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_node_manager() {
        let manager = NodeManager::new("node_0".to_string());

        for i in (1..5).rev() {
            let peer = PeerNode::new(format!("node_{}", i), format!("mem://node_{}", i));
            manager.upsert_peer(peer).await;
        }
        assert!(manager.connected_peers().await.is_empty());

        manager.update_peer_state(&"node_3".to_string(), ConnectionState::Connected).await;
        manager.update_peer_state(&"node_1".to_string(), ConnectionState::Connected).await;

        let connected: Vec<NodeId> = manager
            .connected_peers()
            .await
            .into_iter()
            .map(|p| p.node_id)
            .collect();
        assert_eq!(connected, vec!["node_1".to_string(), "node_3".to_string()]);

        manager.record_failure(&"node_1".to_string()).await;
        manager.record_failure(&"node_1".to_string()).await;
        assert_eq!(manager.get_peer(&"node_1".to_string()).await.unwrap().failure_count, 2);
        manager.record_success(&"node_1".to_string()).await;
        assert_eq!(manager.get_peer(&"node_1".to_string()).await.unwrap().failure_count, 0);

        manager.remove_peer(&"node_3".to_string()).await;
        assert!(manager.get_peer(&"node_3".to_string()).await.is_none());
    }

    #[tokio::test]
    async fn test_max_peers_evicts_disconnected() {
        let manager = NodeManager::new("node_0".to_string()).with_max_peers(2);
        manager.upsert_peer(PeerNode::new("a".into(), "mem://a".into())).await;
        manager.upsert_peer(PeerNode::new("b".into(), "mem://b".into())).await;
        manager.update_peer_state(&"b".to_string(), ConnectionState::Connected).await;
        manager.upsert_peer(PeerNode::new("c".into(), "mem://c".into())).await;

        assert!(manager.get_peer(&"a".to_string()).await.is_none());
        assert!(manager.get_peer(&"b".to_string()).await.is_some());
        assert!(manager.get_peer(&"c".to_string()).await.is_some());
    }
}
