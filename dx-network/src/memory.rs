//! In-process transport
//!
//! A [`MemoryNetwork`] is a shared switchboard: every joined node gets an
//! inbox, and [`MemoryTransport::send`] drops messages straight into the
//! target's inbox. Used by tests and single-process clusters.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use crate::error::{NetworkError, NetworkResult};
use crate::message::{NetworkMessage, NodeId};
use crate::node::{ConnectionState, NodeManager, PeerNode, Transport};

type Inbox = mpsc::Sender<(NodeId, NetworkMessage)>;

/// Shared in-memory switchboard
#[derive(Clone)]
pub struct MemoryNetwork {
    inboxes: Arc<RwLock<HashMap<NodeId, Inbox>>>,
    queue_size: usize,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl MemoryNetwork {
    pub fn new(queue_size: usize) -> Self {
        Self {
            inboxes: Arc::new(RwLock::new(HashMap::new())),
            queue_size,
        }
    }

    /// Attach a node; returns its transport and the receiving end of its inbox
    pub async fn join(
        &self,
        node_manager: Arc<NodeManager>,
    ) -> (Arc<MemoryTransport>, mpsc::Receiver<(NodeId, NetworkMessage)>) {
        let (tx, rx) = mpsc::channel(self.queue_size);
        self.inboxes
            .write()
            .await
            .insert(node_manager.node_id.clone(), tx);

        let transport = Arc::new(MemoryTransport {
            node_manager,
            network: self.clone(),
        });
        (transport, rx)
    }

    /// Detach a node; later sends to it fail with `NodeNotFound`
    pub async fn leave(&self, node_id: &NodeId) {
        self.inboxes.write().await.remove(node_id);
    }

    pub async fn members(&self) -> Vec<NodeId> {
        let mut members: Vec<NodeId> = self.inboxes.read().await.keys().cloned().collect();
        members.sort();
        members
    }

    async fn inbox(&self, node_id: &NodeId) -> Option<Inbox> {
        self.inboxes.read().await.get(node_id).cloned()
    }
}

/// Transport of one node on a [`MemoryNetwork`]
pub struct MemoryTransport {
    node_manager: Arc<NodeManager>,
    network: MemoryNetwork,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, to: &NodeId, message: &NetworkMessage) -> NetworkResult<()> {
        let inbox = self
            .network
            .inbox(to)
            .await
            .ok_or_else(|| NetworkError::NodeNotFound(to.clone()))?;

        inbox
            .send((self.node_manager.node_id.clone(), message.clone()))
            .await
            .map_err(|_| NetworkError::SendFailed(format!("inbox of {} closed", to)))
    }

    /// In memory the address is the node id
    async fn connect(&self, address: &str) -> NetworkResult<NodeId> {
        let node_id = address.to_string();
        if self.network.inbox(&node_id).await.is_none() {
            return Err(NetworkError::NodeNotFound(node_id));
        }

        if self.node_manager.get_peer(&node_id).await.is_none() {
            self.node_manager
                .upsert_peer(PeerNode::new(node_id.clone(), address.to_string()))
                .await;
        }
        self.node_manager
            .update_peer_state(&node_id, ConnectionState::Connected)
            .await;
        Ok(node_id)
    }

    async fn disconnect(&self, node_id: &NodeId) -> NetworkResult<()> {
        self.node_manager
            .update_peer_state(node_id, ConnectionState::Disconnected)
            .await;
        Ok(())
    }
}
