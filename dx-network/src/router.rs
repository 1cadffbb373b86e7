//! Message Router
//!
//! Routes incoming messages to registered handlers and matches replies to
//! outstanding requests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{NetworkError, NetworkResult};
use crate::gateway::NetworkGateway;
use crate::message::{MessageId, MessagePayload, NetworkMessage, NodeId, PongPayload};
use crate::node::{NodeManager, Transport};

/// Message handler trait
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle an incoming request; the returned payload is sent back as the reply
    async fn handle(&self, from: NodeId, message: NetworkMessage) -> NetworkResult<Option<MessagePayload>>;
}

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Timeout used by [`MessageRouter::request`] callers that have no better value
    pub default_timeout_ms: u64,
    /// Inbox size for in-process transports
    pub queue_size: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 15_000,
            queue_size: 1000,
        }
    }
}

/// Message router for handling incoming messages
pub struct MessageRouter {
    config: RouterConfig,
    node_manager: Arc<NodeManager>,
    transport: Arc<dyn Transport>,
    handlers: Arc<RwLock<HashMap<String, Arc<dyn MessageHandler>>>>,
    /// Requests waiting for a reply, keyed by request message id
    pending_responses: Arc<RwLock<HashMap<MessageId, oneshot::Sender<NetworkMessage>>>>,
}

impl MessageRouter {
    pub fn new(
        node_manager: Arc<NodeManager>,
        transport: Arc<dyn Transport>,
        config: RouterConfig,
    ) -> Self {
        Self {
            config,
            node_manager,
            transport,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            pending_responses: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn node_manager(&self) -> &Arc<NodeManager> {
        &self.node_manager
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Register a message handler
    pub async fn register_handler(&self, message_type: &str, handler: Arc<dyn MessageHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.insert(message_type.to_string(), handler);
    }

    /// Route an incoming message
    pub async fn route(&self, from: NodeId, message: NetworkMessage) -> NetworkResult<()> {
        if let Some(request_id) = &message.in_reply_to {
            let waiter = self.pending_responses.write().await.remove(request_id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(message);
                }
                None => debug!(from = %from, request_id = %request_id, "Dropping late reply"),
            }
            return Ok(());
        }

        let reply = match &message.payload {
            MessagePayload::Ping(ping) => Some(MessagePayload::Pong(PongPayload { nonce: ping.nonce })),
            payload => {
                let message_type = payload.message_type();
                let handler = self.handlers.read().await.get(message_type).cloned();
                match handler {
                    Some(handler) => match handler.handle(from.clone(), message.clone()).await {
                        Ok(reply) => reply,
                        Err(e) => {
                            warn!(from = %from, message_type, error = %e, "Handler failed");
                            Some(MessagePayload::nack(None, e.to_string()))
                        }
                    },
                    None => {
                        debug!(from = %from, message_type, "No handler registered");
                        Some(MessagePayload::nack(None, format!("no handler for {}", message_type)))
                    }
                }
            }
        };

        if let Some(payload) = reply {
            let response = NetworkMessage::reply(&message, payload);
            self.transport.send(&from, &response).await?;
        }

        Ok(())
    }

    /// Send a request and wait for its reply
    pub async fn request(
        &self,
        to: &NodeId,
        payload: MessagePayload,
        timeout: Duration,
    ) -> NetworkResult<NetworkMessage> {
        let message = NetworkMessage::new(self.node_manager.node_id.clone(), to.clone(), payload);

        let (tx, rx) = oneshot::channel();
        self.pending_responses
            .write()
            .await
            .insert(message.message_id.clone(), tx);

        if let Err(e) = self.transport.send(to, &message).await {
            self.pending_responses.write().await.remove(&message.message_id);
            self.node_manager.record_failure(to).await;
            return Err(e);
        }

        let outcome = tokio::time::timeout(timeout, rx).await;

        // Cleanup
        self.pending_responses.write().await.remove(&message.message_id);

        match outcome {
            Ok(Ok(reply)) => {
                self.node_manager.record_success(to).await;
                Ok(reply)
            }
            Ok(Err(_)) => Err(NetworkError::ChannelClosed(format!(
                "reply channel for {} dropped",
                message.message_id
            ))),
            Err(_) => {
                self.node_manager.record_failure(to).await;
                Err(NetworkError::Timeout(format!(
                    "no reply from {} within {}ms",
                    to,
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Process the inbox until it closes; every message is routed on its own task
    pub fn spawn(self: Arc<Self>, mut message_rx: mpsc::Receiver<(NodeId, NetworkMessage)>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some((from, message)) = message_rx.recv().await {
                let router = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = router.route(from.clone(), message).await {
                        warn!(from = %from, error = %e, "Error routing message");
                    }
                });
            }
        })
    }
}

#[async_trait]
impl NetworkGateway for MessageRouter {
    fn local_node_id(&self) -> &NodeId {
        &self.node_manager.node_id
    }

    async fn send(
        &self,
        peer_id: &NodeId,
        payload: MessagePayload,
        timeout: Duration,
    ) -> NetworkResult<MessagePayload> {
        self.request(peer_id, payload, timeout)
            .await
            .map(|reply| reply.payload)
    }

    async fn register_handler(&self, message_type: &str, handler: Arc<dyn MessageHandler>) {
        MessageRouter::register_handler(self, message_type, handler).await;
    }

    async fn connected_peers(&self) -> Vec<NodeId> {
        self.node_manager
            .connected_peers()
            .await
            .into_iter()
            .map(|peer| peer.node_id)
            .collect()
    }
}
