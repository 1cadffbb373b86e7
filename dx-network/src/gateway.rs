//! The contract the engine depends on

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::NetworkResult;
use crate::message::{MessagePayload, NodeId};
use crate::router::MessageHandler;

/// Request/response access to peers.
///
/// The message type of a request is the payload variant
/// ([`MessagePayload::message_type`]).
#[async_trait]
pub trait NetworkGateway: Send + Sync {
    /// Id of this node
    fn local_node_id(&self) -> &NodeId;

    /// Send `payload` to `peer_id` and wait up to `timeout` for its reply
    async fn send(
        &self,
        peer_id: &NodeId,
        payload: MessagePayload,
        timeout: Duration,
    ) -> NetworkResult<MessagePayload>;

    /// Serve incoming requests of `message_type` with `handler`
    async fn register_handler(&self, message_type: &str, handler: Arc<dyn MessageHandler>);

    /// Peers currently reachable, in a stable order
    async fn connected_peers(&self) -> Vec<NodeId>;
}
