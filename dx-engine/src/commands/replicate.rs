//! Operation fan-out
//!
//! Sends the operation's request to a batch of peers concurrently and feeds
//! every reply into the registry as it arrives. Peers beyond the first
//! batch are kept as leftovers and tried by a follow-up command when the
//! batch was not enough.
//!
//! Read operations go through the same fan-out; their first ACK completes
//! them. A read carrying a merkle root only accepts replicas reporting it.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

use dx_core::{Command, CommandPriority, OperationId, PeerId, PeerResponseStatus};
use dx_network::{MessagePayload, NetworkError, ProtocolRequestPayload};

use crate::context::NodeContext;
use crate::error::{EngineError, EngineResult};
use crate::scheduler::{CommandHandler, CommandOutcome};

pub const NAME: &str = "replicate";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicatePayload {
    pub operation_id: OperationId,
    /// Peers of this run; resolved from the gateway when absent
    #[serde(default)]
    pub batch: Option<Vec<PeerId>>,
    /// Peers reserved for later batches
    #[serde(default)]
    pub leftover: Vec<PeerId>,
}

/// First fan-out of an operation
pub fn command(operation_id: OperationId, retries: u32) -> Command {
    Command::new(NAME, json!({ "operation_id": operation_id }))
        .blocking()
        .owned_by(operation_id)
        .with_retries(retries)
        .with_priority(CommandPriority::High)
}

fn follow_up(operation_id: OperationId, batch: Vec<PeerId>, leftover: Vec<PeerId>, retries: u32) -> Command {
    Command::new(
        NAME,
        json!({ "operation_id": operation_id, "batch": batch, "leftover": leftover }),
    )
    .blocking()
    .owned_by(operation_id)
    .with_retries(retries)
    .with_priority(CommandPriority::High)
}

/// Split `peers` into the next batch of at most `size` and the rest
fn next_batch(mut peers: Vec<PeerId>, size: usize) -> (Vec<PeerId>, Vec<PeerId>) {
    let rest = peers.split_off(size.min(peers.len()));
    (peers, rest)
}

/// Per-batch tallies
#[derive(Debug, Default)]
struct BatchTally {
    answered: usize,
    timed_out: usize,
    busy: usize,
}

pub struct ReplicateHandler;

#[async_trait]
impl CommandHandler for ReplicateHandler {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn execute(&self, ctx: &NodeContext, command: &Command) -> EngineResult<CommandOutcome> {
        let payload: ReplicatePayload = super::parse_payload(command)?;
        let operation_id = payload.operation_id;

        let operation = ctx.registry.get_operation(&operation_id).await?;
        if operation.status.is_terminal() {
            return Ok(CommandOutcome::done());
        }
        let cached = ctx
            .registry
            .cached(&operation_id)
            .await
            .ok_or_else(|| EngineError::integrity(operation_id, "cached payload unavailable"))?;

        let batch_size = ctx.config.replication_factor as usize;
        let (batch, leftover) = match payload.batch {
            Some(batch) => (batch, payload.leftover),
            None => {
                let local = ctx.gateway.local_node_id().clone();
                let peers: Vec<PeerId> = ctx
                    .gateway
                    .connected_peers()
                    .await
                    .into_iter()
                    .filter(|peer| *peer != local)
                    .collect();
                if peers.is_empty() {
                    return Err(EngineError::NoPeersAvailable(format!(
                        "operation {} has no connected peers",
                        operation_id
                    )));
                }
                next_batch(peers, batch_size)
            }
        };

        debug!(
            operation_id = %operation_id,
            batch = batch.len(),
            leftover = leftover.len(),
            "Fanning out operation"
        );

        let request = MessagePayload::ProtocolRequest(ProtocolRequestPayload {
            operation_id,
            operation_type: operation.operation_type,
            locator: operation.locator.clone(),
            payload: cached.payload.clone(),
        });
        let timeout = Duration::from_millis(ctx.config.network_request_timeout_ms);
        let claimed_root = cached.payload.merkle_root.clone();
        let check_root = operation.operation_type.requires_replication() || claimed_root.is_some();

        let mut replies: FuturesUnordered<_> = batch
            .iter()
            .map(|peer| {
                let gateway = ctx.gateway.clone();
                let request = request.clone();
                let peer = peer.clone();
                async move {
                    let reply = gateway.send(&peer, request, timeout).await;
                    (peer, reply)
                }
            })
            .collect();

        let mut tally = BatchTally::default();
        while let Some((peer, reply)) = replies.next().await {
            match &reply {
                Ok(_) => tally.answered += 1,
                Err(e) if e.is_timeout() => tally.timed_out += 1,
                Err(_) => {}
            }

            let (status, message, data) = classify(reply, check_root, claimed_root.as_deref());
            if status == PeerResponseStatus::Busy {
                tally.busy += 1;
            }
            ctx.registry
                .append_peer_response(&operation_id, &peer, status, message, data)
                .await?;
        }

        let operation = ctx.registry.get_operation(&operation_id).await?;
        if operation.status.is_terminal() {
            return Ok(CommandOutcome::done());
        }

        if !leftover.is_empty() {
            let (next, rest) = next_batch(leftover, batch_size);
            info!(
                operation_id = %operation_id,
                next = next.len(),
                remaining = rest.len(),
                "Batch did not settle the operation, trying more peers"
            );
            return Ok(CommandOutcome::then(vec![follow_up(
                operation_id,
                next,
                rest,
                ctx.config.command_retry_max,
            )]));
        }

        if tally.answered == 0 {
            if tally.timed_out == batch.len() {
                return Err(EngineError::NetworkTimeout(format!(
                    "no peer of {} answered operation {}",
                    batch.len(),
                    operation_id
                )));
            }
            return Err(EngineError::Network(format!(
                "no peer reachable for operation {}",
                operation_id
            )));
        }
        if tally.busy > 0 {
            return Err(EngineError::CommandExecution(format!(
                "{} peers busy for operation {}",
                tally.busy, operation_id
            )));
        }

        let reason = if check_root {
            let state = ctx.finality.get_state(&operation.locator).await?;
            format!(
                "replication quorum not reached: {}/{} acks",
                state.distinct_ack_count,
                ctx.finality.replication_factor()
            )
        } else {
            "no peer could serve the request".to_string()
        };
        ctx.registry.fail_operation(&operation_id, reason).await?;
        Ok(CommandOutcome::done())
    }

    /// Out of retries: the operation cannot finish
    async fn recover(&self, ctx: &NodeContext, command: &Command, error: &EngineError) -> EngineResult<()> {
        let operation_id = match super::parse_payload::<ReplicatePayload>(command) {
            Ok(payload) => payload.operation_id,
            Err(_) => match command.owner_operation_id {
                Some(operation_id) => operation_id,
                None => return Ok(()),
            },
        };
        ctx.registry
            .fail_operation(&operation_id, format!("replication failed: {}", error))
            .await?;
        Ok(())
    }
}

/// Map a peer reply to a response record
fn classify(
    reply: Result<MessagePayload, NetworkError>,
    check_root: bool,
    claimed_root: Option<&str>,
) -> (PeerResponseStatus, Option<String>, Option<serde_json::Value>) {
    match reply {
        Ok(MessagePayload::Ack(ack)) => {
            if check_root && ack.merkle_root.as_deref() != claimed_root {
                let reported = ack.merkle_root.unwrap_or_else(|| "none".to_string());
                warn!(reported = %reported, "Replica reported a different merkle root");
                return (
                    PeerResponseStatus::Nack,
                    Some(format!("replica root mismatch: {}", reported)),
                    None,
                );
            }
            (PeerResponseStatus::Ack, None, ack.data)
        }
        Ok(MessagePayload::Nack(nack)) => (PeerResponseStatus::Nack, Some(nack.reason), None),
        Ok(MessagePayload::Busy(busy)) => (
            PeerResponseStatus::Busy,
            busy.retry_after_ms.map(|ms| format!("retry after {}ms", ms)),
            None,
        ),
        Ok(other) => (
            PeerResponseStatus::Failed,
            Some(format!("unexpected reply {}", other.message_type())),
            None,
        ),
        Err(e) => (PeerResponseStatus::Failed, Some(e.to_string()), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dx_network::{AckPayload, BusyPayload};

    #[test]
    fn test_next_batch() {
        let peers: Vec<PeerId> = (1..=5).map(|i| format!("p{}", i)).collect();
        let (batch, rest) = next_batch(peers.clone(), 3);
        assert_eq!(batch, vec!["p1", "p2", "p3"]);
        assert_eq!(rest, vec!["p4", "p5"]);

        let (batch, rest) = next_batch(peers, 9);
        assert_eq!(batch.len(), 5);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_classify_root_mismatch_is_nack() {
        let ack = |root: &str| {
            Ok(MessagePayload::Ack(AckPayload {
                merkle_root: Some(root.to_string()),
                ..AckPayload::default()
            }))
        };

        let (status, _, _) = classify(ack("aa"), true, Some("aa"));
        assert_eq!(status, PeerResponseStatus::Ack);

        let (status, message, _) = classify(ack("bb"), true, Some("aa"));
        assert_eq!(status, PeerResponseStatus::Nack);
        assert!(message.unwrap().contains("root mismatch"));

        // Reads without a claimed root do not compare roots
        let (status, _, _) = classify(ack("bb"), false, None);
        assert_eq!(status, PeerResponseStatus::Ack);
    }

    #[test]
    fn test_classify_other_replies() {
        let busy = Ok(MessagePayload::Busy(BusyPayload {
            operation_id: None,
            retry_after_ms: Some(50),
        }));
        assert_eq!(classify(busy, true, None).0, PeerResponseStatus::Busy);

        let timeout = Err(NetworkError::Timeout("p1".into()));
        let (status, message, _) = classify(timeout, true, None);
        assert_eq!(status, PeerResponseStatus::Failed);
        assert!(message.is_some());

        let nack = Ok(MessagePayload::nack(None, "full"));
        assert_eq!(classify(nack, true, None).1.as_deref(), Some("full"));
    }

    #[test]
    fn test_command_shape() {
        let operation_id = OperationId::new();
        let command = command(operation_id, 3);
        assert!(command.is_blocking);
        assert_eq!(command.retries_left, 3);
        assert_eq!(command.owner_operation_id, Some(operation_id));

        let payload: ReplicatePayload = serde_json::from_value(command.payload).unwrap();
        assert_eq!(payload.operation_id, operation_id);
        assert!(payload.batch.is_none());
    }
}
