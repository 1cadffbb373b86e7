//! Random-challenge replica audits
//!
//! A repeating command created after a publish completes. Each run picks
//! one peer that acked the locator and one random leaf, asks the peer for
//! that leaf with its inclusion proof and checks the proof against the
//! committed root.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use dx_core::merkle::hash_leaf;
use dx_core::{digest_from_hex, Command, CommandPriority, Locator, PeerId};
use dx_network::{ChallengePayload, MessagePayload};

use crate::context::NodeContext;
use crate::error::EngineResult;
use crate::scheduler::{CommandHandler, CommandOutcome};

pub const NAME: &str = "replica_audit";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditPayload {
    pub locator: Locator,
    pub merkle_root: String,
    pub leaf_count: usize,
}

/// Repeating audit of `locator`, first run one interval from now
pub fn command(locator: Locator, merkle_root: String, leaf_count: usize, interval_ms: u64) -> Command {
    Command::new(
        NAME,
        json!({ "locator": locator, "merkle_root": merkle_root, "leaf_count": leaf_count }),
    )
    .with_period(interval_ms)
    .with_delay(interval_ms)
    .with_priority(CommandPriority::Low)
}

/// Result of challenging one replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditVerdict {
    Passed { peer_id: PeerId, leaf_index: usize },
    Failed { peer_id: PeerId, leaf_index: usize, reason: String },
    /// Nobody acked the locator yet
    NoReplicas,
}

/// Challenge `peer_id` for leaf `leaf_index` of `payload.locator`
pub async fn challenge_replica(
    ctx: &NodeContext,
    payload: &AuditPayload,
    peer_id: &PeerId,
    leaf_index: usize,
) -> EngineResult<AuditVerdict> {
    let root = digest_from_hex(&payload.merkle_root)?;
    let timeout = Duration::from_millis(ctx.config.network_request_timeout_ms);
    let request = MessagePayload::Challenge(ChallengePayload {
        locator: payload.locator.clone(),
        leaf_index,
    });

    let failed = |reason: String| AuditVerdict::Failed {
        peer_id: peer_id.clone(),
        leaf_index,
        reason,
    };

    let verdict = match ctx.gateway.send(peer_id, request, timeout).await {
        Ok(MessagePayload::ChallengeResponse(response)) => {
            let leaf_hash = hash_leaf(leaf_index, response.leaf.as_bytes());
            if response.locator != payload.locator || response.leaf_index != leaf_index {
                failed("response does not match the challenge".to_string())
            } else if ctx.verifier.verify(&root, &response.proof, &leaf_hash, leaf_index) {
                AuditVerdict::Passed {
                    peer_id: peer_id.clone(),
                    leaf_index,
                }
            } else {
                failed("inclusion proof rejected".to_string())
            }
        }
        Ok(MessagePayload::Nack(nack)) => failed(nack.reason),
        Ok(other) => failed(format!("unexpected reply {}", other.message_type())),
        Err(e) => failed(e.to_string()),
    };
    Ok(verdict)
}

pub struct ReplicaAuditHandler;

impl ReplicaAuditHandler {
    /// Pick a random acked peer and leaf, then challenge it
    pub async fn audit(&self, ctx: &NodeContext, payload: &AuditPayload) -> EngineResult<AuditVerdict> {
        let acks = ctx.finality.acks(&payload.locator).await?;
        let target = {
            let mut rng = rand::thread_rng();
            acks.choose(&mut rng)
                .map(|ack| (ack.peer_id.clone(), rng.gen_range(0..payload.leaf_count.max(1))))
        };

        match target {
            Some((peer_id, leaf_index)) => challenge_replica(ctx, payload, &peer_id, leaf_index).await,
            None => Ok(AuditVerdict::NoReplicas),
        }
    }
}

#[async_trait]
impl CommandHandler for ReplicaAuditHandler {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn execute(&self, ctx: &NodeContext, command: &Command) -> EngineResult<CommandOutcome> {
        let payload: AuditPayload = super::parse_payload(command)?;

        match self.audit(ctx, &payload).await? {
            AuditVerdict::Passed { peer_id, leaf_index } => {
                debug!(locator = %payload.locator, peer_id = %peer_id, leaf_index, "Replica audit passed");
            }
            AuditVerdict::Failed {
                peer_id,
                leaf_index,
                reason,
            } => {
                warn!(
                    locator = %payload.locator,
                    peer_id = %peer_id,
                    leaf_index,
                    error = %reason,
                    "Replica audit failed"
                );
            }
            AuditVerdict::NoReplicas => {
                debug!(locator = %payload.locator, "No replicas to audit");
            }
        }
        Ok(CommandOutcome::Repeat)
    }
}
