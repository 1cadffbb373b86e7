//! End-to-end operation flows on an in-process cluster

mod common;

use async_trait::async_trait;
use std::sync::Arc;

use dx_core::{digest_to_hex, Locator, OperationPayload, OperationStatus, OperationType, PeerResponseStatus, Timestamp};
use dx_engine::commands::audit::{challenge_replica, AuditPayload, AuditVerdict};
use dx_engine::{EngineConfig, EngineStorage, ResponseOutcome};
use dx_network::{
    AckPayload, MessageHandler, MessagePayload, NetworkMessage, NetworkResult, NodeId, PROTOCOL_REQUEST,
};

use common::{dataset, Cluster};

fn locator(s: &str) -> Locator {
    Locator::new(s).unwrap()
}

/// Acks every request with the root the coordinator claimed, storing nothing
struct RubberStamp;

#[async_trait]
impl MessageHandler for RubberStamp {
    async fn handle(&self, _from: NodeId, message: NetworkMessage) -> NetworkResult<Option<MessagePayload>> {
        let reply = match message.payload {
            MessagePayload::ProtocolRequest(request) => MessagePayload::Ack(AckPayload {
                operation_id: Some(request.operation_id),
                merkle_root: request.payload.merkle_root,
                data: None,
            }),
            other => MessagePayload::nack(None, format!("unexpected {}", other.message_type())),
        };
        Ok(Some(reply))
    }
}

#[tokio::test]
async fn test_publish_completes_on_quorum() {
    let cluster = Cluster::start(3, EngineConfig::test()).await;
    let ctx = cluster.ctx();
    let mut events = ctx.registry.subscribe();
    let (leaves, root) = dataset(9);

    let id = ctx
        .create_operation(OperationType::Publish, locator("u1"), OperationPayload::dataset(leaves, root.clone()))
        .await
        .unwrap();
    assert_eq!(ctx.get_status(&id).await.unwrap().status, OperationStatus::InProgress);

    let report = cluster.run_due().await;
    assert_eq!(report.dispatched, 1);

    let view = ctx.get_status(&id).await.unwrap();
    assert_eq!(view.status, OperationStatus::Completed);
    let data = view.data.unwrap();
    assert_eq!(data["merkle_root"], root.as_str());
    assert_eq!(data["replicas"], 3);

    let state = ctx.finality.get_state(&locator("u1")).await.unwrap();
    assert_eq!(state.distinct_ack_count, 3);
    assert!(state.min_acks_reached);

    let summary = ctx.registry.response_summary(&id).await.unwrap();
    assert_eq!(summary.ack, 3);
    assert_eq!(summary.total(), 3);

    for replica in &cluster.replicas {
        assert!(replica.ctx.replica.stored(&locator("u1")).await.is_some());
    }

    // Payload is dropped once terminal
    assert!(ctx.registry.cached(&id).await.is_none());

    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.operation_id, id);
        statuses.push(event.status);
    }
    assert_eq!(
        statuses,
        vec![OperationStatus::Pending, OperationStatus::InProgress, OperationStatus::Completed]
    );
}

#[tokio::test]
async fn test_scenario_duplicate_ack_then_quorum() {
    // No peers connected: responses are fed by hand
    let cluster = Cluster::start(0, EngineConfig::test().with_replication_factor(3)).await;
    let ctx = cluster.ctx();
    let (leaves, root) = dataset(4);
    let id = ctx
        .create_operation(OperationType::Publish, locator("U"), OperationPayload::dataset(leaves, root))
        .await
        .unwrap();

    let mut observed = Vec::new();
    for peer in ["p1", "p2", "p1", "p3"] {
        let outcome = ctx
            .registry
            .append_peer_response(&id, &peer.to_string(), PeerResponseStatus::Ack, None, None)
            .await
            .unwrap();
        match outcome {
            ResponseOutcome::Ack(ack) => observed.push((
                ack.state().distinct_ack_count,
                ack.state().min_acks_reached,
                ack.is_duplicate(),
            )),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    assert_eq!(
        observed,
        vec![(1, false, false), (2, false, false), (2, false, true), (3, true, false)]
    );
    assert_eq!(ctx.get_status(&id).await.unwrap().status, OperationStatus::Completed);
}

#[tokio::test]
async fn test_integrity_failure_despite_quorum() {
    let cluster = Cluster::start(0, EngineConfig::test()).await;
    let ctx = cluster.ctx();
    let (leaves, _) = dataset(5);
    let wrong_root = digest_to_hex(&[9u8; 32]);

    let id = ctx
        .create_operation(OperationType::Publish, locator("U"), OperationPayload::dataset(leaves, wrong_root))
        .await
        .unwrap();
    for peer in ["p1", "p2", "p3"] {
        ctx.registry
            .append_peer_response(&id, &peer.to_string(), PeerResponseStatus::Ack, None, None)
            .await
            .unwrap();
    }

    let state = ctx.finality.get_state(&locator("U")).await.unwrap();
    assert_eq!(state.distinct_ack_count, 3);

    let view = ctx.get_status(&id).await.unwrap();
    assert_eq!(view.status, OperationStatus::Failed);
    assert!(view.error.unwrap().contains("Integrity verification failed"));
}

#[tokio::test]
async fn test_dishonest_replicas_cannot_complete_bad_dataset() {
    let cluster = Cluster::start(3, EngineConfig::test()).await;
    for replica in &cluster.replicas {
        replica.router.register_handler(PROTOCOL_REQUEST, Arc::new(RubberStamp)).await;
    }
    let ctx = cluster.ctx();
    let (leaves, _) = dataset(6);
    let (_, other_root) = dataset(7);

    let id = ctx
        .create_operation(OperationType::Publish, locator("u2"), OperationPayload::dataset(leaves, other_root))
        .await
        .unwrap();
    cluster.run_due().await;

    let view = ctx.get_status(&id).await.unwrap();
    assert_eq!(view.status, OperationStatus::Failed);
    assert_eq!(ctx.registry.response_summary(&id).await.unwrap().ack, 3);
}

#[tokio::test]
async fn test_honest_replicas_nack_bad_root() {
    let cluster = Cluster::start(3, EngineConfig::test()).await;
    let ctx = cluster.ctx();
    let (leaves, _) = dataset(6);
    let (_, other_root) = dataset(7);

    let id = ctx
        .create_operation(OperationType::Publish, locator("u3"), OperationPayload::dataset(leaves, other_root))
        .await
        .unwrap();
    cluster.run_due().await;

    let view = ctx.get_status(&id).await.unwrap();
    assert_eq!(view.status, OperationStatus::Failed);
    assert!(view.error.unwrap().contains("quorum not reached"));

    let summary = ctx.registry.response_summary(&id).await.unwrap();
    assert_eq!(summary.nack, 3);
    assert_eq!(summary.ack, 0);
}

#[tokio::test]
async fn test_leftover_peers_form_next_batch() {
    let config = EngineConfig::test().with_replication_factor(2);
    let cluster = Cluster::start(4, config).await;
    // The first batch (replica-1, replica-2) refuses everything
    for replica in &cluster.replicas[..2] {
        replica.router.register_handler(PROTOCOL_REQUEST, Arc::new(Refuser)).await;
    }
    let ctx = cluster.ctx();
    let (leaves, root) = dataset(3);

    let id = ctx
        .create_operation(OperationType::Publish, locator("u4"), OperationPayload::dataset(leaves, root))
        .await
        .unwrap();

    cluster.run_due().await;
    assert_eq!(ctx.get_status(&id).await.unwrap().status, OperationStatus::InProgress);

    let commands = ctx.scheduler.commands_for_operation(&id).await.unwrap();
    let follow_up = commands
        .iter()
        .find(|command| command.parent_id.is_some())
        .expect("follow-up scheduled");
    assert!(follow_up.is_blocking);

    cluster.run_due().await;
    assert_eq!(ctx.get_status(&id).await.unwrap().status, OperationStatus::Completed);

    let summary = ctx.registry.response_summary(&id).await.unwrap();
    assert_eq!(summary.nack, 2);
    assert_eq!(summary.ack, 2);
}

struct Refuser;

#[async_trait]
impl MessageHandler for Refuser {
    async fn handle(&self, _from: NodeId, _message: NetworkMessage) -> NetworkResult<Option<MessagePayload>> {
        Ok(Some(MessagePayload::nack(None, "disk full")))
    }
}

#[tokio::test]
async fn test_operation_timeout_fails_open_operation() {
    let mut config = EngineConfig::test();
    config.operation_timeout_ms = 50;
    let cluster = Cluster::start(0, config).await;
    let ctx = cluster.ctx();
    let (leaves, root) = dataset(2);

    let id = ctx
        .create_operation(OperationType::Publish, locator("u5"), OperationPayload::dataset(leaves, root))
        .await
        .unwrap();

    cluster.run_due_at(Timestamp::now().plus_millis(1_000)).await;

    let view = ctx.get_status(&id).await.unwrap();
    assert_eq!(view.status, OperationStatus::Failed);
    assert!(view.error.unwrap().contains("timed out"));

    // The pending fan-out is skipped now that the operation ended
    cluster.run_due_at(Timestamp::now().plus_millis(60_000)).await;
    let commands = ctx.scheduler.commands_for_operation(&id).await.unwrap();
    assert!(commands.iter().all(|command| command.status.is_terminal()));
}

#[tokio::test]
async fn test_cancelled_operation_skips_fan_out() {
    let cluster = Cluster::start(3, EngineConfig::test()).await;
    let ctx = cluster.ctx();
    let (leaves, root) = dataset(3);
    let mut events = ctx.registry.subscribe();

    let id = ctx
        .create_operation(OperationType::Update, locator("u-cancel"), OperationPayload::dataset(leaves, root))
        .await
        .unwrap();
    assert_eq!(ctx.registry.cancel_operation(&id).await.unwrap(), OperationStatus::Failed);

    let report = cluster.run_due().await;
    assert_eq!(report.dispatched, 0);
    assert_eq!(report.skipped, 1);

    let view = ctx.get_status(&id).await.unwrap();
    assert_eq!(view.error.as_deref(), Some("cancelled"));
    assert!(ctx.registry.responses(&id).await.unwrap().is_empty());
    assert!(ctx.registry.cached(&id).await.is_none());

    let statuses: Vec<OperationStatus> = std::iter::from_fn(|| events.try_recv().ok())
        .map(|event| event.status)
        .collect();
    assert_eq!(
        statuses,
        vec![OperationStatus::Pending, OperationStatus::InProgress, OperationStatus::Failed]
    );

    // Cancelling twice changes nothing
    assert_eq!(ctx.registry.cancel_operation(&id).await.unwrap(), OperationStatus::Failed);
}

#[tokio::test]
async fn test_late_response_is_logged_but_ignored() {
    let cluster = Cluster::start(3, EngineConfig::test()).await;
    let ctx = cluster.ctx();
    let (leaves, root) = dataset(3);
    let id = ctx
        .create_operation(OperationType::Publish, locator("u6"), OperationPayload::dataset(leaves, root))
        .await
        .unwrap();
    cluster.run_due().await;
    assert_eq!(ctx.get_status(&id).await.unwrap().status, OperationStatus::Completed);

    let outcome = ctx
        .registry
        .append_peer_response(
            &id,
            &"straggler".to_string(),
            PeerResponseStatus::Nack,
            Some("too late".into()),
            None,
        )
        .await
        .unwrap();
    assert_eq!(outcome, ResponseOutcome::Late(OperationStatus::Completed));
    assert_eq!(ctx.get_status(&id).await.unwrap().status, OperationStatus::Completed);
    assert_eq!(ctx.registry.responses(&id).await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_get_after_publish_returns_verified_leaves() {
    let cluster = Cluster::start(3, EngineConfig::test()).await;
    let ctx = cluster.ctx();
    let (leaves, root) = dataset(5);

    let publish = ctx
        .create_operation(OperationType::Publish, locator("u7"), OperationPayload::dataset(leaves.clone(), root.clone()))
        .await
        .unwrap();
    cluster.run_due().await;
    assert_eq!(ctx.get_status(&publish).await.unwrap().status, OperationStatus::Completed);

    let get = ctx
        .create_operation(OperationType::Get, locator("u7"), OperationPayload::default().with_merkle_root(root))
        .await
        .unwrap();
    cluster.run_due().await;

    let view = ctx.get_status(&get).await.unwrap();
    assert_eq!(view.status, OperationStatus::Completed);
    assert_eq!(view.data.unwrap(), serde_json::json!(leaves));
}

#[tokio::test]
async fn test_ask_and_search_after_publish() {
    let cluster = Cluster::start(3, EngineConfig::test()).await;
    let ctx = cluster.ctx();
    let (leaves, root) = dataset(5);

    let publish = ctx
        .create_operation(OperationType::Publish, locator("u9"), OperationPayload::dataset(leaves.clone(), root.clone()))
        .await
        .unwrap();
    cluster.run_due().await;
    assert_eq!(ctx.get_status(&publish).await.unwrap().status, OperationStatus::Completed);

    let ask = ctx
        .create_operation(OperationType::Ask, locator("u9"), OperationPayload::default().with_merkle_root(root.clone()))
        .await
        .unwrap();
    let search = ctx
        .create_operation(
            OperationType::Search,
            locator("u9"),
            OperationPayload::query("<urn:asset:3>").with_merkle_root(root),
        )
        .await
        .unwrap();
    let unrooted = ctx
        .create_operation(OperationType::Search, locator("u9"), OperationPayload::query("urn:p:value"))
        .await
        .unwrap();
    cluster.run_due().await;

    let view = ctx.get_status(&ask).await.unwrap();
    assert_eq!(view.status, OperationStatus::Completed);
    assert_eq!(view.data.unwrap(), serde_json::json!({ "known": true, "leaf_count": 5 }));

    let expected: Vec<&String> = leaves.iter().filter(|leaf| leaf.contains("<urn:asset:3>")).collect();
    assert_eq!(expected.len(), 1);
    let view = ctx.get_status(&search).await.unwrap();
    assert_eq!(view.status, OperationStatus::Completed);
    assert_eq!(view.data.unwrap(), serde_json::json!(expected));

    let view = ctx.get_status(&unrooted).await.unwrap();
    assert_eq!(view.status, OperationStatus::Completed);
    assert_eq!(view.data.unwrap(), serde_json::json!(leaves));
}

#[tokio::test]
async fn test_search_under_other_root_is_refused() {
    let cluster = Cluster::start(3, EngineConfig::test()).await;
    let ctx = cluster.ctx();
    let (leaves, root) = dataset(4);
    let (_, other_root) = dataset(6);

    ctx.create_operation(OperationType::Publish, locator("u10"), OperationPayload::dataset(leaves, root))
        .await
        .unwrap();
    cluster.run_due().await;

    let search = ctx
        .create_operation(
            OperationType::Search,
            locator("u10"),
            OperationPayload::query("urn").with_merkle_root(other_root),
        )
        .await
        .unwrap();
    cluster.run_due().await;

    let view = ctx.get_status(&search).await.unwrap();
    assert_eq!(view.status, OperationStatus::Failed);
    assert_eq!(ctx.registry.response_summary(&search).await.unwrap().nack, 3);
}

#[tokio::test]
async fn test_get_of_unknown_locator_fails() {
    let cluster = Cluster::start(2, EngineConfig::test().with_replication_factor(2)).await;
    let ctx = cluster.ctx();

    let id = ctx
        .create_operation(OperationType::Get, locator("missing"), OperationPayload::default())
        .await
        .unwrap();
    cluster.run_due().await;

    let view = ctx.get_status(&id).await.unwrap();
    assert_eq!(view.status, OperationStatus::Failed);
    assert_eq!(ctx.registry.response_summary(&id).await.unwrap().nack, 2);
}

#[tokio::test]
async fn test_unknown_operation_is_not_found() {
    let cluster = Cluster::start(0, EngineConfig::test()).await;
    let err = cluster
        .ctx()
        .get_status(&dx_core::OperationId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, dx_engine::EngineError::OperationNotFound(_)));
}

#[tokio::test]
async fn test_replica_audit_detects_tampering() {
    let cluster = Cluster::start(3, EngineConfig::test()).await;
    let ctx = cluster.ctx();
    let (leaves, root) = dataset(6);
    let id = ctx
        .create_operation(OperationType::Publish, locator("u8"), OperationPayload::dataset(leaves.clone(), root.clone()))
        .await
        .unwrap();
    cluster.run_due().await;
    assert_eq!(ctx.get_status(&id).await.unwrap().status, OperationStatus::Completed);

    let payload = AuditPayload {
        locator: locator("u8"),
        merkle_root: root.clone(),
        leaf_count: leaves.len(),
    };
    let verdict = challenge_replica(ctx, &payload, &"replica-1".to_string(), 4).await.unwrap();
    assert_eq!(
        verdict,
        AuditVerdict::Passed {
            peer_id: "replica-1".to_string(),
            leaf_index: 4
        }
    );

    // Replica 2 drops the data
    assert!(cluster.replicas[1].ctx.replica.evict(&locator("u8")).await);
    let verdict = challenge_replica(ctx, &payload, &"replica-2".to_string(), 1).await.unwrap();
    assert!(matches!(verdict, AuditVerdict::Failed { .. }));
}

#[tokio::test]
async fn test_audit_scheduled_after_completion() {
    let mut config = EngineConfig::test();
    config.replica_audit_interval_ms = Some(1_000);
    let cluster = Cluster::start(3, config).await;
    let ctx = cluster.ctx();
    let (leaves, root) = dataset(4);
    ctx.create_operation(OperationType::Publish, locator("u9"), OperationPayload::dataset(leaves, root))
        .await
        .unwrap();
    cluster.run_due().await;

    let audits = ctx
        .storage
        .list_commands_by_status(&[dx_core::CommandStatus::Scheduled])
        .await
        .unwrap()
        .into_iter()
        .filter(|command| command.name == dx_engine::commands::audit::NAME)
        .count();
    assert_eq!(audits, 1);

    let report = cluster.run_due_at(Timestamp::now().plus_millis(2_000)).await;
    assert!(report.dispatched >= 1);
    let repeating = ctx
        .storage
        .list_commands_by_status(&[dx_core::CommandStatus::Repeating])
        .await
        .unwrap();
    assert!(repeating
        .iter()
        .any(|command| command.name == dx_engine::commands::audit::NAME));
}
