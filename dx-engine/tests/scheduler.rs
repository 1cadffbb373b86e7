//! Command scheduler behavior

mod common;

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dx_core::{Command, CommandPriority, CommandStatus, Locator, Operation, OperationId, OperationStatus, OperationType, Timestamp};
use dx_engine::{
    CommandHandler, CommandOutcome, EngineConfig, EngineError, EngineResult, EngineStorage, NodeContext, OperationUpdate,
};
use dx_network::MemoryNetwork;

use common::{spawn_node_with, NodeOptions, TestNode};

const HOUR_MS: u64 = 3_600_000;

/// Fails every time with a configurable error
struct Failing {
    name: &'static str,
    retryable: bool,
    runs: AtomicUsize,
    recovered: AtomicUsize,
}

impl Failing {
    fn new(name: &'static str, retryable: bool) -> Arc<Self> {
        Arc::new(Self {
            name,
            retryable,
            runs: AtomicUsize::new(0),
            recovered: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl CommandHandler for Failing {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn execute(&self, _ctx: &NodeContext, _command: &Command) -> EngineResult<CommandOutcome> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.retryable {
            Err(EngineError::CommandExecution("peer refused".into()))
        } else {
            Err(EngineError::InvalidPayload("bad input".into()))
        }
    }

    async fn recover(&self, _ctx: &NodeContext, _command: &Command, _error: &EngineError) -> EngineResult<()> {
        self.recovered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Takes a while, then fails retryably
struct Slow {
    sleep_ms: u64,
}

#[async_trait]
impl CommandHandler for Slow {
    fn name(&self) -> &'static str {
        "slow"
    }

    async fn execute(&self, _ctx: &NodeContext, _command: &Command) -> EngineResult<CommandOutcome> {
        tokio::time::sleep(Duration::from_millis(self.sleep_ms)).await;
        Err(EngineError::CommandExecution("gave up".into()))
    }
}

/// Fails for good and panics while recovering
struct PanickingRecovery;

#[async_trait]
impl CommandHandler for PanickingRecovery {
    fn name(&self) -> &'static str {
        "panicking_recovery"
    }

    async fn execute(&self, _ctx: &NodeContext, _command: &Command) -> EngineResult<CommandOutcome> {
        Err(EngineError::InvalidPayload("unusable".into()))
    }

    async fn recover(&self, _ctx: &NodeContext, _command: &Command, _error: &EngineError) -> EngineResult<()> {
        panic!("recovery blew up");
    }
}

/// Records start/end of every run and sleeps in between
struct Recording {
    events: Mutex<Vec<String>>,
    expired: AtomicUsize,
}

impl Recording {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            expired: AtomicUsize::new(0),
        })
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandHandler for Recording {
    fn name(&self) -> &'static str {
        "record"
    }

    async fn execute(&self, _ctx: &NodeContext, command: &Command) -> EngineResult<CommandOutcome> {
        let label = command.payload["label"].as_str().unwrap_or("?").to_string();
        self.events.lock().unwrap().push(format!("start {}", label));
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.events.lock().unwrap().push(format!("end {}", label));

        match command.payload.get("child") {
            Some(child) => Ok(CommandOutcome::then(vec![Command::new("record", json!({ "label": child }))])),
            None => Ok(CommandOutcome::done()),
        }
    }

    async fn expired(&self, _ctx: &NodeContext, _command: &Command) -> EngineResult<()> {
        self.expired.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn node(config: EngineConfig, handlers: Vec<Arc<dyn CommandHandler>>) -> TestNode {
    let network = MemoryNetwork::default();
    spawn_node_with(
        &network,
        "solo",
        config,
        NodeOptions {
            storage: None,
            handlers,
        },
    )
    .await
}

fn record(label: &str) -> Command {
    Command::new("record", json!({ "label": label }))
}

#[tokio::test]
async fn test_retry_exhaustion_runs_n_plus_one_times() {
    let handler = Failing::new("flaky", true);
    let node = node(EngineConfig::test(), vec![handler.clone()]).await;
    let ctx = &node.ctx;

    let id = ctx
        .scheduler
        .schedule(Command::new("flaky", json!({})).with_retries(3))
        .await
        .unwrap();

    let mut now = Timestamp::now();
    for _ in 0..10 {
        ctx.scheduler.run_due(ctx, now).await.unwrap();
        if ctx.scheduler.get_command(&id).await.unwrap().status.is_terminal() {
            break;
        }
        now = now.plus_millis(HOUR_MS);
    }

    let command = ctx.scheduler.get_command(&id).await.unwrap();
    assert_eq!(command.status, CommandStatus::Failed);
    assert_eq!(handler.runs.load(Ordering::SeqCst), 4);
    assert_eq!(command.attempts, 4);
    assert_eq!(command.retries_left, 0);
    assert!(command.last_error.unwrap().contains("peer refused"));
    assert_eq!(handler.recovered.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_retry_waits_for_backoff() {
    let handler = Failing::new("flaky", true);
    let mut config = EngineConfig::test();
    config.backoff = dx_engine::BackoffStrategy::Fixed { delay_ms: HOUR_MS };
    let node = node(config, vec![handler.clone()]).await;
    let ctx = &node.ctx;

    let id = ctx
        .scheduler
        .schedule(Command::new("flaky", json!({})).with_retries(1))
        .await
        .unwrap();
    let now = Timestamp::now();

    ctx.scheduler.run_due(ctx, now).await.unwrap();
    let command = ctx.scheduler.get_command(&id).await.unwrap();
    assert_eq!(command.status, CommandStatus::Scheduled);
    assert!(command.due_at >= now.plus_millis(HOUR_MS));
    assert!(command.due_at < now.plus_millis(HOUR_MS + 60_000));

    // Not due yet
    let report = ctx.scheduler.run_due(ctx, now.plus_millis(1_000)).await.unwrap();
    assert_eq!(report.dispatched, 0);
    assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_retry_delay_counts_from_completion() {
    let mut config = EngineConfig::test();
    config.backoff = dx_engine::BackoffStrategy::Fixed { delay_ms: 100 };
    let node = node(config, vec![Arc::new(Slow { sleep_ms: 250 })]).await;
    let ctx = &node.ctx;

    let id = ctx
        .scheduler
        .schedule(Command::new("slow", json!({})).with_retries(2))
        .await
        .unwrap();
    let now = Timestamp::now();

    ctx.scheduler.run_due(ctx, now).await.unwrap();
    let command = ctx.scheduler.get_command(&id).await.unwrap();
    assert_eq!(command.status, CommandStatus::Scheduled);
    assert!(command.due_at >= now.plus_millis(350));

    // Due time relative to dispatch has passed, the backoff has not
    let report = ctx.scheduler.run_due(ctx, now.plus_millis(300)).await.unwrap();
    assert_eq!(report.dispatched, 0);
}

#[tokio::test]
async fn test_panicking_recovery_releases_command() {
    let node = node(EngineConfig::test(), vec![Arc::new(PanickingRecovery)]).await;
    let ctx = &node.ctx;

    let id = ctx
        .scheduler
        .schedule(Command::new("panicking_recovery", json!({})))
        .await
        .unwrap();
    ctx.scheduler.run_due(ctx, Timestamp::now()).await.unwrap();

    let command = ctx.scheduler.get_command(&id).await.unwrap();
    assert_eq!(command.status, CommandStatus::Failed);
    assert!(command.last_error.unwrap().contains("unusable"));
    assert_eq!(ctx.scheduler.in_flight_count(), 0);

    // The scheduler keeps dispatching afterwards
    let next = ctx
        .scheduler
        .schedule(Command::new("panicking_recovery", json!({})))
        .await
        .unwrap();
    let report = ctx.scheduler.run_due(ctx, Timestamp::now()).await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(ctx.scheduler.get_command(&next).await.unwrap().status, CommandStatus::Failed);
    assert_eq!(ctx.scheduler.in_flight_count(), 0);
}

#[tokio::test]
async fn test_non_retryable_error_fails_immediately() {
    let handler = Failing::new("broken", false);
    let node = node(EngineConfig::test(), vec![handler.clone()]).await;
    let ctx = &node.ctx;

    let id = ctx
        .scheduler
        .schedule(Command::new("broken", json!({})).with_retries(5))
        .await
        .unwrap();
    ctx.scheduler.run_due(ctx, Timestamp::now()).await.unwrap();

    let command = ctx.scheduler.get_command(&id).await.unwrap();
    assert_eq!(command.status, CommandStatus::Failed);
    assert_eq!(command.retries_left, 5);
    assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
    assert_eq!(handler.recovered.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unknown_command_fails_fast() {
    let node = node(EngineConfig::test(), vec![]).await;
    let ctx = &node.ctx;

    let err = ctx
        .scheduler
        .schedule(Command::new("no_such_handler", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownCommandHandler(_)));

    let failed = ctx
        .storage
        .list_commands_by_status(&[CommandStatus::Failed])
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].name, "no_such_handler");
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_blocking_commands_run_in_creation_order() {
    let handler = Recording::new();
    let node = node(EngineConfig::test(), vec![handler.clone()]).await;
    let ctx = &node.ctx;
    let owner = OperationId::new();

    let a = record("a").blocking().owned_by(owner);
    let mut b = record("b").blocking().owned_by(owner).with_priority(CommandPriority::Critical);
    b.created_at = a.created_at.plus_millis(1);
    let a_id = ctx.scheduler.schedule(a).await.unwrap();
    let b_id = ctx.scheduler.schedule(b).await.unwrap();

    // B has the higher priority but was created later
    let first = ctx.scheduler.tick(ctx).await.unwrap();
    assert_eq!(first.dispatched, 1);
    assert_eq!(first.blocked, 1);

    // A is still running
    let second = ctx.scheduler.tick(ctx).await.unwrap();
    assert_eq!(second.dispatched, 0);
    assert_eq!(
        ctx.scheduler.get_command(&b_id).await.unwrap().status,
        CommandStatus::Pending
    );

    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.scheduler.tick(ctx).await.unwrap();
        if ctx.scheduler.get_command(&b_id).await.unwrap().status.is_terminal() {
            break;
        }
    }

    assert_eq!(ctx.scheduler.get_command(&a_id).await.unwrap().status, CommandStatus::Completed);
    assert_eq!(ctx.scheduler.get_command(&b_id).await.unwrap().status, CommandStatus::Completed);
    assert_eq!(handler.events(), vec!["start a", "end a", "start b", "end b"]);
}

#[tokio::test]
async fn test_non_blocking_commands_run_concurrently() {
    let handler = Recording::new();
    let node = node(EngineConfig::test(), vec![handler.clone()]).await;
    let ctx = &node.ctx;
    let owner = OperationId::new();

    ctx.scheduler.schedule(record("x").owned_by(owner)).await.unwrap();
    ctx.scheduler.schedule(record("y").owned_by(owner)).await.unwrap();

    let report = ctx.scheduler.run_due(ctx, Timestamp::now()).await.unwrap();
    assert_eq!(report.dispatched, 2);

    let events = handler.events();
    assert!(events[0].starts_with("start") && events[1].starts_with("start"));
}

#[tokio::test]
async fn test_concurrency_limit_prefers_priority() {
    let handler = Recording::new();
    let mut config = EngineConfig::test();
    config.scheduler_max_concurrency = 1;
    let node = node(config, vec![handler.clone()]).await;
    let ctx = &node.ctx;

    ctx.scheduler
        .schedule(record("low").with_priority(CommandPriority::Low))
        .await
        .unwrap();
    ctx.scheduler
        .schedule(record("critical").with_priority(CommandPriority::Critical))
        .await
        .unwrap();

    let report = ctx.scheduler.run_due(ctx, Timestamp::now()).await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.deferred, 1);
    assert_eq!(handler.events(), vec!["start critical", "end critical"]);

    ctx.scheduler.run_due(ctx, Timestamp::now()).await.unwrap();
    assert_eq!(handler.events().len(), 4);
}

#[tokio::test]
async fn test_expired_command_is_not_run() {
    let handler = Recording::new();
    let node = node(EngineConfig::test(), vec![handler.clone()]).await;
    let ctx = &node.ctx;

    let now = Timestamp::now();
    let id = ctx
        .scheduler
        .schedule(record("stale").with_deadline(now.plus_millis(10)))
        .await
        .unwrap();

    let report = ctx.scheduler.run_due(ctx, now.plus_millis(1_000)).await.unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(ctx.scheduler.get_command(&id).await.unwrap().status, CommandStatus::Expired);
    assert!(handler.events().is_empty());
    assert_eq!(handler.expired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_periodic_command_repeats() {
    let handler = Recording::new();
    let node = node(EngineConfig::test(), vec![handler.clone()]).await;
    let ctx = &node.ctx;

    let id = ctx
        .scheduler
        .schedule(record("tick").with_period(HOUR_MS))
        .await
        .unwrap();
    let now = Timestamp::now();

    ctx.scheduler.run_due(ctx, now).await.unwrap();
    let command = ctx.scheduler.get_command(&id).await.unwrap();
    assert_eq!(command.status, CommandStatus::Repeating);
    // The period counts from the end of the 30ms run
    assert!(command.due_at >= now.plus_millis(HOUR_MS + 30));

    let report = ctx.scheduler.run_due(ctx, now.plus_millis(HOUR_MS)).await.unwrap();
    assert_eq!(report.dispatched, 0);

    ctx.scheduler.run_due(ctx, command.due_at).await.unwrap();
    let command = ctx.scheduler.get_command(&id).await.unwrap();
    assert_eq!(command.status, CommandStatus::Repeating);
    assert_eq!(command.attempts, 2);
}

#[tokio::test]
async fn test_follow_up_commands_form_a_sequence() {
    let handler = Recording::new();
    let node = node(EngineConfig::test(), vec![handler.clone()]).await;
    let ctx = &node.ctx;

    let parent_id = ctx
        .scheduler
        .schedule(Command::new("record", json!({ "label": "parent", "child": "child" })))
        .await
        .unwrap();
    ctx.scheduler.run_due(ctx, Timestamp::now()).await.unwrap();
    ctx.scheduler.run_due(ctx, Timestamp::now()).await.unwrap();

    let completed = ctx
        .storage
        .list_commands_by_status(&[CommandStatus::Completed])
        .await
        .unwrap();
    let child = completed
        .iter()
        .find(|command| command.parent_id == Some(parent_id))
        .expect("child command");
    assert_eq!(child.payload["label"], "child");
    assert_eq!(handler.events(), vec!["start parent", "end parent", "start child", "end child"]);
}

#[tokio::test]
async fn test_commands_of_finished_operation_are_skipped() {
    let handler = Recording::new();
    let node = node(EngineConfig::test(), vec![handler.clone()]).await;
    let ctx = &node.ctx;

    let operation = Operation::new(OperationType::Publish, Locator::new("u").unwrap());
    let owner = operation.operation_id;
    ctx.storage.insert_operation(&operation).await.unwrap();
    ctx.storage
        .transition_operation(&owner, OperationUpdate::failed("cancelled"))
        .await
        .unwrap();
    assert_eq!(ctx.storage.get_operation(&owner).await.unwrap().unwrap().status, OperationStatus::Failed);

    let id = ctx.scheduler.schedule(record("orphan").owned_by(owner)).await.unwrap();
    let report = ctx.scheduler.run_due(ctx, Timestamp::now()).await.unwrap();
    assert_eq!(report.skipped, 1);

    let command = ctx.scheduler.get_command(&id).await.unwrap();
    assert_eq!(command.status, CommandStatus::Completed);
    assert!(command.last_error.unwrap().starts_with("skipped"));
    assert!(handler.events().is_empty());
}

#[tokio::test]
async fn test_recover_interrupted_requeues_processing() {
    let handler = Recording::new();
    let node = node(EngineConfig::test(), vec![handler.clone()]).await;
    let ctx = &node.ctx;

    let mut command = record("crashed");
    command.status = CommandStatus::Processing;
    command.attempts = 1;
    let id = command.id;
    ctx.storage.insert_command(&command).await.unwrap();

    assert_eq!(ctx.scheduler.recover_interrupted().await.unwrap(), 1);
    assert_eq!(ctx.scheduler.get_command(&id).await.unwrap().status, CommandStatus::Scheduled);

    ctx.scheduler.run_due(ctx, Timestamp::now().plus_millis(1)).await.unwrap();
    let command = ctx.scheduler.get_command(&id).await.unwrap();
    assert_eq!(command.status, CommandStatus::Completed);
    assert_eq!(command.attempts, 2);
}

#[tokio::test]
async fn test_runner_drives_commands() {
    let handler = Recording::new();
    let node = node(EngineConfig::test(), vec![handler.clone()]).await;
    let ctx = node.ctx.clone();

    let id = ctx.scheduler.schedule(record("background")).await.unwrap();
    let runner = dx_engine::SchedulerRunner::new(ctx.clone()).start().await.unwrap();

    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if ctx.scheduler.get_command(&id).await.unwrap().status.is_terminal() {
            break;
        }
    }
    assert_eq!(ctx.scheduler.get_command(&id).await.unwrap().status, CommandStatus::Completed);
    runner.stop().await;
}
