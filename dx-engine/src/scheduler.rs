//! Command scheduler
//!
//! Persistent, retrying, priority-aware command execution. Every tick loads
//! the due commands from storage and dispatches them to their handlers on
//! tokio tasks, at most `max_concurrency` at a time.
//!
//! # Command lifecycle
//!
//! ```text
//!   PENDING / SCHEDULED / REPEATING
//!          │            │
//!          │            └──deadline passed──► EXPIRED
//!          ▼
//!      PROCESSING ──ok──► COMPLETED
//!          │   │  └─ok, periodic──► REPEATING
//!          │   └──error, retries left──► SCHEDULED (backoff)
//!          └──error, no retries──► FAILED
//! ```
//!
//! Blocking commands of the same operation run one at a time in creation
//! order. Commands whose operation already ended are completed without
//! running their handler.

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use dx_core::{Command, CommandId, CommandStatus, OperationId, Timestamp};

use crate::context::NodeContext;
use crate::error::{EngineError, EngineResult};
use crate::retry::BackoffStrategy;
use crate::storage::EngineStorage;

/// Interval of `Repeat` outcomes for commands without a period
pub const DEFAULT_REPEAT_INTERVAL_MS: u64 = 5_000;

/// Longest delay a command may be scheduled with (10 days)
pub const MAX_COMMAND_DELAY_MS: u64 = 10 * 24 * 60 * 60 * 1_000;

/// What a handler asks the scheduler to do next
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// Finished; `follow_ups` are scheduled as children of this command
    Done { follow_ups: Vec<Command> },
    /// Run again after the command's period
    Repeat,
}

impl CommandOutcome {
    pub fn done() -> Self {
        Self::Done { follow_ups: Vec::new() }
    }

    pub fn then(follow_ups: Vec<Command>) -> Self {
        Self::Done { follow_ups }
    }
}

/// Executes commands of one name
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Registry key, matched against `Command::name`
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &NodeContext, command: &Command) -> EngineResult<CommandOutcome>;

    /// Called once after the command failed for good
    async fn recover(&self, _ctx: &NodeContext, _command: &Command, _error: &EngineError) -> EngineResult<()> {
        Ok(())
    }

    /// Called once when the command's deadline passed before it could run
    async fn expired(&self, _ctx: &NodeContext, _command: &Command) -> EngineResult<()> {
        Ok(())
    }
}

/// Name to handler map, fixed once the scheduler is built
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn CommandHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler; a later handler with the same name replaces the earlier one
    pub fn register(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        if self.handlers.insert(handler.name(), handler.clone()).is_some() {
            debug!(command = handler.name(), "Command handler replaced");
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.handlers.keys().copied().collect();
        names.sort();
        names
    }
}

/// Counters of one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub dispatched: usize,
    pub blocked: usize,
    pub deferred: usize,
    pub skipped: usize,
    pub expired: usize,
    pub failed: usize,
}

/// Command scheduler
pub struct CommandScheduler {
    storage: Arc<dyn EngineStorage>,
    handlers: HandlerRegistry,
    backoff: BackoffStrategy,
    slots: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<CommandId>>>,
}

impl CommandScheduler {
    pub fn new(
        storage: Arc<dyn EngineStorage>,
        handlers: HandlerRegistry,
        backoff: BackoffStrategy,
        max_concurrency: usize,
    ) -> Self {
        Self {
            storage,
            handlers,
            backoff,
            slots: Arc::new(Semaphore::new(max_concurrency.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Persist a new command.
    ///
    /// Unknown names are stored as FAILED and rejected right away.
    pub async fn schedule(&self, mut command: Command) -> EngineResult<CommandId> {
        let now = Timestamp::now();

        if !self.handlers.contains(&command.name) {
            let err = EngineError::UnknownCommandHandler(command.name.clone());
            command.status = CommandStatus::Failed;
            command.last_error = Some(err.to_string());
            command.updated_at = now;
            self.storage.insert_command(&command).await?;
            warn!(command_id = %command.id, command = %command.name, "Rejected command without handler");
            return Err(err);
        }

        if command.due_at.as_millis().saturating_sub(now.as_millis()) > MAX_COMMAND_DELAY_MS {
            return Err(EngineError::InvalidPayload(format!(
                "command {} delayed past the {}ms limit",
                command.name, MAX_COMMAND_DELAY_MS
            )));
        }

        command.status = if command.due_at > now {
            CommandStatus::Scheduled
        } else {
            CommandStatus::Pending
        };
        self.storage.insert_command(&command).await?;

        debug!(
            command_id = %command.id,
            command = %command.name,
            status = %command.status,
            due_at = command.due_at.as_millis(),
            "Command scheduled"
        );
        Ok(command.id)
    }

    pub async fn get_command(&self, command_id: &CommandId) -> EngineResult<Command> {
        self.storage
            .get_command(command_id)
            .await?
            .ok_or_else(|| EngineError::CommandNotFound(command_id.to_string()))
    }

    pub async fn commands_for_operation(&self, operation_id: &OperationId) -> EngineResult<Vec<Command>> {
        self.storage.list_commands_for_operation(operation_id).await
    }

    /// Commands currently executing in this process
    pub fn in_flight_count(&self) -> usize {
        self.lock_in_flight().len()
    }

    /// Dispatch everything due now without waiting for the handlers
    pub async fn tick(&self, ctx: &Arc<NodeContext>) -> EngineResult<TickReport> {
        let (report, _handles) = self.dispatch(ctx, Timestamp::now()).await?;
        Ok(report)
    }

    /// Dispatch everything due at `now` and wait until the handlers finish
    pub async fn run_due(&self, ctx: &Arc<NodeContext>, now: Timestamp) -> EngineResult<TickReport> {
        let (report, handles) = self.dispatch(ctx, now).await?;
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Command task aborted");
            }
        }
        Ok(report)
    }

    /// Re-queue commands a crash left in PROCESSING
    pub async fn recover_interrupted(&self) -> EngineResult<usize> {
        let processing = self
            .storage
            .list_commands_by_status(&[CommandStatus::Processing])
            .await?;

        let mut recovered = 0;
        for mut command in processing {
            if self.lock_in_flight().contains(&command.id) {
                continue;
            }
            command.transition(CommandStatus::Scheduled)?;
            command.due_at = Timestamp::now();
            self.storage.update_command(&command).await?;
            recovered += 1;
        }

        if recovered > 0 {
            info!(count = recovered, "Re-queued interrupted commands");
        }
        Ok(recovered)
    }

    async fn dispatch(
        &self,
        ctx: &Arc<NodeContext>,
        now: Timestamp,
    ) -> EngineResult<(TickReport, Vec<JoinHandle<()>>)> {
        let due = self.storage.list_due_commands(now).await?;
        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };
        let mut handles = Vec::new();
        let mut claimed: HashSet<OperationId> = HashSet::new();

        for mut command in due {
            if self.lock_in_flight().contains(&command.id) {
                continue;
            }

            let handler = match self.handlers.get(&command.name) {
                Some(handler) => handler,
                None => {
                    let err = EngineError::UnknownCommandHandler(command.name.clone());
                    self.finish(&mut command, CommandStatus::Failed, Some(err.to_string()))
                        .await;
                    report.failed += 1;
                    continue;
                }
            };

            if command.is_expired(now) {
                self.finish(&mut command, CommandStatus::Expired, None).await;
                if let Err(e) = handler.expired(ctx, &command).await {
                    warn!(command_id = %command.id, command = %command.name, error = %e, "Expiry hook failed");
                }
                report.expired += 1;
                continue;
            }

            if let Some(owner) = command.owner_operation_id {
                match self.storage.get_operation(&owner).await {
                    Ok(Some(operation)) if operation.status.is_terminal() => {
                        let note = format!("skipped: operation already {}", operation.status);
                        self.finish(&mut command, CommandStatus::Completed, Some(note))
                            .await;
                        report.skipped += 1;
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(command_id = %command.id, operation_id = %owner, error = %e, "Failed to load owner operation");
                        continue;
                    }
                }

                if command.is_blocking {
                    if claimed.contains(&owner) || self.has_blocking_predecessor(&command, &owner).await? {
                        report.blocked += 1;
                        continue;
                    }
                }
            }

            let permit = match self.slots.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    report.deferred += 1;
                    continue;
                }
            };

            command.transition(CommandStatus::Processing)?;
            command.attempts += 1;
            if let Err(e) = self.storage.update_command(&command).await {
                error!(command_id = %command.id, error = %e, "Failed to mark command processing");
                continue;
            }

            if command.is_blocking {
                if let Some(owner) = command.owner_operation_id {
                    claimed.insert(owner);
                }
            }
            self.lock_in_flight().insert(command.id);
            report.dispatched += 1;

            debug!(
                command_id = %command.id,
                command = %command.name,
                attempt = command.attempts,
                "Dispatching command"
            );

            let execution = Execution {
                ctx: ctx.clone(),
                storage: self.storage.clone(),
                handler,
                backoff: self.backoff.clone(),
                in_flight: self.in_flight.clone(),
                now,
                dispatched: Instant::now(),
                _permit: permit,
            };
            handles.push(tokio::spawn(execution.run(command)));
        }

        if report.due > 0 {
            debug!(
                due = report.due,
                dispatched = report.dispatched,
                blocked = report.blocked,
                deferred = report.deferred,
                "Scheduler tick"
            );
        }
        Ok((report, handles))
    }

    /// Another unfinished blocking command of `owner` must run first
    async fn has_blocking_predecessor(&self, command: &Command, owner: &OperationId) -> EngineResult<bool> {
        let siblings = self.storage.list_commands_for_operation(owner).await?;
        Ok(siblings.iter().any(|other| {
            other.id != command.id
                && other.is_blocking
                && !other.status.is_terminal()
                && (other.status == CommandStatus::Processing
                    || (other.status != CommandStatus::Repeating
                        && (other.created_at, other.id) < (command.created_at, command.id)))
        }))
    }

    async fn finish(&self, command: &mut Command, status: CommandStatus, note: Option<String>) {
        if let Err(e) = command.transition(status) {
            warn!(command_id = %command.id, error = %e, "Refused command transition");
            return;
        }
        if note.is_some() {
            command.last_error = note;
        }
        if let Err(e) = self.storage.update_command(command).await {
            error!(command_id = %command.id, error = %e, "Failed to persist command");
        }
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<CommandId>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One handler run, owned by its task
struct Execution {
    ctx: Arc<NodeContext>,
    storage: Arc<dyn EngineStorage>,
    handler: Arc<dyn CommandHandler>,
    backoff: BackoffStrategy,
    in_flight: Arc<Mutex<HashSet<CommandId>>>,
    /// Tick time the command was dispatched at
    now: Timestamp,
    dispatched: Instant,
    _permit: OwnedSemaphorePermit,
}

impl Execution {
    /// Tick time advanced by how long the handler took
    fn finished_at(&self) -> Timestamp {
        let elapsed = u64::try_from(self.dispatched.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.now.plus_millis(elapsed)
    }

    async fn run(self, mut command: Command) {
        let result = AssertUnwindSafe(self.handler.execute(&self.ctx, &command))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(EngineError::CommandExecution(format!("handler {} panicked", command.name))));
        let finished = self.finished_at();

        let mut failure = None;
        match result {
            Ok(outcome) => {
                let repeat = matches!(outcome, CommandOutcome::Repeat) || command.period.is_some();
                if let CommandOutcome::Done { follow_ups } = outcome {
                    self.schedule_follow_ups(&command, follow_ups).await;
                }

                command.last_error = None;
                if repeat {
                    let period = command.period.unwrap_or(DEFAULT_REPEAT_INTERVAL_MS);
                    command.due_at = finished.plus_millis(period);
                    self.transition(&mut command, CommandStatus::Repeating);
                } else {
                    self.transition(&mut command, CommandStatus::Completed);
                }
            }
            Err(err) if err.is_retryable() && command.retries_left > 0 => {
                command.retries_left -= 1;
                let delay = self.backoff.delay_for_attempt(command.attempts, command.period);
                command.due_at = finished.plus_millis(delay.as_millis() as u64);
                command.last_error = Some(err.to_string());
                self.transition(&mut command, CommandStatus::Scheduled);
                warn!(
                    command_id = %command.id,
                    command = %command.name,
                    attempt = command.attempts,
                    retries_left = command.retries_left,
                    error = %err,
                    "Command failed, retry scheduled"
                );
            }
            Err(err) => {
                command.last_error = Some(err.to_string());
                self.transition(&mut command, CommandStatus::Failed);
                warn!(
                    command_id = %command.id,
                    command = %command.name,
                    attempt = command.attempts,
                    error = %err,
                    "Command failed"
                );
                failure = Some(err);
            }
        }

        if let Err(e) = self.storage.update_command(&command).await {
            error!(command_id = %command.id, error = %e, "Failed to persist command result");
        }

        if let Some(err) = failure {
            let recovered = AssertUnwindSafe(self.handler.recover(&self.ctx, &command, &err))
                .catch_unwind()
                .await;
            match recovered {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(command_id = %command.id, command = %command.name, error = %e, "Recovery hook failed");
                }
                Err(_) => {
                    error!(command_id = %command.id, command = %command.name, "Recovery hook panicked");
                }
            }
        }

        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&command.id);
    }

    async fn schedule_follow_ups(&self, parent: &Command, follow_ups: Vec<Command>) {
        for mut child in follow_ups {
            child.parent_id = Some(parent.id);
            if child.owner_operation_id.is_none() {
                child.owner_operation_id = parent.owner_operation_id;
            }
            if let Err(e) = self.ctx.scheduler.schedule(child).await {
                warn!(command_id = %parent.id, error = %e, "Failed to schedule follow-up command");
            }
        }
    }

    fn transition(&self, command: &mut Command, status: CommandStatus) {
        if let Err(e) = command.transition(status) {
            warn!(command_id = %command.id, error = %e, "Refused command transition");
        }
    }
}
