//! Command - the schedulable unit of work
//!
//! Commands are persisted by the scheduler and never deleted; terminal rows
//! stay behind as the audit trail of every attempt.
//!
//! # State machine
//!
//! ```text
//! pending ───┬──→ processing ──┬──→ completed
//!            │        ↑        ├──→ failed
//! scheduled ─┘        │        ├──→ scheduled   (retry with backoff)
//!                     │        └──→ repeating   (periodic)
//! repeating ──────────┘
//!
//! pending / scheduled / repeating ──→ expired   (deadline passed)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use super::common::*;

/// Command status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    /// Waiting, due immediately
    #[default]
    Pending,
    /// Waiting for a future `due_at` (initial delay or retry backoff)
    Scheduled,
    /// Handler running
    Processing,
    /// Finished successfully
    Completed,
    /// Finished with a non-recoverable error or retries exhausted
    Failed,
    /// Periodic command waiting for its next run
    Repeating,
    /// Deadline passed before the handler could run
    Expired,
}

impl CommandStatus {
    /// Terminal statuses are absorbing
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }

    /// Whether the scheduler may pick the command up when it is due
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, Self::Pending | Self::Scheduled | Self::Repeating)
    }

    pub fn can_transition_to(&self, target: CommandStatus) -> bool {
        use CommandStatus::*;
        match (self, target) {
            (Pending | Scheduled | Repeating, Processing) => true,
            (Pending | Scheduled | Repeating, Expired) => true,
            // Owner operation already finished, or name no longer resolvable.
            (Pending | Scheduled | Repeating, Completed | Failed) => true,
            (Processing, Completed | Failed | Scheduled | Repeating) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Scheduled => "SCHEDULED",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Repeating => "REPEATING",
            Self::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch priority; higher runs first among due commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CommandPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

/// A persisted unit of work
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Command {
    pub id: CommandId,

    /// Dispatch key into the handler registry
    pub name: String,

    /// Handler-specific payload
    pub payload: serde_json::Value,

    pub status: CommandStatus,

    /// Earliest time the command may run
    pub due_at: Timestamp,

    /// Repeat interval in milliseconds; also the fixed retry delay when set
    pub period: Option<u64>,

    /// Remaining retries; never increases
    pub retries_left: u32,

    pub priority: CommandPriority,

    /// Blocking commands of one operation run strictly one after another
    pub is_blocking: bool,

    pub owner_operation_id: Option<OperationId>,

    /// Command that produced this one as a follow-up
    pub parent_id: Option<CommandId>,

    /// Past this time the command expires instead of running
    pub deadline_at: Option<Timestamp>,

    /// Number of handler executions so far
    pub attempts: u32,

    pub last_error: Option<String>,

    pub created_at: Timestamp,

    pub updated_at: Timestamp,
}

impl Command {
    /// New command, due immediately
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Timestamp::now();
        Self {
            id: CommandId::new(),
            name: name.into(),
            payload,
            status: CommandStatus::Pending,
            due_at: now,
            period: None,
            retries_left: 0,
            priority: CommandPriority::Normal,
            is_blocking: false,
            owner_operation_id: None,
            parent_id: None,
            deadline_at: None,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Delay the first run by `delay_ms` from creation
    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.due_at = self.created_at.plus_millis(delay_ms);
        self
    }

    pub fn due_at(mut self, due_at: Timestamp) -> Self {
        self.due_at = due_at;
        self
    }

    pub fn with_period(mut self, period_ms: u64) -> Self {
        self.period = Some(period_ms);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries_left = retries;
        self
    }

    pub fn with_priority(mut self, priority: CommandPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn blocking(mut self) -> Self {
        self.is_blocking = true;
        self
    }

    pub fn owned_by(mut self, operation_id: OperationId) -> Self {
        self.owner_operation_id = Some(operation_id);
        self
    }

    pub fn with_deadline(mut self, deadline_at: Timestamp) -> Self {
        self.deadline_at = Some(deadline_at);
        self
    }

    pub fn is_due(&self, now: Timestamp) -> bool {
        self.status.is_dispatchable() && self.due_at <= now
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.deadline_at.map(|deadline| deadline < now).unwrap_or(false)
    }

    /// Move to `target`, refusing transitions out of terminal states
    pub fn transition(&mut self, target: CommandStatus) -> crate::CoreResult<()> {
        if !self.status.can_transition_to(target) {
            return Err(crate::CoreError::InvalidTransition {
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }
        self.status = target;
        self.updated_at = Timestamp::now();
        Ok(())
    }
}
