//! Operation deadline

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use dx_core::{Command, CommandPriority, OperationId};

use crate::context::NodeContext;
use crate::error::EngineResult;
use crate::scheduler::{CommandHandler, CommandOutcome};

pub const NAME: &str = "operation_timeout";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutPayload {
    pub operation_id: OperationId,
    pub timeout_ms: u64,
}

/// Fires `timeout_ms` after creation; skipped by the scheduler once the
/// operation has ended
pub fn command(operation_id: OperationId, timeout_ms: u64) -> Command {
    Command::new(NAME, json!({ "operation_id": operation_id, "timeout_ms": timeout_ms }))
        .with_delay(timeout_ms)
        .with_priority(CommandPriority::High)
        .owned_by(operation_id)
}

pub struct OperationTimeoutHandler;

#[async_trait]
impl CommandHandler for OperationTimeoutHandler {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn execute(&self, ctx: &NodeContext, command: &Command) -> EngineResult<CommandOutcome> {
        let payload: TimeoutPayload = super::parse_payload(command)?;
        let operation = ctx.registry.get_operation(&payload.operation_id).await?;
        if operation.status.is_terminal() {
            return Ok(CommandOutcome::done());
        }

        warn!(
            operation_id = %payload.operation_id,
            timeout_ms = payload.timeout_ms,
            "Operation timed out"
        );
        ctx.registry
            .fail_operation(
                &payload.operation_id,
                format!("operation timed out after {}ms", payload.timeout_ms),
            )
            .await?;
        Ok(CommandOutcome::done())
    }
}
