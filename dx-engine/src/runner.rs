//! Scheduler runner
//!
//! Background loop that ticks the command scheduler on a fixed interval.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::context::NodeContext;
use crate::error::EngineResult;

/// Scheduler runner
pub struct SchedulerRunner {
    ctx: Arc<NodeContext>,
}

impl SchedulerRunner {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// Re-queue interrupted commands, then start ticking
    pub async fn start(self) -> EngineResult<RunnerHandle> {
        self.ctx.scheduler.recover_interrupted().await?;

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let running = Arc::new(RwLock::new(true));
        let running_clone = running.clone();

        let tick_interval = Duration::from_millis(self.ctx.config.scheduler_tick_interval_ms);
        let ctx = self.ctx;

        tokio::spawn(async move {
            let mut ticker = interval(tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Scheduler runner received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        if *running_clone.read().await {
                            match ctx.scheduler.tick(&ctx).await {
                                Ok(report) if report.dispatched > 0 => {
                                    debug!(dispatched = report.dispatched, "Tick dispatched commands");
                                }
                                Ok(_) => {}
                                Err(e) => error!(error = %e, "Scheduler tick failed"),
                            }
                        }
                    }
                }
            }

            info!("Scheduler runner stopped");
        });

        Ok(RunnerHandle { shutdown_tx, running })
    }
}

/// Control handle of a started runner
pub struct RunnerHandle {
    shutdown_tx: mpsc::Sender<()>,
    running: Arc<RwLock<bool>>,
}

impl RunnerHandle {
    pub async fn stop(self) {
        *self.running.write().await = false;
        let _ = self.shutdown_tx.send(()).await;
    }

    /// Keep the loop alive but stop dispatching
    pub async fn pause(&self) {
        *self.running.write().await = false;
    }

    pub async fn resume(&self) {
        *self.running.write().await = true;
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_runner_handle() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = RunnerHandle {
            shutdown_tx: tx,
            running: Arc::new(RwLock::new(true)),
        };

        assert!(handle.is_running().await);
        handle.pause().await;
        assert!(!handle.is_running().await);
        handle.resume().await;
        assert!(handle.is_running().await);
    }
}
