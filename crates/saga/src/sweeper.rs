//! Background task that fires expired wait tokens.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use event_store::EventStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::engine::WorkflowEngine;

/// Periodically fires the timeouts of expired wait tokens.
pub struct TimeoutSweeper<S: EventStore> {
    engine: Arc<WorkflowEngine<S>>,
    interval: Duration,
    batch_size: usize,
}

impl<S> TimeoutSweeper<S>
where
    S: EventStore + Clone + 'static,
{
    /// Uses the engine's configured interval and batch size.
    pub fn new(engine: Arc<WorkflowEngine<S>>) -> Self {
        let interval = engine.config().sweeper_interval;
        let batch_size = engine.config().sweeper_batch_size;
        Self {
            engine,
            interval,
            batch_size,
        }
    }

    /// Runs one sweep: keeps firing batches until fewer than a full batch is due.
    pub async fn sweep_once(&self) -> usize {
        let mut total = 0;
        loop {
            match self.engine.fire_due_timeouts(Utc::now(), self.batch_size).await {
                Ok(fired) => {
                    total += fired;
                    if fired < self.batch_size {
                        break;
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "timeout sweep failed");
                    break;
                }
            }
        }
        if total > 0 {
            tracing::info!(fired = total, "timeout sweep fired waits");
        }
        total
    }

    /// Spawns the sweep loop; it stops when `shutdown` changes.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::info!(
                interval_ms = self.interval.as_millis() as u64,
                batch_size = self.batch_size,
                "timeout sweeper started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep_once().await;
                    }
                    _ = shutdown.changed() => {
                        tracing::info!("timeout sweeper stopping due to shutdown");
                        break;
                    }
                }
            }
        })
    }
}
