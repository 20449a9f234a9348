//! The recurring-task planner: a 1s ticker that submits due scheduled
//! tasks through the scheduler, relying on its overlap guard to coalesce
//! a tick that lands while the previous run is still in flight.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use core_db::models::Trigger;
use core_db::queries::tasks::NewTask;

use crate::scheduler::Scheduler;
use crate::store::TaskStore;

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const MIN_INTERVAL_MS: i64 = 1000;
const JITTER_FRACTION: f64 = 0.05;

/// Drives scheduled-task submission on a fixed tick.
pub struct Planner {
    store: Arc<dyn TaskStore>,
    scheduler: Arc<Scheduler>,
}

impl Planner {
    pub fn new(store: Arc<dyn TaskStore>, scheduler: Arc<Scheduler>) -> Self {
        Self { store, scheduler }
    }

    /// Run the planner loop until `cancel` fires. Exits within one tick of
    /// cancellation (at most `TICK_INTERVAL`).
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::warn!(error = %e, "planner tick failed");
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("planner shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn tick(&self) -> Result<()> {
        let now = Utc::now();
        let due = self
            .store
            .list_due_scheduled(now)
            .await
            .context("failed to list due scheduled tasks")?;

        for def in due {
            let outcome = self
                .scheduler
                .submit(NewTask {
                    name: &def.name,
                    command: &def.command,
                    body: def.body.clone(),
                    priority: def.priority,
                    trigger: Trigger::Scheduled,
                    deadline_ms: None,
                    scheduled_task_name: Some(&def.name),
                })
                .await;

            match outcome {
                Ok(result) if result.reused => {
                    tracing::debug!(
                        schedule = %def.name,
                        task_id = result.task_id,
                        "scheduled tick coalesced into in-flight task"
                    );
                }
                Ok(result) => {
                    tracing::info!(schedule = %def.name, task_id = result.task_id, "submitted scheduled task");
                }
                Err(e) => {
                    tracing::warn!(schedule = %def.name, error = %e, "failed to submit scheduled task");
                    continue;
                }
            }

            let interval_ms = def.interval_ms.max(MIN_INTERVAL_MS);
            let jittered_ms = apply_jitter(interval_ms);
            let next_run = now + chrono::Duration::milliseconds(jittered_ms);

            if let Err(e) = self.store.mark_run(&def.name, now, next_run).await {
                tracing::warn!(schedule = %def.name, error = %e, "failed to advance schedule");
            }
        }

        Ok(())
    }
}

/// Apply +/-5% jitter to an interval, clamped so it never drops below the
/// 1000ms floor.
fn apply_jitter(interval_ms: i64) -> i64 {
    let mut rng = rand::rng();
    let jitter = rng.random_range(-JITTER_FRACTION..=JITTER_FRACTION);
    let jittered = (interval_ms as f64) * (1.0 + jitter);
    (jittered.round() as i64).max(MIN_INTERVAL_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_five_percent_and_above_floor() {
        for _ in 0..200 {
            let jittered = apply_jitter(60_000);
            assert!(jittered >= 57_000 && jittered <= 63_000, "{jittered}");
        }
    }

    #[test]
    fn jitter_never_drops_below_minimum_interval() {
        for _ in 0..200 {
            let jittered = apply_jitter(1000);
            assert!(jittered >= MIN_INTERVAL_MS);
        }
    }
}
