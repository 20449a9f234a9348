//! Retention sweeps: delete completed tasks, resolved issues, and stale
//! metric samples past their configured age.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use crate::config::CoreConfig;
use crate::store::TaskStore;

pub struct RetentionJob {
    store: Arc<dyn TaskStore>,
    config: Arc<CoreConfig>,
}

impl RetentionJob {
    pub fn new(store: Arc<dyn TaskStore>, config: Arc<CoreConfig>) -> Self {
        Self { store, config }
    }

    /// Delete completed tasks, resolved issues, and metrics past their
    /// configured retention window. Returns the row counts removed from
    /// each table, in that order.
    pub async fn run(&self) -> Result<(u64, u64, u64)> {
        let task_cutoff = Utc::now() - chrono::Duration::days(self.config.task_retention_days);
        let metrics_cutoff =
            Utc::now() - chrono::Duration::days(self.config.health.metrics_retention_days);

        let tasks_deleted = self.store.delete_completed_before(task_cutoff).await?;
        let issues_deleted = self.store.delete_resolved_before(task_cutoff).await?;
        let metrics_deleted = self.store.delete_metrics_before(metrics_cutoff).await?;

        tracing::info!(
            tasks_deleted,
            issues_deleted,
            metrics_deleted,
            "retention sweep completed"
        );

        Ok((tasks_deleted, issues_deleted, metrics_deleted))
    }
}
