//! The `TaskStore` seam -- an object-safe trait wrapping [`core_db::queries`]
//! so the scheduler, planner, and monitor can be unit-tested against a fake
//! implementation without a live Postgres instance.
//!
//! [`PgTaskStore`] is the sole production implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use core_db::models::{
    HealthIssue, IssueType, PerformanceMetric, ScheduledTask, Severity, Task, WorkerPoolRow,
};
use core_db::queries::metrics::NewMetric;
use core_db::queries::scheduled::ScheduledTaskFields;
use core_db::queries::tasks::{NewTask, Page, TaskFilter};
use core_db::queries::{events, issues, metrics, pools, scheduled, tasks};

/// Durable record access for tasks, scheduled definitions, pools, issues,
/// and metrics.
///
/// Object-safe so the scheduler/planner/monitor can be constructed over
/// `Arc<dyn TaskStore>` and exercised against a fake in unit tests.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, fields: NewTask<'_>) -> anyhow::Result<Task>;
    async fn get_task(&self, id: i64) -> anyhow::Result<Option<Task>>;
    async fn list_tasks(&self, filter: &TaskFilter, page: Page) -> anyhow::Result<Vec<Task>>;
    #[allow(clippy::too_many_arguments)]
    async fn update_task_status(
        &self,
        id: i64,
        from_set: &[core_db::models::TaskStatus],
        to: core_db::models::TaskStatus,
        started_at: Option<DateTime<Utc>>,
        ended_at: Option<DateTime<Utc>>,
        duration_ms: Option<i64>,
        result: Option<serde_json::Value>,
        error_message: Option<&str>,
    ) -> anyhow::Result<bool>;
    async fn update_task_progress(
        &self,
        id: i64,
        percent: i32,
        message: Option<&str>,
    ) -> anyhow::Result<()>;
    async fn count_in_flight_for_schedule(&self, scheduled_task_name: &str)
    -> anyhow::Result<i64>;
    async fn find_in_flight_for_schedule(
        &self,
        scheduled_task_name: &str,
    ) -> anyhow::Result<Option<Task>>;
    async fn reap_orphaned_started(
        &self,
        older_than: DateTime<Utc>,
        message: &str,
    ) -> anyhow::Result<Vec<Task>>;
    async fn delete_completed_before(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64>;

    async fn upsert_scheduled(
        &self,
        name: &str,
        fields: ScheduledTaskFields<'_>,
    ) -> anyhow::Result<ScheduledTask>;
    async fn get_scheduled(&self, name: &str) -> anyhow::Result<Option<ScheduledTask>>;
    async fn list_scheduled(&self) -> anyhow::Result<Vec<ScheduledTask>>;
    async fn list_due_scheduled(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<ScheduledTask>>;
    async fn mark_run(
        &self,
        name: &str,
        last_run: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> anyhow::Result<()>;
    async fn delete_scheduled(&self, name: &str) -> anyhow::Result<bool>;

    async fn get_pool(&self, name: &str) -> anyhow::Result<Option<WorkerPoolRow>>;
    async fn list_pools(&self) -> anyhow::Result<Vec<WorkerPoolRow>>;
    async fn update_pool_counts(
        &self,
        name: &str,
        active_workers: i32,
        queued_depth: i32,
        running_depth: i32,
    ) -> anyhow::Result<()>;
    async fn reconcile_pool(
        &self,
        name: &str,
        max_workers: i32,
        enabled: bool,
    ) -> anyhow::Result<WorkerPoolRow>;

    #[allow(clippy::too_many_arguments)]
    async fn upsert_issue(
        &self,
        issue_type: IssueType,
        source: &str,
        signature: &str,
        severity: Severity,
        message: &str,
        details: serde_json::Value,
        wiki_url: Option<&str>,
    ) -> anyhow::Result<HealthIssue>;
    async fn resolve_by_key(
        &self,
        issue_type: IssueType,
        source: &str,
    ) -> anyhow::Result<Option<HealthIssue>>;
    async fn resolve_issue(&self, id: i64) -> anyhow::Result<bool>;
    async fn dismiss_issue(&self, id: i64) -> anyhow::Result<bool>;
    async fn get_issue(&self, id: i64) -> anyhow::Result<Option<HealthIssue>>;
    async fn list_issues(&self, unresolved_only: bool) -> anyhow::Result<Vec<HealthIssue>>;
    async fn delete_resolved_before(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64>;

    async fn insert_metric(&self, fields: NewMetric) -> anyhow::Result<PerformanceMetric>;
    async fn list_metrics(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> anyhow::Result<Vec<PerformanceMetric>>;
    async fn last_n_metrics(&self, n: i64) -> anyhow::Result<Vec<PerformanceMetric>>;
    async fn delete_metrics_before(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64>;

    /// Record a status-transition audit event. Best-effort from the
    /// scheduler's point of view -- a failure here never blocks a
    /// transition that has already been persisted.
    async fn record_event(
        &self,
        task_id: i64,
        from_status: Option<core_db::models::TaskStatus>,
        to_status: core_db::models::TaskStatus,
    ) -> anyhow::Result<()>;
}

// Compile-time assertion: TaskStore must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn TaskStore) {}
};

/// The production [`TaskStore`], backed by a Postgres pool.
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn insert_task(&self, fields: NewTask<'_>) -> anyhow::Result<Task> {
        tasks::insert_task(&self.pool, fields).await
    }

    async fn get_task(&self, id: i64) -> anyhow::Result<Option<Task>> {
        tasks::get_task(&self.pool, id).await
    }

    async fn list_tasks(&self, filter: &TaskFilter, page: Page) -> anyhow::Result<Vec<Task>> {
        tasks::list_tasks(&self.pool, filter, page).await
    }

    async fn update_task_status(
        &self,
        id: i64,
        from_set: &[core_db::models::TaskStatus],
        to: core_db::models::TaskStatus,
        started_at: Option<DateTime<Utc>>,
        ended_at: Option<DateTime<Utc>>,
        duration_ms: Option<i64>,
        result: Option<serde_json::Value>,
        error_message: Option<&str>,
    ) -> anyhow::Result<bool> {
        tasks::update_task_status(
            &self.pool,
            id,
            from_set,
            to,
            started_at,
            ended_at,
            duration_ms,
            result,
            error_message,
        )
        .await
    }

    async fn update_task_progress(
        &self,
        id: i64,
        percent: i32,
        message: Option<&str>,
    ) -> anyhow::Result<()> {
        tasks::update_task_progress(&self.pool, id, percent, message).await
    }

    async fn count_in_flight_for_schedule(
        &self,
        scheduled_task_name: &str,
    ) -> anyhow::Result<i64> {
        tasks::count_in_flight_for_schedule(&self.pool, scheduled_task_name).await
    }

    async fn find_in_flight_for_schedule(
        &self,
        scheduled_task_name: &str,
    ) -> anyhow::Result<Option<Task>> {
        tasks::find_in_flight_for_schedule(&self.pool, scheduled_task_name).await
    }

    async fn reap_orphaned_started(
        &self,
        older_than: DateTime<Utc>,
        message: &str,
    ) -> anyhow::Result<Vec<Task>> {
        tasks::reap_orphaned_started(&self.pool, older_than, message).await
    }

    async fn delete_completed_before(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64> {
        tasks::delete_completed_before(&self.pool, older_than).await
    }

    async fn upsert_scheduled(
        &self,
        name: &str,
        fields: ScheduledTaskFields<'_>,
    ) -> anyhow::Result<ScheduledTask> {
        scheduled::upsert_scheduled(&self.pool, name, fields).await
    }

    async fn get_scheduled(&self, name: &str) -> anyhow::Result<Option<ScheduledTask>> {
        scheduled::get_scheduled(&self.pool, name).await
    }

    async fn list_scheduled(&self) -> anyhow::Result<Vec<ScheduledTask>> {
        scheduled::list_scheduled(&self.pool).await
    }

    async fn list_due_scheduled(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<ScheduledTask>> {
        scheduled::list_due_scheduled(&self.pool, now).await
    }

    async fn mark_run(
        &self,
        name: &str,
        last_run: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        scheduled::mark_run(&self.pool, name, last_run, next_run).await
    }

    async fn delete_scheduled(&self, name: &str) -> anyhow::Result<bool> {
        scheduled::delete_scheduled(&self.pool, name).await
    }

    async fn get_pool(&self, name: &str) -> anyhow::Result<Option<WorkerPoolRow>> {
        pools::get_pool(&self.pool, name).await
    }

    async fn list_pools(&self) -> anyhow::Result<Vec<WorkerPoolRow>> {
        pools::list_pools(&self.pool).await
    }

    async fn update_pool_counts(
        &self,
        name: &str,
        active_workers: i32,
        queued_depth: i32,
        running_depth: i32,
    ) -> anyhow::Result<()> {
        pools::update_pool_counts(&self.pool, name, active_workers, queued_depth, running_depth)
            .await
    }

    async fn reconcile_pool(
        &self,
        name: &str,
        max_workers: i32,
        enabled: bool,
    ) -> anyhow::Result<WorkerPoolRow> {
        pools::reconcile_pool(&self.pool, name, max_workers, enabled).await
    }

    async fn upsert_issue(
        &self,
        issue_type: IssueType,
        source: &str,
        signature: &str,
        severity: Severity,
        message: &str,
        details: serde_json::Value,
        wiki_url: Option<&str>,
    ) -> anyhow::Result<HealthIssue> {
        issues::upsert_issue(
            &self.pool, issue_type, source, signature, severity, message, details, wiki_url,
        )
        .await
    }

    async fn resolve_by_key(
        &self,
        issue_type: IssueType,
        source: &str,
    ) -> anyhow::Result<Option<HealthIssue>> {
        issues::resolve_by_key(&self.pool, issue_type, source).await
    }

    async fn resolve_issue(&self, id: i64) -> anyhow::Result<bool> {
        issues::resolve_issue(&self.pool, id).await
    }

    async fn dismiss_issue(&self, id: i64) -> anyhow::Result<bool> {
        issues::dismiss_issue(&self.pool, id).await
    }

    async fn get_issue(&self, id: i64) -> anyhow::Result<Option<HealthIssue>> {
        issues::get_issue(&self.pool, id).await
    }

    async fn list_issues(&self, unresolved_only: bool) -> anyhow::Result<Vec<HealthIssue>> {
        issues::list_issues(&self.pool, unresolved_only).await
    }

    async fn delete_resolved_before(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64> {
        issues::delete_resolved_before(&self.pool, older_than).await
    }

    async fn insert_metric(&self, fields: NewMetric) -> anyhow::Result<PerformanceMetric> {
        metrics::insert_metric(&self.pool, fields).await
    }

    async fn list_metrics(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> anyhow::Result<Vec<PerformanceMetric>> {
        metrics::list_metrics(&self.pool, since, until).await
    }

    async fn last_n_metrics(&self, n: i64) -> anyhow::Result<Vec<PerformanceMetric>> {
        metrics::last_n_metrics(&self.pool, n).await
    }

    async fn delete_metrics_before(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64> {
        metrics::delete_before(&self.pool, older_than).await
    }

    async fn record_event(
        &self,
        task_id: i64,
        from_status: Option<core_db::models::TaskStatus>,
        to_status: core_db::models::TaskStatus,
    ) -> anyhow::Result<()> {
        events::record_event(&self.pool, task_id, from_status, to_status).await?;
        Ok(())
    }
}
