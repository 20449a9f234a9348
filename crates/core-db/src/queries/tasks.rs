//! Database query functions for the `tasks` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::{Priority, Task, TaskStatus, Trigger};

/// Fields needed to insert a new task row. The row's id, status (`queued`),
/// and `queued_at` are server-assigned.
pub struct NewTask<'a> {
    pub name: &'a str,
    pub command: &'a str,
    pub body: serde_json::Value,
    pub priority: Priority,
    pub trigger: Trigger,
    pub deadline_ms: Option<i64>,
    pub scheduled_task_name: Option<&'a str>,
}

/// Insert a new task row with status `queued`. Returns the inserted row with
/// server-generated defaults (id, queued_at, status, progress_percent).
pub async fn insert_task(pool: &PgPool, fields: NewTask<'_>) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (name, command, body, priority, trigger, deadline_ms, scheduled_task_name) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(fields.name)
    .bind(fields.command)
    .bind(fields.body)
    .bind(fields.priority)
    .bind(fields.trigger)
    .bind(fields.deadline_ms)
    .bind(fields.scheduled_task_name)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by id.
pub async fn get_task(pool: &PgPool, id: i64) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Filter criteria for [`list_tasks`]. All fields are optional; `None` means
/// "no constraint on this dimension".
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub statuses: Option<Vec<TaskStatus>>,
    pub command: Option<String>,
    pub queued_after: Option<DateTime<Utc>>,
    pub queued_before: Option<DateTime<Utc>>,
}

/// Offset/limit paging parameters.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub offset: i64,
    pub limit: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

/// List tasks matching `filter`, newest-queued-first, paged.
pub async fn list_tasks(pool: &PgPool, filter: &TaskFilter, page: Page) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE ($1::text[] IS NULL OR status::text = ANY($1)) \
           AND ($2::text IS NULL OR command = $2) \
           AND ($3::timestamptz IS NULL OR queued_at >= $3) \
           AND ($4::timestamptz IS NULL OR queued_at <= $4) \
         ORDER BY queued_at DESC \
         OFFSET $5 LIMIT $6",
    )
    .bind(
        filter
            .statuses
            .as_ref()
            .map(|ss| ss.iter().map(|s| s.to_string()).collect::<Vec<_>>()),
    )
    .bind(filter.command.as_deref())
    .bind(filter.queued_after)
    .bind(filter.queued_before)
    .bind(page.offset)
    .bind(page.limit)
    .fetch_all(pool)
    .await
    .context("failed to list tasks")?;

    Ok(tasks)
}

/// Atomically transition a task's status, but only if its current status is
/// one of `from_set`. Returns `true` iff the row was updated.
///
/// This is the sole concurrency-safety primitive for task state: an `UPDATE
/// ... WHERE status = ANY(from_set)` compare-and-swap.
#[allow(clippy::too_many_arguments)]
pub async fn update_task_status(
    pool: &PgPool,
    id: i64,
    from_set: &[TaskStatus],
    to: TaskStatus,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
    result: Option<serde_json::Value>,
    error_message: Option<&str>,
) -> Result<bool> {
    let from: Vec<String> = from_set.iter().map(|s| s.to_string()).collect();

    let rows = sqlx::query(
        "UPDATE tasks \
         SET status = $1, \
             started_at = COALESCE($2, started_at), \
             ended_at = COALESCE($3, ended_at), \
             duration_ms = COALESCE($4, duration_ms), \
             result = COALESCE($5, result), \
             error_message = COALESCE($6, error_message) \
         WHERE id = $7 AND status::text = ANY($8)",
    )
    .bind(to)
    .bind(started_at)
    .bind(ended_at)
    .bind(duration_ms)
    .bind(result)
    .bind(error_message)
    .bind(id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task status")?
    .rows_affected();

    Ok(rows > 0)
}

/// Update a task's progress snapshot. Does not touch status.
pub async fn update_task_progress(
    pool: &PgPool,
    id: i64,
    percent: i32,
    message: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE tasks \
         SET progress_percent = $1, progress_message = $2, progress_updated_at = now() \
         WHERE id = $3",
    )
    .bind(percent)
    .bind(message)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update task progress")?;

    Ok(())
}

/// Count task rows in a non-terminal status (queued, started, cancelling)
/// for a given scheduled-task name -- the scheduled-task overlap guard.
pub async fn count_in_flight_for_schedule(pool: &PgPool, scheduled_task_name: &str) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks \
         WHERE scheduled_task_name = $1 \
           AND status IN ('queued', 'started', 'cancelling')",
    )
    .bind(scheduled_task_name)
    .fetch_one(pool)
    .await
    .context("failed to count in-flight tasks for schedule")?;

    Ok(row.0)
}

/// Find the single in-flight task row for a scheduled name, if any. Used to
/// return the "reused" id when an overlapping submission is coalesced.
pub async fn find_in_flight_for_schedule(
    pool: &PgPool,
    scheduled_task_name: &str,
) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE scheduled_task_name = $1 \
           AND status IN ('queued', 'started', 'cancelling') \
         ORDER BY queued_at DESC \
         LIMIT 1",
    )
    .bind(scheduled_task_name)
    .fetch_optional(pool)
    .await
    .context("failed to find in-flight task for schedule")?;

    Ok(task)
}

/// Sweep `started` rows whose `started_at` predates `older_than` back to
/// `failed` with the given diagnostic message. Returns the reaped rows.
pub async fn reap_orphaned_started(
    pool: &PgPool,
    older_than: DateTime<Utc>,
    message: &str,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'failed', ended_at = now(), error_message = $1 \
         WHERE status = 'started' AND started_at < $2 \
         RETURNING *",
    )
    .bind(message)
    .bind(older_than)
    .fetch_all(pool)
    .await
    .context("failed to reap orphaned tasks")?;

    Ok(tasks)
}

/// Delete completed/failed/aborted task rows whose `ended_at` predates
/// `older_than`. Returns the number of rows deleted.
pub async fn delete_completed_before(pool: &PgPool, older_than: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM tasks \
         WHERE status IN ('completed', 'failed', 'aborted') AND ended_at < $1",
    )
    .bind(older_than)
    .execute(pool)
    .await
    .context("failed to delete retired tasks")?;

    Ok(result.rows_affected())
}

/// Count tasks currently `started` whose priority maps to the given class --
/// used to seed and cross-check worker-pool occupancy at startup.
pub async fn count_started_by_priority(pool: &PgPool, priority: Priority) -> Result<i64> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE status = 'started' AND priority = $1")
            .bind(priority)
            .fetch_one(pool)
            .await
            .context("failed to count started tasks by priority")?;

    Ok(row.0)
}
