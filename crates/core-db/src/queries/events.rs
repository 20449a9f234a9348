//! Database query functions for the `task_events` audit trail.
//!
//! An append-only record of every status transition, used by the admin
//! `get-task` route for a history view.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::{TaskEvent, TaskStatus};

/// Record a status transition. `from_status` is `None` for the initial
/// `queued` insert.
pub async fn record_event(
    pool: &PgPool,
    task_id: i64,
    from_status: Option<TaskStatus>,
    to_status: TaskStatus,
) -> Result<TaskEvent> {
    let row = sqlx::query_as::<_, TaskEvent>(
        "INSERT INTO task_events (task_id, from_status, to_status) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(from_status)
    .bind(to_status)
    .fetch_one(pool)
    .await
    .context("failed to record task event")?;

    Ok(row)
}

/// List all events for a task, oldest first.
pub async fn list_events_for_task(pool: &PgPool, task_id: i64) -> Result<Vec<TaskEvent>> {
    let rows = sqlx::query_as::<_, TaskEvent>(
        "SELECT * FROM task_events WHERE task_id = $1 ORDER BY at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list task events")?;

    Ok(rows)
}
