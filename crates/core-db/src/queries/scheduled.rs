//! Database query functions for the `scheduled_tasks` table.
//!
//! Rows here are owned exclusively by the planner: only it mutates
//! `next_run`/`last_run`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::{Priority, ScheduledTask};

/// Fields for creating or updating a scheduled-task definition.
pub struct ScheduledTaskFields<'a> {
    pub command: &'a str,
    pub body: serde_json::Value,
    pub interval_ms: i64,
    pub priority: Priority,
    pub enabled: bool,
}

/// Insert a scheduled-task definition, or update it in place if `name`
/// already exists. `next_run` is left untouched on conflict so an enabled
/// definition does not lose its schedule when re-upserted with new fields.
pub async fn upsert_scheduled(
    pool: &PgPool,
    name: &str,
    fields: ScheduledTaskFields<'_>,
) -> Result<ScheduledTask> {
    let row = sqlx::query_as::<_, ScheduledTask>(
        "INSERT INTO scheduled_tasks (name, command, body, interval_ms, priority, enabled, next_run) \
         VALUES ($1, $2, $3, $4, $5, $6, now()) \
         ON CONFLICT (name) DO UPDATE SET \
             command = EXCLUDED.command, \
             body = EXCLUDED.body, \
             interval_ms = EXCLUDED.interval_ms, \
             priority = EXCLUDED.priority, \
             enabled = EXCLUDED.enabled \
         RETURNING *",
    )
    .bind(name)
    .bind(fields.command)
    .bind(fields.body)
    .bind(fields.interval_ms)
    .bind(fields.priority)
    .bind(fields.enabled)
    .fetch_one(pool)
    .await
    .context("failed to upsert scheduled task")?;

    Ok(row)
}

/// Fetch a single scheduled-task definition by name.
pub async fn get_scheduled(pool: &PgPool, name: &str) -> Result<Option<ScheduledTask>> {
    let row = sqlx::query_as::<_, ScheduledTask>("SELECT * FROM scheduled_tasks WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("failed to fetch scheduled task")?;

    Ok(row)
}

/// List all scheduled-task definitions, alphabetically by name.
pub async fn list_scheduled(pool: &PgPool) -> Result<Vec<ScheduledTask>> {
    let rows = sqlx::query_as::<_, ScheduledTask>("SELECT * FROM scheduled_tasks ORDER BY name")
        .fetch_all(pool)
        .await
        .context("failed to list scheduled tasks")?;

    Ok(rows)
}

/// Definitions that are enabled and due (`next_run <= now`), ordered by how
/// overdue they are.
pub async fn list_due_scheduled(pool: &PgPool, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>> {
    let rows = sqlx::query_as::<_, ScheduledTask>(
        "SELECT * FROM scheduled_tasks \
         WHERE enabled AND next_run <= $1 \
         ORDER BY next_run ASC",
    )
    .bind(now)
    .fetch_all(pool)
    .await
    .context("failed to list due scheduled tasks")?;

    Ok(rows)
}

/// Record that a definition ran: advance `last_run`/`next_run` together,
/// regardless of whether the submission was fresh or coalesced.
pub async fn mark_run(
    pool: &PgPool,
    name: &str,
    last_run: DateTime<Utc>,
    next_run: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE scheduled_tasks SET last_run = $1, next_run = $2 WHERE name = $3")
        .bind(last_run)
        .bind(next_run)
        .bind(name)
        .execute(pool)
        .await
        .context("failed to record scheduled task run")?;

    Ok(())
}

/// Remove a scheduled-task definition. Does not touch task rows it already
/// produced.
pub async fn delete_scheduled(pool: &PgPool, name: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM scheduled_tasks WHERE name = $1")
        .bind(name)
        .execute(pool)
        .await
        .context("failed to delete scheduled task")?;

    Ok(result.rows_affected() > 0)
}
