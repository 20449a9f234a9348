//! Database query functions for the `worker_pools` table.
//!
//! The table holds a live occupancy snapshot so a restarted process can
//! report pool depths without re-deriving them purely from task rows.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::WorkerPoolRow;

/// Fetch a single pool's row by name.
pub async fn get_pool(pool: &PgPool, name: &str) -> Result<Option<WorkerPoolRow>> {
    let row = sqlx::query_as::<_, WorkerPoolRow>("SELECT * FROM worker_pools WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("failed to fetch worker pool")?;

    Ok(row)
}

/// List all pools, alphabetically by name.
pub async fn list_pools(pool: &PgPool) -> Result<Vec<WorkerPoolRow>> {
    let rows = sqlx::query_as::<_, WorkerPoolRow>("SELECT * FROM worker_pools ORDER BY name")
        .fetch_all(pool)
        .await
        .context("failed to list worker pools")?;

    Ok(rows)
}

/// Flush the live occupancy counters for a pool. Advisory only -- never
/// consulted by a correctness-critical path, only by health/metrics and the
/// dispatcher's backoff heuristic.
pub async fn update_pool_counts(
    pool: &PgPool,
    name: &str,
    active_workers: i32,
    queued_depth: i32,
    running_depth: i32,
) -> Result<()> {
    sqlx::query(
        "UPDATE worker_pools \
         SET active_workers = $1, queued_depth = $2, running_depth = $3 \
         WHERE name = $4",
    )
    .bind(active_workers)
    .bind(queued_depth)
    .bind(running_depth)
    .bind(name)
    .execute(pool)
    .await
    .context("failed to update worker pool counts")?;

    Ok(())
}

/// Reconcile a pool's static configuration (`max_workers`, `enabled`) at
/// startup without disturbing its live counters, creating the row if the
/// default seed migration predates this pool name.
pub async fn reconcile_pool(
    pool: &PgPool,
    name: &str,
    max_workers: i32,
    enabled: bool,
) -> Result<WorkerPoolRow> {
    let row = sqlx::query_as::<_, WorkerPoolRow>(
        "INSERT INTO worker_pools (name, max_workers, enabled) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (name) DO UPDATE SET \
             max_workers = EXCLUDED.max_workers, \
             enabled = EXCLUDED.enabled \
         RETURNING *",
    )
    .bind(name)
    .bind(max_workers)
    .bind(enabled)
    .fetch_one(pool)
    .await
    .context("failed to reconcile worker pool")?;

    Ok(row)
}
