//! Database query functions for the `performance_metrics` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::PerformanceMetric;

/// Fields for one sampled row, everything but `id`/`sampled_at`.
pub struct NewMetric {
    pub cpu_percent: f64,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
    pub disk_percent: f64,
    pub disk_free_bytes: i64,
    pub disk_total_bytes: i64,
    pub database_latency_ms: f64,
    pub api_latency_ms: f64,
    pub active_connections: i32,
    pub queue_size: i32,
}

/// Insert a performance-metric sample.
pub async fn insert_metric(pool: &PgPool, fields: NewMetric) -> Result<PerformanceMetric> {
    let row = sqlx::query_as::<_, PerformanceMetric>(
        "INSERT INTO performance_metrics \
             (cpu_percent, memory_used_mb, memory_total_mb, disk_percent, \
              disk_free_bytes, disk_total_bytes, database_latency_ms, api_latency_ms, \
              active_connections, queue_size) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
         RETURNING *",
    )
    .bind(fields.cpu_percent)
    .bind(fields.memory_used_mb)
    .bind(fields.memory_total_mb)
    .bind(fields.disk_percent)
    .bind(fields.disk_free_bytes)
    .bind(fields.disk_total_bytes)
    .bind(fields.database_latency_ms)
    .bind(fields.api_latency_ms)
    .bind(fields.active_connections)
    .bind(fields.queue_size)
    .fetch_one(pool)
    .await
    .context("failed to insert performance metric")?;

    Ok(row)
}

/// List samples within `[since, until]`, oldest first. Used by the
/// `performance` checker's moving-average regression check and by the
/// admin `list-metrics` route.
pub async fn list_metrics(
    pool: &PgPool,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<Vec<PerformanceMetric>> {
    let rows = sqlx::query_as::<_, PerformanceMetric>(
        "SELECT * FROM performance_metrics \
         WHERE sampled_at >= $1 AND sampled_at <= $2 \
         ORDER BY sampled_at ASC",
    )
    .bind(since)
    .bind(until)
    .fetch_all(pool)
    .await
    .context("failed to list performance metrics")?;

    Ok(rows)
}

/// The most recent `n` samples, oldest first (for a trailing moving average).
pub async fn last_n_metrics(pool: &PgPool, n: i64) -> Result<Vec<PerformanceMetric>> {
    let rows = sqlx::query_as::<_, PerformanceMetric>(
        "SELECT * FROM (\
             SELECT * FROM performance_metrics ORDER BY sampled_at DESC LIMIT $1\
         ) recent ORDER BY sampled_at ASC",
    )
    .bind(n)
    .fetch_all(pool)
    .await
    .context("failed to fetch recent performance metrics")?;

    Ok(rows)
}

/// Delete samples older than `older_than`.
pub async fn delete_before(pool: &PgPool, older_than: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM performance_metrics WHERE sampled_at < $1")
        .bind(older_than)
        .execute(pool)
        .await
        .context("failed to delete retired performance metrics")?;

    Ok(result.rows_affected())
}
