//! Database query functions for the `health_issues` table.
//!
//! Rows here are owned exclusively by the monitor: other subsystems may only
//! read them. Identity for deduplication is the triple (type, source,
//! signature); see `upsert_issue`.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::{HealthIssue, IssueType, Severity};

/// Insert or update a health issue keyed by (type, source, signature).
///
/// If an *unresolved* row with the same key exists, its `last_seen` always
/// advances; `severity`/`message` are only overwritten if the new severity
/// is strictly higher than the one on file (demotion never downgrades the
/// worst observed severity before resolution). If no unresolved row with
/// this key exists -- including when a past occurrence was already resolved
/// -- a fresh row is inserted.
pub async fn upsert_issue(
    pool: &PgPool,
    issue_type: IssueType,
    source: &str,
    signature: &str,
    severity: Severity,
    message: &str,
    details: serde_json::Value,
    wiki_url: Option<&str>,
) -> Result<HealthIssue> {
    let existing = sqlx::query_as::<_, HealthIssue>(
        "SELECT * FROM health_issues \
         WHERE issue_type = $1 AND source = $2 AND signature = $3 AND is_resolved = false",
    )
    .bind(issue_type)
    .bind(source)
    .bind(signature)
    .fetch_optional(pool)
    .await
    .context("failed to look up existing health issue")?;

    if let Some(existing) = existing {
        let (next_severity, next_message) = if severity > existing.severity {
            (severity, message)
        } else {
            (existing.severity, existing.message.as_str())
        };

        let row = sqlx::query_as::<_, HealthIssue>(
            "UPDATE health_issues \
             SET severity = $1, message = $2, details = $3, \
                 wiki_url = COALESCE($4, wiki_url), last_seen = now() \
             WHERE id = $5 \
             RETURNING *",
        )
        .bind(next_severity)
        .bind(next_message)
        .bind(details)
        .bind(wiki_url)
        .bind(existing.id)
        .fetch_one(pool)
        .await
        .context("failed to update existing health issue")?;

        return Ok(row);
    }

    let row = sqlx::query_as::<_, HealthIssue>(
        "INSERT INTO health_issues (issue_type, source, signature, severity, message, details, wiki_url) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(issue_type)
    .bind(source)
    .bind(signature)
    .bind(severity)
    .bind(message)
    .bind(details)
    .bind(wiki_url)
    .fetch_one(pool)
    .await
    .context("failed to insert health issue")?;

    Ok(row)
}

/// Resolve the unresolved issue for this (type, source), if any. Called when
/// a checker execution comes back healthy for a (type, source) it previously
/// flagged. Matches on (type, source) alone, not signature: the healthy
/// execution's message describes the resolved state, not the problem that
/// was recorded, so it will not share a signature with the unresolved row.
pub async fn resolve_by_key(
    pool: &PgPool,
    issue_type: IssueType,
    source: &str,
) -> Result<Option<HealthIssue>> {
    let row = sqlx::query_as::<_, HealthIssue>(
        "UPDATE health_issues \
         SET is_resolved = true, resolved_at = now() \
         WHERE issue_type = $1 AND source = $2 AND is_resolved = false \
         RETURNING *",
    )
    .bind(issue_type)
    .bind(source)
    .fetch_optional(pool)
    .await
    .context("failed to resolve health issue by key")?;

    Ok(row)
}

/// Manually resolve an issue by id, regardless of whether a checker
/// currently reports it healthy.
pub async fn resolve_issue(pool: &PgPool, id: i64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE health_issues SET is_resolved = true, resolved_at = now() \
         WHERE id = $1 AND is_resolved = false",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to resolve health issue")?;

    Ok(result.rows_affected() > 0)
}

/// Dismiss an issue. Dismissal suppresses notifications but not display, and
/// does not resolve the issue.
pub async fn dismiss_issue(pool: &PgPool, id: i64) -> Result<bool> {
    let result = sqlx::query("UPDATE health_issues SET is_dismissed = true WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to dismiss health issue")?;

    Ok(result.rows_affected() > 0)
}

/// Fetch a single issue by id.
pub async fn get_issue(pool: &PgPool, id: i64) -> Result<Option<HealthIssue>> {
    let row = sqlx::query_as::<_, HealthIssue>("SELECT * FROM health_issues WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch health issue")?;

    Ok(row)
}

/// List issues, optionally restricted to unresolved-only, most recently
/// seen first.
pub async fn list_issues(pool: &PgPool, unresolved_only: bool) -> Result<Vec<HealthIssue>> {
    let rows = sqlx::query_as::<_, HealthIssue>(
        "SELECT * FROM health_issues \
         WHERE (NOT $1) OR is_resolved = false \
         ORDER BY last_seen DESC",
    )
    .bind(unresolved_only)
    .fetch_all(pool)
    .await
    .context("failed to list health issues")?;

    Ok(rows)
}

/// Delete resolved issues whose `resolved_at` predates `older_than`.
pub async fn delete_resolved_before(
    pool: &PgPool,
    older_than: chrono::DateTime<chrono::Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM health_issues WHERE is_resolved = true AND resolved_at < $1",
    )
    .bind(older_than)
    .execute(pool)
    .await
    .context("failed to delete retired health issues")?;

    Ok(result.rows_affected())
}
