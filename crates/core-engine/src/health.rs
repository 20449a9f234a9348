//! Health monitoring: a registry of checkers run on a timer, whose results
//! are deduplicated into persisted issues and, above a severity threshold,
//! forwarded to a notification sink with per-signature debounce.
//!
//! `Checker` generalizes the same object-safe-trait-plus-registry shape
//! used for task handlers: a `HashMap<String, Box<dyn Checker>>` run
//! concurrently, bounded by a semaphore, each wrapped in a timeout that
//! yields a synthetic unhealthy result rather than hanging the sweep.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sysinfo::{Disks, System};
use tokio::sync::Semaphore;

use core_db::models::{HealthIssue, IssueType, Severity};
use core_db::queries::metrics::NewMetric;

use crate::config::HealthSection;
use crate::store::TaskStore;

const DEFAULT_CHECKER_CONCURRENCY: usize = 4;

/// Outcome of running a single checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Unhealthy,
    Critical,
}

impl HealthStatus {
    fn severity(&self) -> Option<Severity> {
        match self {
            HealthStatus::Healthy => None,
            HealthStatus::Warning => Some(Severity::Warning),
            HealthStatus::Unhealthy => Some(Severity::Error),
            HealthStatus::Critical => Some(Severity::Critical),
        }
    }
}

/// The result of one checker's execution.
#[derive(Debug, Clone)]
pub struct HealthExecution {
    pub issue_type: IssueType,
    pub source: String,
    pub status: HealthStatus,
    pub message: String,
    pub details: serde_json::Value,
    pub duration_ms: i64,
}

/// A single health probe. Object-safe so built-in and custom checkers can
/// share one registry.
#[async_trait]
pub trait Checker: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self) -> HealthExecution;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Checker) {}
};

/// The set of enabled checkers, run concurrently on each sweep.
#[derive(Default)]
pub struct CheckerRegistry {
    checkers: HashMap<String, Box<dyn Checker>>,
}

impl CheckerRegistry {
    pub fn new() -> Self {
        Self {
            checkers: HashMap::new(),
        }
    }

    pub fn register(&mut self, checker: impl Checker + 'static) {
        self.checkers.insert(checker.name().to_string(), Box::new(checker));
    }

    pub fn len(&self) -> usize {
        self.checkers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkers.is_empty()
    }
}

/// Where resolved health notifications are delivered. `LogSink` is the only
/// in-tree implementation; a richer deployment could add email/webhook
/// sinks behind the same trait without touching the monitor.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, issue: &HealthIssue, is_resolution: bool);
}

pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, issue: &HealthIssue, is_resolution: bool) {
        if is_resolution {
            tracing::info!(issue_id = issue.id, source = %issue.source, "health issue resolved");
        } else {
            match issue.severity {
                Severity::Critical => {
                    tracing::error!(issue_id = issue.id, source = %issue.source, message = %issue.message, "critical health issue")
                }
                Severity::Error => {
                    tracing::error!(issue_id = issue.id, source = %issue.source, message = %issue.message, "health issue")
                }
                Severity::Warning => {
                    tracing::warn!(issue_id = issue.id, source = %issue.source, message = %issue.message, "health warning")
                }
                Severity::Info => {
                    tracing::info!(issue_id = issue.id, source = %issue.source, message = %issue.message, "health notice")
                }
            }
        }
    }
}

/// Runs the checker sweep, applies the issue dedup/resolution/escalation
/// lifecycle, and debounces notifications per `(issue_type, source,
/// severity)`.
pub struct HealthMonitor {
    store: Arc<dyn TaskStore>,
    registry: CheckerRegistry,
    sink: Arc<dyn NotificationSink>,
    config: HealthSection,
    last_notified: tokio::sync::Mutex<HashMap<(IssueType, String, Severity), chrono::DateTime<Utc>>>,
}

impl HealthMonitor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: CheckerRegistry,
        sink: Arc<dyn NotificationSink>,
        config: HealthSection,
    ) -> Self {
        Self {
            store,
            registry,
            sink,
            config,
            last_notified: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Run every registered checker concurrently, bounded by a semaphore,
    /// and apply the dedup/resolution lifecycle to each result.
    pub async fn sweep(&self) -> anyhow::Result<()> {
        let semaphore = Arc::new(Semaphore::new(DEFAULT_CHECKER_CONCURRENCY));
        let mut handles = Vec::new();

        for checker in self.registry.checkers.values() {
            let permit = Arc::clone(&semaphore);
            let name = checker.name().to_string();
            // Checkers are borrowed for the lifetime of the sweep; run them
            // inline under the semaphore rather than spawning, since most
            // are short I/O calls and the registry itself isn't `'static`.
            let _permit = permit.acquire_owned().await.ok();
            let timeout = Duration::from_secs(self.config.external_service_timeout_secs.max(1));
            let execution = match tokio::time::timeout(timeout, checker.check()).await {
                Ok(execution) => execution,
                Err(_) => HealthExecution {
                    issue_type: IssueType::ExternalService,
                    source: name.clone(),
                    status: HealthStatus::Unhealthy,
                    message: format!("checker {name} timed out"),
                    details: serde_json::json!({}),
                    duration_ms: timeout.as_millis() as i64,
                },
            };
            handles.push(execution);
        }

        for execution in handles {
            if let Err(e) = self.apply_execution(execution).await {
                tracing::warn!(error = %e, "failed to apply health checker result");
            }
        }

        Ok(())
    }

    async fn apply_execution(&self, execution: HealthExecution) -> anyhow::Result<()> {
        match execution.status.severity() {
            None => {
                // Healthy: resolve whatever this (type, source) previously had
                // open, regardless of the healthy message's own text -- it
                // describes the recovered state, not the problem that was
                // recorded, so it never shares a signature with it.
                if let Some(resolved) = self
                    .store
                    .resolve_by_key(execution.issue_type, &execution.source)
                    .await?
                {
                    self.sink.notify(&resolved, true).await;
                }
            }
            Some(severity) => {
                let signature = signature_for(&execution.message);
                let issue = self
                    .store
                    .upsert_issue(
                        execution.issue_type,
                        &execution.source,
                        &signature,
                        severity,
                        &execution.message,
                        execution.details.clone(),
                        None,
                    )
                    .await?;

                if issue.is_dismissed {
                    return Ok(());
                }

                self.maybe_notify(&issue).await;
            }
        }

        Ok(())
    }

    /// Debounce notification per `(type, source, severity)`: the first
    /// crossing into warning-or-worse always fires; subsequent re-checks of
    /// the same severity are throttled to at most once per
    /// `throttle_minutes`.
    async fn maybe_notify(&self, issue: &HealthIssue) {
        if issue.severity == Severity::Critical && !self.config.notify_critical_issues {
            return;
        }
        if issue.severity == Severity::Warning && !self.config.notify_warning_issues {
            return;
        }

        let key = (issue.issue_type, issue.source.clone(), issue.severity);
        let now = Utc::now();
        let throttle = chrono::Duration::minutes(self.config.throttle_minutes as i64);

        let mut guard = self.last_notified.lock().await;
        let should_notify = match guard.get(&key) {
            Some(last) => now - *last >= throttle,
            None => true,
        };

        if should_notify {
            guard.insert(key, now);
            drop(guard);
            self.sink.notify(issue, false).await;
        }
    }

    /// Sample current performance metrics into the store. Called once per
    /// minute by the caller's ticker.
    pub async fn sample_performance(&self, fields: NewMetric) -> anyhow::Result<()> {
        self.store.insert_metric(fields).await?;
        Ok(())
    }

    /// Delete metric rows older than `metrics_retention_days`.
    pub async fn retain_metrics(&self) -> anyhow::Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.metrics_retention_days);
        self.store.delete_metrics_before(cutoff).await
    }
}

/// Normalizes a checker message into a dedup key by collapsing every run of
/// digits (elapsed milliseconds, byte counts, percentages, timestamps) into a
/// single placeholder, so two polls of the same underlying problem with
/// different live numbers still produce the same signature.
fn signature_for(message: &str) -> String {
    let mut signature = String::with_capacity(message.len());
    let mut chars = message.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch.is_ascii_digit() {
            signature.push('#');
            while matches!(chars.peek(), Some(c) if c.is_ascii_digit() || *c == '.') {
                chars.next();
            }
        } else {
            signature.push(ch);
        }
    }
    signature
}

// ---------------------------------------------------------------------------
// Built-in checkers
// ---------------------------------------------------------------------------

/// Verifies the database is reachable within `database_timeout_threshold`,
/// warning once latency crosses three quarters of the threshold.
pub struct DatabaseChecker {
    pool: sqlx::PgPool,
    timeout: Duration,
}

impl DatabaseChecker {
    pub fn new(pool: sqlx::PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait]
impl Checker for DatabaseChecker {
    fn name(&self) -> &str {
        "database"
    }

    async fn check(&self) -> HealthExecution {
        let start = std::time::Instant::now();
        let result = tokio::time::timeout(self.timeout, sqlx::query("SELECT 1").execute(&self.pool)).await;
        let elapsed = start.elapsed();
        let elapsed_ms = elapsed.as_millis() as i64;

        let warn_at = self.timeout.mul_f64(0.75);

        let status = match result {
            Ok(Ok(_)) if elapsed >= warn_at => HealthStatus::Warning,
            Ok(Ok(_)) => HealthStatus::Healthy,
            Ok(Err(_)) | Err(_) => HealthStatus::Critical,
        };

        let message = match status {
            HealthStatus::Healthy => "database responded".to_string(),
            HealthStatus::Warning => format!("database latency {elapsed_ms}ms approaching timeout"),
            _ => "database unreachable".to_string(),
        };

        HealthExecution {
            issue_type: IssueType::Database,
            source: "database".to_string(),
            status,
            message,
            details: serde_json::json!({"latency_ms": elapsed_ms}),
            duration_ms: elapsed_ms,
        }
    }
}

/// Checks free disk space on a monitored root folder against the
/// configured warning/critical thresholds, in bytes.
pub struct DiskSpaceChecker {
    path: PathBuf,
    warning_threshold_bytes: i64,
    critical_threshold_bytes: i64,
}

impl DiskSpaceChecker {
    pub fn new(path: PathBuf, warning_threshold_bytes: i64, critical_threshold_bytes: i64) -> Self {
        Self {
            path,
            warning_threshold_bytes,
            critical_threshold_bytes,
        }
    }
}

#[async_trait]
impl Checker for DiskSpaceChecker {
    fn name(&self) -> &str {
        "diskSpace"
    }

    async fn check(&self) -> HealthExecution {
        let start = std::time::Instant::now();
        let disks = Disks::new_with_refreshed_list();
        let free_bytes = disks
            .iter()
            .filter(|d| self.path.starts_with(d.mount_point()))
            .map(|d| d.available_space() as i64)
            .max()
            .unwrap_or(0);

        let status = if free_bytes <= self.critical_threshold_bytes {
            HealthStatus::Critical
        } else if free_bytes <= self.warning_threshold_bytes {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        let free_gb = free_bytes as f64 / (1024.0 * 1024.0 * 1024.0);
        let message = format!("{free_gb:.0} GB free");

        HealthExecution {
            issue_type: IssueType::DiskSpace,
            source: self.path.display().to_string(),
            status,
            message,
            details: serde_json::json!({"free_bytes": free_bytes}),
            duration_ms: start.elapsed().as_millis() as i64,
        }
    }
}

/// Verifies a monitored root folder exists and is writable.
pub struct RootFolderChecker {
    path: PathBuf,
}

impl RootFolderChecker {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl Checker for RootFolderChecker {
    fn name(&self) -> &str {
        "rootFolder"
    }

    async fn check(&self) -> HealthExecution {
        let start = std::time::Instant::now();
        let status = if !self.path.exists() {
            HealthStatus::Critical
        } else {
            let probe = self.path.join(".taskcore_write_probe");
            match std::fs::write(&probe, b"") {
                Ok(()) => {
                    let _ = std::fs::remove_file(&probe);
                    HealthStatus::Healthy
                }
                Err(_) => HealthStatus::Unhealthy,
            }
        };

        let message = match status {
            HealthStatus::Healthy => "root folder writable".to_string(),
            HealthStatus::Critical => "root folder missing".to_string(),
            _ => "root folder not writable".to_string(),
        };

        HealthExecution {
            issue_type: IssueType::RootFolder,
            source: self.path.display().to_string(),
            status,
            message,
            details: serde_json::json!({}),
            duration_ms: start.elapsed().as_millis() as i64,
        }
    }
}

/// CPU/memory pressure checker, thresholds matching the documented
/// defaults (cpu warn 80%/critical 95%, memory warn 85%/critical 95%).
pub struct SystemResourcesChecker {
    cpu_warn: f32,
    cpu_critical: f32,
    mem_warn: f32,
    mem_critical: f32,
}

impl Default for SystemResourcesChecker {
    fn default() -> Self {
        Self {
            cpu_warn: 80.0,
            cpu_critical: 95.0,
            mem_warn: 85.0,
            mem_critical: 95.0,
        }
    }
}

#[async_trait]
impl Checker for SystemResourcesChecker {
    fn name(&self) -> &str {
        "systemResources"
    }

    async fn check(&self) -> HealthExecution {
        let start = std::time::Instant::now();
        let mut system = System::new_all();
        system.refresh_cpu_usage();
        system.refresh_memory();

        let cpu_percent = system.global_cpu_usage();
        let mem_percent = if system.total_memory() > 0 {
            (system.used_memory() as f64 / system.total_memory() as f64 * 100.0) as f32
        } else {
            0.0
        };

        let status = if cpu_percent >= self.cpu_critical || mem_percent >= self.mem_critical {
            HealthStatus::Critical
        } else if cpu_percent >= self.cpu_warn || mem_percent >= self.mem_warn {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        let message = format!("cpu {cpu_percent:.0}%, memory {mem_percent:.0}%");

        HealthExecution {
            issue_type: IssueType::SystemResources,
            source: "system".to_string(),
            status,
            message,
            details: serde_json::json!({"cpu_percent": cpu_percent, "memory_percent": mem_percent}),
            duration_ms: start.elapsed().as_millis() as i64,
        }
    }
}

/// Probes an external HTTP dependency with a bounded timeout.
pub struct ExternalServiceChecker {
    name: String,
    url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl ExternalServiceChecker {
    pub fn new(name: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl Checker for ExternalServiceChecker {
    fn name(&self) -> &str {
        "externalService"
    }

    async fn check(&self) -> HealthExecution {
        let start = std::time::Instant::now();
        let result = self.client.get(&self.url).timeout(self.timeout).send().await;
        let elapsed_ms = start.elapsed().as_millis() as i64;

        let status = match result {
            Ok(resp) if resp.status().is_success() => HealthStatus::Healthy,
            Ok(resp) => {
                tracing::debug!(status = %resp.status(), service = %self.name, "external service returned non-success");
                HealthStatus::Unhealthy
            }
            Err(_) => HealthStatus::Unhealthy,
        };

        let message = match status {
            HealthStatus::Healthy => format!("{} reachable", self.name),
            _ => format!("{} unreachable", self.name),
        };

        HealthExecution {
            issue_type: IssueType::ExternalService,
            source: self.name.clone(),
            status,
            message,
            details: serde_json::json!({"url": self.url}),
            duration_ms: elapsed_ms,
        }
    }
}

/// Watches for a sustained regression in recent performance samples, e.g.
/// database or API latency trending upward over the last few minutes.
pub struct PerformanceChecker {
    store: Arc<dyn TaskStore>,
}

impl PerformanceChecker {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Checker for PerformanceChecker {
    fn name(&self) -> &str {
        "performance"
    }

    async fn check(&self) -> HealthExecution {
        let start = std::time::Instant::now();
        let recent = self.store.last_n_metrics(10).await.unwrap_or_default();

        let status = if recent.len() < 2 {
            HealthStatus::Healthy
        } else {
            let avg_db_latency: f64 =
                recent.iter().map(|m| m.database_latency_ms).sum::<f64>() / recent.len() as f64;
            if avg_db_latency > 1000.0 {
                HealthStatus::Warning
            } else {
                HealthStatus::Healthy
            }
        };

        let message = match status {
            HealthStatus::Healthy => "performance nominal".to_string(),
            _ => "database latency trending upward".to_string(),
        };

        HealthExecution {
            issue_type: IssueType::Performance,
            source: "performance".to_string(),
            status,
            message,
            details: serde_json::json!({}),
            duration_ms: start.elapsed().as_millis() as i64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_normalizes_embedded_numbers() {
        assert_eq!(signature_for("3 GB free"), "# GB free");
        assert_eq!(signature_for("10 GB free"), "# GB free");
        assert_eq!(
            signature_for("database latency 37ms approaching timeout"),
            signature_for("database latency 812ms approaching timeout")
        );
        assert_eq!(
            signature_for("cpu 83.5%, memory 91%"),
            signature_for("cpu 79%, memory 88.2%")
        );
    }

    #[tokio::test]
    async fn root_folder_checker_flags_missing_path() {
        let checker = RootFolderChecker::new(PathBuf::from("/nonexistent/taskcore/root"));
        let execution = checker.check().await;
        assert_eq!(execution.status, HealthStatus::Critical);
    }

    #[tokio::test]
    async fn root_folder_checker_passes_for_writable_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let checker = RootFolderChecker::new(dir.path().to_path_buf());
        let execution = checker.check().await;
        assert_eq!(execution.status, HealthStatus::Healthy);
    }

    #[test]
    fn default_system_thresholds_match_documented_values() {
        let checker = SystemResourcesChecker::default();
        assert_eq!(checker.cpu_warn, 80.0);
        assert_eq!(checker.cpu_critical, 95.0);
        assert_eq!(checker.mem_warn, 85.0);
        assert_eq!(checker.mem_critical, 95.0);
    }
}
