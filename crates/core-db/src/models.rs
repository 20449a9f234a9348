use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Priority class of a task. Determines which worker pool it is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl Priority {
    /// The worker pool a priority class is routed to.
    pub fn pool_name(&self) -> &'static str {
        match self {
            Self::High => "high-priority",
            Self::Normal => "default",
            Self::Low => "background",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = PriorityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(PriorityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Priority`] string.
#[derive(Debug, Clone)]
pub struct PriorityParseError(pub String);

impl fmt::Display for PriorityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid priority: {:?}", self.0)
    }
}

impl std::error::Error for PriorityParseError {}

// ---------------------------------------------------------------------------

/// Status of a task. `queued -> started -> (completed|failed|aborted)`, with
/// `cancelling` reachable only from `started` on the way to `aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Started,
    Completed,
    Failed,
    Aborted,
    Cancelling,
}

impl TaskStatus {
    /// Whether this status is terminal (no further transitions are valid).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
            Self::Cancelling => "cancelling",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "started" => Ok(Self::Started),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            "cancelling" => Ok(Self::Cancelling),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Who or what caused a task to be submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Manual,
    Scheduled,
    System,
    Api,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
            Self::System => "system",
            Self::Api => "api",
        };
        f.write_str(s)
    }
}

impl FromStr for Trigger {
    type Err = TriggerParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "scheduled" => Ok(Self::Scheduled),
            "system" => Ok(Self::System),
            "api" => Ok(Self::Api),
            other => Err(TriggerParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Trigger`] string.
#[derive(Debug, Clone)]
pub struct TriggerParseError(pub String);

impl fmt::Display for TriggerParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid trigger: {:?}", self.0)
    }
}

impl std::error::Error for TriggerParseError {}

// ---------------------------------------------------------------------------

/// Category of a health issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum IssueType {
    Database,
    DiskSpace,
    SystemResources,
    RootFolder,
    ExternalService,
    Configuration,
    Network,
    Performance,
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Database => "database",
            Self::DiskSpace => "diskSpace",
            Self::SystemResources => "systemResources",
            Self::RootFolder => "rootFolder",
            Self::ExternalService => "externalService",
            Self::Configuration => "configuration",
            Self::Network => "network",
            Self::Performance => "performance",
        };
        f.write_str(s)
    }
}

impl FromStr for IssueType {
    type Err = IssueTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "database" => Ok(Self::Database),
            "diskSpace" => Ok(Self::DiskSpace),
            "systemResources" => Ok(Self::SystemResources),
            "rootFolder" => Ok(Self::RootFolder),
            "externalService" => Ok(Self::ExternalService),
            "configuration" => Ok(Self::Configuration),
            "network" => Ok(Self::Network),
            "performance" => Ok(Self::Performance),
            other => Err(IssueTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`IssueType`] string.
#[derive(Debug, Clone)]
pub struct IssueTypeParseError(pub String);

impl fmt::Display for IssueTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid issue type: {:?}", self.0)
    }
}

impl std::error::Error for IssueTypeParseError {}

// ---------------------------------------------------------------------------

/// Severity of a health issue or checker execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for Severity {
    type Err = SeverityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            other => Err(SeverityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Severity`] string.
#[derive(Debug, Clone)]
pub struct SeverityParseError(pub String);

impl fmt::Display for SeverityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid severity: {:?}", self.0)
    }
}

impl std::error::Error for SeverityParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task -- one execution record of a submitted command.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub command: String,
    pub body: serde_json::Value,
    pub priority: Priority,
    pub status: TaskStatus,
    pub trigger: Trigger,
    pub progress_percent: i32,
    pub progress_message: Option<String>,
    pub progress_updated_at: Option<DateTime<Utc>>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub deadline_ms: Option<i64>,
    pub scheduled_task_name: Option<String>,
}

impl Task {
    /// Whether this row is in a non-terminal status (queued, started, or
    /// cancelling) -- used by the scheduled-task overlap guard.
    pub fn is_in_flight(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// A recurring task definition, owned exclusively by the planner.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScheduledTask {
    pub name: String,
    pub command: String,
    pub body: serde_json::Value,
    pub interval_ms: i64,
    pub priority: Priority,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A worker pool's live occupancy snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkerPoolRow {
    pub name: String,
    pub max_workers: i32,
    pub active_workers: i32,
    pub queued_depth: i32,
    pub running_depth: i32,
    pub enabled: bool,
}

/// A deduplicated health issue.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct HealthIssue {
    pub id: i64,
    #[sqlx(rename = "issue_type")]
    pub issue_type: IssueType,
    pub source: String,
    pub signature: String,
    pub severity: Severity,
    pub message: String,
    pub details: serde_json::Value,
    pub wiki_url: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub is_resolved: bool,
    pub is_dismissed: bool,
}

/// One sampled row of system/database/queue gauges.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PerformanceMetric {
    pub id: i64,
    pub sampled_at: DateTime<Utc>,
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

/// An audit-trail row: one status transition for a task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskEvent {
    pub id: i64,
    pub task_id: i64,
    pub from_status: Option<TaskStatus>,
    pub to_status: TaskStatus,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_display_roundtrip() {
        for v in [Priority::High, Priority::Normal, Priority::Low] {
            let s = v.to_string();
            let parsed: Priority = s.parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn priority_pool_mapping() {
        assert_eq!(Priority::High.pool_name(), "high-priority");
        assert_eq!(Priority::Normal.pool_name(), "default");
        assert_eq!(Priority::Low.pool_name(), "background");
    }

    #[test]
    fn priority_invalid() {
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Queued,
            TaskStatus::Started,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Aborted,
            TaskStatus::Cancelling,
        ];
        for v in variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn task_status_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Aborted.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Started.is_terminal());
        assert!(!TaskStatus::Cancelling.is_terminal());
    }

    #[test]
    fn task_status_invalid() {
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn trigger_display_roundtrip() {
        for v in [Trigger::Manual, Trigger::Scheduled, Trigger::System, Trigger::Api] {
            let s = v.to_string();
            let parsed: Trigger = s.parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn trigger_invalid() {
        assert!("cron".parse::<Trigger>().is_err());
    }

    #[test]
    fn issue_type_display_roundtrip() {
        let variants = [
            IssueType::Database,
            IssueType::DiskSpace,
            IssueType::SystemResources,
            IssueType::RootFolder,
            IssueType::ExternalService,
            IssueType::Configuration,
            IssueType::Network,
            IssueType::Performance,
        ];
        for v in variants {
            let s = v.to_string();
            let parsed: IssueType = s.parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn issue_type_invalid() {
        assert!("cpu".parse::<IssueType>().is_err());
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
    }

    #[test]
    fn severity_display_roundtrip() {
        for v in [
            Severity::Info,
            Severity::Warning,
            Severity::Error,
            Severity::Critical,
        ] {
            let s = v.to_string();
            let parsed: Severity = s.parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn severity_invalid() {
        assert!("fatal".parse::<Severity>().is_err());
    }
}
