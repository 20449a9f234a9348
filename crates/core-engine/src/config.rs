//! Configuration resolution: CLI flag > environment variable > config file
//! > built-in default.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use core_db::config::DbConfig;

const DEFAULT_TASK_RETENTION_DAYS: i64 = 30;
const DEFAULT_METRICS_RETENTION_DAYS: i64 = 30;
const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 900;
const DEFAULT_DISK_WARNING_BYTES: i64 = 5 * 1024 * 1024 * 1024;
const DEFAULT_DISK_CRITICAL_BYTES: i64 = 1 * 1024 * 1024 * 1024;
const DEFAULT_DATABASE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_EXTERNAL_SERVICE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_THROTTLE_MINUTES: u64 = 60;

/// Per-pool worker limits, keyed by pool name (`high-priority`, `default`,
/// `background`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSection {
    pub max_workers: i32,
}

/// Health-monitor thresholds and notification policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub interval_secs: u64,
    pub disk_space_warning_threshold_bytes: i64,
    pub disk_space_critical_threshold_bytes: i64,
    pub database_timeout_secs: u64,
    pub external_service_timeout_secs: u64,
    pub metrics_retention_days: i64,
    pub notify_critical_issues: bool,
    pub notify_warning_issues: bool,
    pub throttle_minutes: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_HEALTH_INTERVAL_SECS,
            disk_space_warning_threshold_bytes: DEFAULT_DISK_WARNING_BYTES,
            disk_space_critical_threshold_bytes: DEFAULT_DISK_CRITICAL_BYTES,
            database_timeout_secs: DEFAULT_DATABASE_TIMEOUT_SECS,
            external_service_timeout_secs: DEFAULT_EXTERNAL_SERVICE_TIMEOUT_SECS,
            metrics_retention_days: DEFAULT_METRICS_RETENTION_DAYS,
            notify_critical_issues: true,
            notify_warning_issues: true,
            throttle_minutes: DEFAULT_THROTTLE_MINUTES,
        }
    }
}

/// The on-disk TOML shape, loaded from `config_path()` if present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct ConfigFile {
    database_url: Option<String>,
    task_pools: HashMap<String, PoolSection>,
    task_timeouts: HashMap<String, u64>,
    task_retention_days: Option<i64>,
    health: Option<HealthSection>,
}

/// Fully resolved runtime configuration for `core-engine`.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub db: DbConfig,
    pub task_pools: HashMap<String, PoolSection>,
    pub task_timeouts: HashMap<String, u64>,
    pub task_retention_days: i64,
    pub health: HealthSection,
}

impl Default for CoreConfig {
    fn default() -> Self {
        let mut task_pools = HashMap::new();
        task_pools.insert("high-priority".to_string(), PoolSection { max_workers: 2 });
        task_pools.insert("default".to_string(), PoolSection { max_workers: 3 });
        task_pools.insert("background".to_string(), PoolSection { max_workers: 1 });

        Self {
            db: DbConfig::default(),
            task_pools,
            task_timeouts: HashMap::new(),
            task_retention_days: DEFAULT_TASK_RETENTION_DAYS,
            health: HealthSection::default(),
        }
    }
}

impl CoreConfig {
    /// Resolve configuration from, in descending priority: an explicit CLI
    /// flag, the `TASKCORE_DATABASE_URL` env var, the config file at
    /// [`config_path`], then the built-in default.
    pub fn resolve(cli_database_url: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(file) = load_config_file()? {
            if let Some(url) = file.database_url {
                config.db.database_url = url;
            }
            for (name, section) in file.task_pools {
                config.task_pools.insert(name, section);
            }
            config.task_timeouts.extend(file.task_timeouts);
            if let Some(days) = file.task_retention_days {
                config.task_retention_days = days;
            }
            if let Some(health) = file.health {
                config.health = health;
            }
        }

        if let Ok(url) = std::env::var("TASKCORE_DATABASE_URL") {
            config.db.database_url = url;
        }

        if let Some(url) = cli_database_url {
            config.db.database_url = url.to_string();
        }

        Ok(config)
    }

    pub fn max_workers_for(&self, pool_name: &str) -> i32 {
        self.task_pools
            .get(pool_name)
            .map(|p| p.max_workers)
            .unwrap_or(1)
    }

    pub fn timeout_for(&self, command: &str) -> std::time::Duration {
        let secs = self.task_timeouts.get(command).copied().unwrap_or(300);
        std::time::Duration::from_secs(secs)
    }
}

/// `$XDG_CONFIG_HOME/taskcore` or `~/.config/taskcore`.
fn config_dir() -> Result<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return Ok(PathBuf::from(xdg).join("taskcore"));
    }
    let home = dirs::home_dir().context("could not determine home directory")?;
    Ok(home.join(".config").join("taskcore"))
}

fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

fn load_config_file() -> Result<Option<ConfigFile>> {
    let path = config_path()?;
    load_config_file_from(&path)
}

fn load_config_file_from(path: &Path) -> Result<Option<ConfigFile>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let parsed: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(Some(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pools_match_seeded_migration() {
        let config = CoreConfig::default();
        assert_eq!(config.max_workers_for("high-priority"), 2);
        assert_eq!(config.max_workers_for("default"), 3);
        assert_eq!(config.max_workers_for("background"), 1);
    }

    #[test]
    fn unknown_pool_falls_back_to_one_worker() {
        let config = CoreConfig::default();
        assert_eq!(config.max_workers_for("nonexistent"), 1);
    }

    #[test]
    fn unknown_command_timeout_falls_back_to_five_minutes() {
        let config = CoreConfig::default();
        assert_eq!(
            config.timeout_for("Unconfigured"),
            std::time::Duration::from_secs(300)
        );
    }

    #[test]
    fn health_defaults_match_documented_thresholds() {
        let health = HealthSection::default();
        assert_eq!(health.interval_secs, 900);
        assert_eq!(health.disk_space_warning_threshold_bytes, 5 * 1024 * 1024 * 1024);
        assert_eq!(health.throttle_minutes, 60);
        assert!(health.notify_critical_issues);
    }

    #[test]
    fn missing_config_file_yields_none() {
        let path = PathBuf::from("/nonexistent/taskcore/config.toml");
        let result = load_config_file_from(&path).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn parses_partial_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            database_url = "postgresql://example/taskcore"

            [task_pools.default]
            max_workers = 7
            "#,
        )
        .unwrap();

        let parsed = load_config_file_from(&path).unwrap().unwrap();
        assert_eq!(
            parsed.database_url.as_deref(),
            Some("postgresql://example/taskcore")
        );
        assert_eq!(parsed.task_pools.get("default").unwrap().max_workers, 7);
    }
}
