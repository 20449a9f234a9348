//! CLI-facing configuration loading.
//!
//! All resolution logic (CLI flag > env var > config file > default)
//! lives in [`core_engine::config::CoreConfig`]; this module only adds the
//! `taskd init` convenience of writing a starter config file to the XDG
//! config path.

use std::path::PathBuf;

use anyhow::{Context, Result};

pub use core_engine::config::CoreConfig;

const TEMPLATE: &str = r#"# database_url = "postgresql://localhost:5432/taskcore"

[task_pools.high-priority]
max_workers = 2

[task_pools.default]
max_workers = 3

[task_pools.background]
max_workers = 1

task_retention_days = 30

[health]
interval_secs = 900
disk_space_warning_threshold_bytes = 5368709120
disk_space_critical_threshold_bytes = 1073741824
database_timeout_secs = 5
external_service_timeout_secs = 10
metrics_retention_days = 30
notify_critical_issues = true
notify_warning_issues = true
throttle_minutes = 60
"#;

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

/// Write the starter config file if one does not already exist. Returns the
/// path written (or the existing path, untouched).
pub fn init_config_file() -> Result<PathBuf> {
    let path = config_path()?;
    if path.exists() {
        return Ok(path);
    }

    let dir = config_dir()?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    std::fs::write(&path, TEMPLATE)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_writes_parseable_toml() {
        let parsed: toml::Value = toml::from_str(TEMPLATE).unwrap();
        assert!(parsed.get("task_pools").is_some());
        assert!(parsed.get("health").is_some());
    }
}
