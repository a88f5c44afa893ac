//! Runtime configuration and well-known paths.
//!
//! Everything lives under `~/.cabinet`. The config file is optional; a missing
//! file (or a missing section/key) falls back to the defaults below.

use chrono::Duration;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::lifecycle::{LoanPolicy, DEFAULT_LOAN_HOURS, DEFAULT_REMINDER_WINDOW_HOURS};

const CABINET_DIR_NAME: &str = ".cabinet";
const CONFIG_FILE_NAME: &str = "cabinetd.toml";
const SOCKET_NAME: &str = "cabinetd.sock";
const SPOOL_FILE_NAME: &str = "outbox.jsonl";

pub const DEFAULT_REMINDER_INTERVAL_SECS: u64 = 30 * 60;
pub const DEFAULT_OVERDUE_INTERVAL_SECS: u64 = 4 * 60 * 60;
pub const DEFAULT_MAX_ACTIVE_USERS: usize = 4;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_EVICTION_INTERVAL_SECS: u64 = 5 * 60;
pub const DEFAULT_ADMIN_EMAIL: &str = "admin@localhost";

const MAX_LOAN_HOURS: i64 = 24 * 365;
const MAX_IDLE_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LifecycleConfig {
    #[serde(default = "default_loan_hours")]
    pub loan_hours: i64,
    #[serde(default = "default_reminder_window_hours")]
    pub reminder_window_hours: i64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            loan_hours: default_loan_hours(),
            reminder_window_hours: default_reminder_window_hours(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SweepConfig {
    #[serde(default = "default_reminder_interval_secs")]
    pub reminder_interval_secs: u64,
    #[serde(default = "default_overdue_interval_secs")]
    pub overdue_interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            reminder_interval_secs: default_reminder_interval_secs(),
            overdue_interval_secs: default_overdue_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SessionsConfig {
    #[serde(default = "default_max_active_users")]
    pub max_active_users: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_active_users: default_max_active_users(),
            idle_timeout_secs: default_idle_timeout_secs(),
            eviction_interval_secs: default_eviction_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct NotifyConfig {
    #[serde(default = "default_admin_email")]
    pub admin_email: String,
    /// Defaults to `~/.cabinet/outbox.jsonl`.
    #[serde(default)]
    pub spool_path: Option<PathBuf>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            admin_email: default_admin_email(),
            spool_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct CabinetConfig {
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl CabinetConfig {
    /// Hour values outside `1..=MAX_LOAN_HOURS` fall back to the defaults
    /// rather than producing loans that are due on creation or never.
    pub fn policy(&self) -> LoanPolicy {
        LoanPolicy {
            loan_duration: bounded_hours(
                "loan_hours",
                self.lifecycle.loan_hours,
                DEFAULT_LOAN_HOURS,
            ),
            reminder_window: bounded_hours(
                "reminder_window_hours",
                self.lifecycle.reminder_window_hours,
                DEFAULT_REMINDER_WINDOW_HOURS,
            ),
        }
    }

    /// Zero or oversized timeouts fall back to the default.
    pub fn idle_timeout(&self) -> Duration {
        let secs = self.sessions.idle_timeout_secs;
        if secs == 0 || secs > MAX_IDLE_TIMEOUT_SECS {
            tracing::warn!(
                idle_timeout_secs = secs,
                fallback = DEFAULT_IDLE_TIMEOUT_SECS,
                "Idle timeout out of range; using default"
            );
            return Duration::seconds(DEFAULT_IDLE_TIMEOUT_SECS as i64);
        }
        Duration::try_seconds(secs as i64)
            .unwrap_or_else(|| Duration::seconds(DEFAULT_IDLE_TIMEOUT_SECS as i64))
    }

    pub fn spool_path(&self, cabinet_dir: &Path) -> PathBuf {
        self.notify
            .spool_path
            .clone()
            .unwrap_or_else(|| cabinet_dir.join(SPOOL_FILE_NAME))
    }
}

fn bounded_hours(field: &str, value: i64, fallback: i64) -> Duration {
    let hours = if value > 0 && value <= MAX_LOAN_HOURS {
        value
    } else {
        tracing::warn!(field, value, fallback, "Config hours out of range; using default");
        fallback
    };
    Duration::try_hours(hours).unwrap_or_else(|| Duration::hours(fallback))
}

fn default_loan_hours() -> i64 {
    DEFAULT_LOAN_HOURS
}

fn default_reminder_window_hours() -> i64 {
    DEFAULT_REMINDER_WINDOW_HOURS
}

fn default_reminder_interval_secs() -> u64 {
    DEFAULT_REMINDER_INTERVAL_SECS
}

fn default_overdue_interval_secs() -> u64 {
    DEFAULT_OVERDUE_INTERVAL_SECS
}

fn default_max_active_users() -> usize {
    DEFAULT_MAX_ACTIVE_USERS
}

fn default_idle_timeout_secs() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

fn default_eviction_interval_secs() -> u64 {
    DEFAULT_EVICTION_INTERVAL_SECS
}

fn default_admin_email() -> String {
    DEFAULT_ADMIN_EMAIL.to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Paths
// ─────────────────────────────────────────────────────────────────────────────

/// Returns `~/.cabinet`.
pub fn cabinet_dir() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(CABINET_DIR_NAME))
}

pub fn socket_path() -> Result<PathBuf, String> {
    Ok(cabinet_dir()?.join(SOCKET_NAME))
}

pub fn db_path() -> Result<PathBuf, String> {
    Ok(cabinet_dir()?.join("data").join("cabinet.db"))
}

pub fn default_config_path() -> Result<PathBuf, String> {
    Ok(cabinet_dir()?.join(CONFIG_FILE_NAME))
}

pub fn load_config(path: Option<PathBuf>) -> Result<CabinetConfig, String> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(CabinetConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|err| {
        format!(
            "Failed to read cabinet config {}: {}",
            config_path.display(),
            err
        )
    })?;
    toml::from_str::<CabinetConfig>(&content).map_err(|err| {
        format!(
            "Failed to parse cabinet config {}: {}",
            config_path.display(),
            err
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_config_defaults_when_file_missing() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let config =
            load_config(Some(temp_dir.path().join("missing.toml"))).expect("load config");
        assert_eq!(config, CabinetConfig::default());
        assert_eq!(config.policy(), LoanPolicy::default());
        assert_eq!(config.sessions.max_active_users, 4);
        assert_eq!(config.sweep.reminder_interval_secs, 1800);
        assert_eq!(config.sweep.overdue_interval_secs, 14400);
    }

    #[test]
    fn load_config_merges_partial_sections() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("cabinetd.toml");
        fs_err::write(
            &path,
            r#"
[lifecycle]
loan_hours = 48

[sessions]
max_active_users = 2

[notify]
admin_email = "lab-admin@example.com"
spool_path = "/tmp/cabinet-outbox.jsonl"
"#,
        )
        .expect("write config");

        let config = load_config(Some(path)).expect("load config");
        assert_eq!(config.policy().loan_duration, Duration::hours(48));
        assert_eq!(config.policy().reminder_window, Duration::hours(2));
        assert_eq!(config.sessions.max_active_users, 2);
        assert_eq!(config.sessions.idle_timeout_secs, 1800);
        assert_eq!(config.notify.admin_email, "lab-admin@example.com");
        assert_eq!(
            config.spool_path(temp_dir.path()),
            PathBuf::from("/tmp/cabinet-outbox.jsonl")
        );
    }

    #[test]
    fn load_config_reports_parse_errors() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("cabinetd.toml");
        fs_err::write(&path, "[lifecycle]\nloan_hours = \"soon\"\n").expect("write config");
        let err = load_config(Some(path)).unwrap_err();
        assert!(err.contains("Failed to parse cabinet config"));
    }

    #[test]
    fn non_positive_hours_fall_back_to_defaults() {
        let mut config = CabinetConfig::default();
        config.lifecycle.loan_hours = 0;
        config.lifecycle.reminder_window_hours = -3;
        assert_eq!(config.policy(), LoanPolicy::default());
    }

    #[test]
    fn oversized_durations_fall_back_to_defaults() {
        let mut config = CabinetConfig::default();
        config.lifecycle.loan_hours = i64::MAX / 1000;
        config.lifecycle.reminder_window_hours = i64::MAX;
        config.sessions.idle_timeout_secs = u64::MAX;
        assert_eq!(config.policy(), LoanPolicy::default());
        assert_eq!(config.idle_timeout(), Duration::seconds(1800));

        config.lifecycle.loan_hours = 24 * 365;
        assert_eq!(config.policy().loan_duration, Duration::hours(24 * 365));
    }

    #[test]
    fn spool_defaults_under_cabinet_dir() {
        let config = CabinetConfig::default();
        let dir = PathBuf::from("/home/lab/.cabinet");
        assert_eq!(config.spool_path(&dir), dir.join("outbox.jsonl"));
    }
}
