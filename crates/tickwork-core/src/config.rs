use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_SLEEP_CHUNK_MS: u64 = 250; // corrective cron sleep granularity
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100; // pause / overrun-wait polling
pub const DEFAULT_CALENDAR_RETRY_MS: u64 = 1_000; // back-off after an InvalidDate
pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const DEFAULT_SHELL: &str = "sh";
pub const ENV_PREFIX: &str = "TICKWORK_";

/// Top-level config (tickwork.toml + TICKWORK_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickworkConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
}

/// Timing knobs for the scheduling engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound of a single sleep while waiting for a cron instant.
    /// Override with env var: TICKWORK_ENGINE__SLEEP_CHUNK_MS=100
    #[serde(default = "default_sleep_chunk_ms")]
    pub sleep_chunk_ms: u64,
    /// Polling cadence while a job is paused or waiting out an overrun.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Delay before recomputing a schedule whose next instant could not be found.
    #[serde(default = "default_calendar_retry_ms")]
    pub calendar_retry_ms: u64,
}

impl EngineConfig {
    pub fn sleep_chunk(&self) -> Duration {
        Duration::from_millis(self.sleep_chunk_ms.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn calendar_retry(&self) -> Duration {
        Duration::from_millis(self.calendar_retry_ms.max(1))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sleep_chunk_ms: DEFAULT_SLEEP_CHUNK_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            calendar_retry_ms: DEFAULT_CALENDAR_RETRY_MS,
        }
    }
}

/// Settings for the `tickwork` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// IANA zone used by daily/cron jobs that do not name their own.
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
    /// Shell used to run job commands (`<shell> -c <command>`).
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Kill a job command that runs longer than this. `None` means no limit.
    #[serde(default)]
    pub command_timeout_secs: Option<u64>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            default_timezone: default_timezone(),
            shell: default_shell(),
            command_timeout_secs: None,
        }
    }
}

/// A job declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub schedule: ScheduleSpec,
    /// Shell command executed on every firing.
    pub command: String,
    #[serde(default)]
    pub on_error: ErrorPolicyKind,
    /// Back-off used when `on_error = "retry"`.
    #[serde(default)]
    pub retry_backoff_secs: Option<u64>,
    #[serde(default)]
    pub on_overrun: OverrunPolicy,
    /// Stop after this many firings. `None` means unlimited.
    #[serde(default)]
    pub max_runs: Option<u64>,
}

/// Serialised schedule definition, e.g. `{ kind = "cron", expression = "0 */5 * * * *" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Repeat every N seconds.
    Interval { every_secs: u64 },

    /// Fire at HH:MM every day in `timezone` (daemon default when absent).
    Daily {
        hour: u8,
        minute: u8,
        #[serde(default)]
        timezone: Option<String>,
    },

    /// Five- or six-field cron expression evaluated in `timezone`.
    Cron {
        expression: String,
        #[serde(default)]
        timezone: Option<String>,
    },
}

/// What happens when a job is due while its previous firing is still running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrunPolicy {
    /// Drop the tick and move on to the following one.
    #[default]
    Skip,
    /// Hold the tick until the running execution finishes, then fire.
    Wait,
    /// Fire anyway; executions of the same job run concurrently.
    Overlap,
}

/// Config-file spelling of the engine's error policy (the back-off lives in
/// [`JobSpec::retry_backoff_secs`]).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicyKind {
    #[default]
    Ignore,
    Stop,
    Retry,
}

fn default_sleep_chunk_ms() -> u64 {
    DEFAULT_SLEEP_CHUNK_MS
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_calendar_retry_ms() -> u64 {
    DEFAULT_CALENDAR_RETRY_MS
}
fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}
fn default_shell() -> String {
    DEFAULT_SHELL.to_string()
}

impl TickworkConfig {
    /// Load config from a TOML file with TICKWORK_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.tickwork/tickwork.toml
    ///
    /// A missing file is not an error; every section has defaults.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        debug!(%path, "loading config");

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    /// Parse config from an in-memory TOML document (no env overrides).
    pub fn from_toml_str(toml: &str) -> crate::error::Result<Self> {
        Self::from_figment(Figment::new().merge(Toml::string(toml)))
    }

    fn from_figment(figment: Figment) -> crate::error::Result<Self> {
        figment
            .extract()
            .map_err(|e| crate::error::TickworkError::Config(e.to_string()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tickwork/tickwork.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = TickworkConfig::from_toml_str("").unwrap();
        assert_eq!(config.engine.sleep_chunk_ms, DEFAULT_SLEEP_CHUNK_MS);
        assert_eq!(config.engine.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.daemon.default_timezone, "UTC");
        assert_eq!(config.daemon.shell, "sh");
        assert!(config.jobs.is_empty());
    }

    #[test]
    fn parses_job_table() {
        let toml = r#"
            [engine]
            sleep_chunk_ms = 50

            [[jobs]]
            name = "heartbeat"
            command = "echo alive"
            schedule = { kind = "interval", every_secs = 30 }

            [[jobs]]
            name = "report"
            command = "./report.sh"
            on_error = "retry"
            retry_backoff_secs = 10
            on_overrun = "wait"
            max_runs = 3

            [jobs.schedule]
            kind = "cron"
            expression = "0 0 9 * * MON-FRI"
            timezone = "Europe/Berlin"

            [[jobs]]
            name = "nightly"
            command = "true"
            schedule = { kind = "daily", hour = 2, minute = 30 }
        "#;
        let config = TickworkConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.engine.sleep_chunk(), Duration::from_millis(50));
        assert_eq!(config.jobs.len(), 3);

        let heartbeat = &config.jobs[0];
        assert_eq!(heartbeat.schedule, ScheduleSpec::Interval { every_secs: 30 });
        assert_eq!(heartbeat.on_error, ErrorPolicyKind::Ignore);
        assert_eq!(heartbeat.on_overrun, OverrunPolicy::Skip);

        let report = &config.jobs[1];
        assert_eq!(report.on_error, ErrorPolicyKind::Retry);
        assert_eq!(report.retry_backoff_secs, Some(10));
        assert_eq!(report.on_overrun, OverrunPolicy::Wait);
        assert_eq!(report.max_runs, Some(3));
        match &report.schedule {
            ScheduleSpec::Cron {
                expression,
                timezone,
            } => {
                assert_eq!(expression, "0 0 9 * * MON-FRI");
                assert_eq!(timezone.as_deref(), Some("Europe/Berlin"));
            }
            other => panic!("expected cron schedule, got {other:?}"),
        }

        assert_eq!(
            config.jobs[2].schedule,
            ScheduleSpec::Daily {
                hour: 2,
                minute: 30,
                timezone: None
            }
        );
    }

    #[test]
    fn unknown_schedule_kind_is_a_config_error() {
        let toml = r#"
            [[jobs]]
            name = "bad"
            command = "true"
            schedule = { kind = "weekly", day = 1 }
        "#;
        let err = TickworkConfig::from_toml_str(toml).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn zero_durations_are_clamped() {
        let engine = EngineConfig {
            sleep_chunk_ms: 0,
            poll_interval_ms: 0,
            calendar_retry_ms: 0,
        };
        assert_eq!(engine.sleep_chunk(), Duration::from_millis(1));
        assert_eq!(engine.poll_interval(), Duration::from_millis(1));
        assert_eq!(engine.calendar_retry(), Duration::from_millis(1));
    }
}
