//! Turns `[[jobs]]` config entries into engine jobs.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use tickwork_core::config::{DaemonConfig, ErrorPolicyKind, JobSpec, ScheduleSpec};
use tickwork_core::{TickworkConfig, TickworkError};
use tickwork_scheduler::{parse_timezone, CronError, ErrorPolicy, Job, Schedule};

use crate::command::ShellCommand;

/// Build every configured job. Job names must be unique.
pub fn build_jobs(config: &TickworkConfig) -> tickwork_core::Result<Vec<Job>> {
    let mut seen = HashSet::new();
    config
        .jobs
        .iter()
        .map(|spec| {
            if !seen.insert(spec.name.as_str()) {
                return Err(invalid(spec, "duplicate job name"));
            }
            build_job(spec, &config.daemon)
        })
        .collect()
}

pub fn build_job(spec: &JobSpec, daemon: &DaemonConfig) -> tickwork_core::Result<Job> {
    let default_tz = parse_timezone(&daemon.default_timezone)
        .map_err(|e| TickworkError::Config(format!("daemon.default_timezone: {e}")))?;
    let schedule = build_schedule(&spec.schedule, default_tz).map_err(|e| invalid(spec, e))?;

    let command = ShellCommand::new(
        daemon.shell.as_str(),
        spec.command.as_str(),
        daemon.command_timeout_secs.map(Duration::from_secs),
    );

    let mut job = Job::with_action(schedule, command.into_action())
        .with_name(spec.name.as_str())
        .with_error_policy(error_policy(spec)?)
        .with_overrun_policy(spec.on_overrun);
    if let Some(runs) = spec.max_runs {
        if runs == 0 {
            return Err(invalid(spec, "max_runs must be at least 1"));
        }
        job = job.with_max_runs(runs);
    }
    Ok(job)
}

pub fn build_schedule(spec: &ScheduleSpec, default_tz: Tz) -> tickwork_scheduler::Result<Schedule> {
    let zone = |name: &Option<String>| match name {
        Some(name) => parse_timezone(name),
        None => Ok(default_tz),
    };
    match spec {
        ScheduleSpec::Interval { every_secs } => {
            Schedule::interval(Duration::from_secs(*every_secs))
        }
        ScheduleSpec::Daily {
            hour,
            minute,
            timezone,
        } => Schedule::daily(u32::from(*hour), u32::from(*minute), zone(timezone)?),
        ScheduleSpec::Cron {
            expression,
            timezone,
        } => Schedule::cron(expression, zone(timezone)?),
    }
}

fn error_policy(spec: &JobSpec) -> tickwork_core::Result<ErrorPolicy> {
    Ok(match spec.on_error {
        ErrorPolicyKind::Ignore => ErrorPolicy::Ignore,
        ErrorPolicyKind::Stop => ErrorPolicy::Stop,
        ErrorPolicyKind::Retry => {
            let secs = spec
                .retry_backoff_secs
                .ok_or_else(|| invalid(spec, "on_error = \"retry\" requires retry_backoff_secs"))?;
            ErrorPolicy::retry(Duration::from_secs(secs))
        }
    })
}

/// The next `count` nominal fire instants after `after`.
pub fn upcoming(
    schedule: &Schedule,
    after: DateTime<Utc>,
    count: usize,
) -> Result<Vec<DateTime<Utc>>, CronError> {
    let mut cursor = after;
    let mut instants = Vec::with_capacity(count);
    for _ in 0..count {
        cursor = schedule.next_fire(cursor)?;
        instants.push(cursor);
    }
    Ok(instants)
}

/// Zone a schedule is evaluated in; interval schedules have none.
pub fn schedule_timezone(schedule: &Schedule) -> Option<Tz> {
    match schedule {
        Schedule::Interval(_) => None,
        Schedule::Daily { timezone, .. } => Some(*timezone),
        Schedule::Cron(expr) => Some(expr.timezone()),
    }
}

fn invalid(spec: &JobSpec, reason: impl ToString) -> TickworkError {
    TickworkError::InvalidJob {
        job: spec.name.clone(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tickwork_scheduler::OverrunPolicy;

    fn config(toml: &str) -> TickworkConfig {
        TickworkConfig::from_toml_str(toml).unwrap()
    }

    #[test]
    fn builds_jobs_with_policies() {
        let config = config(
            r#"
            [daemon]
            default_timezone = "Europe/Berlin"

            [[jobs]]
            name = "report"
            command = "true"
            on_error = "retry"
            retry_backoff_secs = 30
            on_overrun = "overlap"
            max_runs = 5
            schedule = { kind = "cron", expression = "0 9 * * MON-FRI" }

            [[jobs]]
            name = "heartbeat"
            command = "true"
            on_error = "stop"
            schedule = { kind = "interval", every_secs = 15 }
            "#,
        );
        let jobs = build_jobs(&config).unwrap();
        assert_eq!(jobs.len(), 2);

        let report = &jobs[0];
        assert_eq!(report.name(), Some("report"));
        assert_eq!(report.error_policy(), ErrorPolicy::retry(Duration::from_secs(30)));
        assert_eq!(report.overrun_policy(), OverrunPolicy::Overlap);
        assert_eq!(report.max_runs(), Some(5));
        assert_eq!(
            schedule_timezone(report.schedule()),
            Some(chrono_tz::Europe::Berlin)
        );

        let heartbeat = &jobs[1];
        assert_eq!(heartbeat.error_policy(), ErrorPolicy::Stop);
        assert_eq!(heartbeat.overrun_policy(), OverrunPolicy::Skip);
        assert_eq!(
            heartbeat.schedule(),
            &Schedule::Interval(Duration::from_secs(15))
        );
        assert_eq!(schedule_timezone(heartbeat.schedule()), None);
    }

    #[test]
    fn job_timezone_overrides_default() {
        let spec = ScheduleSpec::Daily {
            hour: 6,
            minute: 0,
            timezone: Some("Asia/Tokyo".to_string()),
        };
        let schedule = build_schedule(&spec, Tz::UTC).unwrap();
        assert_eq!(schedule_timezone(&schedule), Some(chrono_tz::Asia::Tokyo));
    }

    #[test]
    fn retry_without_backoff_is_rejected() {
        let config = config(
            r#"
            [[jobs]]
            name = "flaky"
            command = "true"
            on_error = "retry"
            schedule = { kind = "interval", every_secs = 5 }
            "#,
        );
        let err = build_jobs(&config).unwrap_err();
        assert_eq!(err.code(), "INVALID_JOB");
        assert!(err.to_string().contains("flaky"));
    }

    #[test]
    fn bad_cron_names_the_job() {
        let config = config(
            r#"
            [[jobs]]
            name = "broken"
            command = "true"
            schedule = { kind = "cron", expression = "0 0 25 * * *" }
            "#,
        );
        let err = build_jobs(&config).unwrap_err();
        assert!(matches!(err, TickworkError::InvalidJob { ref job, .. } if job == "broken"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let config = config(
            r#"
            [[jobs]]
            name = "twice"
            command = "true"
            schedule = { kind = "interval", every_secs = 5 }

            [[jobs]]
            name = "twice"
            command = "true"
            schedule = { kind = "interval", every_secs = 10 }
            "#,
        );
        let err = build_jobs(&config).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn zero_interval_and_zero_runs_are_rejected() {
        let spec = ScheduleSpec::Interval { every_secs: 0 };
        assert!(build_schedule(&spec, Tz::UTC).is_err());

        let config = config(
            r#"
            [[jobs]]
            name = "never"
            command = "true"
            max_runs = 0
            schedule = { kind = "interval", every_secs = 5 }
            "#,
        );
        assert!(build_jobs(&config).is_err());
    }

    #[test]
    fn unknown_default_timezone_is_a_config_error() {
        let config = config(
            r#"
            [daemon]
            default_timezone = "Nowhere/Special"

            [[jobs]]
            name = "x"
            command = "true"
            schedule = { kind = "daily", hour = 1, minute = 0 }
            "#,
        );
        assert_eq!(build_jobs(&config).unwrap_err().code(), "CONFIG_ERROR");
    }

    #[test]
    fn upcoming_chains_instants() {
        let schedule = Schedule::cron("0 0 * * * *", Tz::UTC).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap();
        let next = upcoming(&schedule, after, 3).unwrap();
        assert_eq!(
            next,
            vec![
                Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap(),
            ]
        );

        let impossible = Schedule::cron("0 0 0 31 4 *", Tz::UTC).unwrap();
        assert!(upcoming(&impossible, after, 1).is_err());
    }
}
