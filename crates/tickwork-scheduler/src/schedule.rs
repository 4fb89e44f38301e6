use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

use crate::cron::CronExpression;
use crate::error::{CronError, Result, SchedulerError};

/// Defines when and how often a job should run.
#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
    /// Fixed sleep between firings.
    Interval(Duration),

    /// Every day at `hour:minute` wall-clock time in `timezone`.
    Daily { hour: u32, minute: u32, timezone: Tz },

    /// Cron expression (carries its own timezone).
    Cron(CronExpression),
}

impl Schedule {
    /// Repeat every `every`. Zero is rejected.
    pub fn interval(every: Duration) -> Result<Self> {
        if every.is_zero() {
            return Err(SchedulerError::InvalidSchedule(
                "interval must be greater than zero".to_string(),
            ));
        }
        Ok(Schedule::Interval(every))
    }

    /// Fire every day at `hour:minute` in `timezone`.
    pub fn daily(hour: u32, minute: u32, timezone: Tz) -> Result<Self> {
        if hour > 23 || minute > 59 {
            return Err(SchedulerError::InvalidSchedule(format!(
                "daily time {hour:02}:{minute:02} is not a valid wall-clock time"
            )));
        }
        Ok(Schedule::Daily {
            hour,
            minute,
            timezone,
        })
    }

    /// Parse a five- or six-field cron expression. Syntax errors surface here,
    /// before the job is ever scheduled.
    pub fn cron(expression: &str, timezone: Tz) -> Result<Self> {
        Ok(Schedule::Cron(CronExpression::parse(expression, timezone)?))
    }

    /// Short label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Schedule::Interval(_) => "interval",
            Schedule::Daily { .. } => "daily",
            Schedule::Cron(_) => "cron",
        }
    }

    /// Cron schedules are driven by an anchor instead of a plain sleep.
    pub fn as_cron(&self) -> Option<&CronExpression> {
        match self {
            Schedule::Cron(expr) => Some(expr),
            _ => None,
        }
    }

    /// How long to sleep from `now` until the next firing.
    ///
    /// Interval schedules return the interval unconditionally; daily schedules
    /// the gap to today's occurrence if it is still ahead, else tomorrow's.
    pub fn sleep_duration(&self, now: DateTime<Utc>) -> std::result::Result<Duration, CronError> {
        match self {
            Schedule::Interval(every) => Ok(*every),
            _ => {
                let next = self.next_fire(now)?;
                Ok((next - now).to_std().unwrap_or(Duration::ZERO))
            }
        }
    }

    /// Next nominal firing strictly after `after`.
    pub fn next_fire(&self, after: DateTime<Utc>) -> std::result::Result<DateTime<Utc>, CronError> {
        match self {
            Schedule::Interval(every) => chrono::Duration::from_std(*every)
                .ok()
                .and_then(|every| after.checked_add_signed(every))
                .ok_or_else(|| CronError::InvalidDate(format!("interval {every:?} overflows"))),
            Schedule::Daily {
                hour,
                minute,
                timezone,
            } => next_daily(*hour, *minute, *timezone, after),
            Schedule::Cron(expr) => expr.next_date(after),
        }
    }
}

/// Resolve an IANA timezone name such as `"Europe/Berlin"`.
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| SchedulerError::InvalidTimezone(name.to_string()))
}

fn next_daily(
    hour: u32,
    minute: u32,
    timezone: Tz,
    now: DateTime<Utc>,
) -> std::result::Result<DateTime<Utc>, CronError> {
    let today = now.with_timezone(&timezone).date_naive();
    let candidate = local_instant(timezone, today, hour, minute)?;
    if candidate > now {
        return Ok(candidate);
    }
    // Today's slot has passed.
    let tomorrow = today
        .succ_opt()
        .ok_or_else(|| CronError::InvalidDate(format!("no day after {today}")))?;
    local_instant(timezone, tomorrow, hour, minute)
}

/// `hour:minute` on `date` in `timezone`. A time that falls into a DST gap is
/// pushed forward by an hour; a repeated time takes its first occurrence.
fn local_instant(
    timezone: Tz,
    date: NaiveDate,
    hour: u32,
    minute: u32,
) -> std::result::Result<DateTime<Utc>, CronError> {
    let naive = date
        .and_hms_opt(hour, minute, 0)
        .ok_or_else(|| CronError::InvalidDate(format!("{hour:02}:{minute:02} on {date}")))?;
    timezone
        .from_local_datetime(&naive)
        .earliest()
        .or_else(|| {
            timezone
                .from_local_datetime(&(naive + chrono::Duration::hours(1)))
                .earliest()
        })
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| {
            CronError::InvalidDate(format!("{naive} does not exist in {timezone}"))
        })
}
