use thiserror::Error;

/// Errors produced while parsing or evaluating a cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    /// Malformed cron syntax. Detected at parse time.
    #[error("Invalid cron field '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    /// Calendar arithmetic could not produce an instant (e.g. nothing matches
    /// within the search horizon).
    #[error("Invalid date: {0}")]
    InvalidDate(String),
}

impl CronError {
    pub(crate) fn field(field: &str, reason: impl Into<String>) -> Self {
        CronError::InvalidField {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The cron expression could not be parsed or evaluated.
    #[error(transparent)]
    Cron(#[from] CronError),

    /// The provided schedule definition is invalid.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The timezone name is not a known IANA zone.
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
