use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a registered job (UUIDv4).
///
/// Compared by value and used as the registry key, so it is `Copy` and cheap
/// to pass around between the control loop and its execution tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a fresh random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// How a job left the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum JobOutcome {
    /// The job reached its run limit.
    Completed,
    /// `cancel` / `cancel_all` was called.
    Cancelled,
    /// The action failed under the `stop` error policy.
    Failed { error: String },
}

/// Lifecycle state of a job as seen by callers and state sinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    /// Registered but its loop has not started yet, or no longer registered.
    Idle,
    /// Loop alive, waiting for the next due time.
    Running,
    /// At least one execution of the action is in flight.
    Executing,
    /// Loop alive but not firing until resumed.
    Paused,
    /// Terminal. Followed immediately by removal from the registry.
    Finished { outcome: JobOutcome },
}

impl JobState {
    pub fn finished(outcome: JobOutcome) -> Self {
        JobState::Finished { outcome }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Finished { .. })
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Idle => write!(f, "idle"),
            JobState::Running => write!(f, "running"),
            JobState::Executing => write!(f, "executing"),
            JobState::Paused => write!(f, "paused"),
            JobState::Finished { outcome } => match outcome {
                JobOutcome::Completed => write!(f, "finished(completed)"),
                JobOutcome::Cancelled => write!(f, "finished(cancelled)"),
                JobOutcome::Failed { error } => write!(f, "finished(failed: {error})"),
            },
        }
    }
}

/// The changed subset of `{JobId: JobState}` handed to state sinks.
///
/// A removed job is reported as [`JobState::Idle`].
pub type StateChanges = HashMap<JobId, JobState>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_are_unique() {
        assert_ne!(JobId::new(), JobId::new());
    }

    #[test]
    fn finished_is_terminal() {
        assert!(JobState::finished(JobOutcome::Cancelled).is_terminal());
        assert!(!JobState::Paused.is_terminal());
        assert!(!JobState::Idle.is_terminal());
    }

    #[test]
    fn state_serializes_with_tag() {
        let state = JobState::finished(JobOutcome::Failed {
            error: "boom".to_string(),
        });
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains(r#""state":"finished""#));
        assert!(json.contains(r#""result":"failed""#));
        assert!(json.contains(r#""error":"boom""#));

        let running = serde_json::to_string(&JobState::Running).unwrap();
        assert_eq!(running, r#"{"state":"running"}"#);
    }

    #[test]
    fn display_matches_lifecycle_names() {
        assert_eq!(JobState::Executing.to_string(), "executing");
        assert_eq!(
            JobState::finished(JobOutcome::Completed).to_string(),
            "finished(completed)"
        );
    }
}
