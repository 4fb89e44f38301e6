use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::Serialize;

pub use tickwork_core::config::OverrunPolicy;
use tickwork_core::types::{JobId, JobState};

use crate::schedule::Schedule;

/// Future returned by one invocation of a job's action.
pub type ActionFuture = BoxFuture<'static, anyhow::Result<()>>;

/// The work a job performs on every firing. Called once per firing; each call
/// produces an independent future.
pub type Action = Arc<dyn Fn() -> ActionFuture + Send + Sync>;

/// What happens when an action returns an error (or panics).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Log and carry on with the next tick.
    #[default]
    Ignore,
    /// Terminate the job: it settles into `finished(failed)` and is removed.
    Stop,
    /// Hold the next firing until `backoff` has elapsed, then continue.
    Retry { backoff: Duration },
}

impl ErrorPolicy {
    pub fn retry(backoff: Duration) -> Self {
        ErrorPolicy::Retry { backoff }
    }
}

/// A job definition: identity, schedule, action and policies.
///
/// Immutable once built; hand it to [`Scheduler::schedule`](crate::Scheduler::schedule).
pub struct Job {
    id: JobId,
    name: Option<String>,
    schedule: Schedule,
    action: Action,
    error_policy: ErrorPolicy,
    overrun_policy: OverrunPolicy,
    max_runs: Option<u64>,
}

impl Job {
    /// Create a job with a fresh id, `ignore` error policy and `skip` overrun
    /// policy.
    pub fn new<F, Fut>(schedule: Schedule, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::with_action(schedule, Arc::new(move || -> ActionFuture { Box::pin(action()) }))
    }

    /// Create a job from an already type-erased [`Action`].
    pub fn with_action(schedule: Schedule, action: Action) -> Self {
        Self {
            id: JobId::new(),
            name: None,
            schedule,
            action,
            error_policy: ErrorPolicy::default(),
            overrun_policy: OverrunPolicy::default(),
            max_runs: None,
        }
    }

    /// Set a human-readable name (used in logs and summaries).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn with_overrun_policy(mut self, policy: OverrunPolicy) -> Self {
        self.overrun_policy = policy;
        self
    }

    /// Finish the job (`finished(completed)`) after `runs` firings. With 0 the
    /// job completes without ever firing.
    pub fn with_max_runs(mut self, runs: u64) -> Self {
        self.max_runs = Some(runs);
        self
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Name if set, otherwise the id. Used in log lines.
    pub fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn error_policy(&self) -> ErrorPolicy {
        self.error_policy
    }

    pub fn overrun_policy(&self) -> OverrunPolicy {
        self.overrun_policy
    }

    pub fn max_runs(&self) -> Option<u64> {
        self.max_runs
    }

    /// Start one invocation of the action.
    pub(crate) fn invoke(&self) -> ActionFuture {
        (self.action)()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("schedule", &self.schedule)
            .field("error_policy", &self.error_policy)
            .field("overrun_policy", &self.overrun_policy)
            .field("max_runs", &self.max_runs)
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of a registered job, as returned by
/// [`Scheduler::jobs`](crate::Scheduler::jobs).
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub name: Option<String>,
    /// `interval`, `daily` or `cron`.
    pub schedule: &'static str,
    pub state: JobState,
    /// Number of times the action has been started.
    pub runs: u64,
    /// Cron anchor (the next nominal firing) once one has been computed.
    pub next_fire: Option<DateTime<Utc>>,
}
