//! `tickwork-scheduler` — in-process job scheduling engine with a cron evaluator.
//!
//! # Overview
//!
//! Every job handed to [`Scheduler::schedule`] gets its own control loop on the
//! Tokio runtime. The loop sleeps until the job is due, applies the overrun and
//! error policies, and starts the action on a separate task so a slow action
//! never delays the next tick. Loops can be paused, resumed and cancelled;
//! [`Scheduler::wait_until_idle`] resolves once every job has left the
//! registry.
//!
//! # Schedule variants
//!
//! | Variant    | Behaviour                                                  |
//! |------------|------------------------------------------------------------|
//! | `Interval` | Sleep a fixed duration between firings                     |
//! | `Daily`    | Fire at HH:MM wall-clock time in a given timezone          |
//! | `Cron`     | Five- or six-field cron expression, evaluated in a timezone |
//!
//! Cron firings follow an anchor chain: each firing time is derived from the
//! previous nominal slot, not from when the loop happened to wake up, so there
//! is no cumulative drift.

pub mod clock;
pub mod cron;
pub mod engine;
pub mod error;
pub mod field;
pub mod notify;
mod registry;
pub mod schedule;
pub mod types;

pub use clock::{Clock, SystemClock, VirtualClock};
pub use cron::CronExpression;
pub use engine::{Scheduler, SchedulerBuilder};
pub use error::{CronError, Result, SchedulerError};
pub use notify::{NoopSink, StateBatch, StateSink, TracingSink};
pub use schedule::{parse_timezone, Schedule};
pub use types::{Action, ActionFuture, ErrorPolicy, Job, JobSummary, OverrunPolicy};

pub use tickwork_core::types::{JobId, JobOutcome, JobState, StateChanges};
