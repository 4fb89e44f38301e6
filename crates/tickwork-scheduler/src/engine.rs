use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use futures_util::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tickwork_core::config::EngineConfig;
use tickwork_core::types::{JobId, JobOutcome, JobState};

use crate::{
    clock::{Clock, SystemClock},
    error::CronError,
    notify::{NoopSink, StateSink},
    registry::{JobEntry, Registry},
    types::{ErrorPolicy, Job, JobSummary, OverrunPolicy},
};

/// Runs one control loop per registered job.
///
/// Cheap to clone; every clone drives the same registry. Must be used from
/// within a Tokio runtime because [`Scheduler::schedule`] spawns tasks.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

/// Builder for a [`Scheduler`] with a non-default clock, state sink or timing.
pub struct SchedulerBuilder {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn StateSink>,
}

impl SchedulerBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Install the observer hook that receives every state change.
    pub fn sink(mut self, sink: impl StateSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    pub fn build(self) -> Scheduler {
        Scheduler {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                clock: self.clock,
                sink: self.sink,
                config: self.config,
            }),
        }
    }
}

impl Scheduler {
    /// Scheduler on the system clock with no state sink.
    pub fn new(config: EngineConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder {
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            sink: Arc::new(NoopSink),
        }
    }

    /// Register `job` and start its control loop. Returns immediately.
    pub fn schedule(&self, job: Job) -> JobId {
        let job = Arc::new(job);
        let id = job.id();
        let entry = JobEntry::new(Arc::clone(&job));
        let cancel = entry.cancel.clone();
        let exited = entry.exited.clone();
        self.inner.with_registry(|reg| reg.insert(entry));

        info!(
            job_id = %id,
            name = %job.label(),
            schedule = job.schedule().kind(),
            "job scheduled"
        );
        tokio::spawn(Arc::clone(&self.inner).run_job(job, cancel, exited));
        id
    }

    /// Schedule every job produced by `jobs`, in order.
    pub fn schedule_all(&self, jobs: impl IntoIterator<Item = Job>) -> Vec<JobId> {
        jobs.into_iter().map(|job| self.schedule(job)).collect()
    }

    /// Cancel a job and wait until its control loop has terminated.
    ///
    /// The state becomes `finished(cancelled)` before the loop is signalled.
    /// In-flight executions are abandoned. Unknown ids are a no-op apart from
    /// anchor cleanup and idle-waiter release.
    pub async fn cancel(&self, id: JobId) {
        let handles = self.inner.with_registry(|reg| {
            reg.update(&id, |e| {
                e.finish(JobOutcome::Cancelled);
                (e.cancel.clone(), e.exited.clone())
            })
        });

        match handles {
            Some((cancel, exited)) => {
                cancel.cancel();
                exited.cancelled().await;
                info!(job_id = %id, "job cancelled");
            }
            None => debug!(job_id = %id, "cancel for unknown job"),
        }
        self.inner.with_registry(|reg| {
            reg.remove(&id);
        });
    }

    /// Cancel every registered job and wait for all of their loops.
    ///
    /// Every job is marked cancelled before any loop is signalled.
    pub async fn cancel_all(&self) {
        let handles = self.inner.with_registry(|reg| {
            let mut handles = Vec::with_capacity(reg.len());
            reg.update_all(|e| {
                e.finish(JobOutcome::Cancelled);
                handles.push((e.job.id(), e.cancel.clone(), e.exited.clone()));
            });
            handles
        });

        for (_, cancel, _) in &handles {
            cancel.cancel();
        }
        join_all(handles.iter().map(|(_, _, exited)| exited.cancelled())).await;

        self.inner.with_registry(|reg| {
            for (id, _, _) in &handles {
                reg.remove(id);
            }
        });
        info!(count = handles.len(), "all jobs cancelled");
    }

    /// Suspend firing of a job. Returns `false` if the job is unknown,
    /// terminal or already paused.
    pub fn pause(&self, id: JobId) -> bool {
        let paused = self
            .inner
            .with_registry(|reg| {
                reg.update(&id, |e| {
                    if e.is_terminal() || e.paused {
                        return false;
                    }
                    e.paused = true;
                    true
                })
            })
            .unwrap_or(false);
        if paused {
            info!(job_id = %id, "job paused");
        }
        paused
    }

    /// Resume a paused job. A cron job restarts from the next slot after now
    /// rather than replaying the slots missed while paused.
    pub fn resume(&self, id: JobId) -> bool {
        let resumed = self.inner.with_registry(|reg| {
            let resumed = reg
                .update(&id, |e| {
                    if e.is_terminal() || !e.paused {
                        return false;
                    }
                    e.paused = false;
                    true
                })
                .unwrap_or(false);
            if resumed {
                reg.clear_anchor(&id);
            }
            resumed
        });
        if resumed {
            info!(job_id = %id, "job resumed");
        }
        resumed
    }

    /// Wait until every job registered at the time of the call has left the
    /// registry. Returns immediately when no jobs are registered.
    pub async fn wait_until_idle(&self) {
        let waiter = self.inner.with_registry(|reg| reg.add_idle_waiter());
        if let Some(rx) = waiter {
            // The sender is only dropped after sending.
            let _ = rx.await;
        }
    }

    /// Current state of a job; `idle` for unknown ids.
    pub fn job_state(&self, id: JobId) -> JobState {
        self.inner.with_registry(|reg| reg.state(&id))
    }

    /// Snapshot of every registered job, sorted by name.
    pub fn jobs(&self) -> Vec<JobSummary> {
        self.inner.with_registry(|reg| reg.summaries())
    }

    pub fn len(&self) -> usize {
        self.inner.with_registry(|reg| reg.len())
    }

    pub fn is_idle(&self) -> bool {
        self.inner.with_registry(|reg| reg.is_empty())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

struct Inner {
    registry: Mutex<Registry>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn StateSink>,
    config: EngineConfig,
}

impl Inner {
    /// Run `f` under the registry lock, then forward the recorded state
    /// changes to the sink after the lock is released. Batches from different
    /// tasks can reach the sink out of order; their `seq` cannot.
    fn with_registry<R>(&self, f: impl FnOnce(&mut Registry) -> R) -> R {
        let (out, batch) = {
            let mut reg = self
                .registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let out = f(&mut reg);
            (out, reg.take_changes())
        };
        if let Some(batch) = batch {
            self.sink.notify(&batch);
        }
        out
    }

    // --- control loop ------------------------------------------------------

    async fn run_job(
        self: Arc<Self>,
        job: Arc<Job>,
        cancel: CancellationToken,
        exited: CancellationToken,
    ) {
        // Cancellers wait on `exited`; the guard fires it even if this task
        // unwinds.
        let _exited = exited.drop_guard();
        let id = job.id();
        let mut executions = JoinSet::new();

        self.with_registry(|reg| reg.update(&id, |e| e.started = true));
        debug!(job_id = %id, "control loop started");

        let exhausted = self.drive(&job, &cancel, &mut executions).await;

        if exhausted {
            // Let the final firings finish unless someone cancels meanwhile.
            while executions.join_next().await.is_some() {}
            self.with_registry(|reg| reg.update(&id, |e| e.finish(JobOutcome::Completed)));
        }

        cancel.cancel();
        while executions.join_next().await.is_some() {}

        if let Some(entry) = self.with_registry(|reg| reg.remove(&id)) {
            info!(
                job_id = %id,
                name = %job.label(),
                runs = entry.runs,
                state = %entry.state(),
                "job finished"
            );
        }
    }

    /// The per-job state machine. Returns `true` when the run limit was
    /// reached, `false` on cancellation or terminal failure.
    async fn drive(
        self: &Arc<Self>,
        job: &Arc<Job>,
        cancel: &CancellationToken,
        executions: &mut JoinSet<()>,
    ) -> bool {
        let id = job.id();
        loop {
            while executions.try_join_next().is_some() {}

            if self.should_stop(&id, cancel) {
                return false;
            }

            if self.limit_reached(job) {
                debug!(job_id = %id, "run limit reached");
                return true;
            }

            if self.is_paused(&id) {
                if !self.wait_while_paused(&id, cancel).await {
                    return false;
                }
                continue;
            }

            let mut due = match self.wait_for_due(job, cancel).await {
                Ok(Some(due)) => due,
                Ok(None) => return false,
                Err(e) => {
                    if !self.retry_after_calendar_error(&id, &e, cancel).await {
                        return false;
                    }
                    continue;
                }
            };

            if self.should_stop(&id, cancel) {
                return false;
            }
            if self.is_paused(&id) {
                continue;
            }

            if self.in_flight(&id) > 0 {
                match job.overrun_policy() {
                    OverrunPolicy::Skip => {
                        debug!(job_id = %id, %due, "previous run still executing, skipping tick");
                        self.advance_anchor(job, due);
                        continue;
                    }
                    OverrunPolicy::Wait => {
                        debug!(job_id = %id, %due, "previous run still executing, waiting");
                        if !self.wait_for_executions(&id, cancel).await {
                            return false;
                        }
                    }
                    OverrunPolicy::Overlap => {
                        debug!(job_id = %id, %due, "previous run still executing, overlapping");
                    }
                }
            }

            if let Some(until) = self.take_backoff(&id) {
                due = match self.hold_for_backoff(job, due, until, cancel).await {
                    Ok(Some(held)) => held,
                    Ok(None) => return false,
                    Err(e) => {
                        if !self.retry_after_calendar_error(&id, &e, cancel).await {
                            return false;
                        }
                        continue;
                    }
                };
            }

            if self.should_stop(&id, cancel) {
                return false;
            }
            self.advance_anchor(job, due);

            let Some(run) = self.begin_execution(&id) else {
                return false;
            };
            self.spawn_execution(job, cancel, executions, run);
        }
    }

    /// Hold a firing until a retry backoff has elapsed. Returns the instant the
    /// job actually fires at, or `None` if cancelled.
    ///
    /// A cron job does not fire the moment the backoff ends; it moves on to the
    /// first slot at or after that instant, which also becomes the new anchor.
    async fn hold_for_backoff(
        &self,
        job: &Job,
        due: DateTime<Utc>,
        until: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Option<DateTime<Utc>>, CronError> {
        if until <= due {
            return Ok(Some(due));
        }
        let id = job.id();
        let target = match job.schedule().as_cron() {
            Some(expr) => {
                let slot = expr.next_date(until - chrono::Duration::nanoseconds(1))?;
                self.with_registry(|reg| reg.set_anchor(&id, slot));
                slot
            }
            None => until,
        };
        debug!(job_id = %id, %until, fire_at = %target, "holding firing for retry backoff");
        Ok(self.sleep_until(target, cancel).await.then_some(target))
    }

    /// Log a calendar failure, drop the anchor and wait before recomputing.
    /// Returns `false` if cancelled while waiting.
    async fn retry_after_calendar_error(
        &self,
        id: &JobId,
        error: &CronError,
        cancel: &CancellationToken,
    ) -> bool {
        warn!(job_id = %id, error = %error, "cannot determine next run, will retry");
        self.with_registry(|reg| reg.clear_anchor(id));
        self.sleep_or_cancel(self.config.calendar_retry(), cancel).await
    }

    /// Sleep until the job is due. `Ok(None)` means cancelled while waiting.
    async fn wait_for_due(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<Option<DateTime<Utc>>, CronError> {
        let id = job.id();
        match job.schedule().as_cron() {
            Some(expr) => {
                let due = match self.with_registry(|reg| reg.anchor(&id)) {
                    Some(anchor) => anchor,
                    None => {
                        let next = expr.next_date(self.clock.now())?;
                        self.with_registry(|reg| reg.set_anchor(&id, next));
                        next
                    }
                };
                debug!(job_id = %id, %due, "waiting for cron slot");
                Ok(self.sleep_until(due, cancel).await.then_some(due))
            }
            None => {
                let now = self.clock.now();
                let delay = job.schedule().sleep_duration(now)?;
                let due = add_std(now, delay);
                debug!(
                    job_id = %id,
                    %due,
                    delay_ms = delay.as_millis() as u64,
                    "sleeping until due"
                );
                Ok(self.sleep_or_cancel(delay, cancel).await.then_some(due))
            }
        }
    }

    /// Corrective sleep toward a wall-clock instant: re-read the clock and
    /// sleep at most one chunk at a time so clock drift and cancellation are
    /// noticed promptly. Returns `false` if cancelled.
    async fn sleep_until(&self, deadline: DateTime<Utc>, cancel: &CancellationToken) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let remaining = match (deadline - self.clock.now()).to_std() {
                Ok(remaining) if !remaining.is_zero() => remaining,
                _ => return true,
            };
            let chunk = remaining.min(self.config.sleep_chunk());
            if !self.sleep_or_cancel(chunk, cancel).await {
                return false;
            }
        }
    }

    /// Returns `false` if cancelled before `duration` elapsed.
    async fn sleep_or_cancel(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = self.clock.sleep(duration) => true,
        }
    }

    async fn wait_while_paused(&self, id: &JobId, cancel: &CancellationToken) -> bool {
        loop {
            if self.should_stop(id, cancel) {
                return false;
            }
            if !self.is_paused(id) {
                return true;
            }
            if !self
                .sleep_or_cancel(self.config.poll_interval(), cancel)
                .await
            {
                return false;
            }
        }
    }

    async fn wait_for_executions(&self, id: &JobId, cancel: &CancellationToken) -> bool {
        loop {
            if self.should_stop(id, cancel) {
                return false;
            }
            if self.in_flight(id) == 0 {
                return true;
            }
            if !self
                .sleep_or_cancel(self.config.poll_interval(), cancel)
                .await
            {
                return false;
            }
        }
    }

    fn should_stop(&self, id: &JobId, cancel: &CancellationToken) -> bool {
        cancel.is_cancelled()
            || self.with_registry(|reg| reg.get(id).map_or(true, JobEntry::is_terminal))
    }

    fn is_paused(&self, id: &JobId) -> bool {
        self.with_registry(|reg| reg.get(id).is_some_and(|e| e.paused))
    }

    fn in_flight(&self, id: &JobId) -> usize {
        self.with_registry(|reg| reg.get(id).map_or(0, |e| e.in_flight))
    }

    fn limit_reached(&self, job: &Job) -> bool {
        let Some(max) = job.max_runs() else {
            return false;
        };
        self.with_registry(|reg| reg.get(&job.id()).is_some_and(|e| e.runs >= max))
    }

    fn take_backoff(&self, id: &JobId) -> Option<DateTime<Utc>> {
        self.with_registry(|reg| reg.update(id, |e| e.backoff_until.take()))
            .flatten()
    }

    /// Move the cron anchor to the slot after `due`. The chain of anchors, not
    /// the wake-up time, determines every following slot.
    fn advance_anchor(&self, job: &Job, due: DateTime<Utc>) {
        let Some(expr) = job.schedule().as_cron() else {
            return;
        };
        let id = job.id();
        match expr.next_date(due) {
            Ok(next) => self.with_registry(|reg| reg.set_anchor(&id, next)),
            Err(e) => {
                warn!(job_id = %id, error = %e, "cannot advance cron anchor");
                self.with_registry(|reg| reg.clear_anchor(&id));
            }
        }
    }

    /// Mark one more execution in flight. Returns the run number, or `None`
    /// if the job has become terminal in the meantime.
    fn begin_execution(&self, id: &JobId) -> Option<u64> {
        self.with_registry(|reg| {
            reg.update(id, |e| {
                if e.is_terminal() {
                    return None;
                }
                e.in_flight += 1;
                e.runs += 1;
                Some(e.runs)
            })
        })
        .flatten()
    }

    // --- executions --------------------------------------------------------

    /// Run the action on its own task so a slow action never stalls the loop.
    /// The task owns the `executing → running` transition.
    fn spawn_execution(
        self: &Arc<Self>,
        job: &Arc<Job>,
        cancel: &CancellationToken,
        executions: &mut JoinSet<()>,
        run: u64,
    ) {
        let inner = Arc::clone(self);
        let job = Arc::clone(job);
        let cancel = cancel.clone();
        debug!(job_id = %job.id(), run, "firing");

        executions.spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = AssertUnwindSafe(job.invoke()).catch_unwind() => {
                    Some(result.unwrap_or_else(|panic| {
                        Err(anyhow::anyhow!(panic_message(&*panic)))
                    }))
                }
            };
            inner.complete_execution(&job, run, outcome, &cancel);
        });
    }

    /// Settle one execution and apply the job's error policy.
    fn complete_execution(
        &self,
        job: &Job,
        run: u64,
        outcome: Option<anyhow::Result<()>>,
        cancel: &CancellationToken,
    ) {
        let id = job.id();
        let policy = job.error_policy();
        let now = self.clock.now();

        let stop = self
            .with_registry(|reg| {
                reg.update(&id, |e| {
                    e.in_flight = e.in_flight.saturating_sub(1);
                    match (&outcome, policy) {
                        (Some(Err(err)), ErrorPolicy::Stop) => {
                            e.finish(JobOutcome::Failed {
                                error: format!("{err:#}"),
                            });
                            true
                        }
                        (Some(Err(_)), ErrorPolicy::Retry { backoff }) => {
                            e.backoff_until = Some(add_std(now, backoff));
                            false
                        }
                        _ => false,
                    }
                })
            })
            .unwrap_or(false);

        match (&outcome, policy) {
            (None, _) => debug!(job_id = %id, run, "execution abandoned"),
            (Some(Ok(())), _) => debug!(job_id = %id, run, "execution completed"),
            (Some(Err(err)), ErrorPolicy::Ignore) => {
                warn!(job_id = %id, run, error = %format!("{err:#}"), "job action failed");
            }
            (Some(Err(err)), ErrorPolicy::Stop) => {
                error!(
                    job_id = %id,
                    run,
                    error = %format!("{err:#}"),
                    "job action failed, stopping job"
                );
            }
            (Some(Err(err)), ErrorPolicy::Retry { backoff }) => {
                warn!(
                    job_id = %id,
                    run,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %format!("{err:#}"),
                    "job action failed, retrying after backoff"
                );
            }
        }

        if stop {
            cancel.cancel();
        }
    }
}

fn add_std(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("action panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("action panicked: {msg}")
    } else {
        "action panicked".to_string()
    }
}
