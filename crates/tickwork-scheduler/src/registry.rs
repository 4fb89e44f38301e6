//! Shared mutable state of the scheduler: job entries, cron anchors and idle
//! waiters.
//!
//! Everything here is synchronous. The engine keeps the registry behind a
//! single `std::sync::Mutex` and never holds the guard across an `.await`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use tickwork_core::types::{JobId, JobOutcome, JobState, StateChanges};

use crate::notify::StateBatch;
use crate::types::{Job, JobSummary};

/// The engine's mutable record for a registered job.
///
/// The externally visible [`JobState`] is derived from these flags so the
/// loop and the execution tasks can each own the part they are responsible
/// for: the loop sets `started`, execution tasks decrement `in_flight`, and
/// callers toggle `paused` or set `terminal`.
pub(crate) struct JobEntry {
    pub job: Arc<Job>,
    /// Signals the control loop (and its in-flight executions) to stop.
    pub cancel: CancellationToken,
    /// Cancelled by the control loop as its very last act.
    pub exited: CancellationToken,
    pub started: bool,
    pub paused: bool,
    pub in_flight: usize,
    pub terminal: Option<JobOutcome>,
    /// Earliest instant the next firing may start after a `retry` failure.
    pub backoff_until: Option<DateTime<Utc>>,
    pub runs: u64,
}

impl JobEntry {
    pub fn new(job: Arc<Job>) -> Self {
        Self {
            job,
            cancel: CancellationToken::new(),
            exited: CancellationToken::new(),
            started: false,
            paused: false,
            in_flight: 0,
            terminal: None,
            backoff_until: None,
            runs: 0,
        }
    }

    pub fn state(&self) -> JobState {
        if let Some(outcome) = &self.terminal {
            JobState::finished(outcome.clone())
        } else if self.paused {
            JobState::Paused
        } else if self.in_flight > 0 {
            JobState::Executing
        } else if self.started {
            JobState::Running
        } else {
            JobState::Idle
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    /// Record a terminal outcome unless one is already set.
    pub fn finish(&mut self, outcome: JobOutcome) {
        if self.terminal.is_none() {
            self.terminal = Some(outcome);
        }
    }
}

struct IdleWaiter {
    /// Jobs registered when the waiter arrived and not yet removed.
    pending: HashSet<JobId>,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
pub(crate) struct Registry {
    entries: HashMap<JobId, JobEntry>,
    anchors: HashMap<JobId, DateTime<Utc>>,
    waiters: Vec<IdleWaiter>,
    changes: StateChanges,
    /// Sequence number of the last batch handed out by `take_changes`.
    seq: u64,
}

impl Registry {
    pub fn insert(&mut self, entry: JobEntry) {
        let id = entry.job.id();
        self.changes.insert(id, entry.state());
        self.entries.insert(id, entry);
    }

    pub fn get(&self, id: &JobId) -> Option<&JobEntry> {
        self.entries.get(id)
    }

    /// Mutate an entry, recording a state change if the derived state moved.
    pub fn update<R>(&mut self, id: &JobId, f: impl FnOnce(&mut JobEntry) -> R) -> Option<R> {
        let entry = self.entries.get_mut(id)?;
        let before = entry.state();
        let out = f(entry);
        let after = entry.state();
        if after != before {
            self.changes.insert(*id, after);
        }
        Some(out)
    }

    /// Apply `f` to every entry.
    pub fn update_all(&mut self, mut f: impl FnMut(&mut JobEntry)) {
        let ids: Vec<JobId> = self.entries.keys().copied().collect();
        for id in ids {
            self.update(&id, &mut f);
        }
    }

    pub fn state(&self, id: &JobId) -> JobState {
        self.entries
            .get(id)
            .map(JobEntry::state)
            .unwrap_or(JobState::Idle)
    }

    /// Drop an entry and its anchor, then release any idle waiter whose jobs
    /// have all left. Safe to call for unknown ids.
    pub fn remove(&mut self, id: &JobId) -> Option<JobEntry> {
        self.anchors.remove(id);
        let removed = self.entries.remove(id);
        if removed.is_some() {
            self.changes.insert(*id, JobState::Idle);
        }
        for waiter in &mut self.waiters {
            waiter.pending.remove(id);
        }
        self.release_waiters();
        removed
    }

    fn release_waiters(&mut self) {
        let registry_empty = self.entries.is_empty();
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition(|w| registry_empty || w.pending.is_empty());
        self.waiters = waiting;
        for waiter in ready {
            // The receiver may have been dropped; nothing to do then.
            let _ = waiter.tx.send(());
        }
    }

    /// Register an idle waiter. Returns `None` when the registry is already
    /// empty and the caller need not wait at all.
    pub fn add_idle_waiter(&mut self) -> Option<oneshot::Receiver<()>> {
        if self.entries.is_empty() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.push(IdleWaiter {
            pending: self.entries.keys().copied().collect(),
            tx,
        });
        Some(rx)
    }

    pub fn anchor(&self, id: &JobId) -> Option<DateTime<Utc>> {
        self.anchors.get(id).copied()
    }

    /// Store the next cron anchor; ignored once the job has left the registry.
    pub fn set_anchor(&mut self, id: &JobId, anchor: DateTime<Utc>) {
        if self.entries.contains_key(id) {
            self.anchors.insert(*id, anchor);
        }
    }

    pub fn clear_anchor(&mut self, id: &JobId) {
        self.anchors.remove(id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn summaries(&self) -> Vec<JobSummary> {
        let mut jobs: Vec<JobSummary> = self
            .entries
            .iter()
            .map(|(id, entry)| JobSummary {
                id: *id,
                name: entry.job.name().map(str::to_string),
                schedule: entry.job.schedule().kind(),
                state: entry.state(),
                runs: entry.runs,
                next_fire: self.anchors.get(id).copied(),
            })
            .collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        jobs
    }

    /// Drain the changes recorded since the last call as a numbered batch.
    /// Numbers are assigned under the registry lock, so they follow the order
    /// in which the changes happened.
    pub fn take_changes(&mut self) -> Option<StateBatch> {
        if self.changes.is_empty() {
            return None;
        }
        self.seq += 1;
        Some(StateBatch {
            seq: self.seq,
            changes: std::mem::take(&mut self.changes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::Schedule;
    use std::time::Duration;

    fn entry() -> JobEntry {
        let schedule = Schedule::interval(Duration::from_secs(1)).unwrap();
        JobEntry::new(Arc::new(Job::new(schedule, || async { Ok(()) })))
    }

    #[test]
    fn derived_state_precedence() {
        let mut e = entry();
        assert_eq!(e.state(), JobState::Idle);
        e.started = true;
        assert_eq!(e.state(), JobState::Running);
        e.in_flight = 2;
        assert_eq!(e.state(), JobState::Executing);
        e.paused = true;
        assert_eq!(e.state(), JobState::Paused);
        e.finish(JobOutcome::Cancelled);
        e.finish(JobOutcome::Completed);
        assert_eq!(e.state(), JobState::finished(JobOutcome::Cancelled));
    }

    #[test]
    fn update_records_only_real_transitions() {
        let mut reg = Registry::default();
        let e = entry();
        let id = e.job.id();
        reg.insert(e);
        let first = reg.take_changes().unwrap();
        assert_eq!(first.changes.get(&id), Some(&JobState::Idle));

        reg.update(&id, |e| e.started = true);
        reg.update(&id, |e| e.runs += 1);
        let second = reg.take_changes().unwrap();
        assert_eq!(second.changes.len(), 1);
        assert_eq!(second.changes.get(&id), Some(&JobState::Running));

        reg.update(&id, |e| e.runs += 1);
        assert!(reg.take_changes().is_none());
    }

    #[test]
    fn batches_are_numbered_in_order() {
        let mut reg = Registry::default();
        let e = entry();
        let id = e.job.id();
        reg.insert(e);
        let a = reg.take_changes().unwrap();
        assert!(reg.take_changes().is_none());

        reg.update(&id, |e| e.paused = true);
        let b = reg.take_changes().unwrap();
        reg.remove(&id);
        let c = reg.take_changes().unwrap();
        assert_eq!((a.seq, b.seq, c.seq), (1, 2, 3));
    }

    #[test]
    fn remove_is_idempotent_and_drops_anchor() {
        let mut reg = Registry::default();
        let e = entry();
        let id = e.job.id();
        reg.insert(e);
        reg.set_anchor(&id, Utc::now());
        assert!(reg.anchor(&id).is_some());

        assert!(reg.remove(&id).is_some());
        assert!(reg.anchor(&id).is_none());
        assert_eq!(reg.state(&id), JobState::Idle);
        assert!(reg.remove(&id).is_none());

        // Anchors are not stored for jobs that are gone.
        reg.set_anchor(&id, Utc::now());
        assert!(reg.anchor(&id).is_none());
    }

    #[test]
    fn idle_waiter_released_once_registry_empties() {
        let mut reg = Registry::default();
        assert!(reg.add_idle_waiter().is_none());

        let (a, b) = (entry(), entry());
        let (id_a, id_b) = (a.job.id(), b.job.id());
        reg.insert(a);
        reg.insert(b);

        let mut rx = reg.add_idle_waiter().unwrap();
        reg.remove(&id_a);
        assert!(rx.try_recv().is_err());
        reg.remove(&id_b);
        assert!(rx.try_recv().is_ok());
        assert!(reg.is_empty());
    }

    #[test]
    fn idle_waiter_ignores_later_jobs() {
        let mut reg = Registry::default();
        let first = entry();
        let first_id = first.job.id();
        reg.insert(first);

        let mut rx = reg.add_idle_waiter().unwrap();
        reg.insert(entry());
        reg.remove(&first_id);
        assert!(rx.try_recv().is_ok());
        assert_eq!(reg.len(), 1);
    }
}
