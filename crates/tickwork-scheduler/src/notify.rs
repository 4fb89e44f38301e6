//! State-change hook for observer layers.
//!
//! The engine calls [`StateSink::notify`] with the changed subset of
//! `{JobId: JobState}` after every registration, removal and transition. It is
//! always called outside the registry lock, so a sink may query the scheduler.
//!
//! Jobs run on separate tasks, so on a multi-threaded runtime two batches can
//! reach a sink in the opposite order to the one they were recorded in. Each
//! batch carries a `seq` taken under the registry lock; sinks that care about
//! ordering compare it against the last one they saw.

use tokio::sync::broadcast;
use tracing::{debug, trace};

use tickwork_core::types::StateChanges;

/// One set of changes drained from the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct StateBatch {
    /// Starts at 1 and increases by one per batch within a scheduler.
    pub seq: u64,
    pub changes: StateChanges,
}

pub trait StateSink: Send + Sync {
    fn notify(&self, batch: &StateBatch);
}

/// Discards every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl StateSink for NoopSink {
    fn notify(&self, _batch: &StateBatch) {}
}

/// Logs each transition at `debug`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl StateSink for TracingSink {
    fn notify(&self, batch: &StateBatch) {
        for (id, state) in &batch.changes {
            debug!(seq = batch.seq, job_id = %id, %state, "job state changed");
        }
    }
}

/// Fan-out to any number of subscribers. Sending never blocks; with no
/// subscribers the batch is dropped.
impl StateSink for broadcast::Sender<StateBatch> {
    fn notify(&self, batch: &StateBatch) {
        if self.send(batch.clone()).is_err() {
            trace!("no state subscribers");
        }
    }
}
