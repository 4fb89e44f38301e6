//! `--events`: one JSON line per job state change on stdout.

use std::collections::HashMap;
use std::io::Write;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use tickwork_scheduler::{Job, JobId, JobState, StateBatch, StateSink};

#[derive(Serialize)]
struct EventLine<'a> {
    seq: u64,
    at: DateTime<Utc>,
    job_id: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(flatten)]
    state: &'a JobState,
}

/// State sink that prints every change as a JSON line.
pub struct EventPrinter {
    names: HashMap<JobId, String>,
}

impl EventPrinter {
    /// Remember job names up front so every line, including the first
    /// registration, can carry the name.
    pub fn new<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        let names = jobs
            .into_iter()
            .filter_map(|job| job.name().map(|name| (job.id(), name.to_string())))
            .collect();
        Self { names }
    }

    /// Serialise a batch, one line per job, sorted by job id. Every line
    /// carries the batch `seq`; lines can be printed out of `seq` order when
    /// jobs change state concurrently.
    pub fn render(
        &self,
        batch: &StateBatch,
        at: DateTime<Utc>,
    ) -> tickwork_core::Result<String> {
        let mut ids: Vec<&JobId> = batch.changes.keys().collect();
        ids.sort();

        let mut out = String::new();
        for id in ids {
            let line = EventLine {
                seq: batch.seq,
                at,
                job_id: *id,
                name: self.names.get(id).map(String::as_str),
                state: &batch.changes[id],
            };
            out.push_str(&serde_json::to_string(&line)?);
            out.push('\n');
        }
        Ok(out)
    }

    fn emit(&self, batch: &StateBatch) -> tickwork_core::Result<()> {
        let text = self.render(batch, Utc::now())?;
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(text.as_bytes())?;
        stdout.flush()?;
        Ok(())
    }
}

impl StateSink for EventPrinter {
    fn notify(&self, batch: &StateBatch) {
        if let Err(e) = self.emit(batch) {
            warn!(code = e.code(), error = %e, "failed to write state event");
        }
    }
}
