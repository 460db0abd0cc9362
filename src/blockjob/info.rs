//! Progress reporting for running jobs.

use super::bandwidth::{from_bytes_per_sec, BandwidthUnit};
use super::job::{JobKind, JobState};
use crate::error::Result;
use crate::vm::Guest;
use blockjobd_protocol::BlockJobInfo;
use serde::{Deserialize, Serialize};

/// Progress of a block job as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Job id.
    pub id: String,
    /// Kind of job.
    pub kind: JobKind,
    /// Engine-side state.
    pub state: JobState,
    /// Work done.
    pub current: u64,
    /// Total work; never below `current`.
    pub total: u64,
    /// Bandwidth limit in `unit`.
    pub bandwidth: u64,
    /// Unit of `bandwidth`.
    pub unit: BandwidthUnit,
    /// Whether the job can be pivoted.
    pub ready: bool,
}

/// Normalise raw progress counters.
///
/// A job with no work yet reports 0/1, or 1/1 once ready. A job that is
/// not ready never reports completion, since emulators can catch up with
/// the estimate before the job is actually done.
pub fn translate_counters(current: u64, total: u64, ready: bool) -> (u64, u64) {
    match (current, total) {
        (0, 0) if ready => (1, 1),
        (0, 0) => (0, 1),
        (cur, end) => {
            let cur = cur.min(end);
            if !ready && cur == end && end > 0 {
                (cur - 1, end)
            } else {
                (cur, end)
            }
        }
    }
}

impl JobProgress {
    fn from_raw(info: &BlockJobInfo, kind: JobKind, state: JobState, unit: BandwidthUnit) -> Self {
        let ready = info.ready.unwrap_or(state == JobState::Ready);
        let (current, total) = translate_counters(info.offset, info.len, ready);
        Self {
            id: info.device.clone(),
            kind,
            state,
            current,
            total,
            bandwidth: from_bytes_per_sec(info.speed, unit),
            unit,
            ready,
        }
    }
}

impl Guest {
    /// Progress of the job on `target`, or `None` if it has none.
    ///
    /// Applies any report the job has not processed yet before querying.
    pub fn get_info(&self, target: &str, unit: BandwidthUnit) -> Result<Option<JobProgress>> {
        let job = {
            let inner = self.lock_active()?;
            let disk = inner.disk(target)?;
            inner.jobs.lookup(disk)
        };
        let Some(job) = job else {
            return Ok(None);
        };
        if job.sync_waiters() == 0 {
            self.apply_pending(&job);
        }
        if job.state().is_terminal() {
            return Ok(None);
        }

        let jobs = self.monitor.query_block_jobs()?;
        let Some(info) = jobs.iter().find(|info| info.device == job.id()) else {
            tracing::debug!(job = %job.id(), "job not reported by the emulator");
            return Ok(None);
        };
        Ok(Some(JobProgress::from_raw(info, job.kind(), job.state(), unit)))
    }
}
