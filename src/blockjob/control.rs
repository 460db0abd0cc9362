//! Controlling running jobs: abort, pivot and bandwidth changes.

use super::addressing::Addressing;
use super::bandwidth::Bandwidth;
use super::job::{BlockJob, JobKind, JobState};
use crate::error::{Error, Result};
use crate::vm::{Guest, MirrorState};
use blockjobd_protocol::{BlockJobCancelArgs, BlockJobRef, BlockJobSetSpeedArgs, Command, JobRef};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Options for [`Guest::abort`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AbortOptions {
    /// Finish a ready copy or active commit by switching to its mirror.
    pub pivot: bool,
    /// Return once the emulator accepted the request instead of waiting
    /// for the job to end.
    pub asynchronous: bool,
}

impl Guest {
    /// Job running on `target`, if any.
    pub fn job(&self, target: &str) -> Option<Arc<BlockJob>> {
        let inner = self.lock();
        let disk = inner.disk(target).ok()?;
        inner.jobs.lookup(disk)
    }

    /// Cancel the job on `target`, or pivot onto its mirror.
    ///
    /// Unless `asynchronous` is set, waits until the job has ended and
    /// reports its failure as an error.
    pub fn abort(&self, target: &str, opts: &AbortOptions) -> Result<()> {
        let _job = self.job_lock.begin("block-job-abort");
        let job = {
            let inner = self.lock_active()?;
            let disk = inner.disk(target)?;
            inner.jobs.lookup(disk).ok_or_else(|| Error::NoJob {
                disk: target.to_string(),
            })?
        };

        let state = job.state();
        if state.is_stopping() {
            tracing::debug!(job = %job.id(), %state, "abort already in progress");
            if !opts.asynchronous {
                job.sync_begin();
                return self.wait_for_end(&job, state == JobState::Pivoting);
            }
            return Ok(());
        }
        if opts.pivot {
            if !job.kind().has_mirror() {
                return Err(Error::invalid(format!(
                    "block job '{}' of kind {} cannot pivot",
                    job.id(),
                    job.kind()
                )));
            }
            if state != JobState::Ready {
                return Err(Error::NotReady {
                    job: job.id().to_string(),
                    state: state.to_string(),
                });
            }
        }

        let cmd = match (opts.pivot, Addressing::for_caps(&self.caps)) {
            (true, Addressing::NodeName) => Command::JobComplete(JobRef {
                id: job.id().to_string(),
            }),
            (true, Addressing::Legacy) => Command::BlockJobComplete(BlockJobRef {
                device: job.id().to_string(),
            }),
            (false, _) => Command::BlockJobCancel(BlockJobCancelArgs {
                device: job.id().to_string(),
                force: job.kind() == JobKind::Broken,
            }),
        };

        // Reports that arrive while the command is in flight must wait
        // until the job is marked as stopping
        job.sync_begin();
        if let Err(e) = self.monitor.run(cmd) {
            job.sync_end();
            tracing::warn!(job = %job.id(), pivot = opts.pivot, error = %e, "block job abort refused");
            self.apply_pending(&job);
            return Err(e);
        }

        {
            let mut inner = self.lock();
            let next = if opts.pivot {
                JobState::Pivoting
            } else {
                JobState::Aborting
            };
            job.advance(next);
            if let Some(disk) = job.disk().and_then(|t| inner.disk_index(t).ok()) {
                let disk = &mut inner.disks[disk];
                if opts.pivot {
                    disk.mirror_state = MirrorState::PivotRequested;
                } else if disk.mirror.is_some() {
                    disk.mirror_state = MirrorState::AbortRequested;
                }
            }
        }
        tracing::info!(guest = %self.name, job = %job.id(), pivot = opts.pivot, "block job abort requested");

        if opts.asynchronous {
            job.sync_end();
            self.apply_pending(&job);
            return Ok(());
        }
        self.wait_for_end(&job, opts.pivot)
    }

    /// Wait for `job` to end, applying reports as they arrive.
    ///
    /// Consumes one synchronous waiter registration.
    fn wait_for_end(&self, job: &Arc<BlockJob>, pivot: bool) -> Result<()> {
        let mut inner = self.lock();
        loop {
            if job.has_pending() {
                drop(inner);
                self.apply_pending(job);
                inner = self.lock();
                continue;
            }
            if job.state().is_terminal() || !inner.active {
                break;
            }
            self.changed.wait(&mut inner);
        }
        drop(inner);
        job.sync_end();

        match (job.state(), job.error()) {
            (JobState::Failed, error) => {
                let message = error.unwrap_or_else(|| "unknown error".to_string());
                if pivot {
                    Err(Error::PivotFailed {
                        job: job.id().to_string(),
                        message,
                    })
                } else {
                    Err(Error::Failed {
                        job: job.id().to_string(),
                        message,
                    })
                }
            }
            _ => Ok(()),
        }
    }

    /// Change the bandwidth limit of the job on `target`.
    pub fn set_speed(&self, target: &str, bandwidth: Bandwidth) -> Result<()> {
        let _job = self.job_lock.begin("block-job-set-speed");
        let speed = bandwidth.to_bytes_per_sec()?;
        let job = {
            let inner = self.lock_active()?;
            let disk = inner.disk(target)?;
            inner.jobs.lookup(disk).ok_or_else(|| Error::NoJob {
                disk: target.to_string(),
            })?
        };

        self.monitor.run(Command::BlockJobSetSpeed(BlockJobSetSpeedArgs {
            device: job.id().to_string(),
            speed,
        }))?;
        tracing::info!(job = %job.id(), speed, "block job bandwidth changed");
        Ok(())
    }
}
