//! Block job engine.
//!
//! Long-running storage operations on a running guest's disks:
//!
//! - **pull**: merge backing images into the active image
//! - **commit**: merge an image into one of its backing images
//! - **copy**: mirror the disk onto a new destination and pivot to it
//!
//! A job is reserved in the [`Registry`] before its start command is sent
//! and activated once the emulator accepts it. Completion is reported
//! asynchronously by monitor events; [`Guest::handle_event`] turns them
//! into pending states and [`Guest::apply_pending`] applies them,
//! rewriting the disk's backing chain where the job changed it.
//!
//! # Lock Order
//!
//! The guest [`JobLock`](crate::vm::JobLock) is taken first and may be held
//! across monitor commands. The guest state mutex is never held while a
//! monitor command is in flight.

pub mod addressing;
pub mod bandwidth;
pub mod chain;
pub mod commit;
pub mod control;
pub mod copy;
pub mod info;
pub mod job;
pub mod notify;
pub mod pull;
pub mod refresh;
pub mod registry;
pub mod update;

pub use addressing::Addressing;
pub use bandwidth::{Bandwidth, BandwidthUnit};
pub use chain::Locator;
pub use commit::CommitOptions;
pub use control::AbortOptions;
pub use copy::CopyOptions;
pub use info::JobProgress;
pub use job::{BlockJob, JobData, JobKind, JobState, PendingState};
pub use notify::{spawn_event_worker, JobKey, JobNotification};
pub use pull::PullOptions;
pub use registry::Registry;

use crate::error::Result;
use crate::vm::{Guest, GuestInner};
use blockjobd_protocol::Command;
use std::sync::Arc;

impl Guest {
    /// Send the start command of a reserved job.
    ///
    /// On success the job is activated and any notification buffered
    /// meanwhile is applied. On failure `rollback` runs under the state
    /// lock and the reservation is released.
    pub(crate) fn launch(
        &self,
        job: &Arc<BlockJob>,
        cmd: Command,
        rollback: impl FnOnce(&mut GuestInner),
    ) -> Result<()> {
        let command = cmd.name();
        match self.monitor.run(cmd) {
            Ok(()) => {
                let buffered = self.lock().jobs.activate(job);
                tracing::info!(
                    guest = %self.name,
                    disk = job.disk().unwrap_or("-"),
                    job = %job.id(),
                    kind = %job.kind(),
                    "block job started"
                );
                if buffered {
                    self.apply_pending(job);
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(job = %job.id(), command, error = %e, "block job start failed");
                let mut inner = self.lock();
                rollback(&mut inner);
                self.release(&mut inner, job);
                Err(e)
            }
        }
    }

    /// Drop a reservation without starting the job.
    pub(crate) fn release(&self, inner: &mut GuestInner, job: &BlockJob) {
        let GuestInner { disks, jobs, .. } = inner;
        match job
            .disk()
            .and_then(|target| disks.iter_mut().find(|d| d.target == target))
        {
            Some(disk) => jobs.release(disk, job),
            None => jobs.unregister(None, job.id()),
        }
    }
}
