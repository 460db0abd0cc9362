//! Re-synchronising the registry with the emulator, and tearing it down.

use super::job::{JobKind, JobState, PendingState};
use crate::error::Result;
use crate::vm::{Guest, GuestInner};
use blockjobd_protocol::{BlockJobCancelArgs, Command, JobRef, JobStatus};
use std::collections::HashSet;

/// A job as listed by the emulator.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReportedJob {
    id: String,
    ready: bool,
    concluded: bool,
}

impl Guest {
    /// Jobs the emulator currently knows about.
    ///
    /// Node-name capable emulators list generic jobs with their status;
    /// older ones only list running block jobs.
    fn reported_jobs(&self) -> Result<Vec<ReportedJob>> {
        if self.caps.blockdev {
            let jobs = self.monitor.query_jobs()?;
            Ok(jobs
                .into_iter()
                .filter(|info| info.status != JobStatus::Null)
                .map(|info| ReportedJob {
                    ready: matches!(info.status, JobStatus::Ready | JobStatus::Standby),
                    concluded: info.status == JobStatus::Concluded,
                    id: info.id,
                })
                .collect())
        } else {
            let jobs = self.monitor.query_block_jobs()?;
            Ok(jobs
                .into_iter()
                .map(|info| ReportedJob {
                    ready: info.ready == Some(true),
                    concluded: false,
                    id: info.device,
                })
                .collect())
        }
    }

    /// Reconcile tracked jobs with the emulator's job list.
    ///
    /// Used after (re)connecting to the monitor, when events may have been
    /// missed:
    ///
    /// - a tracked job the emulator reports as ready becomes ready
    /// - a tracked job the emulator reports as concluded is finished
    /// - a job running on a known disk without a record is adopted as
    ///   broken and cancelled
    /// - a tracked job the emulator no longer reports is failed
    pub fn refresh_jobs(&self) -> Result<()> {
        let _job = self.job_lock.begin("block-job-refresh");
        drop(self.lock_active()?);
        let reported = self.reported_jobs()?;
        let mut seen = HashSet::new();
        let mut broken = Vec::new();

        for info in &reported {
            let (job, adopted) = {
                let mut inner = self.lock_active()?;
                match inner.jobs.lookup_by_id(&info.id) {
                    Some(job) => (job, false),
                    None => {
                        let Some(idx) = inner.disk_for_device(&info.id) else {
                            tracing::debug!(device = %info.id, "ignoring job on unknown device");
                            continue;
                        };
                        if let Some(job) = inner.jobs.lookup(&inner.disks[idx]) {
                            (job, false)
                        } else if inner.disks[idx].active_job.is_some() {
                            continue;
                        } else if info.concluded {
                            drop(inner);
                            self.dismiss_untracked(&info.id);
                            continue;
                        } else {
                            let GuestInner { disks, jobs, .. } = &mut *inner;
                            let job = jobs.adopt(&mut disks[idx], info.id.clone(), JobKind::Broken);
                            (job, true)
                        }
                    }
                }
            };
            seen.insert(job.id().to_string());

            if adopted {
                tracing::warn!(job = %job.id(), device = %info.id, "found untracked block job");
                broken.push(job);
            } else if info.concluded {
                tracing::info!(job = %job.id(), "block job concluded while unobserved");
                job.set_pending(PendingState::Concluded);
                self.apply_pending(&job);
            } else if info.ready && job.state() == JobState::Running {
                job.set_pending(PendingState::Ready);
                self.apply_pending(&job);
            }
        }

        for job in broken {
            let cancel = Command::BlockJobCancel(BlockJobCancelArgs {
                device: job.id().to_string(),
                force: true,
            });
            if let Err(e) = self.monitor.run(cancel) {
                tracing::warn!(job = %job.id(), error = %e, "failed to cancel untracked block job");
                let mut inner = self.lock();
                let idx = job.disk().and_then(|t| inner.disk_index(t).ok());
                job.fail(e.to_string());
                let GuestInner { disks, jobs, .. } = &mut *inner;
                match idx {
                    Some(idx) => jobs.unregister(Some(&mut disks[idx]), job.id()),
                    None => jobs.unregister(None, job.id()),
                }
                continue;
            }
            job.advance(JobState::Aborting);
        }

        let missing: Vec<_> = {
            let inner = self.lock();
            inner
                .jobs
                .jobs()
                .into_iter()
                .filter(|job| !seen.contains(job.id()) && job.state() != JobState::New)
                .collect()
        };
        for job in missing {
            tracing::warn!(job = %job.id(), "tracked block job vanished from the emulator");
            job.set_pending(PendingState::Failed("job disappeared from the emulator".to_string()));
            self.apply_pending(&job);
        }

        self.notify_changed();
        Ok(())
    }

    /// Remove a concluded job nobody is tracking from the emulator's list.
    fn dismiss_untracked(&self, id: &str) {
        let dismiss = Command::JobDismiss(JobRef { id: id.to_string() });
        match self.monitor.run(dismiss) {
            Ok(()) => tracing::info!(job = %id, "dismissed untracked concluded job"),
            Err(e) => tracing::warn!(job = %id, error = %e, "failed to dismiss untracked job"),
        }
    }

    /// Mark the guest stopped and fail all outstanding jobs with `reason`.
    ///
    /// Synchronous waiters are woken and see the failure.
    pub fn shutdown(&self, reason: &str) {
        let mut inner = self.lock();
        inner.active = false;
        let GuestInner { disks, jobs, .. } = &mut *inner;
        for job in jobs.jobs() {
            let disk = job
                .disk()
                .and_then(|target| disks.iter_mut().find(|d| d.target == target));
            match disk {
                Some(disk) => {
                    self.discard_mirror(disk);
                    job.fail(reason);
                    jobs.unregister(Some(disk), job.id());
                }
                None => {
                    job.fail(reason);
                    jobs.unregister(None, job.id());
                }
            }
            tracing::info!(guest = %self.name, job = %job.id(), reason, "block job force-concluded");
        }
        drop(inner);
        self.notify_changed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockjob::{CopyOptions, PullOptions};
    use crate::monitor::Capabilities;
    use crate::testutil::{sample_guest, FakeMonitor};
    use serde_json::json;

    #[test]
    fn test_refresh_marks_ready() {
        let dir = tempfile::tempdir().unwrap();
        let (guest, fake) = sample_guest(Capabilities::default(), FakeMonitor::new());
        let id = guest
            .start_copy(
                "vda",
                &CopyOptions {
                    destination: dir.path().join("copy.qcow2"),
                    ..Default::default()
                },
            )
            .unwrap();
        fake.reply(
            "query-jobs",
            json!([{"id": id, "type": "mirror", "status": "ready"}]),
        );
        guest.refresh_jobs().unwrap();
        assert_eq!(guest.job("vda").unwrap().state(), JobState::Ready);
    }

    #[test]
    fn test_refresh_legacy_uses_block_job_list() {
        let dir = tempfile::tempdir().unwrap();
        let (guest, fake) = sample_guest(Capabilities::legacy(), FakeMonitor::new());
        fake.reply("query-block", json!([{"device": "drive-virtio-disk0"}]));
        let id = guest
            .start_copy(
                "vda",
                &CopyOptions {
                    destination: dir.path().join("copy.qcow2"),
                    ..Default::default()
                },
            )
            .unwrap();
        fake.reply(
            "query-block-jobs",
            json!([{"type": "mirror", "device": id, "len": 8, "offset": 8, "ready": true}]),
        );
        guest.refresh_jobs().unwrap();
        assert_eq!(guest.job("vda").unwrap().state(), JobState::Ready);
        assert!(fake.last_command("query-jobs").is_none());
    }

    #[test]
    fn test_refresh_finishes_concluded_job() {
        let (guest, fake) = sample_guest(Capabilities::default(), FakeMonitor::new());
        let id = guest.start_pull("vda", &PullOptions::default()).unwrap();
        let job = guest.job("vda").unwrap();

        // The completion event was missed while disconnected
        fake.reply(
            "query-jobs",
            json!([{"id": id, "type": "stream", "status": "concluded"}]),
        );
        guest.refresh_jobs().unwrap();

        assert_eq!(job.state(), JobState::Concluded);
        assert!(guest.job("vda").is_none());
        assert_eq!(guest.disk("vda").unwrap().chain.len(), 1);
        let cmd = fake.last_command("job-dismiss").unwrap();
        assert_eq!(cmd["arguments"]["id"], id.as_str());
    }

    #[test]
    fn test_refresh_fails_concluded_job_with_error() {
        let (guest, fake) = sample_guest(Capabilities::default(), FakeMonitor::new());
        let id = guest.start_pull("vda", &PullOptions::default()).unwrap();
        let job = guest.job("vda").unwrap();

        fake.reply(
            "query-jobs",
            json!([{"id": id, "type": "stream", "status": "concluded", "error": "Input/output error"}]),
        );
        guest.refresh_jobs().unwrap();

        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(job.error().as_deref(), Some("Input/output error"));
        assert_eq!(guest.disk("vda").unwrap().chain.len(), 3);
        assert!(guest.job("vda").is_none());
    }

    #[test]
    fn test_refresh_dismisses_untracked_concluded_job() {
        let (guest, fake) = sample_guest(Capabilities::default(), FakeMonitor::new());
        fake.reply(
            "query-jobs",
            json!([{"id": "commit-vdb-vdb-fmt3", "type": "commit", "status": "concluded"}]),
        );
        guest.refresh_jobs().unwrap();

        assert!(guest.job("vdb").is_none());
        assert!(fake.last_command("block-job-cancel").is_none());
        let cmd = fake.last_command("job-dismiss").unwrap();
        assert_eq!(cmd["arguments"]["id"], "commit-vdb-vdb-fmt3");
    }

    #[test]
    fn test_refresh_cancels_untracked_job() {
        let (guest, fake) = sample_guest(Capabilities::default(), FakeMonitor::new());
        fake.reply(
            "query-jobs",
            json!([{"id": "commit-vdb-vdb-fmt3", "type": "commit", "status": "running"}]),
        );
        guest.refresh_jobs().unwrap();

        let job = guest.job("vdb").unwrap();
        assert_eq!(job.kind(), JobKind::Broken);
        assert_eq!(job.state(), JobState::Aborting);
        let cmd = fake.last_command("block-job-cancel").unwrap();
        assert_eq!(cmd["arguments"]["device"], "commit-vdb-vdb-fmt3");
        assert_eq!(cmd["arguments"]["force"], true);
    }

    #[test]
    fn test_refresh_drops_untracked_job_when_cancel_fails() {
        let (guest, fake) = sample_guest(Capabilities::default(), FakeMonitor::new());
        fake.reply(
            "query-jobs",
            json!([{"id": "commit-vdb-vdb-fmt3", "type": "commit", "status": "running"}]),
        );
        fake.reject("block-job-cancel", "Job not found");
        guest.refresh_jobs().unwrap();
        assert!(guest.job("vdb").is_none());
        assert!(guest.lock().jobs.is_empty());
    }

    #[test]
    fn test_refresh_fails_vanished_job() {
        let (guest, _fake) = sample_guest(Capabilities::default(), FakeMonitor::new());
        guest.start_pull("vda", &PullOptions::default()).unwrap();
        let job = guest.job("vda").unwrap();

        guest.refresh_jobs().unwrap();
        assert_eq!(job.state(), JobState::Failed);
        assert!(guest.job("vda").is_none());
        assert_eq!(guest.disk("vda").unwrap().chain.len(), 3);
    }

    #[test]
    fn test_shutdown_discards_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("copy.qcow2");
        let (guest, fake) = sample_guest(Capabilities::default(), FakeMonitor::new());
        guest
            .start_copy(
                "vda",
                &CopyOptions {
                    destination: dest.clone(),
                    ..Default::default()
                },
            )
            .unwrap();
        let job = guest.job("vda").unwrap();

        guest.shutdown("guest destroyed");
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(job.error().as_deref(), Some("guest destroyed"));
        let disk = guest.disk("vda").unwrap();
        assert!(disk.mirror.is_none());
        assert!(disk.active_job.is_none());
        assert!(fake.revoked().contains(&dest));
        assert!(matches!(guest.refresh_jobs(), Err(crate::Error::GuestInactive(_))));
        assert!(fake.last_command("query-jobs").is_none());
    }
}
