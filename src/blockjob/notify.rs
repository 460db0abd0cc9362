//! Routing monitor events to block jobs.
//!
//! The emulator reports job progress in one of two dialects:
//!
//! - `JOB_STATUS_CHANGE`, keyed by job id, with node-name addressing
//! - `BLOCK_JOB_*`, keyed by drive alias or job id, with legacy addressing
//!
//! Each guest listens to exactly one dialect, picked from its capabilities;
//! the other is ignored. Events become [`JobNotification`]s, which are
//! dispatched to the job they name.

use super::job::{JobKind, PendingState};
use crate::vm::{Guest, GuestInner};
use blockjobd_protocol::{Event, JobStatus, JobType, RawEvent};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;

/// How a notification names its job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKey {
    /// Job id.
    Id(String),
    /// Device string: a drive alias, or a job id on emulators that use
    /// the id as device.
    Alias(String),
}

/// A job state change reported by the emulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNotification {
    /// Job the notification is for.
    pub key: JobKey,
    /// Job kind derived from the reported type, when known.
    pub kind: Option<JobKind>,
    /// Reported state.
    pub pending: PendingState,
}

/// Job kind for a type reported by the emulator.
///
/// Image amend jobs have no kind the engine can track.
pub fn kind_for(job_type: JobType) -> Option<JobKind> {
    match job_type {
        JobType::Stream => Some(JobKind::Pull),
        JobType::Commit => Some(JobKind::Commit),
        JobType::Mirror => Some(JobKind::Copy),
        JobType::Backup => Some(JobKind::Backup),
        JobType::Create => Some(JobKind::Create),
        JobType::SnapshotLoad | JobType::SnapshotSave | JobType::SnapshotDelete => {
            Some(JobKind::InternalSnapshotFlush)
        }
        JobType::Amend => None,
    }
}

/// Translate an event into a notification in the given dialect.
fn translate(event: Event, blockdev: bool) -> Option<JobNotification> {
    match (event, blockdev) {
        (Event::JobStatusChange(data), true) => {
            let pending = match data.status {
                JobStatus::Ready => PendingState::Ready,
                JobStatus::Concluded => PendingState::Concluded,
                _ => return None,
            };
            Some(JobNotification {
                key: JobKey::Id(data.id),
                kind: None,
                pending,
            })
        }
        (Event::BlockJobCompleted(data), false) => Some(JobNotification {
            kind: kind_for(data.job_type),
            pending: match data.error {
                Some(error) => PendingState::Failed(error),
                None => PendingState::Completed,
            },
            key: JobKey::Alias(data.device),
        }),
        (Event::BlockJobCancelled(data), false) => Some(JobNotification {
            kind: kind_for(data.job_type),
            pending: PendingState::Cancelled,
            key: JobKey::Alias(data.device),
        }),
        (Event::BlockJobReady(data), false) => Some(JobNotification {
            kind: kind_for(data.job_type),
            pending: PendingState::Ready,
            key: JobKey::Alias(data.device),
        }),
        (Event::BlockJobError(data), false) => {
            tracing::warn!(
                device = %data.device,
                operation = %data.operation,
                action = %data.action,
                "block job I/O error"
            );
            None
        }
        (event, _) => {
            tracing::debug!(?event, blockdev, "ignoring event from the other dialect");
            None
        }
    }
}

/// Where a notification ends up.
enum Route {
    Job(Arc<super::BlockJob>),
    Buffer(String),
    Drop,
}

impl GuestInner {
    fn route(&mut self, note: &JobNotification) -> Route {
        let device = match &note.key {
            JobKey::Id(id) | JobKey::Alias(id) => id.as_str(),
        };
        if let Some(job) = self.jobs.lookup_by_id(device) {
            return Route::Job(job);
        }
        if let Some(target) = self.jobs.reserved_disk(device) {
            return Route::Buffer(target);
        }
        if matches!(note.key, JobKey::Id(_)) {
            return Route::Drop;
        }

        let Some(idx) = self.disk_for_device(device) else {
            return Route::Drop;
        };
        if self.jobs.is_reserved(&self.disks[idx]) {
            return Route::Buffer(self.disks[idx].target.clone());
        }
        if let Some(job) = self.jobs.lookup(&self.disks[idx]) {
            return Route::Job(job);
        }
        match note.kind {
            // Reports of job ends the engine never saw start still update
            // the chain, through a placeholder job
            Some(kind) => {
                let GuestInner { disks, jobs, .. } = self;
                Route::Job(jobs.adopt(&mut disks[idx], device.to_string(), kind))
            }
            None => Route::Drop,
        }
    }
}

impl Guest {
    /// Handle one raw monitor event.
    pub fn handle_event(&self, raw: &RawEvent) {
        let event = match raw.decode() {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(event = %raw.event, error = %e, "malformed monitor event");
                return;
            }
        };
        if let Some(note) = translate(event, self.caps.blockdev) {
            self.dispatch(note);
        }
    }

    /// Deliver a notification to its job.
    ///
    /// While a caller waits synchronously for the job, the notification is
    /// only recorded and the waiter applies it; otherwise it is applied
    /// here.
    pub fn dispatch(&self, note: JobNotification) {
        let job = {
            let mut inner = self.lock();
            match inner.route(&note) {
                Route::Job(job) => job,
                Route::Buffer(target) => {
                    tracing::debug!(disk = %target, ?note, "buffering notification for starting job");
                    inner.jobs.buffer(&target, note.pending);
                    return;
                }
                Route::Drop => {
                    tracing::debug!(?note, "notification for unknown job");
                    return;
                }
            }
        };

        job.set_pending(note.pending);
        if job.sync_waiters() > 0 {
            let _inner = self.lock();
            self.notify_changed();
            return;
        }
        self.apply_pending(&job);
    }
}

/// Feed events from `events` to `guest` on a dedicated thread.
///
/// When the channel closes the monitor connection is gone and the guest
/// is shut down.
pub fn spawn_event_worker(
    guest: Arc<Guest>,
    events: Receiver<RawEvent>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("blockjob-events".to_string())
        .spawn(move || {
            for raw in events {
                tracing::trace!(event = %raw.event, "monitor event");
                guest.handle_event(&raw);
            }
            tracing::info!(guest = %guest.name(), "monitor event stream closed");
            guest.shutdown("monitor connection closed");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockjob::{JobState, PullOptions};
    use crate::monitor::Capabilities;
    use crate::testutil::{sample_guest, FakeMonitor};
    use serde_json::json;
    use std::sync::mpsc;

    fn raw(event: &str, data: serde_json::Value) -> RawEvent {
        RawEvent {
            event: event.to_string(),
            data,
            timestamp: None,
        }
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(kind_for(JobType::Mirror), Some(JobKind::Copy));
        assert_eq!(kind_for(JobType::SnapshotSave), Some(JobKind::InternalSnapshotFlush));
        assert_eq!(kind_for(JobType::Amend), None);
    }

    #[test]
    fn test_dialects_are_exclusive() {
        let legacy = raw(
            "BLOCK_JOB_READY",
            json!({"type": "mirror", "device": "drive-virtio-disk0", "len": 1, "offset": 1, "speed": 0}),
        );
        let modern = raw("JOB_STATUS_CHANGE", json!({"id": "copy-vda", "status": "ready"}));

        let event = legacy.decode().unwrap().unwrap();
        assert!(translate(event.clone(), true).is_none());
        assert_eq!(
            translate(event, false).unwrap().key,
            JobKey::Alias("drive-virtio-disk0".into())
        );

        let event = modern.decode().unwrap().unwrap();
        assert!(translate(event.clone(), false).is_none());
        assert_eq!(translate(event, true).unwrap().pending, PendingState::Ready);
    }

    #[test]
    fn test_intermediate_statuses_are_ignored() {
        let event = raw("JOB_STATUS_CHANGE", json!({"id": "pull-vda", "status": "running"}));
        assert!(translate(event.decode().unwrap().unwrap(), true).is_none());
    }

    #[test]
    fn test_completion_with_error_is_failure() {
        let event = raw(
            "BLOCK_JOB_COMPLETED",
            json!({"type": "commit", "device": "drive-virtio-disk0", "len": 4, "offset": 2, "error": "No space left on device"}),
        );
        let note = translate(event.decode().unwrap().unwrap(), false).unwrap();
        assert_eq!(note.kind, Some(JobKind::Commit));
        assert_eq!(
            note.pending,
            PendingState::Failed("No space left on device".into())
        );
    }

    #[test]
    fn test_unknown_job_id_is_dropped() {
        let (guest, fake) = sample_guest(Capabilities::default(), FakeMonitor::new());
        fake.emit(&guest, "JOB_STATUS_CHANGE", json!({"id": "backup-vda-x", "status": "concluded"}));
        assert!(guest.lock().jobs.is_empty());
        assert!(fake.last_command("query-jobs").is_none());
    }

    #[test]
    fn test_malformed_event_is_ignored() {
        let (guest, _fake) = sample_guest(Capabilities::default(), FakeMonitor::new());
        guest.handle_event(&raw("JOB_STATUS_CHANGE", json!({"status": 7})));
        guest.handle_event(&raw("SHUTDOWN", json!({})));
        assert!(guest.is_active());
    }

    #[test]
    fn test_legacy_ready_moves_job() {
        let (guest, fake) = sample_guest(Capabilities::legacy(), FakeMonitor::new());
        fake.reply("query-block", json!([{"device": "drive-virtio-disk0"}]));
        guest.start_pull("vda", &PullOptions::default()).unwrap();
        guest.dispatch(JobNotification {
            key: JobKey::Alias("virtio-disk0".into()),
            kind: Some(JobKind::Pull),
            pending: PendingState::Ready,
        });
        assert_eq!(guest.job("vda").unwrap().state(), JobState::Ready);
    }

    #[test]
    fn test_event_worker_shuts_down_guest_on_close() {
        let (guest, _fake) = sample_guest(Capabilities::default(), FakeMonitor::new());
        guest.start_pull("vda", &PullOptions::default()).unwrap();
        let job = guest.job("vda").unwrap();

        let (tx, rx) = mpsc::channel();
        let worker = spawn_event_worker(Arc::clone(&guest), rx).unwrap();
        tx.send(raw("JOB_STATUS_CHANGE", json!({"id": job.id(), "status": "ready"})))
            .unwrap();
        drop(tx);
        worker.join().unwrap();

        assert!(!guest.is_active());
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(job.error().as_deref(), Some("monitor connection closed"));
    }
}
