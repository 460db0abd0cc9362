//! Applying reported job states to the guest.
//!
//! A state reported by the emulator is stored as the job's pending state
//! and applied here, either right away by the event router or by a caller
//! waiting synchronously for the job. Terminal states rewrite the disk's
//! backing chain according to the job kind and drop the job from the
//! registry.

use super::job::{BlockJob, JobData, JobKind, JobState, PendingState};
use crate::storage;
use crate::vm::{ChainNode, Disk, Guest, GuestInner, MirrorState};
use blockjobd_protocol::{Command, JobRef};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Error recorded when a concluded job's outcome cannot be queried.
pub const UNKNOWN_OUTCOME: &str = "unable to determine job outcome";

/// Final outcome of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Completed,
    Cancelled,
    Failed(String),
}

impl Guest {
    /// Apply the job's pending state, if any.
    ///
    /// Must be called without the guest state lock held; a concluded job
    /// needs a monitor round-trip to learn its outcome.
    pub(crate) fn apply_pending(&self, job: &Arc<BlockJob>) {
        let Some(pending) = job.take_pending() else {
            return;
        };
        let pending = match pending {
            PendingState::Concluded => self.fetch_outcome(job),
            other => other,
        };

        let mut inner = self.lock();
        self.apply_locked(&mut inner, job, pending);
        drop(inner);
        self.notify_changed();
    }

    /// Query the outcome of a concluded job and dismiss it.
    fn fetch_outcome(&self, job: &BlockJob) -> PendingState {
        let outcome = match self.monitor.query_jobs() {
            Ok(jobs) => match jobs.into_iter().find(|info| info.id == job.id()) {
                Some(info) => match info.error {
                    Some(error) => PendingState::Failed(error),
                    None => PendingState::Completed,
                },
                None => {
                    tracing::warn!(job = %job.id(), "concluded job missing from job list");
                    PendingState::Failed(UNKNOWN_OUTCOME.to_string())
                }
            },
            Err(e) => {
                tracing::warn!(job = %job.id(), error = %e, "failed to query concluded job");
                PendingState::Failed(UNKNOWN_OUTCOME.to_string())
            }
        };

        let dismiss = Command::JobDismiss(JobRef {
            id: job.id().to_string(),
        });
        if let Err(e) = self.monitor.run(dismiss) {
            tracing::warn!(job = %job.id(), error = %e, "failed to dismiss concluded job");
        }
        outcome
    }

    pub(crate) fn apply_locked(&self, inner: &mut GuestInner, job: &BlockJob, pending: PendingState) {
        let state = job.state();
        if state.is_terminal() {
            tracing::debug!(job = %job.id(), ?pending, "ignoring report for finished job");
            return;
        }

        let outcome = match pending {
            PendingState::Ready => {
                if job.advance(JobState::Ready) {
                    tracing::info!(job = %job.id(), disk = job.disk().unwrap_or("-"), "block job ready");
                }
                return;
            }
            PendingState::Completed if state == JobState::Aborting => Outcome::Cancelled,
            PendingState::Completed => Outcome::Completed,
            PendingState::Cancelled => Outcome::Cancelled,
            PendingState::Failed(message) => Outcome::Failed(message),
            PendingState::Concluded => Outcome::Failed(UNKNOWN_OUTCOME.to_string()),
        };

        let idx = job.disk().and_then(|target| inner.disk_index(target).ok());
        match (&outcome, idx) {
            (Outcome::Completed, Some(idx)) if *job.data() == JobData::None => {
                self.redetect_chain(inner, idx);
            }
            (Outcome::Completed, Some(idx)) => self.finish_completed(&mut inner.disks[idx], job),
            (Outcome::Cancelled, Some(idx)) => self.finish_cancelled(&mut inner.disks[idx], job),
            (Outcome::Failed(_), Some(idx)) => self.finish_failed(&mut inner.disks[idx], job),
            (_, None) => {}
        }

        match outcome {
            Outcome::Completed => {
                job.advance(JobState::Concluded);
                tracing::info!(job = %job.id(), kind = %job.kind(), "block job completed");
            }
            Outcome::Cancelled if state == JobState::Pivoting => {
                job.fail("job was cancelled before the pivot completed");
                tracing::warn!(job = %job.id(), "block job cancelled while pivoting");
            }
            Outcome::Cancelled => {
                job.advance(JobState::Concluded);
                tracing::info!(job = %job.id(), kind = %job.kind(), "block job cancelled");
            }
            Outcome::Failed(message) => {
                tracing::warn!(job = %job.id(), kind = %job.kind(), error = %message, "block job failed");
                job.fail(message);
            }
        }

        match idx {
            Some(idx) => inner.jobs.unregister(Some(&mut inner.disks[idx]), job.id()),
            None => inner.jobs.unregister(None, job.id()),
        }
    }

    // ========================================================================
    // Completion
    // ========================================================================

    fn finish_completed(&self, disk: &mut Disk, job: &BlockJob) {
        match (job.kind(), job.data()) {
            (JobKind::Pull, JobData::Pull { base }) => self.finish_pull(disk, base.as_deref()),
            (
                JobKind::Commit,
                JobData::Commit {
                    top,
                    base,
                    delete_intermediate,
                    ..
                },
            ) => self.finish_commit(disk, top, base, *delete_intermediate),
            (JobKind::ActiveCommit, JobData::Commit { base, delete_intermediate, .. }) => {
                if disk.mirror_state == MirrorState::PivotRequested {
                    self.pivot_active_commit(disk, base, *delete_intermediate);
                } else {
                    self.finish_cancelled(disk, job);
                }
            }
            (JobKind::Copy, JobData::Copy { backing, .. }) => {
                if disk.mirror_state == MirrorState::PivotRequested {
                    self.pivot_copy(disk, backing.as_deref());
                } else {
                    self.discard_mirror(disk);
                }
            }
            (kind, data) => {
                tracing::debug!(job = %job.id(), %kind, ?data, "no chain update for job");
            }
        }
    }

    /// Drop the images merged into the active image.
    fn finish_pull(&self, disk: &mut Disk, base: Option<&Path>) {
        let end = match base {
            Some(base) => match disk.position(base) {
                Some(end) => end,
                None => {
                    tracing::warn!(disk = %disk.target, base = %base.display(), "pull base left the chain");
                    return;
                }
            },
            None => disk.chain.len(),
        };
        if end <= 1 {
            return;
        }
        let removed: Vec<ChainNode> = disk.chain.drain(1..end).collect();
        for node in &removed {
            self.access.revoke(node);
        }
        tracing::debug!(disk = %disk.target, removed = removed.len(), "pull rewrote backing chain");
    }

    /// Splice `top` and everything between it and `base` out of the chain.
    fn finish_commit(&self, disk: &mut Disk, top: &Path, base: &Path, delete_intermediate: bool) {
        let (Some(top_idx), Some(base_idx)) = (disk.position(top), disk.position(base)) else {
            tracing::warn!(disk = %disk.target, "commit images left the chain");
            return;
        };
        if base_idx <= top_idx {
            return;
        }
        let removed: Vec<ChainNode> = disk.chain.drain(top_idx..base_idx).collect();
        for node in &removed {
            self.access.revoke(node);
        }

        let mut restore = vec![&disk.chain[top_idx]];
        if let Some(parent) = top_idx.checked_sub(1).filter(|p| *p > 0) {
            restore.push(&disk.chain[parent]);
        }
        self.restore_readonly(&restore);

        if delete_intermediate {
            remove_images(&removed);
        }
        tracing::debug!(disk = %disk.target, removed = removed.len(), "commit rewrote backing chain");
    }

    /// Make the commit base the active image.
    fn pivot_active_commit(&self, disk: &mut Disk, base: &Path, delete_intermediate: bool) {
        let Some(base_idx) = disk.position(base) else {
            tracing::warn!(disk = %disk.target, base = %base.display(), "commit base left the chain");
            disk.take_mirror();
            return;
        };
        let removed: Vec<ChainNode> = disk.chain.drain(..base_idx).collect();
        disk.chain[0].readonly = false;
        disk.take_mirror();

        if let Some(old_active) = removed.first() {
            self.access.unlock(old_active);
        }
        for node in &removed {
            self.access.revoke(node);
        }
        if delete_intermediate {
            remove_images(&removed);
        }
        tracing::info!(disk = %disk.target, active = %disk.chain[0].display(), "pivoted to commit base");
    }

    /// Make the copy destination the active image.
    ///
    /// A reused destination keeps the backing chain detected in its
    /// headers; a created one gets the old active image as its read-only
    /// backing.
    fn pivot_copy(&self, disk: &mut Disk, backing: Option<&[ChainNode]>) {
        let Some(mut mirror) = disk.take_mirror() else {
            tracing::warn!(disk = %disk.target, "pivot requested without a mirror");
            return;
        };
        mirror.readonly = false;
        if let Some(old_active) = disk.chain.first_mut() {
            old_active.readonly = true;
            self.access.unlock(old_active);
        }

        match backing {
            Some(backing) => {
                let old = std::mem::take(&mut disk.chain);
                for node in old.iter().filter(|n| !backing.iter().any(|b| b.path == n.path)) {
                    self.access.revoke(node);
                }
                disk.chain = std::iter::once(mirror).chain(backing.iter().cloned()).collect();
            }
            None => disk.chain.insert(0, mirror),
        }
        tracing::info!(
            disk = %disk.target,
            active = %disk.chain[0].display(),
            depth = disk.chain.len(),
            "pivoted to copy destination"
        );
    }

    /// Re-read the chain from disk after a job the engine has no record of.
    fn redetect_chain(&self, inner: &mut GuestInner, idx: usize) {
        let Some(active) = inner.disks[idx].active().cloned() else {
            return;
        };
        let detected = match storage::detect_chain(&active.path, Some(active.format)) {
            Ok(detected) => detected,
            Err(e) => {
                tracing::warn!(disk = %inner.disks[idx].target, error = %e, "failed to re-detect backing chain");
                return;
            }
        };

        let target = inner.disks[idx].target.clone();
        let mut chain = Vec::with_capacity(detected.len());
        for (i, mut node) in detected.into_iter().enumerate() {
            let known = inner.disks[idx]
                .chain
                .iter()
                .find(|n| n.path == node.path)
                .and_then(|n| n.node_name.clone());
            node.node_name = Some(match known {
                Some(name) => name,
                None => inner.allocate_node_name(&target),
            });
            if i == 0 {
                node.readonly = active.readonly;
            }
            chain.push(node);
        }

        let disk = &mut inner.disks[idx];
        let kept: Vec<PathBuf> = chain.iter().map(|n| n.path.clone()).collect();
        for node in disk.chain.iter().filter(|n| !kept.contains(&n.path)) {
            self.access.revoke(node);
        }
        disk.chain = chain;
        tracing::debug!(disk = %disk.target, depth = disk.chain.len(), "re-detected backing chain");
    }

    // ========================================================================
    // Cancellation And Failure
    // ========================================================================

    fn finish_cancelled(&self, disk: &mut Disk, job: &BlockJob) {
        self.discard_mirror(disk);
        if let JobData::Commit {
            base, top_parent, ..
        } = job.data()
        {
            let restore: Vec<&ChainNode> = std::iter::once(base)
                .chain(top_parent.iter())
                .filter_map(|path| disk.position(path))
                .filter(|idx| *idx > 0)
                .map(|idx| &disk.chain[idx])
                .collect();
            self.restore_readonly(&restore);
        }
    }

    fn finish_failed(&self, disk: &mut Disk, job: &BlockJob) {
        self.discard_mirror(disk);
        if matches!(job.data(), JobData::Commit { .. }) {
            tracing::warn!(job = %job.id(), disk = %disk.target, "leaving commit images writable after failure");
        }
    }

    /// Drop the disk's mirror; a copy destination also loses its access.
    pub(crate) fn discard_mirror(&self, disk: &mut Disk) {
        let owner = disk.mirror_job;
        if let Some(mirror) = disk.take_mirror() {
            if owner == Some(JobKind::Copy) {
                self.access.revoke(&mirror);
            }
        }
    }
}

fn remove_images(nodes: &[ChainNode]) {
    for node in nodes {
        if let Err(e) = storage::remove_image_file(&node.path) {
            tracing::warn!(image = %node.display(), error = %e, "failed to remove image");
        }
    }
}
