//! Per-guest block job registry.
//!
//! A job is *reserved* while its start command is in flight and becomes
//! visible to lookups only once *activated*. Notifications that arrive for
//! a reserved job's disk are buffered and handed over on activation.

use super::job::{BlockJob, JobData, JobKind, JobState, PendingState};
use crate::error::{Error, Result};
use crate::vm::Disk;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug)]
struct Entry {
    job: Arc<BlockJob>,
    active: bool,
}

/// Jobs of one guest, keyed by job id.
#[derive(Debug, Default)]
pub struct Registry {
    entries: HashMap<String, Entry>,
    buffered: HashMap<String, PendingState>,
}

impl Registry {
    /// Reserve a job on `disk`.
    ///
    /// Fails with [`Error::JobBusy`] if the disk already has a job or a
    /// mirror, or if any of `nodes` is claimed by another job.
    pub fn reserve(
        &mut self,
        disk: &mut Disk,
        id: String,
        kind: JobKind,
        nodes: Vec<PathBuf>,
        data: JobData,
    ) -> Result<Arc<BlockJob>> {
        if let Some(existing) = &disk.active_job {
            return Err(Error::busy(
                &disk.target,
                format!("job '{}' is already running", existing),
            ));
        }
        if disk.mirror.is_some() {
            return Err(Error::busy(&disk.target, "disk has a mirror"));
        }
        if self.entries.contains_key(&id) {
            return Err(Error::busy(&disk.target, format!("job id '{}' is in use", id)));
        }
        for entry in self.entries.values() {
            if entry.job.state().is_terminal() {
                continue;
            }
            if let Some(node) = nodes.iter().find(|n| entry.job.nodes().contains(*n)) {
                return Err(Error::busy(
                    &disk.target,
                    format!("image '{}' is used by job '{}'", node.display(), entry.job.id()),
                ));
            }
        }

        let job = Arc::new(BlockJob::new(id.clone(), kind, Some(disk.target.clone()), nodes, data));
        disk.active_job = Some(id.clone());
        self.buffered.remove(&disk.target);
        self.entries.insert(
            id,
            Entry {
                job: Arc::clone(&job),
                active: false,
            },
        );
        tracing::debug!(disk = %disk.target, job = %job.id(), kind = %kind, "reserved block job");
        Ok(job)
    }

    /// Make a reserved job visible and move it to `Running`.
    ///
    /// A notification buffered for the job's disk becomes its pending
    /// state; returns true in that case.
    pub fn activate(&mut self, job: &BlockJob) -> bool {
        let Some(entry) = self.entries.get_mut(job.id()) else {
            return false;
        };
        entry.active = true;
        job.advance(JobState::Running);

        let buffered = job.disk().and_then(|disk| self.buffered.remove(disk));
        match buffered {
            Some(pending) => {
                tracing::debug!(job = %job.id(), ?pending, "applying buffered notification");
                job.set_pending(pending);
                true
            }
            None => false,
        }
    }

    /// Drop a reserved job whose start command failed.
    pub fn release(&mut self, disk: &mut Disk, job: &BlockJob) {
        if disk.active_job.as_deref() == Some(job.id()) {
            disk.active_job = None;
        }
        self.buffered.remove(&disk.target);
        self.entries.remove(job.id());
        tracing::debug!(disk = %disk.target, job = %job.id(), "released block job reservation");
    }

    /// Register a job the engine did not start, already running.
    pub fn adopt(&mut self, disk: &mut Disk, id: String, kind: JobKind) -> Arc<BlockJob> {
        let job = Arc::new(BlockJob::new(
            id.clone(),
            kind,
            Some(disk.target.clone()),
            disk.chain.iter().map(|n| n.path.clone()).collect(),
            JobData::None,
        ));
        job.advance(JobState::Running);
        disk.active_job = Some(id.clone());
        self.entries.insert(
            id,
            Entry {
                job: Arc::clone(&job),
                active: true,
            },
        );
        tracing::debug!(disk = %disk.target, job = %job.id(), kind = %kind, "adopted block job");
        job
    }

    /// Remove a finished job.
    pub fn unregister(&mut self, disk: Option<&mut Disk>, id: &str) {
        if let Some(disk) = disk {
            if disk.active_job.as_deref() == Some(id) {
                disk.active_job = None;
            }
        }
        self.entries.remove(id);
    }

    /// Activated job running on `disk`.
    pub fn lookup(&self, disk: &Disk) -> Option<Arc<BlockJob>> {
        let id = disk.active_job.as_deref()?;
        self.lookup_by_id(id)
    }

    /// Activated job with the given id.
    pub fn lookup_by_id(&self, id: &str) -> Option<Arc<BlockJob>> {
        self.entries
            .get(id)
            .filter(|entry| entry.active)
            .map(|entry| Arc::clone(&entry.job))
    }

    /// Whether `disk` has a job whose start command is still in flight.
    pub fn is_reserved(&self, disk: &Disk) -> bool {
        disk.active_job
            .as_deref()
            .and_then(|id| self.entries.get(id))
            .is_some_and(|entry| !entry.active)
    }

    /// Disk of the reserved, not yet activated job `id`.
    pub fn reserved_disk(&self, id: &str) -> Option<String> {
        self.entries
            .get(id)
            .filter(|entry| !entry.active)
            .and_then(|entry| entry.job.disk().map(str::to_string))
    }

    /// Hold a notification for the reserved job on `target`.
    pub fn buffer(&mut self, target: &str, pending: PendingState) {
        self.buffered.insert(target.to_string(), pending);
    }

    /// All activated jobs.
    pub fn jobs(&self) -> Vec<Arc<BlockJob>> {
        self.entries
            .values()
            .filter(|entry| entry.active)
            .map(|entry| Arc::clone(&entry.job))
            .collect()
    }

    /// Number of tracked jobs, reserved ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no jobs are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{ChainNode, ImageFormat};

    fn disk(target: &str, images: &[&str]) -> Disk {
        Disk::new(
            target,
            format!("virtio-{}", target),
            images
                .iter()
                .map(|p| ChainNode::new(*p, ImageFormat::Qcow2))
                .collect(),
        )
    }

    fn reserve(reg: &mut Registry, disk: &mut Disk, id: &str, nodes: &[&str]) -> Result<Arc<BlockJob>> {
        reg.reserve(
            disk,
            id.to_string(),
            JobKind::Pull,
            nodes.iter().map(PathBuf::from).collect(),
            JobData::None,
        )
    }

    #[test]
    fn test_one_job_per_disk() {
        let mut reg = Registry::default();
        let mut vda = disk("vda", &["/a", "/b"]);
        reserve(&mut reg, &mut vda, "pull-vda-1", &["/a"]).unwrap();
        let err = reserve(&mut reg, &mut vda, "pull-vda-2", &["/b"]).unwrap_err();
        assert!(matches!(err, Error::JobBusy { .. }));
    }

    #[test]
    fn test_overlapping_nodes_are_busy() {
        let mut reg = Registry::default();
        let mut vda = disk("vda", &["/a", "/shared"]);
        let mut vdb = disk("vdb", &["/c", "/shared"]);
        reserve(&mut reg, &mut vda, "pull-vda", &["/a", "/shared"]).unwrap();
        let err = reserve(&mut reg, &mut vdb, "pull-vdb", &["/c", "/shared"]).unwrap_err();
        assert!(err.to_string().contains("/shared"));
        assert!(vdb.active_job.is_none());
    }

    #[test]
    fn test_reserved_job_is_invisible_until_activated() {
        let mut reg = Registry::default();
        let mut vda = disk("vda", &["/a"]);
        let job = reserve(&mut reg, &mut vda, "pull-vda", &["/a"]).unwrap();
        assert!(reg.lookup(&vda).is_none());
        assert!(reg.is_reserved(&vda));

        assert!(!reg.activate(&job));
        assert_eq!(job.state(), JobState::Running);
        assert!(reg.lookup(&vda).is_some());
        assert!(!reg.is_reserved(&vda));
    }

    #[test]
    fn test_buffered_notification_is_handed_over() {
        let mut reg = Registry::default();
        let mut vda = disk("vda", &["/a"]);
        let job = reserve(&mut reg, &mut vda, "pull-vda", &["/a"]).unwrap();
        reg.buffer("vda", PendingState::Completed);
        assert!(reg.activate(&job));
        assert_eq!(job.take_pending(), Some(PendingState::Completed));
    }

    #[test]
    fn test_release_leaves_no_trace() {
        let mut reg = Registry::default();
        let mut vda = disk("vda", &["/a"]);
        let job = reserve(&mut reg, &mut vda, "pull-vda", &["/a"]).unwrap();
        reg.buffer("vda", PendingState::Ready);
        reg.release(&mut vda, &job);
        assert!(vda.active_job.is_none());
        assert!(reg.is_empty());

        // A later reservation must not inherit the stale notification
        let job = reserve(&mut reg, &mut vda, "pull-vda", &["/a"]).unwrap();
        assert!(!reg.activate(&job));
    }

    #[test]
    fn test_finished_jobs_do_not_claim_nodes() {
        let mut reg = Registry::default();
        let mut vda = disk("vda", &["/a", "/shared"]);
        let mut vdb = disk("vdb", &["/c", "/shared"]);
        let job = reserve(&mut reg, &mut vda, "pull-vda", &["/shared"]).unwrap();
        reg.activate(&job);
        job.fail("boom");
        reserve(&mut reg, &mut vdb, "pull-vdb", &["/shared"]).unwrap();
    }

    #[test]
    fn test_unregister_clears_disk() {
        let mut reg = Registry::default();
        let mut vda = disk("vda", &["/a"]);
        let job = reserve(&mut reg, &mut vda, "pull-vda", &["/a"]).unwrap();
        reg.activate(&job);
        reg.unregister(Some(&mut vda), job.id());
        assert!(vda.active_job.is_none());
        assert!(reg.lookup_by_id("pull-vda").is_none());
    }
}
