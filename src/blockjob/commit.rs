//! Commit jobs: merge an image into one of its backing images.
//!
//! Committing the active image is an *active commit*: the base becomes a
//! mirror of the active image and the job finishes with a pivot onto it.

use super::addressing::Addressing;
use super::bandwidth::Bandwidth;
use super::chain::{self, Locator};
use super::job::{JobData, JobKind};
use crate::error::{Error, Result};
use crate::storage;
use crate::vm::{ChainNode, Guest, GuestInner};
use blockjobd_protocol::{BlockCommitArgs, Command};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Options for [`Guest::start_commit`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitOptions {
    /// Image to commit; defaults to the active image.
    pub top: Option<String>,
    /// Image receiving the data; defaults to the bottom of the chain.
    pub base: Option<String>,
    /// Bandwidth limit.
    pub bandwidth: Bandwidth,
    /// Use the immediate backing image of `top` as the base.
    pub shallow: bool,
    /// Record the new backing file as a relative path.
    pub relative: bool,
    /// Remove the spliced-out image files once the commit succeeds.
    pub delete_intermediate: bool,
}

impl Guest {
    /// Start committing part of `target`'s backing chain.
    ///
    /// Returns the job id.
    pub fn start_commit(&self, target: &str, opts: &CommitOptions) -> Result<String> {
        let _job = self.job_lock.begin("block-commit");
        let speed = opts.bandwidth.speed_arg()?;
        let addressing = Addressing::for_caps(&self.caps);
        let top = parse_locator(opts.top.as_deref())?;
        let base = parse_locator(opts.base.as_deref())?;

        addressing.verify_drive(self.monitor.as_ref(), &self.disk(target)?)?;

        let (job, cmd, grants) = {
            let mut inner = self.lock_active()?;
            let idx = inner.disk_index(target)?;
            let GuestInner { disks, jobs, .. } = &mut *inner;
            let disk = &mut disks[idx];

            let top_idx = match &top {
                Some(locator) => chain::resolve(disk, locator)?.index,
                None => 0,
            };
            let below = chain::backing_of(disk, top_idx)?;
            let base_idx = match (&base, opts.shallow) {
                (Some(locator), shallow) => {
                    let index = chain::resolve(disk, locator)?.index;
                    if shallow && index != below {
                        return Err(Error::invalid(
                            "shallow commit base must be the backing image of top",
                        ));
                    }
                    index
                }
                (None, true) => below,
                (None, false) => disk.chain.len() - 1,
            };
            if base_idx <= top_idx {
                return Err(Error::invalid(format!(
                    "base '{}' is not below top '{}'",
                    disk.chain[base_idx].display(),
                    disk.chain[top_idx].display()
                )));
            }

            let active = top_idx == 0;
            if active && !self.caps.active_commit {
                return Err(Error::unsupported(
                    "committing the active image is not supported by this emulator",
                ));
            }
            if opts.relative && active {
                return Err(Error::unsupported(
                    "relative backing paths cannot be used with active commit",
                ));
            }
            if opts.relative && !self.caps.change_backing_file {
                return Err(Error::unsupported(
                    "relative backing paths are not supported by this emulator",
                ));
            }

            let top_parent = top_idx.checked_sub(1);
            let backing_file = match (opts.relative, top_parent) {
                (true, Some(parent)) => Some(
                    storage::relative_backing_path(
                        &disk.chain[parent].path,
                        &disk.chain[base_idx].path,
                    )
                    .ok_or_else(|| Error::invalid("cannot express base as a relative path"))?,
                ),
                _ => None,
            };

            let kind = if active {
                JobKind::ActiveCommit
            } else {
                JobKind::Commit
            };
            let first = top_parent.unwrap_or(top_idx);
            let nodes: Vec<PathBuf> = disk.chain[first..=base_idx]
                .iter()
                .map(|n| n.path.clone())
                .collect();
            let id = addressing.job_id(kind, disk, &disk.chain[top_idx])?;
            let (top_file, top_node) = addressing.image(&disk.chain[top_idx])?;
            let (base_file, base_node) = addressing.image(&disk.chain[base_idx])?;

            let cmd = Command::BlockCommit(BlockCommitArgs {
                device: addressing.device(disk)?,
                job_id: addressing.explicit_id(&id),
                top: top_file,
                base: base_file,
                top_node,
                base_node,
                backing_file,
                speed,
            });

            // Write access for base, and for top's overlay unless it is
            // the active image
            let mut grants: Vec<ChainNode> = vec![disk.chain[base_idx].clone()];
            if let Some(parent) = top_parent.filter(|p| *p > 0) {
                grants.push(disk.chain[parent].clone());
            }

            let data = JobData::Commit {
                top: disk.chain[top_idx].path.clone(),
                base: disk.chain[base_idx].path.clone(),
                top_parent: top_parent.map(|p| disk.chain[p].path.clone()),
                delete_intermediate: opts.delete_intermediate,
            };
            let mirror = disk.chain[base_idx].clone();
            let job = jobs.reserve(disk, id, kind, nodes, data)?;
            if active {
                disk.mirror = Some(mirror);
                disk.mirror_job = Some(JobKind::ActiveCommit);
            }
            (job, cmd, grants)
        };

        let mut granted: Vec<&ChainNode> = Vec::new();
        for node in &grants {
            if let Err(e) = self.access.grant(node, true) {
                self.restore_readonly(&granted);
                let mut inner = self.lock();
                clear_mirror(&mut inner, target);
                self.release(&mut inner, &job);
                return Err(e);
            }
            granted.push(node);
        }

        self.launch(&job, cmd, |inner| {
            self.restore_readonly(&granted);
            clear_mirror(inner, target);
        })?;
        Ok(job.id().to_string())
    }

    pub(super) fn restore_readonly(&self, nodes: &[&ChainNode]) {
        for node in nodes {
            if let Err(e) = self.access.grant(node, false) {
                tracing::warn!(image = %node.display(), error = %e, "failed to restore read-only access");
            }
        }
    }
}

fn parse_locator(s: Option<&str>) -> Result<Option<Locator>> {
    s.filter(|s| !s.trim().is_empty())
        .map(str::parse::<Locator>)
        .transpose()
}

fn clear_mirror(inner: &mut GuestInner, target: &str) {
    if let Ok(idx) = inner.disk_index(target) {
        inner.disks[idx].take_mirror();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockjob::{AbortOptions, JobState};
    use crate::monitor::Capabilities;
    use crate::testutil::{sample_guest, FakeMonitor};
    use serde_json::json;

    fn concluded(fake: &FakeMonitor, id: &str, kind: &str) {
        fake.reply(
            "query-jobs",
            json!([{"id": id, "type": kind, "status": "concluded"}]),
        );
    }

    #[test]
    fn test_commit_middle_image_splices_chain() {
        let (guest, fake) = sample_guest(Capabilities::default(), FakeMonitor::new());
        let id = guest
            .start_commit(
                "vda",
                &CommitOptions {
                    top: Some("vda[1]".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(id, "commit-vda-vda-fmt1");

        let cmd = fake.last_command("block-commit").unwrap();
        assert_eq!(cmd["arguments"]["top-node"], "vda-fmt1");
        assert_eq!(cmd["arguments"]["base-node"], "vda-fmt2");
        // Base is the only image needing write access; top's overlay is active
        assert_eq!(fake.granted(), vec![(PathBuf::from("/images/vda-base.raw"), true)]);
        assert_eq!(guest.job("vda").unwrap().kind(), JobKind::Commit);

        concluded(&fake, &id, "commit");
        fake.emit(&guest, "JOB_STATUS_CHANGE", json!({"id": id, "status": "concluded"}));

        let disk = guest.disk("vda").unwrap();
        let paths: Vec<_> = disk.chain.iter().map(|n| n.display()).collect();
        assert_eq!(paths, vec!["/images/vda-top.qcow2", "/images/vda-base.raw"]);
        assert!(disk.chain[1].readonly);
        assert!(fake
            .granted()
            .contains(&(PathBuf::from("/images/vda-base.raw"), false)));
        assert!(fake.revoked().contains(&PathBuf::from("/images/vda-mid.qcow2")));
    }

    #[test]
    fn test_shallow_commit_uses_immediate_backing() {
        let (guest, fake) = sample_guest(Capabilities::default(), FakeMonitor::new());
        guest
            .start_commit(
                "vda",
                &CommitOptions {
                    shallow: true,
                    ..Default::default()
                },
            )
            .unwrap();
        let cmd = fake.last_command("block-commit").unwrap();
        assert_eq!(cmd["arguments"]["base-node"], "vda-fmt1");
        assert_eq!(guest.job("vda").unwrap().kind(), JobKind::ActiveCommit);
        assert_eq!(
            guest.disk("vda").unwrap().mirror.map(|m| m.path),
            Some(PathBuf::from("/images/vda-mid.qcow2"))
        );
    }

    #[test]
    fn test_commit_rejections() {
        let caps = Capabilities {
            active_commit: false,
            ..Capabilities::default()
        };
        let (guest, _fake) = sample_guest(caps, FakeMonitor::new());

        let err = guest.start_commit("vda", &CommitOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));

        let err = guest
            .start_commit(
                "vda",
                &CommitOptions {
                    top: Some("vda[2]".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::NoBackingFile(_)));

        let err = guest
            .start_commit(
                "vda",
                &CommitOptions {
                    top: Some("vda[2]".into()),
                    base: Some("vda[1]".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::NoBackingFile(_)));

        let err = guest
            .start_commit(
                "vda",
                &CommitOptions {
                    top: Some("vda[1]".into()),
                    base: Some("vda[1]".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(guest.lock().jobs.is_empty());
    }

    #[test]
    fn test_relative_active_commit_rejected() {
        let (guest, _fake) = sample_guest(Capabilities::default(), FakeMonitor::new());
        let err = guest
            .start_commit(
                "vda",
                &CommitOptions {
                    relative: true,
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn test_rejected_commit_revokes_grants() {
        let (guest, fake) = sample_guest(Capabilities::default(), FakeMonitor::new());
        fake.reject("block-commit", "Permission denied");
        let err = guest.start_commit("vda", &CommitOptions::default()).unwrap_err();
        assert!(matches!(err, Error::MonitorRejected { .. }));

        let base = PathBuf::from("/images/vda-base.raw");
        assert_eq!(fake.granted(), vec![(base.clone(), true), (base, false)]);
        let disk = guest.disk("vda").unwrap();
        assert!(disk.mirror.is_none());
        assert!(disk.active_job.is_none());
    }

    #[test]
    fn test_failed_commit_leaves_base_writable() {
        let (guest, fake) = sample_guest(Capabilities::default(), FakeMonitor::new());
        let id = guest
            .start_commit(
                "vda",
                &CommitOptions {
                    top: Some("vda[1]".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        fake.reply(
            "query-jobs",
            json!([{"id": id, "type": "commit", "status": "concluded", "error": "Input/output error"}]),
        );
        fake.emit(&guest, "JOB_STATUS_CHANGE", json!({"id": id, "status": "concluded"}));

        let base = PathBuf::from("/images/vda-base.raw");
        assert_eq!(fake.granted(), vec![(base, true)]);
        assert_eq!(guest.disk("vda").unwrap().chain.len(), 3);
        assert!(guest.job("vda").is_none());
    }

    #[test]
    fn test_delete_intermediate_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let (guest, fake) = crate::testutil::guest_with_files(
            Capabilities::default(),
            FakeMonitor::new(),
            dir.path(),
        );
        let id = guest
            .start_commit(
                "vda",
                &CommitOptions {
                    top: Some("vda[1]".into()),
                    delete_intermediate: true,
                    ..Default::default()
                },
            )
            .unwrap();
        concluded(&fake, &id, "commit");
        fake.emit(&guest, "JOB_STATUS_CHANGE", json!({"id": id, "status": "concluded"}));

        assert!(!dir.path().join("mid.qcow2").exists());
        assert!(dir.path().join("top.qcow2").exists());
        assert!(dir.path().join("base.qcow2").exists());
    }

    #[test]
    fn test_active_commit_sync_pivot() {
        let (guest, fake) = sample_guest(Capabilities::default(), FakeMonitor::new());
        let id = guest.start_commit("vda", &CommitOptions::default()).unwrap();
        assert_eq!(id, "commit-vda-vda-fmt0");

        fake.emit(&guest, "JOB_STATUS_CHANGE", json!({"id": id, "status": "ready"}));
        assert_eq!(guest.job("vda").unwrap().state(), JobState::Ready);

        concluded(&fake, &id, "commit");
        fake.emit_during(
            "job-complete",
            "JOB_STATUS_CHANGE",
            json!({"id": id, "status": "concluded"}),
        );
        guest
            .abort(
                "vda",
                &AbortOptions {
                    pivot: true,
                    asynchronous: false,
                },
            )
            .unwrap();

        let disk = guest.disk("vda").unwrap();
        assert_eq!(disk.chain.len(), 1);
        assert_eq!(disk.chain[0].path, PathBuf::from("/images/vda-base.raw"));
        assert!(!disk.chain[0].readonly);
        assert!(disk.mirror.is_none());
        assert!(disk.active_job.is_none());
    }
}
