//! Pull jobs: merge backing images into the active image.

use super::addressing::Addressing;
use super::bandwidth::Bandwidth;
use super::chain::{self, Locator};
use super::job::{JobData, JobKind};
use crate::error::{Error, Result};
use crate::storage;
use crate::vm::{Guest, GuestInner};
use blockjobd_protocol::{BlockStreamArgs, Command};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Options for [`Guest::start_pull`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PullOptions {
    /// Image that remains as the active image's backing; `None` or empty
    /// flattens the whole chain.
    pub base: Option<String>,
    /// Bandwidth limit.
    pub bandwidth: Bandwidth,
    /// Record the new backing file as a path relative to the active image.
    pub relative: bool,
}

impl Guest {
    /// Start pulling backing data into `target`'s active image.
    ///
    /// Returns the job id.
    pub fn start_pull(&self, target: &str, opts: &PullOptions) -> Result<String> {
        let _job = self.job_lock.begin("block-pull");
        let speed = opts.bandwidth.speed_arg()?;
        let addressing = Addressing::for_caps(&self.caps);
        if opts.relative && !self.caps.change_backing_file {
            return Err(Error::unsupported(
                "relative backing paths are not supported by this emulator",
            ));
        }
        let base = opts
            .base
            .as_deref()
            .filter(|b| !b.trim().is_empty())
            .map(str::parse::<Locator>)
            .transpose()?;

        addressing.verify_drive(self.monitor.as_ref(), &self.disk(target)?)?;

        let (job, cmd) = {
            let mut inner = self.lock_active()?;
            let idx = inner.disk_index(target)?;
            let GuestInner { disks, jobs, .. } = &mut *inner;
            let disk = &mut disks[idx];

            chain::backing_of(disk, 0)?;
            let base_idx = match &base {
                Some(locator) => {
                    let index = chain::resolve(disk, locator)?.index;
                    if index == 0 {
                        return Err(Error::invalid("pull base cannot be the active image"));
                    }
                    Some(index)
                }
                None => None,
            };

            let backing_file = match (opts.relative, base_idx) {
                (false, _) => None,
                (true, None) => return Err(Error::invalid("relative pull requires a base image")),
                (true, Some(b)) => Some(
                    storage::relative_backing_path(&disk.chain[0].path, &disk.chain[b].path)
                        .ok_or_else(|| Error::invalid("cannot express base as a relative path"))?,
                ),
            };

            let last = base_idx.unwrap_or(disk.chain.len() - 1);
            let nodes: Vec<PathBuf> = disk.chain[..=last].iter().map(|n| n.path.clone()).collect();
            let id = addressing.job_id(JobKind::Pull, disk, &disk.chain[0])?;
            let (base_file, base_node) = match base_idx {
                Some(b) => addressing.image(&disk.chain[b])?,
                None => (None, None),
            };

            let cmd = Command::BlockStream(BlockStreamArgs {
                device: addressing.device(disk)?,
                job_id: addressing.explicit_id(&id),
                base: base_file,
                base_node,
                backing_file,
                speed,
            });
            let data = JobData::Pull {
                base: base_idx.map(|b| disk.chain[b].path.clone()),
            };
            let job = jobs.reserve(disk, id, JobKind::Pull, nodes, data)?;
            (job, cmd)
        };

        self.launch(&job, cmd, |_| {})?;
        Ok(job.id().to_string())
    }
}
