//! Copy jobs: mirror a disk onto a new destination.

use super::addressing::{node_name, Addressing};
use super::bandwidth::Bandwidth;
use super::job::{JobData, JobKind};
use crate::error::{Error, Result};
use crate::storage;
use crate::vm::{ChainNode, Guest, GuestInner, ImageFormat};
use blockjobd_protocol::{Command, DriveMirrorArgs, MirrorMode, MirrorSync};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Smallest accepted dirty bitmap granularity (512 B).
pub const MIN_GRANULARITY: u32 = 512;

/// Largest accepted dirty bitmap granularity (64 MiB).
pub const MAX_GRANULARITY: u32 = 64 << 20;

/// Options for [`Guest::start_copy`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyOptions {
    /// Absolute path of the destination image.
    pub destination: PathBuf,
    /// Destination format; probed for reused files, otherwise the format
    /// of the active image.
    pub format: Option<ImageFormat>,
    /// Bandwidth limit.
    pub bandwidth: Bandwidth,
    /// Dirty bitmap granularity in bytes.
    pub granularity: Option<u32>,
    /// In-flight buffer size in bytes.
    pub buf_size: Option<u64>,
    /// Copy only the active image; the destination shares its backing chain.
    pub shallow: bool,
    /// Use an existing destination file as-is.
    pub reuse_existing: bool,
}

fn check_granularity(granularity: Option<u32>) -> Result<()> {
    match granularity {
        Some(g)
            if !g.is_power_of_two() || !(MIN_GRANULARITY..=MAX_GRANULARITY).contains(&g) =>
        {
            Err(Error::invalid(format!(
                "granularity {} must be a power of two between {} and {}",
                g, MIN_GRANULARITY, MAX_GRANULARITY
            )))
        }
        _ => Ok(()),
    }
}

impl Guest {
    /// Start copying `target` onto a new destination.
    ///
    /// The job becomes ready once the destination mirrors the disk; it is
    /// finished by [`Guest::abort`] with a pivot. Returns the job id.
    pub fn start_copy(&self, target: &str, opts: &CopyOptions) -> Result<String> {
        let _job = self.job_lock.begin("block-copy");
        let speed = opts.bandwidth.speed_arg()?;
        let addressing = Addressing::for_caps(&self.caps);
        if !self.caps.drive_mirror {
            return Err(Error::unsupported("copy jobs are not supported by this emulator"));
        }
        let dest = &opts.destination;
        if !dest.is_absolute() {
            return Err(Error::invalid(format!(
                "copy destination '{}' must be an absolute path",
                dest.display()
            )));
        }
        check_granularity(opts.granularity)?;

        let snapshot = self.disk(target)?;
        let active = snapshot
            .active()
            .ok_or_else(|| Error::not_found(format!("active image of '{}'", target)))?;
        if snapshot.position(dest).is_some() {
            return Err(Error::invalid(format!(
                "copy destination '{}' is part of the disk's backing chain",
                dest.display()
            )));
        }

        let format = match opts.format {
            Some(format) => format,
            None if opts.reuse_existing && dest.exists() => storage::probe_format(dest)?,
            None => active.format,
        };
        if opts.shallow && !format.supports_backing() {
            return Err(Error::unsupported(format!(
                "shallow copy needs a destination format with backing support, not {}",
                format
            )));
        }
        let detected = if opts.reuse_existing {
            if !dest.exists() {
                return Err(Error::not_found(format!(
                    "copy destination '{}'",
                    dest.display()
                )));
            }
            let detected = storage::detect_chain(dest, Some(format))?;
            tracing::debug!(
                destination = %dest.display(),
                depth = detected.len(),
                "reusing copy destination"
            );
            Some(detected.into_iter().skip(1).collect::<Vec<_>>())
        } else {
            None
        };

        addressing.verify_drive(self.monitor.as_ref(), &snapshot)?;

        let (job, cmd, mirror) = {
            let mut inner = self.lock_active()?;
            let idx = inner.disk_index(target)?;
            let mirror_name = inner.allocate_node_name(target);
            let backing = detected.map(|chain| name_backing(&mut inner, idx, chain));
            let GuestInner { disks, jobs, .. } = &mut *inner;
            let disk = &mut disks[idx];

            let active = disk
                .active()
                .ok_or_else(|| Error::not_found(format!("active image of '{}'", target)))?;
            let id = addressing.job_id(JobKind::Copy, disk, active)?;
            let mirror = ChainNode::new(dest.clone(), format)
                .with_node_name(mirror_name)
                .writable();
            let node = match addressing {
                Addressing::NodeName => Some(node_name(&mirror)?.to_string()),
                Addressing::Legacy => None,
            };

            let cmd = Command::DriveMirror(DriveMirrorArgs {
                device: addressing.device(disk)?,
                job_id: addressing.explicit_id(&id),
                target: dest.display().to_string(),
                format: Some(format.as_str().to_string()),
                node_name: node,
                sync: if opts.shallow {
                    MirrorSync::Top
                } else {
                    MirrorSync::Full
                },
                mode: if opts.reuse_existing {
                    MirrorMode::Existing
                } else {
                    MirrorMode::AbsolutePaths
                },
                speed,
                granularity: opts.granularity,
                buf_size: opts.buf_size,
            });

            let mut nodes: Vec<PathBuf> = disk.chain.iter().map(|n| n.path.clone()).collect();
            nodes.push(dest.clone());
            for node in backing.iter().flatten() {
                if !nodes.contains(&node.path) {
                    nodes.push(node.path.clone());
                }
            }
            let data = JobData::Copy {
                destination: dest.clone(),
                backing,
            };
            let job = jobs.reserve(disk, id, JobKind::Copy, nodes, data)?;
            disk.mirror = Some(mirror.clone());
            disk.mirror_job = Some(JobKind::Copy);
            (job, cmd, mirror)
        };

        let abandon = |inner: &mut GuestInner, created: bool| {
            if created {
                if let Err(e) = storage::remove_image_file(dest) {
                    tracing::warn!(destination = %dest.display(), error = %e, "failed to remove copy destination");
                }
            }
            if let Ok(idx) = inner.disk_index(target) {
                inner.disks[idx].take_mirror();
            }
        };

        let created = if opts.reuse_existing {
            false
        } else {
            match storage::create_image_file(dest) {
                Ok(created) => created,
                Err(e) => {
                    let mut inner = self.lock();
                    abandon(&mut inner, false);
                    self.release(&mut inner, &job);
                    return Err(e);
                }
            }
        };

        if let Err(e) = self.access.grant(&mirror, true) {
            let mut inner = self.lock();
            abandon(&mut inner, created);
            self.release(&mut inner, &job);
            return Err(e);
        }

        self.launch(&job, cmd, |inner| {
            self.access.revoke(&mirror);
            abandon(inner, created);
        })?;
        Ok(job.id().to_string())
    }
}

/// Give the backing images of a reused destination their node-names,
/// keeping the names of images already in the disk's chain.
fn name_backing(inner: &mut GuestInner, idx: usize, chain: Vec<ChainNode>) -> Vec<ChainNode> {
    let target = inner.disks[idx].target.clone();
    chain
        .into_iter()
        .map(|mut node| {
            let known = inner.disks[idx]
                .chain
                .iter()
                .find(|n| n.path == node.path)
                .and_then(|n| n.node_name.clone());
            node.node_name = Some(match known {
                Some(name) => name,
                None => inner.allocate_node_name(&target),
            });
            node
        })
        .collect()
}
