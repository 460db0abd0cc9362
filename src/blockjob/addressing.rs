//! How jobs and images are named in monitor commands.
//!
//! Emulators with node-name support address a job by an explicit job id and
//! images by node-name. Older emulators only know the drive alias, which
//! doubles as the job id, and take images as file names.

use super::job::JobKind;
use crate::error::{Error, Result};
use crate::monitor::{Capabilities, Monitor};
use crate::vm::{ChainNode, Disk};

/// Addressing mode of the emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    /// Job ids and node-names.
    NodeName,
    /// Drive aliases and file names.
    Legacy,
}

impl Addressing {
    /// Addressing mode supported by an emulator with `caps`.
    pub fn for_caps(caps: &Capabilities) -> Self {
        if caps.blockdev {
            Addressing::NodeName
        } else {
            Addressing::Legacy
        }
    }

    /// Id of a `kind` job on `disk` operating on `node`.
    pub fn job_id(&self, kind: JobKind, disk: &Disk, node: &ChainNode) -> Result<String> {
        match self {
            Addressing::NodeName => Ok(format!(
                "{}-{}-{}",
                kind.prefix(),
                disk.target,
                node_name(node)?
            )),
            Addressing::Legacy => Ok(disk.drive_alias()),
        }
    }

    /// Job id to pass explicitly in the start command.
    pub fn explicit_id(&self, id: &str) -> Option<String> {
        match self {
            Addressing::NodeName => Some(id.to_string()),
            Addressing::Legacy => None,
        }
    }

    /// Device argument naming `disk`'s active image.
    pub fn device(&self, disk: &Disk) -> Result<String> {
        match self {
            Addressing::NodeName => {
                let active = disk
                    .active()
                    .ok_or_else(|| Error::not_found(format!("active image of '{}'", disk.target)))?;
                Ok(node_name(active)?.to_string())
            }
            Addressing::Legacy => Ok(disk.drive_alias()),
        }
    }

    /// Image argument as `(file, node)`; exactly one is set.
    pub fn image(&self, node: &ChainNode) -> Result<(Option<String>, Option<String>)> {
        match self {
            Addressing::NodeName => Ok((None, Some(node_name(node)?.to_string()))),
            Addressing::Legacy => Ok((Some(node.display()), None)),
        }
    }

    /// Confirm the emulator knows `disk`'s drive alias.
    ///
    /// Only legacy addressing needs this; a query the emulator refuses is
    /// not treated as a failure.
    pub fn verify_drive(&self, monitor: &dyn Monitor, disk: &Disk) -> Result<()> {
        if *self == Addressing::NodeName {
            return Ok(());
        }
        let alias = disk.drive_alias();
        match monitor.query_block() {
            Ok(devices) if devices.iter().any(|d| d.device == alias) => Ok(()),
            Ok(_) => Err(Error::not_found(format!("drive '{}' on the emulator", alias))),
            Err(Error::MonitorRejected { message, .. }) => {
                tracing::debug!(drive = %alias, %message, "drive lookup unavailable");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Node-name of `node`.
pub fn node_name(node: &ChainNode) -> Result<&str> {
    node.node_name
        .as_deref()
        .ok_or_else(|| Error::not_found(format!("node-name of image '{}'", node.display())))
}
