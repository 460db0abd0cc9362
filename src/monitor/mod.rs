//! Command channel to the device emulator.
//!
//! The engine talks to the emulator through the [`Monitor`] trait. The
//! production implementation is [`SocketMonitor`], which speaks the
//! newline-delimited JSON protocol from `blockjobd-protocol` over a Unix
//! socket and forwards asynchronous events to a channel.

pub mod client;

pub use client::SocketMonitor;

use crate::error::{Error, Result};
use blockjobd_protocol::{BlockDeviceInfo, BlockJobInfo, Command, JobInfo};
use serde::{Deserialize, Serialize};

/// Features of the emulator the engine may rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// Jobs and images are addressed by job id and node-name.
    pub blockdev: bool,
    /// Commit of the active image is supported.
    pub active_commit: bool,
    /// Backing file strings can be rewritten as relative paths.
    pub change_backing_file: bool,
    /// Copy (mirror) jobs are supported.
    pub drive_mirror: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            blockdev: true,
            active_commit: true,
            change_backing_file: true,
            drive_mirror: true,
        }
    }
}

impl Capabilities {
    /// Capabilities of an emulator that only knows drive aliases.
    pub fn legacy() -> Self {
        Self {
            blockdev: false,
            ..Self::default()
        }
    }
}

/// Synchronous command execution against the emulator.
///
/// Implementations may deliver events on another thread while a command is
/// in flight; callers must not hold the guest state lock across `execute`.
pub trait Monitor: Send + Sync {
    /// Execute a command and return its raw result.
    ///
    /// A command refused by the emulator yields [`Error::MonitorRejected`];
    /// a broken channel yields [`Error::Monitor`].
    fn execute(&self, cmd: &Command) -> Result<serde_json::Value>;
}

impl<'a> dyn Monitor + 'a {
    /// Execute a command, discarding its result.
    pub fn run(&self, cmd: Command) -> Result<()> {
        let name = cmd.name();
        tracing::debug!(command = name, "monitor command");
        self.execute(&cmd).map(|_| ())
    }

    /// List block jobs with their progress counters.
    pub fn query_block_jobs(&self) -> Result<Vec<BlockJobInfo>> {
        self.query(Command::QueryBlockJobs)
    }

    /// List generic jobs with their status and error.
    pub fn query_jobs(&self) -> Result<Vec<JobInfo>> {
        self.query(Command::QueryJobs)
    }

    /// List attached drives.
    pub fn query_block(&self) -> Result<Vec<BlockDeviceInfo>> {
        self.query(Command::QueryBlock)
    }

    fn query<T: for<'de> Deserialize<'de>>(&self, cmd: Command) -> Result<T> {
        let name = cmd.name();
        let value = self.execute(&cmd)?;
        serde_json::from_value(value)
            .map_err(|e| Error::monitor(format!("malformed {} reply: {}", name, e)))
    }
}
