//! Guest disks and their backing chains.

use crate::blockjob::JobKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// On-disk image format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// Raw image; cannot carry a backing file.
    Raw,
    /// QCOW2 format (copy-on-write).
    #[default]
    Qcow2,
}

impl ImageFormat {
    /// Format name as understood by the emulator.
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Raw => "raw",
            ImageFormat::Qcow2 => "qcow2",
        }
    }

    /// Whether images of this format can reference a backing file.
    pub fn supports_backing(&self) -> bool {
        matches!(self, ImageFormat::Qcow2)
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for ImageFormat {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "raw" => Ok(ImageFormat::Raw),
            "qcow2" => Ok(ImageFormat::Qcow2),
            other => Err(crate::Error::invalid(format!(
                "unknown image format '{}'",
                other
            ))),
        }
    }
}

/// One image in a disk's backing chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainNode {
    /// Image file.
    pub path: PathBuf,
    /// Image format.
    pub format: ImageFormat,
    /// Node-name in the emulator's block graph.
    pub node_name: Option<String>,
    /// Whether the image is opened read-only.
    pub readonly: bool,
}

impl ChainNode {
    /// Create a read-only chain node.
    pub fn new(path: impl Into<PathBuf>, format: ImageFormat) -> Self {
        Self {
            path: path.into(),
            format,
            node_name: None,
            readonly: true,
        }
    }

    /// Set the node-name.
    pub fn with_node_name(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = Some(node_name.into());
        self
    }

    /// Mark the node writable.
    pub fn writable(mut self) -> Self {
        self.readonly = false;
        self
    }

    /// Path as a display string.
    pub fn display(&self) -> String {
        self.path.display().to_string()
    }
}

/// Pending pivot/abort request on a disk's mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MirrorState {
    /// No request outstanding.
    #[default]
    None,
    /// A pivot onto the mirror was requested.
    PivotRequested,
    /// Cancellation of the mirror was requested.
    AbortRequested,
}

/// A guest disk.
#[derive(Debug, Clone, Serialize)]
pub struct Disk {
    /// Target name as seen by the guest (e.g. "vda").
    pub target: String,
    /// Device alias (e.g. "virtio-disk0").
    pub alias: String,
    /// Backing chain; index 0 is the active image.
    pub chain: Vec<ChainNode>,
    /// Mirror destination of a running copy or active commit.
    pub mirror: Option<ChainNode>,
    /// Kind of job owning the mirror.
    #[serde(skip)]
    pub mirror_job: Option<JobKind>,
    /// Outstanding request on the mirror.
    pub mirror_state: MirrorState,
    /// Id of the block job running on this disk.
    pub active_job: Option<String>,
}

impl Disk {
    /// Create a disk with the given chain, active image first.
    pub fn new(target: impl Into<String>, alias: impl Into<String>, chain: Vec<ChainNode>) -> Self {
        Self {
            target: target.into(),
            alias: alias.into(),
            chain,
            mirror: None,
            mirror_job: None,
            mirror_state: MirrorState::None,
            active_job: None,
        }
    }

    /// Drive alias used by legacy addressing.
    pub fn drive_alias(&self) -> String {
        format!("drive-{}", self.alias)
    }

    /// The active (top) image.
    pub fn active(&self) -> Option<&ChainNode> {
        self.chain.first()
    }

    /// Index of the image at `path`.
    pub fn position(&self, path: &Path) -> Option<usize> {
        self.chain.iter().position(|node| node.path == path)
    }

    /// Whether `device` names this disk by target, alias or drive alias.
    pub fn matches_device(&self, device: &str) -> bool {
        device == self.target
            || device == self.alias
            || device.strip_prefix("drive-") == Some(self.alias.as_str())
    }

    /// Clear the mirror and any outstanding request on it.
    pub fn take_mirror(&mut self) -> Option<ChainNode> {
        self.mirror_state = MirrorState::None;
        self.mirror_job = None;
        self.mirror.take()
    }
}
