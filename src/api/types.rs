//! JSON request and response types for the API.

use crate::blockjob::{
    AbortOptions, Bandwidth, BandwidthUnit, CommitOptions, CopyOptions, JobProgress, PullOptions,
};
use crate::vm::{ChainNode, Disk, ImageFormat, MirrorState};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ============================================================================
// Disk Types
// ============================================================================

/// One image of a backing chain.
#[derive(Debug, Clone, Serialize)]
pub struct ImageInfo {
    /// Image file.
    pub path: String,
    /// Image format.
    pub format: ImageFormat,
    /// Node-name in the emulator's block graph.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    /// Whether the image is opened read-only.
    pub readonly: bool,
}

impl From<&ChainNode> for ImageInfo {
    fn from(node: &ChainNode) -> Self {
        Self {
            path: node.display(),
            format: node.format,
            node_name: node.node_name.clone(),
            readonly: node.readonly,
        }
    }
}

/// Disk status information.
#[derive(Debug, Clone, Serialize)]
pub struct DiskInfo {
    /// Target name.
    pub target: String,
    /// Device alias.
    pub alias: String,
    /// Backing chain, active image first.
    pub chain: Vec<ImageInfo>,
    /// Mirror of a running copy or active commit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror: Option<ImageInfo>,
    /// Outstanding pivot/abort request.
    pub mirror_state: MirrorState,
    /// Id of the job running on the disk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
}

impl From<&Disk> for DiskInfo {
    fn from(disk: &Disk) -> Self {
        Self {
            target: disk.target.clone(),
            alias: disk.alias.clone(),
            chain: disk.chain.iter().map(ImageInfo::from).collect(),
            mirror: disk.mirror.as_ref().map(ImageInfo::from),
            mirror_state: disk.mirror_state,
            job: disk.active_job.clone(),
        }
    }
}

/// List disks response.
#[derive(Debug, Serialize)]
pub struct ListDisksResponse {
    /// Guest name.
    pub guest: String,
    /// Attached disks.
    pub disks: Vec<DiskInfo>,
}

// ============================================================================
// Job Types
// ============================================================================

/// Bandwidth fields shared by the job requests.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct BandwidthSpec {
    /// Limit; 0 or absent means unlimited.
    #[serde(default)]
    pub bandwidth: u64,
    /// Unit of `bandwidth`. Default: MiB/s.
    #[serde(default)]
    pub unit: BandwidthUnit,
}

impl From<BandwidthSpec> for Bandwidth {
    fn from(spec: BandwidthSpec) -> Self {
        Bandwidth {
            value: spec.bandwidth,
            unit: spec.unit,
        }
    }
}

/// Request to start a pull job.
#[derive(Debug, Default, Deserialize)]
pub struct PullRequest {
    /// Image that stays as the active image's backing. Default: none,
    /// flatten the whole chain.
    #[serde(default)]
    pub base: Option<String>,
    /// Bandwidth limit.
    #[serde(flatten)]
    pub bandwidth: BandwidthSpec,
    /// Record the backing file as a relative path.
    #[serde(default)]
    pub relative: bool,
}

impl From<PullRequest> for PullOptions {
    fn from(req: PullRequest) -> Self {
        PullOptions {
            base: req.base,
            bandwidth: req.bandwidth.into(),
            relative: req.relative,
        }
    }
}

/// Request to start a commit job.
#[derive(Debug, Default, Deserialize)]
pub struct CommitRequest {
    /// Image to commit. Default: the active image.
    #[serde(default)]
    pub top: Option<String>,
    /// Image receiving the data. Default: bottom of the chain.
    #[serde(default)]
    pub base: Option<String>,
    /// Bandwidth limit.
    #[serde(flatten)]
    pub bandwidth: BandwidthSpec,
    /// Commit into the immediate backing image of `top`.
    #[serde(default)]
    pub shallow: bool,
    /// Record the backing file as a relative path.
    #[serde(default)]
    pub relative: bool,
    /// Remove the committed image files afterwards.
    #[serde(default)]
    pub delete_intermediate: bool,
}

impl From<CommitRequest> for CommitOptions {
    fn from(req: CommitRequest) -> Self {
        CommitOptions {
            top: req.top,
            base: req.base,
            bandwidth: req.bandwidth.into(),
            shallow: req.shallow,
            relative: req.relative,
            delete_intermediate: req.delete_intermediate,
        }
    }
}

/// Request to start a copy job.
#[derive(Debug, Deserialize)]
pub struct CopyRequest {
    /// Absolute path of the destination image.
    pub destination: PathBuf,
    /// Destination format.
    #[serde(default)]
    pub format: Option<ImageFormat>,
    /// Bandwidth limit.
    #[serde(flatten)]
    pub bandwidth: BandwidthSpec,
    /// Dirty bitmap granularity in bytes.
    #[serde(default)]
    pub granularity: Option<u32>,
    /// Copy buffer size in bytes.
    #[serde(default)]
    pub buf_size: Option<u64>,
    /// Copy only the active image.
    #[serde(default)]
    pub shallow: bool,
    /// Reuse an existing destination file.
    #[serde(default)]
    pub reuse_existing: bool,
}

impl From<CopyRequest> for CopyOptions {
    fn from(req: CopyRequest) -> Self {
        CopyOptions {
            destination: req.destination,
            format: req.format,
            bandwidth: req.bandwidth.into(),
            granularity: req.granularity,
            buf_size: req.buf_size,
            shallow: req.shallow,
            reuse_existing: req.reuse_existing,
        }
    }
}

/// Request to abort or pivot a job.
#[derive(Debug, Default, Deserialize)]
pub struct AbortRequest {
    /// Pivot onto the mirror instead of cancelling.
    #[serde(default)]
    pub pivot: bool,
    /// Return without waiting for the job to end.
    #[serde(default, rename = "async")]
    pub asynchronous: bool,
}

impl From<AbortRequest> for AbortOptions {
    fn from(req: AbortRequest) -> Self {
        AbortOptions {
            pivot: req.pivot,
            asynchronous: req.asynchronous,
        }
    }
}

/// Request to change a job's bandwidth limit.
#[derive(Debug, Deserialize)]
pub struct SpeedRequest {
    /// New limit.
    #[serde(flatten)]
    pub bandwidth: BandwidthSpec,
}

/// Query parameters of the job info endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct JobQuery {
    /// Unit to report bandwidth in. Default: MiB/s.
    #[serde(default)]
    pub unit: BandwidthUnit,
}

/// Response to a started job.
#[derive(Debug, Serialize)]
pub struct JobStartedResponse {
    /// Job id.
    pub job: String,
}

/// Job progress response.
#[derive(Debug, Serialize)]
pub struct JobInfoResponse {
    /// Disk target name.
    pub disk: String,
    /// Progress, absent when the disk has no job.
    pub job: Option<JobProgress>,
}

/// Empty success response.
#[derive(Debug, Serialize)]
pub struct OkResponse {
    /// Always true.
    pub ok: bool,
}

// ============================================================================
// Health Types
// ============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Health status (e.g., "ok").
    pub status: &'static str,
    /// Server version.
    pub version: &'static str,
    /// Whether the guest's monitor is connected.
    pub guest_active: bool,
}
