//! Protocol types for the blockjobd monitor channel.
//!
//! This crate defines the wire protocol spoken between blockjobd and the
//! device-emulator monitor: commands, replies, asynchronous events and the
//! records returned by the job query commands.
//!
//! # Protocol Overview
//!
//! Communication uses JSON objects, one per line. The emulator greets the
//! client first, after which commands and replies alternate while events may
//! be interleaved at any point.
//!
//! ```text
//! <- {"QMP": {...}}
//! -> {"execute": "qmp_capabilities", "id": 1}
//! <- {"return": {}, "id": 1}
//! -> {"execute": "block-stream", "arguments": {...}, "id": 2}
//! <- {"event": "JOB_STATUS_CHANGE", "data": {...}, "timestamp": {...}}
//! <- {"return": {}, "id": 2}
//! ```

#![deny(missing_docs)]

use serde::{Deserialize, Serialize};

/// Maximum size of a single line on the wire (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// ============================================================================
// Commands
// ============================================================================

/// Commands sent to the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "execute", content = "arguments", rename_all = "kebab-case")]
pub enum Command {
    /// Leave capability negotiation mode.
    #[serde(rename = "qmp_capabilities")]
    QmpCapabilities,

    /// Start a pull (stream) job.
    BlockStream(BlockStreamArgs),

    /// Start a commit job.
    BlockCommit(BlockCommitArgs),

    /// Start a copy job addressed by drive alias and target path.
    DriveMirror(DriveMirrorArgs),

    /// Cancel a block job.
    BlockJobCancel(BlockJobCancelArgs),

    /// Finish a ready block job by pivoting to its target (legacy addressing).
    BlockJobComplete(BlockJobRef),

    /// Change the bandwidth limit of a running block job.
    BlockJobSetSpeed(BlockJobSetSpeedArgs),

    /// Finish a ready job by pivoting to its target (job-id addressing).
    JobComplete(JobRef),

    /// Remove a concluded job from the emulator's job list.
    JobDismiss(JobRef),

    /// List all block jobs with their progress counters.
    QueryBlockJobs,

    /// List all generic jobs with their status and error.
    QueryJobs,

    /// List the emulator's view of attached drives.
    QueryBlock,
}

impl Command {
    /// Wire name of the command, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::QmpCapabilities => "qmp_capabilities",
            Command::BlockStream(_) => "block-stream",
            Command::BlockCommit(_) => "block-commit",
            Command::DriveMirror(_) => "drive-mirror",
            Command::BlockJobCancel(_) => "block-job-cancel",
            Command::BlockJobComplete(_) => "block-job-complete",
            Command::BlockJobSetSpeed(_) => "block-job-set-speed",
            Command::JobComplete(_) => "job-complete",
            Command::JobDismiss(_) => "job-dismiss",
            Command::QueryBlockJobs => "query-block-jobs",
            Command::QueryJobs => "query-jobs",
            Command::QueryBlock => "query-block",
        }
    }
}

/// Arguments of `block-stream`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BlockStreamArgs {
    /// Drive alias (legacy) or top node-name.
    pub device: String,
    /// Explicit job id (node-name addressing only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Base image by file name (legacy addressing).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    /// Base image by node-name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_node: Option<String>,
    /// Backing file string to record in the active image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backing_file: Option<String>,
    /// Bandwidth limit in bytes per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<u64>,
}

/// Arguments of `block-commit`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BlockCommitArgs {
    /// Drive alias (legacy) or active node-name.
    pub device: String,
    /// Explicit job id (node-name addressing only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Top image by file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top: Option<String>,
    /// Base image by file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    /// Top image by node-name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_node: Option<String>,
    /// Base image by node-name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_node: Option<String>,
    /// Backing file string to record in the overlay of top.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backing_file: Option<String>,
    /// Bandwidth limit in bytes per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<u64>,
}

/// How much of the source chain a copy job duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorSync {
    /// Only the active image; the target shares the source's backing chain.
    Top,
    /// The whole chain, flattened into the target.
    Full,
}

/// Whether the copy target is created by the emulator or reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MirrorMode {
    /// Open the existing target image as-is.
    Existing,
    /// Format the target, recording absolute backing paths.
    AbsolutePaths,
}

/// Arguments of `drive-mirror`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DriveMirrorArgs {
    /// Drive alias or active node-name of the source.
    pub device: String,
    /// Explicit job id (node-name addressing only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Destination file.
    pub target: String,
    /// Destination image format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Node-name to give the destination (node-name addressing only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    /// Copy depth.
    pub sync: MirrorSync,
    /// Destination handling.
    pub mode: MirrorMode,
    /// Bandwidth limit in bytes per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<u64>,
    /// Dirty bitmap granularity in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granularity: Option<u32>,
    /// In-flight buffer size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buf_size: Option<u64>,
}

/// Arguments of `block-job-cancel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockJobCancelArgs {
    /// Job id or drive alias.
    pub device: String,
    /// Cancel even if the job is paused or not yet ready.
    #[serde(default)]
    pub force: bool,
}

/// Reference to a block job by job id or drive alias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockJobRef {
    /// Job id or drive alias.
    pub device: String,
}

/// Arguments of `block-job-set-speed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockJobSetSpeedArgs {
    /// Job id or drive alias.
    pub device: String,
    /// Bandwidth limit in bytes per second, 0 for unlimited.
    pub speed: u64,
}

/// Reference to a generic job by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRef {
    /// Job id.
    pub id: String,
}

// ============================================================================
// Replies
// ============================================================================

/// Error returned by the monitor in place of a command result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Error class (e.g. "GenericError", "DeviceNotActive").
    pub class: String,
    /// Human-readable description.
    pub desc: String,
}

/// Any message the monitor can send.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    /// Asynchronous event.
    Event(RawEvent),
    /// Successful command reply.
    Return {
        /// Command result.
        #[serde(rename = "return")]
        value: serde_json::Value,
        /// Id echoed from the command.
        #[serde(default)]
        id: Option<u64>,
    },
    /// Failed command reply.
    Error {
        /// Error details.
        error: ErrorReply,
        /// Id echoed from the command.
        #[serde(default)]
        id: Option<u64>,
    },
    /// Connection greeting.
    Greeting {
        /// Version and capability banner.
        #[serde(rename = "QMP")]
        banner: serde_json::Value,
    },
}

/// Job type as reported by the emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    /// Commit job.
    Commit,
    /// Pull job.
    Stream,
    /// Copy job (also used by active commit).
    Mirror,
    /// Backup job.
    Backup,
    /// Image creation job.
    Create,
    /// Image amend job.
    Amend,
    /// Internal snapshot load.
    SnapshotLoad,
    /// Internal snapshot save.
    SnapshotSave,
    /// Internal snapshot delete.
    SnapshotDelete,
}

/// Job status as reported by the unified job interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Status not defined.
    Undefined,
    /// Created, not started.
    Created,
    /// Running.
    Running,
    /// Paused by the user.
    Paused,
    /// Ready to be completed.
    Ready,
    /// Paused while ready.
    Standby,
    /// Waiting for other jobs in a transaction.
    Waiting,
    /// Finished, waiting to be finalized.
    Pending,
    /// Being cancelled.
    Aborting,
    /// Finished; the outcome is in the job's error field.
    Concluded,
    /// Dismissed.
    Null,
}

/// Entry of `query-block-jobs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockJobInfo {
    /// Job type.
    #[serde(rename = "type")]
    pub job_type: JobType,
    /// Job id (node-name addressing) or drive alias.
    pub device: String,
    /// Estimated total bytes of work.
    pub len: u64,
    /// Bytes of work done so far.
    pub offset: u64,
    /// Current bandwidth limit in bytes per second.
    #[serde(default)]
    pub speed: u64,
    /// Whether the job is actively doing I/O.
    #[serde(default)]
    pub busy: bool,
    /// Whether the job is paused.
    #[serde(default)]
    pub paused: bool,
    /// Whether the job can be completed. Absent on older emulators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
}

/// Entry of `query-jobs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobInfo {
    /// Job id.
    pub id: String,
    /// Job type.
    #[serde(rename = "type")]
    pub job_type: JobType,
    /// Current status.
    pub status: JobStatus,
    /// Progress counter.
    #[serde(default)]
    pub current_progress: u64,
    /// Progress estimate.
    #[serde(default)]
    pub total_progress: u64,
    /// Error message if the job failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Entry of `query-block`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDeviceInfo {
    /// Drive alias.
    pub device: String,
    /// Whether a medium is inserted.
    #[serde(default)]
    pub inserted: Option<serde_json::Value>,
}

// ============================================================================
// Events
// ============================================================================

/// Event timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since the epoch.
    pub seconds: i64,
    /// Microseconds within the second.
    pub microseconds: i64,
}

/// Event envelope as received from the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Event name.
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Emission time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

/// Payload of the legacy alias-keyed block job events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockJobEventData {
    /// Job type.
    #[serde(rename = "type")]
    pub job_type: JobType,
    /// Drive alias or job id.
    pub device: String,
    /// Estimated total bytes of work.
    #[serde(default)]
    pub len: u64,
    /// Bytes of work done.
    #[serde(default)]
    pub offset: u64,
    /// Bandwidth limit.
    #[serde(default)]
    pub speed: u64,
    /// Error message for a failed completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload of `BLOCK_JOB_ERROR`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockJobErrorData {
    /// Drive alias or job id.
    pub device: String,
    /// Whether the failed I/O was a read or a write.
    pub operation: String,
    /// Action taken by the emulator (ignore, report, stop).
    pub action: String,
}

/// Payload of `JOB_STATUS_CHANGE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusChangeData {
    /// Job id.
    pub id: String,
    /// New status.
    pub status: JobStatus,
}

/// Typed block job events.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// `BLOCK_JOB_COMPLETED`: finished, successfully unless `error` is set.
    BlockJobCompleted(BlockJobEventData),
    /// `BLOCK_JOB_CANCELLED`: finished because it was cancelled.
    BlockJobCancelled(BlockJobEventData),
    /// `BLOCK_JOB_READY`: the job can now be completed.
    BlockJobReady(BlockJobEventData),
    /// `BLOCK_JOB_ERROR`: an I/O error was hit while running.
    BlockJobError(BlockJobErrorData),
    /// `JOB_STATUS_CHANGE`: unified status transition.
    JobStatusChange(JobStatusChangeData),
}

impl RawEvent {
    /// Decode into a typed block job event.
    ///
    /// Returns `Ok(None)` for events that are not related to block jobs.
    pub fn decode(&self) -> Result<Option<Event>, serde_json::Error> {
        let data = self.data.clone();
        let event = match self.event.as_str() {
            "BLOCK_JOB_COMPLETED" => Event::BlockJobCompleted(serde_json::from_value(data)?),
            "BLOCK_JOB_CANCELLED" => Event::BlockJobCancelled(serde_json::from_value(data)?),
            "BLOCK_JOB_READY" => Event::BlockJobReady(serde_json::from_value(data)?),
            "BLOCK_JOB_ERROR" => Event::BlockJobError(serde_json::from_value(data)?),
            "JOB_STATUS_CHANGE" => Event::JobStatusChange(serde_json::from_value(data)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

// ============================================================================
// Wire Format Helpers
// ============================================================================

/// Encode a command with its correlation id into wire format (JSON + newline).
pub fn encode_command(cmd: &Command, id: u64) -> Result<Vec<u8>, serde_json::Error> {
    let mut value = serde_json::to_value(cmd)?;
    if let serde_json::Value::Object(map) = &mut value {
        map.insert("id".to_string(), serde_json::Value::from(id));
    }
    encode_message(&value)
}

/// Encode a message to wire format (JSON + newline).
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = serde_json::to_vec(msg)?;
    buf.push(b'\n');
    Ok(buf)
}

/// Decode a message from a single wire line.
pub fn decode_message<T: for<'de> Deserialize<'de>>(line: &[u8]) -> Result<T, DecodeError> {
    if line.len() > MAX_FRAME_SIZE {
        return Err(DecodeError::TooLarge(line.len()));
    }

    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return Err(DecodeError::Empty);
    }

    serde_json::from_slice(trimmed).map_err(DecodeError::Json)
}

/// Error decoding a wire message.
#[derive(Debug)]
pub enum DecodeError {
    /// Line contained only whitespace.
    Empty,
    /// Line exceeds maximum.
    TooLarge(usize),
    /// JSON parse error.
    Json(serde_json::Error),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Empty => write!(f, "empty line"),
            DecodeError::TooLarge(size) => write!(f, "frame too large: {} bytes", size),
            DecodeError::Json(e) => write!(f, "JSON decode error: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {}
