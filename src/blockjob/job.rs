//! Block job records and their state machine.

use crate::vm::ChainNode;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Kind of block job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    /// Merge backing data into the active image.
    Pull,
    /// Merge an inactive image into one of its backing images.
    Commit,
    /// Commit of the active image; needs a pivot to finish.
    ActiveCommit,
    /// Mirror the disk to a new destination; needs a pivot to finish.
    Copy,
    /// Backup job started outside the engine.
    Backup,
    /// Internal snapshot flush.
    InternalSnapshotFlush,
    /// Image creation.
    Create,
    /// Job found on the emulator that the engine cannot manage.
    Broken,
}

impl JobKind {
    /// Prefix used when naming jobs by node-name.
    pub fn prefix(&self) -> &'static str {
        match self {
            JobKind::Pull => "pull",
            JobKind::Commit | JobKind::ActiveCommit => "commit",
            JobKind::Copy => "copy",
            JobKind::Backup => "backup",
            JobKind::InternalSnapshotFlush => "snapshot",
            JobKind::Create => "create",
            JobKind::Broken => "broken",
        }
    }

    /// Whether the job ends with a pivot onto a mirror.
    pub fn has_mirror(&self) -> bool {
        matches!(self, JobKind::Copy | JobKind::ActiveCommit)
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobKind::Pull => "pull",
            JobKind::Commit => "commit",
            JobKind::ActiveCommit => "active-commit",
            JobKind::Copy => "copy",
            JobKind::Backup => "backup",
            JobKind::InternalSnapshotFlush => "internal-snapshot-flush",
            JobKind::Create => "create",
            JobKind::Broken => "broken",
        };
        write!(f, "{}", name)
    }
}

/// Lifecycle state of a block job.
///
/// States advance monotonically by [`JobState::rank`]; `Concluded` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Reserved, not yet confirmed by the emulator.
    New,
    /// Running on the emulator.
    Running,
    /// Mirror is synchronised; a pivot may be requested.
    Ready,
    /// Cancellation requested.
    Aborting,
    /// Pivot requested.
    Pivoting,
    /// Finished.
    Concluded,
    /// Finished with an error.
    Failed,
}

impl JobState {
    /// Ordering used to reject backward transitions.
    pub fn rank(&self) -> u8 {
        match self {
            JobState::New => 0,
            JobState::Running => 1,
            JobState::Ready => 2,
            JobState::Aborting | JobState::Pivoting => 3,
            JobState::Concluded | JobState::Failed => 4,
        }
    }

    /// Check if the job has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Concluded | JobState::Failed)
    }

    /// Check if an abort or pivot has already been requested.
    pub fn is_stopping(&self) -> bool {
        matches!(self, JobState::Aborting | JobState::Pivoting)
    }

    /// Get the state name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            JobState::New => "new",
            JobState::Running => "running",
            JobState::Ready => "ready",
            JobState::Aborting => "aborting",
            JobState::Pivoting => "pivoting",
            JobState::Concluded => "concluded",
            JobState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A state reported by the emulator that has not been applied yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingState {
    /// The mirror is synchronised.
    Ready,
    /// Finished successfully.
    Completed,
    /// Finished because it was cancelled.
    Cancelled,
    /// Finished with an error.
    Failed(String),
    /// Finished; the outcome must be queried.
    Concluded,
}

/// Per-kind parameters needed to rewrite the disk when the job completes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum JobData {
    /// Nothing to apply; the chain is re-detected instead.
    #[default]
    None,
    /// Pull down to `base` (or flatten everything).
    Pull {
        /// Image that remains the backing of the active image.
        base: Option<PathBuf>,
    },
    /// Commit `top` into `base`.
    Commit {
        /// Image whose data is merged.
        top: PathBuf,
        /// Image receiving the data.
        base: PathBuf,
        /// Overlay of `top`, when distinct from the active image.
        top_parent: Option<PathBuf>,
        /// Remove the spliced-out image files afterwards.
        delete_intermediate: bool,
    },
    /// Copy onto `destination`.
    Copy {
        /// Destination file.
        destination: PathBuf,
        /// Backing chain detected below a reused destination; `None` when
        /// the destination was created for the job.
        backing: Option<Vec<ChainNode>>,
    },
}

#[derive(Debug)]
struct Status {
    state: JobState,
    error: Option<String>,
    sync_waiters: usize,
}

/// A block job tracked by the engine.
#[derive(Debug)]
pub struct BlockJob {
    id: String,
    kind: JobKind,
    disk: Option<String>,
    nodes: Vec<PathBuf>,
    data: JobData,
    status: Mutex<Status>,
    pending: Mutex<Option<PendingState>>,
}

impl BlockJob {
    /// Create a job record in the `New` state.
    pub fn new(
        id: impl Into<String>,
        kind: JobKind,
        disk: Option<String>,
        nodes: Vec<PathBuf>,
        data: JobData,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            disk,
            nodes,
            data,
            status: Mutex::new(Status {
                state: JobState::New,
                error: None,
                sync_waiters: 0,
            }),
            pending: Mutex::new(None),
        }
    }

    /// Job id as known to the emulator.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Kind of job.
    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Target name of the disk the job runs on.
    pub fn disk(&self) -> Option<&str> {
        self.disk.as_deref()
    }

    /// Chain images the job claims.
    pub fn nodes(&self) -> &[PathBuf] {
        &self.nodes
    }

    /// Completion parameters.
    pub fn data(&self) -> &JobData {
        &self.data
    }

    /// Current state.
    pub fn state(&self) -> JobState {
        self.status.lock().state
    }

    /// Error recorded on failure.
    pub fn error(&self) -> Option<String> {
        self.status.lock().error.clone()
    }

    /// Move to `next` if it ranks above the current state.
    ///
    /// Returns false, leaving the state untouched, for backward or
    /// sideways moves.
    pub fn advance(&self, next: JobState) -> bool {
        let mut status = self.status.lock();
        if next.rank() <= status.state.rank() {
            tracing::debug!(
                job = %self.id,
                from = %status.state,
                to = %next,
                "ignoring backward job state transition"
            );
            return false;
        }
        tracing::debug!(job = %self.id, from = %status.state, to = %next, "job state");
        status.state = next;
        true
    }

    /// Mark the job failed with `message`.
    pub fn fail(&self, message: impl Into<String>) {
        let mut status = self.status.lock();
        if status.state.is_terminal() {
            return;
        }
        status.state = JobState::Failed;
        status.error = Some(message.into());
    }

    /// Record a state reported by the emulator; a later report replaces it.
    pub fn set_pending(&self, pending: PendingState) {
        let mut slot = self.pending.lock();
        if let Some(previous) = slot.as_ref() {
            tracing::debug!(job = %self.id, ?previous, next = ?pending, "replacing pending state");
        }
        *slot = Some(pending);
    }

    /// Take the pending state, leaving the slot empty.
    pub fn take_pending(&self) -> Option<PendingState> {
        self.pending.lock().take()
    }

    /// Check if a reported state is waiting to be applied.
    pub fn has_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Number of callers waiting synchronously for this job.
    pub fn sync_waiters(&self) -> usize {
        self.status.lock().sync_waiters
    }

    /// Register a synchronous waiter.
    pub fn sync_begin(&self) {
        self.status.lock().sync_waiters += 1;
    }

    /// Drop a synchronous waiter.
    pub fn sync_end(&self) {
        let mut status = self.status.lock();
        status.sync_waiters = status.sync_waiters.saturating_sub(1);
    }
}
