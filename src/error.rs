//! Error types for blockjobd.

use thiserror::Error;

/// Result type alias using blockjobd's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in blockjobd operations.
#[derive(Error, Debug)]
pub enum Error {
    // Block job preconditions
    /// The disk already has a job, or a chain node is claimed by another job.
    #[error("block job busy on disk '{disk}': {reason}")]
    JobBusy {
        /// Disk target name.
        disk: String,
        /// What is holding the disk.
        reason: String,
    },

    /// A disk, image or node locator did not resolve.
    #[error("not found: {0}")]
    NotFound(String),

    /// The image has no backing file to operate on.
    #[error("image '{0}' has no backing file")]
    NoBackingFile(String),

    /// The emulator lacks a required capability, or the combination is impossible.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Bandwidth does not fit in a signed 64-bit bytes/second value.
    #[error("bandwidth {value} {unit} overflows bytes/second")]
    Overflow {
        /// Value as supplied by the caller.
        value: u64,
        /// Unit the value was supplied in.
        unit: &'static str,
    },

    /// Pivot requested for a job that is not ready.
    #[error("block job '{job}' is not ready for pivot (state: {state})")]
    NotReady {
        /// Job id.
        job: String,
        /// Current job state.
        state: String,
    },

    /// The disk has no block job.
    #[error("no active block job on disk '{disk}'")]
    NoJob {
        /// Disk target name.
        disk: String,
    },

    /// Malformed request parameter.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The guest is not running.
    #[error("guest '{0}' is not running")]
    GuestInactive(String),

    // Monitor errors
    /// The emulator refused a command.
    #[error("monitor rejected {command}: {message}")]
    MonitorRejected {
        /// Command name.
        command: String,
        /// Error description from the emulator.
        message: String,
    },

    /// The monitor channel itself failed.
    #[error("monitor error: {0}")]
    Monitor(String),

    // Terminal job outcomes
    /// A block job ended in failure.
    #[error("block job '{job}' failed: {message}")]
    Failed {
        /// Job id.
        job: String,
        /// Error reported by the emulator.
        message: String,
    },

    /// A pivot was acknowledged but the job then failed.
    ///
    /// The disk may be left needing manual attention.
    #[error("block job '{job}' failed while pivoting: {message}")]
    PivotFailed {
        /// Job id.
        job: String,
        /// Error reported by the emulator.
        message: String,
    },

    // Configuration errors
    /// Generic configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to load configuration.
    #[error("failed to load config: {0}")]
    ConfigLoad(String),

    // IO errors
    /// IO error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a job busy error.
    pub fn busy(disk: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::JobBusy {
            disk: disk.into(),
            reason: reason.into(),
        }
    }

    /// Create a not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an unsupported error.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Create an invalid argument error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a monitor rejection error.
    pub fn rejected(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MonitorRejected {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a monitor transport error.
    pub fn monitor(msg: impl Into<String>) -> Self {
        Self::Monitor(msg.into())
    }

    /// Whether this error was raised before anything was sent to the emulator.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::JobBusy { .. }
                | Error::NotFound(_)
                | Error::NoBackingFile(_)
                | Error::Unsupported(_)
                | Error::Overflow { .. }
                | Error::InvalidArgument(_)
                | Error::GuestInactive(_)
        )
    }
}
