//! blockjobd - block job engine for a hypervisor management daemon.
//!
//! Drives long-running disk operations (pull, commit, active commit and
//! copy) on a running guest through the device emulator's monitor, tracks
//! them through the emulator's asynchronous events, and implements the
//! pivot/abort handshake that swaps or discards the destination image.
//!
//! # Architecture
//!
//! - [`vm`]: the guest object, its disks and backing chains
//! - [`monitor`]: command channel to the emulator
//! - [`access`]: write grants and locks on image files
//! - [`storage`]: image files on the host
//! - [`blockjob`]: the engine itself
//! - [`api`]: HTTP administrative surface

pub mod access;
pub mod api;
pub mod blockjob;
pub mod config;
pub mod error;
pub mod monitor;
pub mod storage;
pub mod vm;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{Error, Result};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
