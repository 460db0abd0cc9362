//! The guest object block jobs operate on.
//!
//! - [`Guest`]: a running guest with its disks, monitor and job registry
//! - [`Disk`] / [`ChainNode`]: disks and their backing chains
//! - [`JobLock`]: serialises state-changing operations on a guest

pub mod disk;

pub use disk::{ChainNode, Disk, ImageFormat, MirrorState};

use crate::access::ImageAccess;
use crate::blockjob::Registry;
use crate::error::{Error, Result};
use crate::monitor::{Capabilities, Monitor};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashSet;
use std::sync::Arc;

/// Mutable guest state, guarded by [`Guest`]'s lock.
#[derive(Debug)]
pub struct GuestInner {
    /// Whether the guest is running.
    pub active: bool,
    /// Attached disks.
    pub disks: Vec<Disk>,
    /// Block jobs on this guest.
    pub jobs: Registry,
    next_node: u64,
}

impl GuestInner {
    /// Index of the disk with the given target name.
    pub fn disk_index(&self, target: &str) -> Result<usize> {
        self.disks
            .iter()
            .position(|d| d.target == target)
            .ok_or_else(|| Error::not_found(format!("disk '{}'", target)))
    }

    /// Disk with the given target name.
    pub fn disk(&self, target: &str) -> Result<&Disk> {
        let idx = self.disk_index(target)?;
        Ok(&self.disks[idx])
    }

    /// Index of the disk an emulator device string refers to.
    ///
    /// Accepts the target, the alias, the drive alias, or a job id of the
    /// form `<prefix>-<target>-<node>`.
    pub fn disk_for_device(&self, device: &str) -> Option<usize> {
        if let Some(idx) = self.disks.iter().position(|d| d.matches_device(device)) {
            return Some(idx);
        }
        let mut parts = device.splitn(3, '-');
        let (_, target) = (parts.next()?, parts.next()?);
        self.disks.iter().position(|d| d.target == target)
    }

    /// Generate a node-name not used anywhere on the guest.
    pub fn allocate_node_name(&mut self, target: &str) -> String {
        let used: HashSet<String> = self
            .disks
            .iter()
            .flat_map(|d| d.chain.iter().chain(d.mirror.iter()))
            .filter_map(|n| n.node_name.clone())
            .collect();
        loop {
            let name = format!("{}-fmt{}", target, self.next_node);
            self.next_node += 1;
            if !used.contains(&name) {
                return name;
            }
        }
    }
}

/// A running guest.
pub struct Guest {
    pub(crate) name: String,
    pub(crate) caps: Capabilities,
    pub(crate) monitor: Arc<dyn Monitor>,
    pub(crate) access: Arc<dyn ImageAccess>,
    pub(crate) inner: Mutex<GuestInner>,
    pub(crate) changed: Condvar,
    pub(crate) job_lock: JobLock,
}

impl Guest {
    /// Create a running guest.
    ///
    /// Chain nodes without a node-name get a generated one.
    pub fn new(
        name: impl Into<String>,
        caps: Capabilities,
        monitor: Arc<dyn Monitor>,
        access: Arc<dyn ImageAccess>,
        disks: Vec<Disk>,
    ) -> Self {
        let mut inner = GuestInner {
            active: true,
            disks,
            jobs: Registry::default(),
            next_node: 0,
        };
        for d in 0..inner.disks.len() {
            for n in 0..inner.disks[d].chain.len() {
                if inner.disks[d].chain[n].node_name.is_none() {
                    let target = inner.disks[d].target.clone();
                    let node_name = inner.allocate_node_name(&target);
                    inner.disks[d].chain[n].node_name = Some(node_name);
                }
            }
        }

        Self {
            name: name.into(),
            caps,
            monitor,
            access,
            inner: Mutex::new(inner),
            changed: Condvar::new(),
            job_lock: JobLock::default(),
        }
    }

    /// Guest name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Emulator capabilities.
    pub fn caps(&self) -> &Capabilities {
        &self.caps
    }

    /// Whether the guest is running.
    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    /// Snapshot of the guest's disks.
    pub fn disks(&self) -> Vec<Disk> {
        self.inner.lock().disks.clone()
    }

    /// Snapshot of one disk.
    pub fn disk(&self, target: &str) -> Result<Disk> {
        self.inner.lock().disk(target).cloned()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, GuestInner> {
        self.inner.lock()
    }

    pub(crate) fn lock_active(&self) -> Result<MutexGuard<'_, GuestInner>> {
        let inner = self.inner.lock();
        if !inner.active {
            return Err(Error::GuestInactive(self.name.clone()));
        }
        Ok(inner)
    }

    /// Wake everyone waiting for a job state change.
    pub(crate) fn notify_changed(&self) {
        self.changed.notify_all();
    }
}

impl std::fmt::Debug for Guest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guest")
            .field("name", &self.name)
            .field("caps", &self.caps)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Domain Job Lock
// ============================================================================

/// Exclusive lock for state-changing operations on a guest.
///
/// Held across monitor round-trips, unlike the guest's state mutex.
#[derive(Debug, Default)]
pub struct JobLock {
    owner: Mutex<Option<&'static str>>,
    released: Condvar,
}

impl JobLock {
    /// Block until the lock is free, then take it for `operation`.
    pub fn begin(&self, operation: &'static str) -> JobGuard<'_> {
        let mut owner = self.owner.lock();
        while let Some(holder) = *owner {
            tracing::debug!(operation, holder, "waiting for guest job lock");
            self.released.wait(&mut owner);
        }
        *owner = Some(operation);
        JobGuard { lock: self }
    }

    /// Operation currently holding the lock.
    pub fn owner(&self) -> Option<&'static str> {
        *self.owner.lock()
    }
}

/// Releases the [`JobLock`] on drop.
#[derive(Debug)]
pub struct JobGuard<'a> {
    lock: &'a JobLock,
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        *self.lock.owner.lock() = None;
        self.lock.released.notify_one();
    }
}
