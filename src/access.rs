//! Access grants and locks on chain images.
//!
//! Block jobs need the emulator to write to images that are normally
//! opened read-only (the base of a commit, a copy destination). The
//! engine grants that access before starting the job and takes it back
//! when the image leaves the chain.

use crate::error::Result;
use crate::vm::ChainNode;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

/// Grants the emulator access to image files.
pub trait ImageAccess: Send + Sync {
    /// Allow the emulator to read the image, and to write it if `writable`.
    ///
    /// Granting read-only access to an image that held write access
    /// also releases its write lock.
    fn grant(&self, node: &ChainNode, writable: bool) -> Result<()>;

    /// Take back all access to an image that left the chain.
    fn revoke(&self, node: &ChainNode);

    /// Release the write lock on an image without changing its access.
    fn unlock(&self, node: &ChainNode);
}

/// [`ImageAccess`] backed by host file permissions.
///
/// Write access is the owner write bit; write locks are tracked in memory.
#[derive(Debug, Default)]
pub struct HostAccess {
    locked: Mutex<HashSet<PathBuf>>,
}

impl HostAccess {
    /// Create a new host access manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the engine holds a write lock on `path`.
    pub fn is_locked(&self, path: &std::path::Path) -> bool {
        self.locked.lock().contains(path)
    }
}

impl ImageAccess for HostAccess {
    fn grant(&self, node: &ChainNode, writable: bool) -> Result<()> {
        let mut perms = std::fs::metadata(&node.path)?.permissions();
        let mode = if writable {
            perms.mode() | 0o200
        } else {
            perms.mode() & !0o222
        };
        perms.set_mode(mode);
        std::fs::set_permissions(&node.path, perms)?;

        let mut locked = self.locked.lock();
        if writable {
            locked.insert(node.path.clone());
        } else {
            locked.remove(&node.path);
        }
        tracing::debug!(image = %node.path.display(), writable, "granted image access");
        Ok(())
    }

    fn revoke(&self, node: &ChainNode) {
        self.locked.lock().remove(&node.path);
        tracing::debug!(image = %node.path.display(), "revoked image access");
    }

    fn unlock(&self, node: &ChainNode) {
        if self.locked.lock().remove(&node.path) {
            tracing::debug!(image = %node.path.display(), "released image write lock");
        }
    }
}
