//! API server state.

use crate::vm::Guest;
use std::sync::Arc;

/// Shared API server state.
#[derive(Debug, Clone)]
pub struct ApiState {
    guest: Arc<Guest>,
}

impl ApiState {
    /// Create API state serving `guest`.
    pub fn new(guest: Arc<Guest>) -> Self {
        Self { guest }
    }

    /// The guest whose disks the API manages.
    pub fn guest(&self) -> Arc<Guest> {
        Arc::clone(&self.guest)
    }
}
