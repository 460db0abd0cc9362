//! HTTP request handlers.

pub mod disks;
pub mod health;
pub mod jobs;
