//! Test fixtures: a scripted monitor and sample guests.

use crate::access::ImageAccess;
use crate::error::{Error, Result};
use crate::monitor::{Capabilities, Monitor};
use crate::storage::{EXT_BACKING_FORMAT, QCOW2_MAGIC};
use crate::vm::{ChainNode, Disk, Guest, ImageFormat};
use blockjobd_protocol::{Command, RawEvent};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

/// In-process monitor and image access stand-in.
///
/// Records every command, answers with canned replies (`[]` for queries,
/// `{}` otherwise) or injected rejections, and can emit events to the
/// attached guest from inside a command.
#[derive(Default)]
pub(crate) struct FakeMonitor {
    replies: Mutex<HashMap<String, Value>>,
    rejections: Mutex<HashMap<String, String>>,
    during: Mutex<HashMap<String, Vec<RawEvent>>>,
    commands: Mutex<Vec<Value>>,
    guest: Mutex<Weak<Guest>>,
    granted: Mutex<Vec<(PathBuf, bool)>>,
    revoked: Mutex<Vec<PathBuf>>,
    unlocked: Mutex<Vec<PathBuf>>,
}

impl FakeMonitor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Answer `command` with `value` from now on.
    pub(crate) fn reply(&self, command: &str, value: Value) {
        self.rejections.lock().remove(command);
        self.replies.lock().insert(command.to_string(), value);
    }

    /// Refuse `command` with `desc` from now on.
    pub(crate) fn reject(&self, command: &str, desc: &str) {
        self.rejections
            .lock()
            .insert(command.to_string(), desc.to_string());
    }

    /// Emit an event while `command` executes, once.
    pub(crate) fn emit_during(&self, command: &str, event: &str, data: Value) {
        self.during
            .lock()
            .entry(command.to_string())
            .or_default()
            .push(raw_event(event, data));
    }

    /// Deliver an event to `guest` right away.
    pub(crate) fn emit(&self, guest: &Guest, event: &str, data: Value) {
        guest.handle_event(&raw_event(event, data));
    }

    /// Most recent command with the given name, as sent on the wire.
    pub(crate) fn last_command(&self, command: &str) -> Option<Value> {
        self.commands
            .lock()
            .iter()
            .rev()
            .find(|c| c["execute"] == command)
            .cloned()
    }

    /// Number of commands with the given name sent so far.
    pub(crate) fn count(&self, command: &str) -> usize {
        self.commands
            .lock()
            .iter()
            .filter(|c| c["execute"] == command)
            .count()
    }

    pub(crate) fn granted(&self) -> Vec<(PathBuf, bool)> {
        self.granted.lock().clone()
    }

    pub(crate) fn revoked(&self) -> Vec<PathBuf> {
        self.revoked.lock().clone()
    }

    pub(crate) fn unlocked(&self) -> Vec<PathBuf> {
        self.unlocked.lock().clone()
    }

    fn attach(&self, guest: &Arc<Guest>) {
        *self.guest.lock() = Arc::downgrade(guest);
    }
}

impl Monitor for FakeMonitor {
    fn execute(&self, cmd: &Command) -> Result<Value> {
        let name = cmd.name();
        let wire = serde_json::to_value(cmd).map_err(|e| Error::monitor(e.to_string()))?;
        self.commands.lock().push(wire);

        let events = self.during.lock().remove(name).unwrap_or_default();
        if !events.is_empty() {
            let guest = self.guest.lock().upgrade();
            if let Some(guest) = guest {
                for event in &events {
                    guest.handle_event(event);
                }
            }
        }

        if let Some(desc) = self.rejections.lock().get(name) {
            return Err(Error::rejected(name, desc.clone()));
        }
        let reply = self.replies.lock().get(name).cloned();
        Ok(reply.unwrap_or_else(|| {
            if name.starts_with("query-") {
                Value::Array(Vec::new())
            } else {
                Value::Object(Default::default())
            }
        }))
    }
}

impl ImageAccess for FakeMonitor {
    fn grant(&self, node: &ChainNode, writable: bool) -> Result<()> {
        self.granted.lock().push((node.path.clone(), writable));
        Ok(())
    }

    fn revoke(&self, node: &ChainNode) {
        self.revoked.lock().push(node.path.clone());
    }

    fn unlock(&self, node: &ChainNode) {
        self.unlocked.lock().push(node.path.clone());
    }
}

fn raw_event(event: &str, data: Value) -> RawEvent {
    RawEvent {
        event: event.to_string(),
        data,
        timestamp: None,
    }
}

fn build_guest(caps: Capabilities, fake: FakeMonitor, disks: Vec<Disk>) -> (Arc<Guest>, Arc<FakeMonitor>) {
    let fake = Arc::new(fake);
    let monitor: Arc<dyn Monitor> = fake.clone();
    let access: Arc<dyn ImageAccess> = fake.clone();
    let guest = Arc::new(Guest::new("test-guest", caps, monitor, access, disks));
    fake.attach(&guest);
    (guest, fake)
}

/// Guest with two disks:
///
/// - `vda` (alias `virtio-disk0`): vda-top.qcow2 -> vda-mid.qcow2 -> vda-base.raw
/// - `vdb` (alias `virtio-disk1`): vdb.qcow2
pub(crate) fn sample_guest(caps: Capabilities, fake: FakeMonitor) -> (Arc<Guest>, Arc<FakeMonitor>) {
    let vda = Disk::new(
        "vda",
        "virtio-disk0",
        vec![
            ChainNode::new("/images/vda-top.qcow2", ImageFormat::Qcow2).writable(),
            ChainNode::new("/images/vda-mid.qcow2", ImageFormat::Qcow2),
            ChainNode::new("/images/vda-base.raw", ImageFormat::Raw),
        ],
    );
    let vdb = Disk::new(
        "vdb",
        "virtio-disk1",
        vec![ChainNode::new("/images/vdb.qcow2", ImageFormat::Qcow2).writable()],
    );
    build_guest(caps, fake, vec![vda, vdb])
}

/// Guest whose `vda` chain top.qcow2 -> mid.qcow2 -> base.qcow2 exists as
/// real images in `dir`.
pub(crate) fn guest_with_files(
    caps: Capabilities,
    fake: FakeMonitor,
    dir: &Path,
) -> (Arc<Guest>, Arc<FakeMonitor>) {
    let images = [
        ("top.qcow2", Some("mid.qcow2")),
        ("mid.qcow2", Some("base.qcow2")),
        ("base.qcow2", None),
    ];
    let mut chain = Vec::new();
    for (name, backing) in images {
        let path = dir.join(name);
        std::fs::write(&path, qcow2_image(backing.map(|b| (b, Some("qcow2")))))
            .expect("write test image");
        chain.push(ChainNode::new(path, ImageFormat::Qcow2));
    }
    chain[0].readonly = false;
    build_guest(caps, fake, vec![Disk::new("vda", "virtio-disk0", chain)])
}

/// Version 3 qcow2 header with an optional backing file and format.
pub(crate) fn qcow2_image(backing: Option<(&str, Option<&str>)>) -> Vec<u8> {
    let mut buf = vec![0u8; 1024];
    buf[0..4].copy_from_slice(&QCOW2_MAGIC);
    buf[4..8].copy_from_slice(&3u32.to_be_bytes());
    buf[100..104].copy_from_slice(&104u32.to_be_bytes());
    if let Some((name, fmt)) = backing {
        buf[8..16].copy_from_slice(&512u64.to_be_bytes());
        buf[16..20].copy_from_slice(&(name.len() as u32).to_be_bytes());
        buf[512..512 + name.len()].copy_from_slice(name.as_bytes());
        if let Some(fmt) = fmt {
            buf[104..108].copy_from_slice(&EXT_BACKING_FORMAT.to_be_bytes());
            buf[108..112].copy_from_slice(&(fmt.len() as u32).to_be_bytes());
            buf[112..112 + fmt.len()].copy_from_slice(fmt.as_bytes());
        }
    }
    buf
}
