//! Daemon configuration.
//!
//! The configuration is a TOML file describing where to listen, how to
//! reach the emulator monitor, what the emulator supports, and the
//! guest's disks with their backing chains.
//!
//! ```toml
//! listen = "127.0.0.1:8089"
//!
//! [monitor]
//! socket = "/run/blockjobd/guest.monitor"
//! command_timeout = "30s"
//!
//! [capabilities]
//! blockdev = true
//!
//! [guest]
//! name = "web01"
//!
//! [[guest.disks]]
//! target = "vda"
//! alias = "virtio-disk0"
//! chain = [
//!     { path = "/images/web01.qcow2" },
//!     { path = "/images/base.raw", format = "raw" },
//! ]
//! ```

use crate::error::{Error, Result};
use crate::monitor::Capabilities;
use crate::vm::{ChainNode, Disk, ImageFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name for config file storage.
const APP_NAME: &str = "blockjobd";

/// Default HTTP listen address.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8089";

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "blockjobd=info";

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_command_timeout() -> String {
    "30s".to_string()
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// HTTP API listen address.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Log filter directive used when `RUST_LOG` is unset.
    #[serde(default)]
    pub log_filter: Option<String>,

    /// Monitor connection.
    pub monitor: MonitorConfig,

    /// Emulator capabilities.
    #[serde(default)]
    pub capabilities: Capabilities,

    /// The guest whose disks are managed.
    pub guest: GuestConfig,
}

/// Monitor connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Path of the monitor's Unix socket.
    pub socket: PathBuf,

    /// How long to wait for a command reply (humantime, e.g. "30s").
    #[serde(default = "default_command_timeout")]
    pub command_timeout: String,
}

/// Guest definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestConfig {
    /// Guest name.
    pub name: String,

    /// Attached disks.
    #[serde(default)]
    pub disks: Vec<DiskConfig>,
}

/// Disk definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Target name (e.g. "vda").
    pub target: String,

    /// Device alias; defaults to `virtio-<target>`.
    #[serde(default)]
    pub alias: Option<String>,

    /// Backing chain, active image first.
    pub chain: Vec<ImageConfig>,
}

/// One image of a backing chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Image file.
    pub path: PathBuf,

    /// Image format.
    #[serde(default)]
    pub format: ImageFormat,

    /// Node-name; generated when absent.
    #[serde(default)]
    pub node_name: Option<String>,
}

impl DiskConfig {
    /// Alias of the disk.
    pub fn alias(&self) -> String {
        self.alias
            .clone()
            .unwrap_or_else(|| format!("virtio-{}", self.target))
    }

    /// Build the runtime disk; the active image is writable.
    pub fn to_disk(&self) -> Disk {
        let chain = self
            .chain
            .iter()
            .enumerate()
            .map(|(idx, image)| {
                let mut node = ChainNode::new(&image.path, image.format);
                node.node_name = image.node_name.clone();
                node.readonly = idx != 0;
                node
            })
            .collect();
        Disk::new(&self.target, self.alias(), chain)
    }
}

impl DaemonConfig {
    /// Default config file location.
    ///
    /// On Linux: `~/.config/blockjobd/blockjobd.toml`
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("could not determine config directory".into()))?;
        Ok(dir.join(APP_NAME).join(format!("{}.toml", APP_NAME)))
    }

    /// Load and validate the configuration from `path`, or the default location.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_path()?,
        };
        let text = std::fs::read_to_string(&path)
            .map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_toml(&text)?;
        tracing::debug!(path = %path.display(), disks = config.guest.disks.len(), "loaded config");
        Ok(config)
    }

    /// Parse and validate a configuration document.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::ConfigLoad(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        self.command_timeout()?;

        let mut targets = HashSet::new();
        let mut node_names = HashSet::new();
        for disk in &self.guest.disks {
            if !targets.insert(disk.target.as_str()) {
                return Err(Error::Config(format!("duplicate disk target '{}'", disk.target)));
            }
            if disk.chain.is_empty() {
                return Err(Error::Config(format!("disk '{}' has an empty chain", disk.target)));
            }
            for (idx, image) in disk.chain.iter().enumerate() {
                if !image.path.is_absolute() {
                    return Err(Error::Config(format!(
                        "disk '{}': image path '{}' must be absolute",
                        disk.target,
                        image.path.display()
                    )));
                }
                if idx + 1 < disk.chain.len() && !image.format.supports_backing() {
                    return Err(Error::Config(format!(
                        "disk '{}': {} image '{}' cannot have a backing image",
                        disk.target,
                        image.format,
                        image.path.display()
                    )));
                }
                if let Some(name) = &image.node_name {
                    if !node_names.insert(name.as_str()) {
                        return Err(Error::Config(format!("duplicate node-name '{}'", name)));
                    }
                }
            }
        }
        Ok(())
    }

    /// Monitor command timeout.
    pub fn command_timeout(&self) -> Result<Duration> {
        humantime::parse_duration(&self.monitor.command_timeout).map_err(|e| {
            Error::Config(format!(
                "invalid command_timeout '{}': {}",
                self.monitor.command_timeout, e
            ))
        })
    }

    /// Log filter directive.
    pub fn log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }

    /// Runtime disks for the guest.
    pub fn disks(&self) -> Vec<Disk> {
        self.guest.disks.iter().map(DiskConfig::to_disk).collect()
    }
}
