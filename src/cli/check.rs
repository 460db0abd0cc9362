//! Check command implementation.

use blockjobd::config::DaemonConfig;
use blockjobd::storage;
use blockjobd::vm::{ChainNode, Disk};
use clap::Args;

/// Validate the configuration and print the guest's backing chains.
#[derive(Args, Debug)]
pub struct CheckCmd {
    /// Also read the image files and compare their backing chains.
    #[arg(long)]
    pub probe: bool,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

impl CheckCmd {
    /// Execute the check command.
    pub fn run(&self, config: &DaemonConfig) -> blockjobd::Result<()> {
        config.validate()?;
        let disks = config.disks();

        if self.json {
            let out = serde_json::json!({
                "guest": config.guest.name,
                "monitor": config.monitor.socket,
                "capabilities": config.capabilities,
                "disks": disks,
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&out)
                    .map_err(|e| blockjobd::Error::Config(e.to_string()))?
            );
        } else {
            println!("guest {} (monitor {})", config.guest.name, config.monitor.socket.display());
            for disk in &disks {
                print_disk(disk);
            }
        }

        if self.probe {
            let mut mismatched = 0;
            for disk in &disks {
                if !probe_disk(disk)? {
                    mismatched += 1;
                }
            }
            if mismatched > 0 {
                return Err(blockjobd::Error::Config(format!(
                    "{} disk(s) do not match their image files",
                    mismatched
                )));
            }
        }
        Ok(())
    }
}

fn print_disk(disk: &Disk) {
    println!("{} ({})", disk.target, disk.alias);
    for (idx, node) in disk.chain.iter().enumerate() {
        println!(
            "  [{}] {:<40} {:<6} {}",
            idx,
            node.display(),
            node.format,
            if node.readonly { "ro" } else { "rw" }
        );
    }
}

/// Compare the configured chain with what the image headers describe.
fn probe_disk(disk: &Disk) -> blockjobd::Result<bool> {
    let Some(top) = disk.active() else {
        return Ok(false);
    };
    let detected = storage::detect_chain(&top.path, Some(top.format))?;
    let same = detected.len() == disk.chain.len()
        && detected
            .iter()
            .zip(&disk.chain)
            .all(|(found, configured)| same_image(found, configured));
    if same {
        println!("{}: chain matches image files", disk.target);
    } else {
        let found: Vec<_> = detected.iter().map(ChainNode::display).collect();
        println!("{}: image files describe {}", disk.target, found.join(" -> "));
    }
    Ok(same)
}

fn same_image(found: &ChainNode, configured: &ChainNode) -> bool {
    found.path == configured.path && found.format == configured.format
}
