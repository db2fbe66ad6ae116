//! Grows a partition to the end of its disk.
//!
//! `parted resizepart` does the job in place. When it refuses (old parted
//! builds, prompts it cannot answer in script mode), the partition entry is
//! deleted and recreated with `fdisk` at the same start sector and the
//! largest possible end, keeping the filesystem signature. Recreating is
//! riskier than resizing, so it is only ever the second attempt.

use crate::runner::{CommandRunner, CommandSpec, invoke};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info, warn};

const PARTED_SETTLE: Duration = Duration::from_secs(2);
const FDISK_SETTLE: Duration = Duration::from_secs(3);

/// One row of `fdisk -l` output. Fields are kept as printed; they are only logged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionDescriptor {
    pub node: String,
    pub number: u32,
    pub boot: bool,
    pub start: String,
    pub end: String,
    pub sectors: String,
    pub size: String,
    pub kind: String,
}

/// Partition table flavor, as reported by `parted print`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableKind {
    Msdos,
    Gpt,
    Unknown,
}

impl TableKind {
    pub fn from_parted_print(output: &str) -> Self {
        let label = output
            .lines()
            .find_map(|line| line.trim().strip_prefix("Partition Table:"))
            .map(str::trim);
        match label {
            Some("msdos") => TableKind::Msdos,
            Some("gpt") => TableKind::Gpt,
            _ => TableKind::Unknown,
        }
    }
}

/// Extracts the partition rows for `device` from `fdisk -l` output.
pub fn parse_fdisk_list(device: &Path, output: &str) -> Vec<PartitionDescriptor> {
    let device = device.to_string_lossy();
    output
        .lines()
        .filter_map(|line| {
            let rest = line.strip_prefix(&*device)?;
            let rest = rest.strip_prefix('p').unwrap_or(rest);
            if !rest.starts_with(|c: char| c.is_ascii_digit()) {
                return None;
            }

            let mut fields = line.split_whitespace();
            let node = fields.next()?.to_string();
            let number: u32 = node
                .rsplit(|c: char| !c.is_ascii_digit())
                .next()?
                .parse()
                .ok()?;

            let mut fields = fields.peekable();
            let boot = fields.next_if_eq(&"*").is_some();
            let start = fields.next()?.to_string();
            let end = fields.next()?.to_string();
            let sectors = fields.next()?.to_string();
            let size = fields.next()?.to_string();
            let kind = fields.collect::<Vec<_>>().join(" ");

            Some(PartitionDescriptor {
                node,
                number,
                boot,
                start,
                end,
                sectors,
                size,
                kind: if kind.is_empty() {
                    "Unknown".to_string()
                } else {
                    kind
                },
            })
        })
        .collect()
}

/// Picks the partition to grow: the configured one if it exists, otherwise
/// the last partition on the disk.
pub fn select_target(configured: u32, partitions: &[PartitionDescriptor]) -> Option<u32> {
    if partitions.iter().any(|p| p.number == configured) {
        return Some(configured);
    }
    partitions.iter().map(|p| p.number).max()
}

/// Keystrokes that delete and recreate partition `number` with the default
/// start sector and the largest end, keeping the existing signature.
pub fn fdisk_script(number: u32, table: TableKind) -> String {
    let mut lines: Vec<String> = vec!["p".into(), "d".into(), number.to_string(), "n".into()];
    if table != TableKind::Gpt {
        lines.push("p".into());
    }
    lines.push(number.to_string());
    // First sector, last sector: accept the defaults.
    lines.push(String::new());
    lines.push(String::new());
    // "Do you want to remove the signature?" -> No.
    lines.push("N".into());
    lines.push("p".into());
    lines.push("w".into());

    let mut script = lines.join("\n");
    script.push('\n');
    script
}

pub struct PartitionExpander {
    runner: Arc<dyn CommandRunner>,
}

impl PartitionExpander {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Lists the partitions on `device`. Failures yield an empty list.
    pub async fn list(&self, device: &Path) -> Vec<PartitionDescriptor> {
        let spec = CommandSpec::new("fdisk").args(["-l".to_string(), path_arg(device)]);
        let output = invoke(self.runner.as_ref(), &spec).await;
        if !output.success() {
            error!(
                "Could not read partition table of {}: {}",
                device.display(),
                output.error_text()
            );
            return Vec::new();
        }

        let partitions = parse_fdisk_list(device, &output.stdout);
        for p in &partitions {
            info!(
                "  {} start={} end={} size={} type={}",
                p.node, p.start, p.end, p.size, p.kind
            );
        }
        partitions
    }

    /// Grows partition `number` on `device` to fill the disk.
    ///
    /// Returns `false` only if both the resize and the recreate attempt fail.
    pub async fn expand(&self, device: &Path, number: u32) -> bool {
        info!("Expanding partition {number} on {}", device.display());
        let dev = path_arg(device);

        let layout = invoke(
            self.runner.as_ref(),
            &CommandSpec::new("parted").args(["-s", dev.as_str(), "print"]),
        )
        .await;
        info!("Current partition layout:\n{}", layout.stdout.trim_end());
        let table = TableKind::from_parted_print(&layout.stdout);

        let resize = CommandSpec::new("parted").args([
            "-s".to_string(),
            dev.clone(),
            "resizepart".to_string(),
            number.to_string(),
            "100%".to_string(),
        ]);
        info!("Executing: {resize}");
        let output = invoke(self.runner.as_ref(), &resize).await;
        if output.success() {
            self.reread(&dev, PARTED_SETTLE).await;
            info!("Partition expanded successfully");
            return true;
        }

        error!("Parted failed: {}", output.error_text());
        self.expand_with_fdisk(&dev, number, table).await
    }

    async fn expand_with_fdisk(&self, dev: &str, number: u32, table: TableKind) -> bool {
        warn!("Recreating partition {number} with fdisk");
        let spec = CommandSpec::new("fdisk")
            .arg(dev)
            .stdin(fdisk_script(number, table));
        let output = invoke(self.runner.as_ref(), &spec).await;
        if !output.success() {
            error!("Fdisk failed: {}", output.error_text());
            return false;
        }

        self.reread(dev, FDISK_SETTLE).await;
        info!("Partition expanded using fdisk");
        true
    }

    /// Asks the kernel to reload the partition table, then waits for it to settle.
    async fn reread(&self, dev: &str, settle: Duration) {
        let output = invoke(
            self.runner.as_ref(),
            &CommandSpec::new("partprobe").arg(dev),
        )
        .await;
        if !output.success() {
            warn!("partprobe {dev} failed: {}", output.error_text());
        }
        time::sleep(settle).await;
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
