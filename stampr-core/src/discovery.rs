//! Finds the USB disk to provision.
//!
//! Block devices are listed with `lsblk --json`. The first disk whose
//! transport is `usb` wins. Some USB bridges do not report a transport at
//! all; for those disks a non-empty vendor string in sysfs is taken as a hint
//! that the disk is external. That heuristic can misfire on internal disks
//! with vendor metadata, which is why the disk backing `/` is excluded
//! outright.

use crate::Device;
use crate::config::AmbiguityPolicy;
use crate::error::DiscoveryError;
use crate::runner::{CommandRunner, CommandSpec};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const LSBLK_COLUMNS: &str = "NAME,TYPE,MOUNTPOINT,SIZE,TRAN";

/// Looks up hardware descriptors for a block device by kernel name.
pub trait HardwareInfo: Send + Sync {
    /// The device's vendor string, if it reports a non-empty one.
    fn vendor(&self, device_name: &str) -> Option<String>;
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<BlockDevice>,
}

/// One node of `lsblk --json` output.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct BlockDevice {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub mountpoint: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub size: Option<String>,
    #[serde(default)]
    pub tran: Option<String>,
    #[serde(default)]
    pub children: Vec<BlockDevice>,
}

/// lsblk prints sizes as strings, except with `--bytes` on some versions.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

impl BlockDevice {
    pub fn is_disk(&self) -> bool {
        self.kind == "disk"
    }

    pub fn is_usb(&self) -> bool {
        self.tran.as_deref() == Some("usb")
    }

    pub fn path(&self) -> PathBuf {
        PathBuf::from("/dev/").join(&self.name)
    }

    fn to_device(&self) -> Device {
        Device {
            path: self.path(),
            name: self.name.clone(),
            transport: self.tran.clone(),
            size: self.size.clone().unwrap_or_else(|| "Unknown".to_string()),
        }
    }

    /// Device nodes of this device and its descendants that are mounted.
    pub fn mounted_nodes(&self) -> Vec<PathBuf> {
        let mut nodes = Vec::new();
        self.collect_mounted(&mut nodes);
        nodes
    }

    fn collect_mounted(&self, nodes: &mut Vec<PathBuf>) {
        // Swap shows up as "[SWAP]"; it isn't something umount can handle.
        let mounted = self
            .mountpoint
            .as_deref()
            .is_some_and(|mp| !mp.is_empty() && !mp.starts_with('['));
        if mounted {
            nodes.push(self.path());
        }
        for child in &self.children {
            child.collect_mounted(nodes);
        }
    }
}

/// Parses the JSON printed by `lsblk -J`.
pub fn parse_lsblk(json: &str) -> Result<Vec<BlockDevice>, serde_json::Error> {
    serde_json::from_str::<LsblkOutput>(json).map(|out| out.blockdevices)
}

fn is_virtual(name: &str) -> bool {
    ["loop", "zram", "ram"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// Applies the selection rule to an lsblk listing, returning every
/// qualifying disk in enumeration order.
///
/// Disks with a `usb` transport are preferred. Only if there are none are
/// disks *without* transport metadata considered, and then only those with a
/// vendor string.
pub fn qualifying_disks(
    devices: &[BlockDevice],
    hardware: &dyn HardwareInfo,
    exclude: Option<&str>,
) -> Vec<Device> {
    let disks: Vec<&BlockDevice> = devices
        .iter()
        .filter(|d| d.is_disk())
        .filter(|d| !is_virtual(&d.name))
        .filter(|d| exclude != Some(d.name.as_str()))
        .collect();

    let usb: Vec<Device> = disks
        .iter()
        .filter(|d| d.is_usb())
        .map(|d| d.to_device())
        .collect();
    if !usb.is_empty() {
        return usb;
    }

    disks
        .iter()
        .filter(|d| d.tran.is_none())
        .filter(|d| {
            let vendor = hardware.vendor(&d.name);
            if let Some(v) = &vendor {
                debug!("{} has no transport but reports vendor '{v}'", d.name);
            }
            vendor.is_some()
        })
        .map(|d| d.to_device())
        .collect()
}

/// Enumerates block devices and picks the candidate disk.
pub struct Discovery {
    runner: Arc<dyn CommandRunner>,
    hardware: Arc<dyn HardwareInfo>,
    policy: AmbiguityPolicy,
    exclude: Option<String>,
}

impl Discovery {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        hardware: Arc<dyn HardwareInfo>,
        policy: AmbiguityPolicy,
    ) -> Self {
        Self {
            runner,
            hardware,
            policy,
            exclude: None,
        }
    }

    /// Never offer the named disk (e.g. the one the system booted from).
    pub fn excluding(mut self, device_name: Option<String>) -> Self {
        if let Some(name) = &device_name {
            debug!("Excluding system disk {name} from discovery");
        }
        self.exclude = device_name;
        self
    }

    async fn lsblk(&self, device: Option<&Path>) -> Result<Vec<BlockDevice>, DiscoveryError> {
        let mut spec = CommandSpec::new("lsblk").args(["-J", "-o", LSBLK_COLUMNS]);
        if let Some(device) = device {
            spec = spec.arg(device.to_string_lossy());
        }

        let output = self.runner.run(&spec).await?;
        if !output.success() {
            return Err(DiscoveryError::Lsblk {
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(parse_lsblk(&output.stdout)?)
    }

    /// Every block device on the system.
    pub async fn list(&self) -> Result<Vec<BlockDevice>, DiscoveryError> {
        self.lsblk(None).await
    }

    /// Mounted partitions (and the disk itself, if mounted) of `device`.
    pub async fn mounted_nodes(&self, device: &Path) -> Result<Vec<PathBuf>, DiscoveryError> {
        let devices = self.lsblk(Some(device)).await?;
        Ok(devices.iter().flat_map(BlockDevice::mounted_nodes).collect())
    }

    /// Finds the disk to provision. `Ok(None)` just means nothing is attached.
    pub async fn find_candidate(&self) -> Result<Option<Device>, DiscoveryError> {
        let devices = self.list().await?;
        let mut candidates =
            qualifying_disks(&devices, self.hardware.as_ref(), self.exclude.as_deref());

        match candidates.len() {
            0 => Ok(None),
            1 => Ok(candidates.pop()),
            _ => {
                let names: Vec<String> = candidates.iter().map(|d| d.name.clone()).collect();
                match self.policy {
                    AmbiguityPolicy::Refuse => Err(DiscoveryError::Ambiguous(names)),
                    AmbiguityPolicy::First => {
                        warn!(
                            "Several USB disks attached ({}); using {}",
                            names.join(", "),
                            names[0]
                        );
                        let first = candidates.swap_remove(0);
                        info!("Selected {}", first.path.display());
                        Ok(Some(first))
                    }
                }
            }
        }
    }
}
