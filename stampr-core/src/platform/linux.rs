use crate::discovery::HardwareInfo;
use nix::ioctl_read;
use nix::sys::stat::{major, minor};
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::warn;

const SYSFS_ROOT: &str = "/sys";

ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// Helper to read a specific file from the /sys/block filesystem.
fn read_sys_file(device_name: &str, file: &str) -> io::Result<String> {
    let path = Path::new(SYSFS_ROOT)
        .join("block")
        .join(device_name)
        .join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

/// Helper to find the parent device of a partition (e.g., /dev/sda1 -> /dev/sda).
pub fn parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") || path_str.starts_with("/dev/vd") {
        if let Some(index) = path_str.rfind(|c: char| c.is_alphabetic()) {
            return PathBuf::from(&path_str[..=index]);
        }
    } else if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.rfind('p') {
            // `nvme0n1` has no partition suffix; only strip a trailing `pN`.
            let suffix = &path_str[index + 1..];
            if index > "/dev/".len()
                && !suffix.is_empty()
                && suffix.chars().all(|c| c.is_ascii_digit())
            {
                return PathBuf::from(&path_str[..index]);
            }
        }
    }

    path.to_path_buf()
}

/// Returns the kernel name (e.g. "mmcblk0") of the disk that backs `/`.
///
/// Provisioning destroys the target, so this disk must never be picked even if
/// it happens to hang off a USB bridge (Raspberry Pis booted from USB do).
///
/// The device number of `/` is resolved through `/sys/dev/block` first, since
/// the mount table may only name `/dev/root`. The mount table is the fallback
/// for roots without a block device number of their own.
pub fn system_disk_name() -> Option<String> {
    let sys = Path::new(SYSFS_ROOT);
    let by_number = fs::metadata("/")
        .ok()
        .and_then(|meta| disk_for_device_number(sys, meta.dev()));
    if by_number.is_some() {
        return by_number;
    }

    let by_mount = root_mount_disk().filter(|name| is_block_device(sys, name));
    if by_mount.is_none() {
        warn!("Could not determine system drive; it will not be excluded from provisioning");
    }
    by_mount
}

/// Maps a device number to the name of the whole disk it lives on.
///
/// `/sys/dev/block/<major>:<minor>` links to the block device directory; a
/// partition sits inside its disk's directory and carries a `partition` file.
fn disk_for_device_number(sys_root: &Path, dev: u64) -> Option<String> {
    let link = sys_root
        .join("dev/block")
        .join(format!("{}:{}", major(dev), minor(dev)));
    let node = fs::canonicalize(link).ok()?;
    let disk = if node.join("partition").exists() {
        node.parent()?
    } else {
        node.as_path()
    };
    disk.file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

fn is_block_device(sys_root: &Path, name: &str) -> bool {
    sys_root.join("block").join(name).exists()
}

/// The disk named by the mount table entry for `/`, as `sysinfo` reports it.
fn root_mount_disk() -> Option<String> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
        .map(|disk| {
            let name = disk.name().to_string_lossy();
            let path = if name.starts_with("/dev/") {
                PathBuf::from(name.as_ref())
            } else {
                PathBuf::from("/dev/").join(name.as_ref())
            };
            parent_device_path(&path)
        })
        .and_then(|parent| {
            parent
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
        })
}

/// Builds the device node of partition `number` on `device`.
///
/// The kernel inserts a `p` between the disk and the partition number when
/// the disk name itself ends in a digit (`mmcblk0p2`, `nvme0n1p2`).
pub fn partition_path(device: &Path, number: u32) -> PathBuf {
    let base = device.to_string_lossy();
    if base.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{base}p{number}"))
    } else {
        PathBuf::from(format!("{base}{number}"))
    }
}

/// Reads the capacity of a block device in bytes with the `BLKGETSIZE64` ioctl.
pub fn device_size_bytes(device_path: &Path) -> io::Result<u64> {
    let file = File::open(device_path)?;
    let fd = file.as_raw_fd();
    let mut size_bytes: u64 = 0;
    unsafe {
        blkgetsize64(fd, &mut size_bytes).map_err(io::Error::from)?;
    }

    if size_bytes == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "device size is reported as zero",
        ));
    }
    Ok(size_bytes)
}

/// Looks up hardware descriptors under `/sys/block/<name>/device`.
#[derive(Clone, Debug, Default)]
pub struct SysfsHardware;

impl HardwareInfo for SysfsHardware {
    fn vendor(&self, device_name: &str) -> Option<String> {
        read_sys_file(device_name, "device/vendor")
            .ok()
            .filter(|vendor| !vendor.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_paths_follow_kernel_naming() {
        assert_eq!(
            partition_path(Path::new("/dev/sdb"), 2),
            PathBuf::from("/dev/sdb2")
        );
        assert_eq!(
            partition_path(Path::new("/dev/mmcblk0"), 2),
            PathBuf::from("/dev/mmcblk0p2")
        );
        assert_eq!(
            partition_path(Path::new("/dev/nvme0n1"), 1),
            PathBuf::from("/dev/nvme0n1p1")
        );
    }

    #[test]
    fn parent_device_strips_partition_suffix() {
        assert_eq!(
            parent_device_path(Path::new("/dev/sda1")),
            PathBuf::from("/dev/sda")
        );
        assert_eq!(
            parent_device_path(Path::new("/dev/mmcblk0p2")),
            PathBuf::from("/dev/mmcblk0")
        );
        assert_eq!(
            parent_device_path(Path::new("/dev/nvme0n1p3")),
            PathBuf::from("/dev/nvme0n1")
        );
        assert_eq!(
            parent_device_path(Path::new("/dev/nvme0n1")),
            PathBuf::from("/dev/nvme0n1")
        );
    }

    /// Lays out `/sys/devices/.../block/<disk>/<partition>` with the
    /// matching `/sys/dev/block/<major>:<minor>` links.
    fn fake_sysfs(root: &Path, disk: &str, partition: &str) {
        let disk_dir = root.join("devices/platform/usb/block").join(disk);
        let part_dir = disk_dir.join(partition);
        fs::create_dir_all(&part_dir).unwrap();
        fs::write(part_dir.join("partition"), "2").unwrap();
        fs::create_dir_all(root.join("dev/block")).unwrap();
        fs::create_dir_all(root.join("block")).unwrap();
        std::os::unix::fs::symlink(&disk_dir, root.join("dev/block/8:0")).unwrap();
        std::os::unix::fs::symlink(&part_dir, root.join("dev/block/8:2")).unwrap();
        std::os::unix::fs::symlink(&disk_dir, root.join("block").join(disk)).unwrap();
    }

    #[test]
    fn root_partition_number_resolves_to_its_disk() {
        let sys = tempfile::tempdir().unwrap();
        fake_sysfs(sys.path(), "sda", "sda2");

        let sda2 = nix::sys::stat::makedev(8, 2);
        let sda = nix::sys::stat::makedev(8, 0);
        assert_eq!(disk_for_device_number(sys.path(), sda2), Some("sda".to_string()));
        assert_eq!(disk_for_device_number(sys.path(), sda), Some("sda".to_string()));
        assert_eq!(
            disk_for_device_number(sys.path(), nix::sys::stat::makedev(0, 27)),
            None
        );
    }

    #[test]
    fn dev_root_alias_is_not_a_disk() {
        let sys = tempfile::tempdir().unwrap();
        fake_sysfs(sys.path(), "sda", "sda2");

        assert_eq!(parent_device_path(Path::new("/dev/root")), PathBuf::from("/dev/root"));
        assert!(!is_block_device(sys.path(), "root"));
        assert!(is_block_device(sys.path(), "sda"));
    }

    #[test]
    fn missing_device_has_no_size() {
        assert!(device_size_bytes(Path::new("/dev/stampr-does-not-exist")).is_err());
    }
}
