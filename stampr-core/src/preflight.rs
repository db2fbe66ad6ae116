//! Startup checks.
//!
//! Everything here runs once before the monitor starts, and any failure is
//! fatal: a duplicator that cannot write should say so at boot rather than
//! blink at the first inserted stick.

use crate::config::Config;
use crate::runner::CommandRunner;
use crate::signal::StatusSignal;
use anyhow::{Context, Result, bail};
use std::path::Path;
use tracing::{info, warn};

/// Tools every run depends on, as (command, Debian package).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("lsblk", "util-linux"),
    ("blkid", "util-linux"),
    ("parted", "parted"),
    ("partprobe", "parted"),
    ("fdisk", "fdisk"),
    ("e2fsck", "e2fsprogs"),
    ("resize2fs", "e2fsprogs"),
    ("dd", "coreutils"),
    ("sync", "coreutils"),
    ("df", "coreutils"),
    ("mount", "mount"),
    ("umount", "mount"),
    ("udevadm", "udev"),
];

/// Tools that are only needed for some images or that improve logging.
pub const OPTIONAL_TOOLS: &[(&str, &str)] = &[
    ("pv", "pv"),
    ("bash", "bash"),
    ("btrfs", "btrfs-progs"),
    ("xfs_growfs", "xfsprogs"),
];

pub fn check_root() -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        bail!("stampr must be run as root (use sudo)");
    }
    Ok(())
}

pub fn check_image(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        bail!("No image configured; set image_path in the config file or pass --image");
    }
    let meta = std::fs::metadata(path)
        .with_context(|| format!("Image file not found at {}", path.display()))?;
    if !meta.is_file() {
        bail!("Image path {} is not a regular file", path.display());
    }
    info!("Using image {} ({} bytes)", path.display(), meta.len());
    Ok(())
}

/// The (command, package) pairs from `tools` that are not on `PATH`.
pub fn missing_tools<'a>(
    runner: &dyn CommandRunner,
    tools: &[(&'a str, &'a str)],
) -> Vec<(&'a str, &'a str)> {
    tools
        .iter()
        .filter(|(tool, _)| !runner.locate(tool))
        .copied()
        .collect()
}

pub fn check_required_tools(runner: &dyn CommandRunner, tools: &[(&str, &str)]) -> Result<()> {
    let missing = missing_tools(runner, tools);
    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {t} (install: {p})"))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required tools:\n{msg}");
    }
    Ok(())
}

fn report_optional_tools(runner: &dyn CommandRunner) {
    for (tool, package) in missing_tools(runner, OPTIONAL_TOOLS) {
        warn!("Optional tool {tool} not found (install: {package})");
    }
}

pub fn prepare_mount_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create mount directory {}", path.display()))
}

/// Runs every startup check against `config`.
pub fn check_all(config: &Config, runner: &dyn CommandRunner, signal: &StatusSignal) -> Result<()> {
    check_root()?;
    check_image(&config.image_path)?;
    check_required_tools(runner, REQUIRED_TOOLS)?;
    report_optional_tools(runner);
    if config.expand.enabled {
        prepare_mount_dir(&config.expand.xfs_mount_dir)?;
    }
    signal
        .self_test()
        .context("Status light is not usable")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::fake::FakeRunner;

    #[test]
    fn reports_missing_tools_with_packages() {
        let runner = FakeRunner::new();
        runner.hide("resize2fs").hide("pv");

        let err = check_required_tools(&runner, REQUIRED_TOOLS).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("resize2fs (install: e2fsprogs)"));
        assert!(!msg.contains("parted"));

        assert_eq!(missing_tools(&runner, OPTIONAL_TOOLS), vec![("pv", "pv")]);
    }

    #[test]
    fn all_tools_present_passes() {
        assert!(check_required_tools(&FakeRunner::new(), REQUIRED_TOOLS).is_ok());
    }

    #[test]
    fn image_must_exist_and_be_a_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check_image(&dir.path().join("missing.img")).is_err());
        assert!(check_image(dir.path()).is_err());
        assert!(check_image(Path::new("")).is_err());

        let image = dir.path().join("os.img");
        std::fs::write(&image, b"image").unwrap();
        assert!(check_image(&image).is_ok());
    }

    #[test]
    fn mount_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let mount = dir.path().join("mnt/temp_xfs");
        prepare_mount_dir(&mount).unwrap();
        assert!(mount.is_dir());
    }
}
