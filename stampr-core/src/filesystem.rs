//! Grows the filesystem on a partition after the partition itself has grown.

use crate::runner::{CommandRunner, CommandSpec, invoke};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Filesystem types stampr knows how to grow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FsKind {
    Ext2,
    Ext3,
    Ext4,
    Btrfs,
    Xfs,
    /// Anything else, including an empty probe result.
    Unsupported(String),
}

impl FsKind {
    /// Maps a `blkid -s TYPE` value to a kind.
    pub fn from_blkid(value: &str) -> Self {
        match value.trim() {
            "ext2" => FsKind::Ext2,
            "ext3" => FsKind::Ext3,
            "ext4" => FsKind::Ext4,
            "btrfs" => FsKind::Btrfs,
            "xfs" => FsKind::Xfs,
            other => FsKind::Unsupported(other.to_string()),
        }
    }

    pub fn is_ext(&self) -> bool {
        matches!(self, FsKind::Ext2 | FsKind::Ext3 | FsKind::Ext4)
    }
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsKind::Ext2 => write!(f, "ext2"),
            FsKind::Ext3 => write!(f, "ext3"),
            FsKind::Ext4 => write!(f, "ext4"),
            FsKind::Btrfs => write!(f, "btrfs"),
            FsKind::Xfs => write!(f, "xfs"),
            FsKind::Unsupported(s) if s.is_empty() => write!(f, "unknown"),
            FsKind::Unsupported(s) => write!(f, "{s}"),
        }
    }
}

pub struct FilesystemExpander {
    runner: Arc<dyn CommandRunner>,
    xfs_mount_dir: PathBuf,
}

impl FilesystemExpander {
    pub fn new(runner: Arc<dyn CommandRunner>, xfs_mount_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            xfs_mount_dir: xfs_mount_dir.into(),
        }
    }

    /// Probes the filesystem type on `partition`.
    pub async fn detect(&self, partition: &Path) -> FsKind {
        let spec = CommandSpec::new("blkid").args([
            "-o".to_string(),
            "value".to_string(),
            "-s".to_string(),
            "TYPE".to_string(),
            partition.to_string_lossy().into_owned(),
        ]);
        let output = invoke(self.runner.as_ref(), &spec).await;
        if !output.success() {
            warn!(
                "Could not detect filesystem on {}: {}",
                partition.display(),
                output.error_text()
            );
        }
        FsKind::from_blkid(&output.stdout)
    }

    /// Grows the filesystem on `partition` to fill it.
    ///
    /// Unknown filesystems are left alone and count as success.
    pub async fn expand(&self, partition: &Path) -> bool {
        let kind = self.detect(partition).await;
        info!("Detected filesystem type: {kind}");

        let part = partition.to_string_lossy().into_owned();
        match kind {
            k if k.is_ext() => self.expand_ext(&part).await,
            FsKind::Btrfs => {
                info!("Expanding btrfs filesystem");
                self.step(
                    CommandSpec::new("btrfs").args(["filesystem", "resize", "max", part.as_str()]),
                    "btrfs resize",
                )
                .await
            }
            FsKind::Xfs => self.expand_xfs(&part).await,
            other => {
                warn!("Unsupported filesystem type '{other}', skipping filesystem expansion");
                true
            }
        }
    }

    async fn expand_ext(&self, part: &str) -> bool {
        info!("Checking filesystem");
        // e2fsck exits 1 when it repaired something; only resize2fs decides the outcome.
        let check = invoke(
            self.runner.as_ref(),
            &CommandSpec::new("e2fsck").args(["-f", "-y", part]),
        )
        .await;
        if !check.success() {
            warn!(
                "e2fsck exited with {:?}: {}",
                check.code,
                check.error_text()
            );
        }

        info!("Expanding ext filesystem");
        self.step(CommandSpec::new("resize2fs").arg(part), "resize2fs")
            .await
    }

    async fn expand_xfs(&self, part: &str) -> bool {
        info!("Expanding XFS filesystem");
        let dir = self.xfs_mount_dir.to_string_lossy().into_owned();
        if let Err(e) = tokio::fs::create_dir_all(&self.xfs_mount_dir).await {
            error!("Could not create {dir}: {e}");
            return false;
        }

        if !self
            .step(CommandSpec::new("mount").args([part, dir.as_str()]), "mount")
            .await
        {
            return false;
        }

        let grown = self
            .step(CommandSpec::new("xfs_growfs").arg(&dir), "xfs_growfs")
            .await;

        if !self.step(CommandSpec::new("umount").arg(&dir), "umount").await {
            warn!("{dir} may still be mounted");
        }
        grown
    }

    async fn step(&self, spec: CommandSpec, what: &str) -> bool {
        let output = invoke(self.runner.as_ref(), &spec).await;
        if !output.success() {
            error!("{what} failed: {}", output.error_text());
        }
        output.success()
    }
}
