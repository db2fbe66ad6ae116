//! Runtime configuration, loaded from a TOML file.
//!
//! Every field has a default so a missing file or a partial file is fine; the
//! only thing an operator must provide is the image to write, which the
//! front-end checks before the monitor starts.

use crate::error::ConfigError;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/stampr/stampr.toml";
pub const DEFAULT_LOG_FILE: &str = "/var/log/stampr.log";

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// The raw disk image written to every provisioned device.
    pub image_path: PathBuf,
    /// Append-only log file; `None` logs to stderr only.
    pub log_file: Option<PathBuf>,
    pub expand: ExpandConfig,
    pub led: LedConfig,
    pub safety: SafetyConfig,
    pub timing: TimingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            image_path: PathBuf::new(),
            log_file: Some(PathBuf::from(DEFAULT_LOG_FILE)),
            expand: ExpandConfig::default(),
            led: LedConfig::default(),
            safety: SafetyConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ExpandConfig {
    /// Grow the partition and filesystem after writing.
    pub enabled: bool,
    /// Partition to grow; the last partition is used when the written image
    /// has fewer partitions than this.
    pub partition: u32,
    /// Scratch mount point for filesystems that only grow while mounted.
    pub xfs_mount_dir: PathBuf,
}

impl Default for ExpandConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            partition: 2,
            xfs_mount_dir: PathBuf::from("/mnt/temp_xfs"),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LedConfig {
    /// When disabled, signal patterns are only logged.
    pub enabled: bool,
    /// `/sys/class/pwm/pwmchip<chip>`
    pub chip: u32,
    /// `pwm<channel>` under the chip.
    pub channel: u32,
    pub frequency_hz: u32,
}

impl Default for LedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chip: 0,
            channel: 0,
            frequency_hz: 100,
        }
    }
}

/// What to do when more than one USB disk qualifies as the target.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AmbiguityPolicy {
    /// Take the first disk in enumeration order and warn about the rest.
    #[default]
    First,
    /// Do nothing until only one candidate is attached.
    Refuse,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SafetyConfig {
    /// Stop the run if any partition of the target fails to unmount.
    pub abort_on_unmount_failure: bool,
    pub ambiguous_candidates: AmbiguityPolicy,
    /// Never pick the disk that backs `/`.
    pub exclude_system_disk: bool,
    /// Pause between announcing the target and writing to it.
    pub write_delay_secs: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            abort_on_unmount_failure: false,
            ambiguous_candidates: AmbiguityPolicy::First,
            exclude_system_disk: true,
            write_delay_secs: 2,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TimingConfig {
    /// How long the light stays on after a successful run.
    pub success_hold_secs: u64,
    /// Pause after writing so the kernel can rescan the new partition table.
    pub expand_settle_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            success_hold_secs: 10,
            expand_settle_secs: 3,
        }
    }
}

impl Config {
    /// Loads `path`, or the default location when `path` is `None`.
    ///
    /// An explicitly named file must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                return Ok(Self::default());
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        let config: Self =
            toml::from_str(&text).map_err(|source| ConfigError::Parse { path, source })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.expand.partition == 0 {
            return Err(ConfigError::Invalid(
                "expand.partition must be 1 or greater".to_string(),
            ));
        }
        if !(1..=1_000_000).contains(&self.led.frequency_hz) {
            return Err(ConfigError::Invalid(format!(
                "led.frequency_hz must be between 1 and 1000000 (got {})",
                self.led.frequency_hz
            )));
        }
        Ok(())
    }
}

impl SafetyConfig {
    pub fn write_delay(&self) -> Duration {
        Duration::from_secs(self.write_delay_secs)
    }
}

impl TimingConfig {
    pub fn success_hold(&self) -> Duration {
        Duration::from_secs(self.success_hold_secs)
    }

    pub fn expand_settle(&self) -> Duration {
        Duration::from_secs(self.expand_settle_secs)
    }
}
