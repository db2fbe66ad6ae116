//! Illumination outputs: the things a [`super::StatusSignal`] writes levels to.

use crate::error::SignalError;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

const PWM_SYSFS_ROOT: &str = "/sys/class/pwm";

/// A light whose intensity can be set between 0 and 100.
///
/// Writes take effect immediately; there is no acknowledgment.
pub trait Illumination: Send + Sync {
    fn set_level(&self, level: u8) -> Result<(), SignalError>;

    /// Turns the output off and hands the hardware back to the system.
    fn release(&self) -> Result<(), SignalError> {
        self.set_level(0)
    }
}

/// A hardware PWM channel driven through `/sys/class/pwm`.
///
/// On a Raspberry Pi with the `pwm` overlay, GPIO18 is `pwmchip0/pwm0`.
/// The channel is released when the value is dropped, if it was not already.
#[derive(Debug)]
pub struct SysfsPwm {
    chip_dir: PathBuf,
    channel_dir: PathBuf,
    channel: u32,
    period_ns: u64,
    released: AtomicBool,
}

impl SysfsPwm {
    pub fn open(chip: u32, channel: u32, frequency_hz: u32) -> Result<Self, SignalError> {
        Self::open_at(Path::new(PWM_SYSFS_ROOT), chip, channel, frequency_hz)
    }

    /// Like [`SysfsPwm::open`], rooted somewhere other than `/sys/class/pwm`.
    pub fn open_at(
        root: &Path,
        chip: u32,
        channel: u32,
        frequency_hz: u32,
    ) -> Result<Self, SignalError> {
        let chip_dir = root.join(format!("pwmchip{chip}"));
        let channel_dir = chip_dir.join(format!("pwm{channel}"));
        let period_ns = 1_000_000_000 / u64::from(frequency_hz.max(1));

        if !channel_dir.exists() {
            let export = chip_dir.join("export");
            fs::write(&export, channel.to_string()).map_err(|source| {
                SignalError::Unavailable {
                    path: export.clone(),
                    source,
                }
            })?;

            // udev fixes up permissions on the new directory asynchronously.
            for _ in 0..20 {
                if channel_dir.exists() {
                    break;
                }
                thread::sleep(Duration::from_millis(50));
            }
        }

        let pwm = Self {
            chip_dir,
            channel_dir,
            channel,
            period_ns,
            released: AtomicBool::new(false),
        };

        // duty_cycle must never exceed period, so clear it first.
        pwm.write_attr("duty_cycle", "0")
            .map_err(|e| pwm.unavailable(e))?;
        pwm.write_attr("period", &period_ns.to_string())
            .map_err(|e| pwm.unavailable(e))?;
        pwm.write_attr("enable", "1")
            .map_err(|e| pwm.unavailable(e))?;

        Ok(pwm)
    }

    fn duty_for(&self, level: u8) -> u64 {
        self.period_ns * u64::from(level.min(100)) / 100
    }

    fn write_attr(&self, attr: &str, value: &str) -> Result<(), SignalError> {
        let path = self.channel_dir.join(attr);
        fs::write(&path, value).map_err(|source| SignalError::Write { path, source })
    }

    fn unavailable(&self, err: SignalError) -> SignalError {
        match err {
            SignalError::Write { path, source } => SignalError::Unavailable { path, source },
            other => other,
        }
    }
}

impl Illumination for SysfsPwm {
    fn set_level(&self, level: u8) -> Result<(), SignalError> {
        self.write_attr("duty_cycle", &self.duty_for(level).to_string())
    }

    fn release(&self) -> Result<(), SignalError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.write_attr("duty_cycle", "0")?;
        self.write_attr("enable", "0")?;
        let unexport = self.chip_dir.join("unexport");
        fs::write(&unexport, self.channel.to_string()).map_err(|source| SignalError::Write {
            path: unexport,
            source,
        })
    }
}

impl Drop for SysfsPwm {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            debug!("Could not release pwm{}: {e}", self.channel);
        }
    }
}

/// An output for hosts without a light; levels only show up in trace logs.
#[derive(Clone, Debug, Default)]
pub struct NullOutput;

impl Illumination for NullOutput {
    fn set_level(&self, level: u8) -> Result<(), SignalError> {
        trace!("light level {level}");
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn fake_chip(root: &Path, exported: bool) {
        let chip = root.join("pwmchip0");
        fs::create_dir_all(&chip).unwrap();
        if exported {
            fs::create_dir_all(chip.join("pwm0")).unwrap();
        }
    }

    #[test]
    fn open_configures_period_and_enables_channel() {
        let root = tempfile::tempdir().unwrap();
        fake_chip(root.path(), true);

        let pwm = SysfsPwm::open_at(root.path(), 0, 0, 100).unwrap();
        let channel = root.path().join("pwmchip0/pwm0");

        assert_eq!(fs::read_to_string(channel.join("period")).unwrap(), "10000000");
        assert_eq!(fs::read_to_string(channel.join("enable")).unwrap(), "1");

        pwm.set_level(50).unwrap();
        assert_eq!(fs::read_to_string(channel.join("duty_cycle")).unwrap(), "5000000");

        pwm.set_level(250).unwrap();
        assert_eq!(fs::read_to_string(channel.join("duty_cycle")).unwrap(), "10000000");
    }

    #[test]
    fn release_disables_and_unexports() {
        let root = tempfile::tempdir().unwrap();
        fake_chip(root.path(), true);

        let pwm = SysfsPwm::open_at(root.path(), 0, 0, 100).unwrap();
        pwm.set_level(100).unwrap();
        pwm.release().unwrap();

        let chip = root.path().join("pwmchip0");
        assert_eq!(fs::read_to_string(chip.join("pwm0/duty_cycle")).unwrap(), "0");
        assert_eq!(fs::read_to_string(chip.join("pwm0/enable")).unwrap(), "0");
        assert_eq!(fs::read_to_string(chip.join("unexport")).unwrap(), "0");
    }

    #[test]
    fn dropping_an_open_channel_releases_it() {
        let root = tempfile::tempdir().unwrap();
        fake_chip(root.path(), true);

        let pwm = SysfsPwm::open_at(root.path(), 0, 0, 100).unwrap();
        pwm.set_level(80).unwrap();
        drop(pwm);

        let chip = root.path().join("pwmchip0");
        assert_eq!(fs::read_to_string(chip.join("pwm0/enable")).unwrap(), "0");
        assert_eq!(fs::read_to_string(chip.join("unexport")).unwrap(), "0");
    }

    #[test]
    fn released_channel_is_not_released_again_on_drop() {
        let root = tempfile::tempdir().unwrap();
        fake_chip(root.path(), true);

        let pwm = SysfsPwm::open_at(root.path(), 0, 0, 100).unwrap();
        pwm.release().unwrap();
        let unexport = root.path().join("pwmchip0/unexport");
        fs::remove_file(&unexport).unwrap();
        drop(pwm);

        assert!(!unexport.exists());
    }

    #[test]
    fn missing_chip_is_unavailable() {
        let root = tempfile::tempdir().unwrap();
        let err = SysfsPwm::open_at(root.path(), 3, 0, 100).unwrap_err();
        assert!(matches!(err, SignalError::Unavailable { .. }));
    }
}
