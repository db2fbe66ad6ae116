//! Contains the logic for writing an image file to a device.
//!
//! The copy itself is delegated to `dd`. When `pv` is installed it reads the
//! image instead, so the log shows throughput and an ETA; otherwise `dd`
//! reports its own progress. Either way the copy tool's output is streamed
//! into the log while it runs, and the write ends with a `sync`.
use crate::error::WriteError;
use crate::platform;
use crate::runner::{CommandRunner, CommandSpec, invoke};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

const BLOCK_SIZE: &str = "4M";

/// Shell pipeline used when `pv` is present. `$1` is the image, `$2` the device.
///
/// `pv` stays silent when stderr is not a terminal unless forced with `-f`.
const PV_PIPELINE: &str = r#"pv -f "$1" | dd of="$2" bs=4M conv=fsync"#;

/// Prefix of the copy tool's lines in the log.
const LOG_LABEL: &str = "Write";

/// Refuses an image that cannot fit on the device.
pub fn ensure_fits(image_len: u64, device_len: u64) -> Result<(), WriteError> {
    if image_len > device_len {
        return Err(WriteError::TooLarge {
            image: image_len,
            device: device_len,
        });
    }
    Ok(())
}

pub struct ImageWriter {
    runner: Arc<dyn CommandRunner>,
}

impl ImageWriter {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Compares the image size with the device capacity.
    ///
    /// A device whose size cannot be read is let through with a warning; the
    /// copy will fail on its own if the image really does not fit.
    pub fn check_capacity(&self, image: &Path, device: &Path) -> Result<(), WriteError> {
        let image_len = std::fs::metadata(image)
            .map_err(|source| WriteError::Image {
                path: image.to_path_buf(),
                source,
            })?
            .len();

        match platform::device_size_bytes(device) {
            Ok(device_len) => {
                info!(
                    "Image is {image_len} bytes, {} holds {device_len} bytes",
                    device.display()
                );
                ensure_fits(image_len, device_len)
            }
            Err(e) => {
                warn!("Could not read size of {}: {e}", device.display());
                Ok(())
            }
        }
    }

    /// The copy invocation for this host.
    pub fn copy_command(&self, image: &Path, device: &Path) -> CommandSpec {
        let image = image.to_string_lossy().into_owned();
        let device = device.to_string_lossy().into_owned();

        if self.runner.locate("pv") && self.runner.locate("bash") {
            CommandSpec::new("bash")
                .args(["-o", "pipefail", "-c", PV_PIPELINE, "stampr"])
                .args([image, device])
                .streamed_as(LOG_LABEL)
        } else {
            CommandSpec::new("dd")
                .args([
                    format!("if={image}"),
                    format!("of={device}"),
                    format!("bs={BLOCK_SIZE}"),
                    "status=progress".to_string(),
                    "conv=fsync".to_string(),
                ])
                .streamed_as(LOG_LABEL)
        }
    }

    /// Writes `image` over the whole of `device`, then flushes caches.
    ///
    /// Returns `false` if the copy exits non-zero. A failed `sync` is only
    /// logged since `conv=fsync` has already flushed the device.
    pub async fn write(&self, image: &Path, device: &Path) -> bool {
        let copy = self.copy_command(image, device);
        info!("Executing: {copy}");

        let output = invoke(self.runner.as_ref(), &copy).await;
        if !output.success() {
            error!(
                "Write failed with exit code {:?}: {}",
                output.code,
                output.error_text()
            );
            return false;
        }

        info!("Syncing filesystem");
        let sync = invoke(self.runner.as_ref(), &CommandSpec::new("sync")).await;
        if !sync.success() {
            warn!("sync failed: {}", sync.error_text());
        }
        info!("Image written successfully");
        true
    }
}
