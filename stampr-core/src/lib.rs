//! The core library for the `stampr` USB duplicator.
//!
//! `stampr-core` turns a Linux board with a status LED into an unattended
//! image duplicator: plug in a USB disk, and it gets the configured image
//! written to it and grown to fill the device. The `stampr` binary is a thin
//! daemon around this crate.
//!
//! The library is structured into several key modules:
//! - [`runner`]: the [`runner::CommandRunner`] seam through which every
//!   external tool (`lsblk`, `dd`, `parted`, ...) is invoked.
//! - [`discovery`]: finds the USB disk to provision.
//! - [`mod@write`]: copies the image onto the device.
//! - [`partition`] and [`filesystem`]: grow the target partition and then
//!   its filesystem.
//! - [`provision`]: the pipeline that ties the stages together.
//! - [`monitor`]: listens for disks being plugged in and starts runs, one
//!   at a time.
//! - [`signal`]: drives the status light on its own task.
//! - [`platform`]: Linux specifics (sysfs, block-device ioctls).
//!
//! ## Example: provisioning whatever is plugged in right now
//!
//! ```rust,no_run
//! use stampr_core::config::Config;
//! use stampr_core::discovery::Discovery;
//! use stampr_core::monitor::Dispatcher;
//! use stampr_core::platform::SysfsHardware;
//! use stampr_core::provision::Provisioner;
//! use stampr_core::run_state::RunState;
//! use stampr_core::runner::SystemRunner;
//! use stampr_core::signal::{NullOutput, StatusSignal};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(None)?;
//!     let runner = Arc::new(SystemRunner::new());
//!     let signal = StatusSignal::new(Arc::new(NullOutput));
//!     let discovery = Discovery::new(
//!         runner.clone(),
//!         Arc::new(SysfsHardware),
//!         config.safety.ambiguous_candidates,
//!     );
//!
//!     let provisioner = Arc::new(Provisioner::new(config, runner, signal, discovery));
//!     let dispatcher = Dispatcher::new(provisioner, RunState::new());
//!
//!     if let Some(outcome) = dispatcher.run_now().await {
//!         println!("Run finished: {outcome}");
//!     }
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::path::PathBuf;

pub mod config;
pub mod discovery;
pub mod error;
pub mod filesystem;
pub mod monitor;
pub mod partition;
pub mod platform;
pub mod preflight;
pub mod provision;
pub mod run_state;
pub mod runner;
pub mod signal;
pub mod write;

/// A disk selected for provisioning.
///
/// Discovered fresh for every run and never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    /// The device node, e.g. `/dev/sdb`.
    pub path: PathBuf,
    /// The kernel name, e.g. `sdb`.
    pub name: String,
    /// Transport reported by lsblk (`usb`), if any.
    pub transport: Option<String>,
    /// Size as lsblk prints it. Only ever logged.
    pub size: String,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (Size: {}, transport: {})",
            self.path.display(),
            self.size,
            self.transport.as_deref().unwrap_or("unknown")
        )
    }
}
