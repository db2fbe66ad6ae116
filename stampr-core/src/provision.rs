//! One provisioning run, from finding the disk to signaling the outcome.
//!
//! The stages run strictly in order and each reports a plain success flag:
//!
//! 1. discover the candidate disk
//! 2. unmount whatever the desktop auto-mounted
//! 3. copy the image over the whole device and `sync`
//! 4. optionally grow the target partition, then its filesystem
//! 5. log a `df` report of the grown partition
//!
//! A failed write ends the run before any expansion is attempted. The status
//! light is switched at each stage and shows the outcome once the run ends.

use crate::Device;
use crate::config::Config;
use crate::discovery::Discovery;
use crate::error::DiscoveryError;
use crate::filesystem::FilesystemExpander;
use crate::partition::{PartitionExpander, select_target};
use crate::platform;
use crate::runner::{CommandRunner, CommandSpec, invoke};
use crate::signal::{Pattern, StatusSignal};
use crate::write::ImageWriter;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info, warn};

const PARTITION_SETTLE: Duration = Duration::from_secs(2);

/// How a provisioning run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// No qualifying disk was attached. Nothing was touched.
    NoDevice,
    Succeeded,
    /// The copy tool failed; the device contents are undefined.
    WriteFailed,
    /// The image was written but could not be grown to fill the device.
    ExpansionFailed,
    /// The run stopped before writing.
    Aborted(String),
    /// Something unexpected went wrong, including a panic in the run task.
    Internal(String),
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::NoDevice => write!(f, "no suitable USB device found"),
            RunOutcome::Succeeded => write!(f, "succeeded"),
            RunOutcome::WriteFailed => write!(f, "image write failed"),
            RunOutcome::ExpansionFailed => write!(f, "image written, expansion failed"),
            RunOutcome::Aborted(reason) => write!(f, "aborted before writing: {reason}"),
            RunOutcome::Internal(reason) => write!(f, "internal error: {reason}"),
        }
    }
}

/// Runs the provisioning pipeline. Shared by the arrival monitor and the
/// one-shot CLI command.
pub struct Provisioner {
    config: Config,
    runner: Arc<dyn CommandRunner>,
    signal: StatusSignal,
    discovery: Discovery,
    writer: ImageWriter,
    partitions: PartitionExpander,
    filesystems: FilesystemExpander,
}

impl Provisioner {
    pub fn new(
        config: Config,
        runner: Arc<dyn CommandRunner>,
        signal: StatusSignal,
        discovery: Discovery,
    ) -> Self {
        Self {
            writer: ImageWriter::new(runner.clone()),
            partitions: PartitionExpander::new(runner.clone()),
            filesystems: FilesystemExpander::new(runner.clone(), &config.expand.xfs_mount_dir),
            config,
            runner,
            signal,
            discovery,
        }
    }

    pub fn signal(&self) -> &StatusSignal {
        &self.signal
    }

    /// Performs one complete run and shows its outcome on the light.
    ///
    /// The light has stopped animating by the time this returns. Callers
    /// serialize runs through [`crate::monitor::Dispatcher`].
    pub async fn run(&self) -> RunOutcome {
        info!("USB device detected, searching for device...");
        let outcome = self.provision().await;

        match &outcome {
            RunOutcome::Succeeded => info!("Provisioning {outcome}"),
            RunOutcome::NoDevice => warn!("Provisioning skipped: {outcome}"),
            _ => error!("Provisioning failed: {outcome}"),
        }
        self.show_outcome(&outcome).await;
        self.signal.halt().await;
        outcome
    }

    /// Shows the failure signal: an error burst, then the light held on.
    pub async fn signal_failure(&self) {
        self.signal.play(Pattern::FAILURE_BURST).await;
        self.signal.set(Pattern::Solid(100)).await;
    }

    async fn show_outcome(&self, outcome: &RunOutcome) {
        match outcome {
            RunOutcome::Succeeded => {
                self.signal.set(Pattern::Solid(100)).await;
                self.signal.play(Pattern::FlashN(3)).await;
                time::sleep(self.config.timing.success_hold()).await;
                self.signal.set(Pattern::Off).await;
            }
            RunOutcome::NoDevice => self.signal.play(Pattern::NO_DEVICE).await,
            _ => self.signal_failure().await,
        }
    }

    async fn provision(&self) -> RunOutcome {
        let device = match self.discovery.find_candidate().await {
            Ok(Some(device)) => device,
            Ok(None) => return RunOutcome::NoDevice,
            Err(e @ DiscoveryError::Ambiguous(_)) => {
                error!("{e}");
                return RunOutcome::NoDevice;
            }
            Err(e) => return RunOutcome::Internal(format!("device discovery: {e}")),
        };

        info!("Found USB device: {device}");
        warn!(
            "WARNING: All data on {} will be destroyed!",
            device.path.display()
        );
        if self.config.expand.enabled {
            warn!("Image will be written and filesystem expanded automatically.");
        }
        time::sleep(self.config.safety.write_delay()).await;

        if !self.unmount(&device.path).await && self.config.safety.abort_on_unmount_failure {
            return RunOutcome::Aborted(format!(
                "could not unmount all partitions of {}",
                device.path.display()
            ));
        }

        if let Err(e) = self
            .writer
            .check_capacity(&self.config.image_path, &device.path)
        {
            return RunOutcome::Aborted(e.to_string());
        }

        info!(
            "Writing image {} to {}",
            self.config.image_path.display(),
            device.path.display()
        );
        self.signal.set(Pattern::Breathing).await;
        if !self.writer.write(&self.config.image_path, &device.path).await {
            return RunOutcome::WriteFailed;
        }

        if !self.config.expand.enabled {
            info!("Filesystem expansion disabled in configuration");
            return RunOutcome::Succeeded;
        }

        self.signal.set(Pattern::Solid(50)).await;
        if self.expand(&device).await {
            RunOutcome::Succeeded
        } else {
            RunOutcome::ExpansionFailed
        }
    }

    /// Unmounts every mounted node of `device`. Returns `false` if any of
    /// them stayed mounted.
    async fn unmount(&self, device: &Path) -> bool {
        let nodes = match self.discovery.mounted_nodes(device).await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!("Could not list mounts of {}: {e}", device.display());
                return false;
            }
        };

        let mut all_unmounted = true;
        for node in nodes {
            info!("Unmounting {}", node.display());
            let spec = CommandSpec::new("umount").arg(node.to_string_lossy());
            let output = invoke(self.runner.as_ref(), &spec).await;
            if !output.success() {
                warn!("Could not unmount {}: {}", node.display(), output.error_text());
                all_unmounted = false;
            }
        }
        all_unmounted
    }

    async fn expand(&self, device: &Device) -> bool {
        info!("Starting filesystem expansion process");
        time::sleep(self.config.timing.expand_settle()).await;

        // Auto-mounters pick up the freshly written partitions.
        self.unmount(&device.path).await;

        let partitions = self.partitions.list(&device.path).await;
        let Some(number) = select_target(self.config.expand.partition, &partitions) else {
            error!("No partitions found to expand");
            return false;
        };
        if number != self.config.expand.partition {
            warn!(
                "Partition {} does not exist, expanding last partition {number} instead",
                self.config.expand.partition
            );
        }

        let partition = platform::partition_path(&device.path, number);
        info!("Target partition for expansion: {}", partition.display());

        if !self.partitions.expand(&device.path, number).await {
            error!("Failed to expand partition");
            return false;
        }
        time::sleep(PARTITION_SETTLE).await;

        if !self.filesystems.expand(&partition).await {
            error!("Failed to expand filesystem");
            return false;
        }

        self.report_capacity(&partition).await;
        info!("Filesystem expansion completed successfully");
        true
    }

    async fn report_capacity(&self, partition: &Path) {
        let spec = CommandSpec::new("df")
            .arg("-h")
            .arg(partition.to_string_lossy());
        let output = invoke(self.runner.as_ref(), &spec).await;
        if output.success() {
            info!("Final filesystem size:\n{}", output.stdout.trim_end());
        } else {
            warn!("df {} failed: {}", partition.display(), output.error_text());
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::AmbiguityPolicy;
    use crate::discovery::HardwareInfo;
    use crate::monitor::Dispatcher;
    use crate::run_state::RunState;
    use crate::runner::CommandOutput;
    use crate::runner::fake::FakeRunner;
    use crate::signal::RecordingLight;
    use tempfile::NamedTempFile;

    pub(crate) struct NoVendors;

    impl HardwareInfo for NoVendors {
        fn vendor(&self, _: &str) -> Option<String> {
            None
        }
    }

    pub(crate) const ONE_USB_DISK: &str = r#"{"blockdevices":[
        {"name":"sda","type":"disk","size":"931.5G","tran":"sata"},
        {"name":"sdb","type":"disk","size":"14.9G","tran":"usb",
         "children":[{"name":"sdb1","type":"part","mountpoint":"/media/pi/boot"}]}]}"#;

    const FDISK_LIST: &str = "\
Device     Boot  Start      End  Sectors  Size Id Type
/dev/sdb1  *      8192   532479   524288  256M  c W95 FAT32 (LBA)
/dev/sdb2       532480 11468799 10936320  5.2G 83 Linux
";

    pub(crate) struct Harness {
        pub(crate) provisioner: Arc<Provisioner>,
        pub(crate) runner: Arc<FakeRunner>,
        pub(crate) light: Arc<RecordingLight>,
        pub(crate) state: Arc<RunState>,
        _image: NamedTempFile,
    }

    pub(crate) fn harness(configure: impl FnOnce(&mut Config)) -> Harness {
        let image = NamedTempFile::new().unwrap();
        let mut config = Config {
            image_path: image.path().to_path_buf(),
            ..Config::default()
        };
        configure(&mut config);

        let runner = Arc::new(FakeRunner::new());
        let light = Arc::new(RecordingLight::default());
        let signal = StatusSignal::new(light.clone());
        let discovery = Discovery::new(
            runner.clone(),
            Arc::new(NoVendors),
            config.safety.ambiguous_candidates,
        );

        Harness {
            provisioner: Arc::new(Provisioner::new(config, runner.clone(), signal, discovery)),
            runner,
            light,
            state: RunState::new(),
            _image: image,
        }
    }

    impl Harness {
        /// Scripts the discovery listing plus the mount listings taken
        /// before writing and before expanding.
        pub(crate) fn with_usb_disk(self) -> Self {
            self.runner
                .push("lsblk", CommandOutput::ok_with_stdout(ONE_USB_DISK));
            for _ in 0..2 {
                self.runner.push(
                    "lsblk",
                    CommandOutput::ok_with_stdout(
                        r#"{"blockdevices":[{"name":"sdb","type":"disk","tran":"usb",
                           "children":[{"name":"sdb1","type":"part","mountpoint":"/media/pi/boot"}]}]}"#,
                    ),
                );
            }
            self
        }

        pub(crate) async fn run(&self) -> RunOutcome {
            Dispatcher::new(self.provisioner.clone(), self.state.clone())
                .run_now()
                .await
                .unwrap()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_run_writes_then_expands() {
        let h = harness(|_| {}).with_usb_disk();
        h.runner.push("fdisk", CommandOutput::ok_with_stdout(FDISK_LIST));
        h.runner.push("blkid", CommandOutput::ok_with_stdout("ext4\n"));

        let outcome = h.run().await;

        assert_eq!(outcome, RunOutcome::Succeeded);
        assert!(!h.state.is_active());
        assert_eq!(
            h.runner.programs(),
            vec![
                "lsblk", "lsblk", "umount", "bash", "sync", "lsblk", "umount", "fdisk",
                "parted", "parted", "partprobe", "blkid", "e2fsck", "resize2fs", "df",
            ]
        );
        assert_eq!(h.runner.calls()[2].args, vec!["/dev/sdb1"]);
        assert_eq!(
            h.runner.calls()[9].args,
            vec!["-s", "/dev/sdb", "resizepart", "2", "100%"]
        );
        assert_eq!(h.runner.calls()[11].args.last().unwrap(), "/dev/sdb2");
        assert_eq!(h.light.last(), Some(0));
        assert!(h.light.levels().contains(&50));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_never_expands() {
        let h = harness(|_| {}).with_usb_disk();
        h.runner.fail("bash", 1);

        let outcome = h.run().await;

        assert_eq!(outcome, RunOutcome::WriteFailed);
        assert_eq!(h.runner.count("parted"), 0);
        assert_eq!(h.runner.count("fdisk"), 0);
        assert_eq!(h.runner.count("blkid"), 0);
        assert_eq!(h.runner.count("sync"), 0);
        assert_eq!(h.light.last(), Some(100));
        assert!(!h.state.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn expansion_can_be_disabled() {
        let h = harness(|c| c.expand.enabled = false).with_usb_disk();

        assert_eq!(h.run().await, RunOutcome::Succeeded);
        assert_eq!(h.runner.programs(), vec!["lsblk", "lsblk", "umount", "bash", "sync"]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_configured_partition_targets_the_last_one() {
        let h = harness(|c| c.expand.partition = 5).with_usb_disk();
        h.runner.push("fdisk", CommandOutput::ok_with_stdout(FDISK_LIST));

        h.run().await;

        let resize = h.runner.position("parted", &["-s", "/dev/sdb", "resizepart"]).unwrap();
        assert_eq!(h.runner.calls()[resize].args[3], "2");
    }

    #[tokio::test(start_paused = true)]
    async fn no_partitions_is_an_expansion_failure() {
        let h = harness(|_| {}).with_usb_disk();

        assert_eq!(h.run().await, RunOutcome::ExpansionFailed);
        assert_eq!(h.runner.count("parted"), 0);
        assert_eq!(h.light.last(), Some(100));
    }

    #[tokio::test(start_paused = true)]
    async fn filesystem_failure_is_an_expansion_failure() {
        let h = harness(|_| {}).with_usb_disk();
        h.runner.push("fdisk", CommandOutput::ok_with_stdout(FDISK_LIST));
        h.runner.push("blkid", CommandOutput::ok_with_stdout("ext4\n"));
        h.runner.fail("resize2fs", 1);

        assert_eq!(h.run().await, RunOutcome::ExpansionFailed);
        assert_eq!(h.runner.count("df"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unmount_failure_is_tolerated_by_default() {
        let h = harness(|c| c.expand.enabled = false).with_usb_disk();
        h.runner.fail("umount", 32);

        assert_eq!(h.run().await, RunOutcome::Succeeded);
        assert_eq!(h.runner.count("bash"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unmount_failure_can_abort_the_run() {
        let h = harness(|c| c.safety.abort_on_unmount_failure = true).with_usb_disk();
        h.runner.fail("umount", 32);

        let outcome = h.run().await;

        assert!(matches!(outcome, RunOutcome::Aborted(_)));
        assert_eq!(h.runner.count("bash"), 0);
        assert_eq!(h.runner.count("dd"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn no_device_blinks_and_touches_nothing() {
        let h = harness(|_| {});
        h.runner.push(
            "lsblk",
            CommandOutput::ok_with_stdout(r#"{"blockdevices":[{"name":"sda","type":"disk","tran":"sata"}]}"#),
        );

        assert_eq!(h.run().await, RunOutcome::NoDevice);
        assert_eq!(h.runner.programs(), vec!["lsblk"]);
        assert_eq!(h.light.levels(), vec![100, 0, 100, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_ambiguity_is_treated_as_no_device() {
        let h = harness(|c| c.safety.ambiguous_candidates = AmbiguityPolicy::Refuse);
        h.runner.push(
            "lsblk",
            CommandOutput::ok_with_stdout(
                r#"{"blockdevices":[
                    {"name":"sdb","type":"disk","tran":"usb"},
                    {"name":"sdc","type":"disk","tran":"usb"}]}"#,
            ),
        );

        assert_eq!(h.run().await, RunOutcome::NoDevice);
        assert_eq!(h.runner.count("bash"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn broken_lsblk_is_an_internal_error() {
        let h = harness(|_| {});
        h.runner.push("lsblk", CommandOutput::ok_with_stdout("not json"));

        let outcome = h.run().await;
        assert!(matches!(outcome, RunOutcome::Internal(_)));
        assert!(!outcome.is_success());
        assert!(!h.state.is_active());
    }
}
