//! Watches for USB disks being plugged in and starts a run for each one.
//!
//! Events come from `udevadm monitor`, filtered to block/disk. A run is
//! handed to a single-slot [`Dispatcher`]: if a run is already going the new
//! arrival is dropped with a warning. Nothing is queued.

use crate::provision::{Provisioner, RunOutcome};
use crate::run_state::RunState;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::mem;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One udev event with its property block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UdevEvent {
    pub action: String,
    pub properties: HashMap<String, String>,
}

impl UdevEvent {
    fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn bus(&self) -> Option<&str> {
        self.property("ID_BUS")
    }

    pub fn devnode(&self) -> Option<&str> {
        self.property("DEVNAME")
    }

    pub fn devtype(&self) -> Option<&str> {
        self.property("DEVTYPE")
    }

    /// An `add` of a whole disk on the USB bus.
    pub fn is_usb_disk_arrival(&self) -> bool {
        self.action == "add"
            && self.bus() == Some("usb")
            && self.devtype().is_none_or(|t| t == "disk")
    }
}

/// Splits `udevadm monitor --property` output into events.
///
/// Each event is a header line followed by `KEY=VALUE` lines and ends with a
/// blank line.
#[derive(Debug, Default)]
pub struct UdevEventParser {
    properties: HashMap<String, String>,
}

impl UdevEventParser {
    /// Feeds one line; returns an event when `line` completes one.
    pub fn push_line(&mut self, line: &str) -> Option<UdevEvent> {
        let line = line.trim_end();
        if line.is_empty() {
            return self.finish();
        }
        if let Some((key, value)) = line.split_once('=') {
            if !key.is_empty() && !key.contains(char::is_whitespace) {
                self.properties.insert(key.to_string(), value.to_string());
            }
        }
        None
    }

    /// Flushes a final event that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<UdevEvent> {
        let properties = mem::take(&mut self.properties);
        let action = properties.get("ACTION")?.clone();
        Some(UdevEvent { action, properties })
    }
}

/// A stream of device events.
#[async_trait]
pub trait EventSource: Send {
    /// The next event, or `None` once the stream has ended.
    async fn next_event(&mut self) -> io::Result<Option<UdevEvent>>;
}

/// Events from a `udevadm monitor` child process.
pub struct UdevadmMonitor {
    _child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    parser: UdevEventParser,
}

impl UdevadmMonitor {
    pub fn spawn() -> io::Result<Self> {
        let mut child = Command::new("udevadm")
            .args([
                "monitor",
                "--udev",
                "--property",
                "--subsystem-match=block/disk",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("udevadm stdout was not captured"))?;

        Ok(Self {
            _child: child,
            lines: BufReader::new(stdout).lines(),
            parser: UdevEventParser::default(),
        })
    }
}

#[async_trait]
impl EventSource for UdevadmMonitor {
    async fn next_event(&mut self) -> io::Result<Option<UdevEvent>> {
        while let Some(line) = self.lines.next_line().await? {
            if let Some(event) = self.parser.push_line(&line) {
                return Ok(Some(event));
            }
        }
        Ok(self.parser.finish())
    }
}

/// Result of offering a run to the [`Dispatcher`].
#[derive(Debug)]
pub enum Dispatch {
    Started(JoinHandle<RunOutcome>),
    /// A run was already in progress.
    Rejected,
}

/// Starts provisioning runs, at most one at a time.
#[derive(Clone)]
pub struct Dispatcher {
    provisioner: Arc<Provisioner>,
    state: Arc<RunState>,
}

impl Dispatcher {
    pub fn new(provisioner: Arc<Provisioner>, state: Arc<RunState>) -> Self {
        Self { provisioner, state }
    }

    /// Spawns a run unless one is already active.
    ///
    /// The run state is held until the run has finished, including the
    /// failure signal shown when the run panics.
    pub fn try_dispatch(&self) -> Dispatch {
        let Some(ticket) = self.state.try_begin() else {
            return Dispatch::Rejected;
        };

        let provisioner = self.provisioner.clone();
        Dispatch::Started(tokio::spawn(async move {
            let run = tokio::spawn({
                let provisioner = provisioner.clone();
                async move { provisioner.run().await }
            });

            let outcome = match run.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Provisioning run crashed: {e}");
                    provisioner.signal_failure().await;
                    provisioner.signal().halt().await;
                    RunOutcome::Internal(format!("provisioning run crashed: {e}"))
                }
            };
            drop(ticket);
            outcome
        }))
    }

    /// Runs now and waits for the outcome. `None` if a run was already active.
    pub async fn run_now(&self) -> Option<RunOutcome> {
        match self.try_dispatch() {
            Dispatch::Started(handle) => Some(join(handle).await),
            Dispatch::Rejected => None,
        }
    }
}

async fn join(handle: JoinHandle<RunOutcome>) -> RunOutcome {
    handle.await.unwrap_or_else(|e| {
        error!("Provisioning task failed: {e}");
        RunOutcome::Internal(e.to_string())
    })
}

pub struct ArrivalMonitor {
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
}

impl ArrivalMonitor {
    pub fn new(dispatcher: Dispatcher, shutdown: CancellationToken) -> Self {
        Self {
            dispatcher,
            shutdown,
        }
    }

    /// Provisions any disk that is already attached, then subscribes to
    /// device events and watches them.
    ///
    /// `subscribe` is only called once the startup run has finished, so
    /// arrivals during that run are not replayed afterwards.
    pub async fn run<S, F>(&self, subscribe: F) -> io::Result<()>
    where
        S: EventSource,
        F: FnOnce() -> io::Result<S>,
    {
        info!("Checking for already connected USB devices...");
        self.dispatcher.run_now().await;

        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        let mut source = subscribe()?;
        self.watch(&mut source).await
    }

    /// Dispatches a run for each USB disk arrival until `source` ends or
    /// shutdown is requested. A run still in flight is awaited before returning.
    ///
    /// The source ending without a shutdown request is an error, since no
    /// further disks would be provisioned.
    pub async fn watch(&self, source: &mut dyn EventSource) -> io::Result<()> {
        info!("Starting udev monitor for USB devices...");
        let mut in_flight: Option<JoinHandle<RunOutcome>> = None;

        let result = loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested, stopping monitor");
                    break Ok(());
                }
                event = source.next_event() => event,
            };

            let event = match event {
                Ok(Some(event)) => event,
                Ok(None) if self.shutdown.is_cancelled() => break Ok(()),
                Ok(None) => {
                    error!("Device event stream ended unexpectedly");
                    break Err(io::Error::other("device event stream ended"));
                }
                Err(e) => break Err(e),
            };

            if !event.is_usb_disk_arrival() {
                debug!(
                    "Ignoring {} event for {}",
                    event.action,
                    event.devnode().unwrap_or("?")
                );
                continue;
            }

            let node = event.devnode().unwrap_or("unknown device");
            info!("USB storage device added: {node}");
            match self.dispatcher.try_dispatch() {
                Dispatch::Started(handle) => in_flight = Some(handle),
                Dispatch::Rejected => warn!("Already writing to a USB device, ignoring {node}"),
            }
        };

        if let Some(handle) = in_flight {
            if !handle.is_finished() {
                info!("Waiting for the current provisioning run to finish");
            }
            join(handle).await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::tests::{Harness, harness};
    use crate::runner::CommandOutput;
    use tokio::sync::mpsc;

    struct ChannelSource(mpsc::UnboundedReceiver<UdevEvent>);

    #[async_trait]
    impl EventSource for ChannelSource {
        async fn next_event(&mut self) -> io::Result<Option<UdevEvent>> {
            Ok(self.0.recv().await)
        }
    }

    fn channel() -> (mpsc::UnboundedSender<UdevEvent>, ChannelSource) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, ChannelSource(rx))
    }

    fn event(action: &str, bus: &str) -> UdevEvent {
        let mut properties = HashMap::new();
        properties.insert("ACTION".to_string(), action.to_string());
        properties.insert("ID_BUS".to_string(), bus.to_string());
        properties.insert("DEVNAME".to_string(), "/dev/sdb".to_string());
        properties.insert("DEVTYPE".to_string(), "disk".to_string());
        UdevEvent {
            action: action.to_string(),
            properties,
        }
    }

    fn monitor(h: &Harness) -> (ArrivalMonitor, CancellationToken) {
        let shutdown = CancellationToken::new();
        let dispatcher = Dispatcher::new(h.provisioner.clone(), h.state.clone());
        (ArrivalMonitor::new(dispatcher, shutdown.clone()), shutdown)
    }

    fn no_usb_disks(h: &Harness) {
        h.runner.push(
            "lsblk",
            CommandOutput::ok_with_stdout(
                r#"{"blockdevices":[{"name":"sda","type":"disk","tran":"sata"}]}"#,
            ),
        );
    }

    const UDEVADM_OUTPUT: &str = "\
monitor will print the received events for:
UDEV - the event which udev sends out after rule processing

UDEV  [4162.384741] add      /devices/platform/scb/usb1/1-1/1-1.3/host0/target0:0:0/0:0:0:0/block/sdb (block)
ACTION=add
DEVPATH=/devices/platform/scb/usb1/1-1/1-1.3/host0/target0:0:0/0:0:0:0/block/sdb
SUBSYSTEM=block
DEVNAME=/dev/sdb
DEVTYPE=disk
ID_BUS=usb
ID_MODEL=Cruzer_Blade

UDEV  [4170.001122] remove   /devices/platform/scb/usb1/1-1/1-1.3/host0/target0:0:0/0:0:0:0/block/sdb (block)
ACTION=remove
DEVNAME=/dev/sdb
DEVTYPE=disk
";

    #[test]
    fn parses_udevadm_property_blocks() {
        let mut parser = UdevEventParser::default();
        let mut events: Vec<UdevEvent> = UDEVADM_OUTPUT
            .lines()
            .filter_map(|line| parser.push_line(line))
            .collect();
        events.extend(parser.finish());

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, "add");
        assert_eq!(events[0].bus(), Some("usb"));
        assert_eq!(events[0].devnode(), Some("/dev/sdb"));
        assert_eq!(events[0].devtype(), Some("disk"));
        assert!(events[0].is_usb_disk_arrival());

        assert_eq!(events[1].action, "remove");
        assert_eq!(events[1].bus(), None);
        assert!(!events[1].is_usb_disk_arrival());
    }

    #[test]
    fn only_usb_disk_additions_qualify() {
        assert!(event("add", "usb").is_usb_disk_arrival());
        assert!(!event("add", "ata").is_usb_disk_arrival());
        assert!(!event("change", "usb").is_usb_disk_arrival());

        let mut partition = event("add", "usb");
        partition
            .properties
            .insert("DEVTYPE".to_string(), "partition".to_string());
        assert!(!partition.is_usb_disk_arrival());
    }

    #[tokio::test(start_paused = true)]
    async fn arrival_while_running_is_dropped() {
        let h = harness(|_| {});
        let (monitor, _) = monitor(&h);
        let _busy = h.state.try_begin().unwrap();

        let (tx, mut source) = channel();
        tx.send(event("add", "usb")).unwrap();
        drop(tx);
        monitor.watch(&mut source).await.unwrap_err();

        assert!(h.runner.calls().is_empty());
        assert!(h.light.levels().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn arrival_starts_a_run_that_is_awaited() {
        let h = harness(|_| {});
        no_usb_disks(&h);
        let (monitor, _) = monitor(&h);

        let (tx, mut source) = channel();
        tx.send(event("add", "ata")).unwrap();
        tx.send(event("add", "usb")).unwrap();
        drop(tx);
        monitor.watch(&mut source).await.unwrap_err();

        assert_eq!(h.runner.programs(), vec!["lsblk"]);
        assert!(!h.state.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn startup_attempt_happens_before_subscribing() {
        let h = harness(|_| {});
        no_usb_disks(&h);
        let (monitor, _) = monitor(&h);

        let (tx, source) = channel();
        drop(tx);
        let runner = h.runner.clone();
        monitor
            .run(move || {
                assert_eq!(runner.count("lsblk"), 1);
                Ok(source)
            })
            .await
            .unwrap_err();

        assert_eq!(h.runner.count("lsblk"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_startup_skips_subscribing() {
        let h = harness(|_| {});
        no_usb_disks(&h);
        let (monitor, shutdown) = monitor(&h);
        shutdown.cancel();

        let result = monitor
            .run(|| -> io::Result<ChannelSource> { panic!("should not subscribe") })
            .await;

        assert!(result.is_ok());
        assert_eq!(h.runner.count("lsblk"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_loop() {
        let h = harness(|_| {});
        let (monitor, shutdown) = monitor(&h);

        let (_tx, mut source) = channel();
        let watching = tokio::spawn(async move { monitor.watch(&mut source).await });
        shutdown.cancel();

        assert!(watching.await.unwrap().is_ok());
        assert!(h.runner.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn source_ending_without_shutdown_is_an_error() {
        let h = harness(|_| {});
        let (monitor, _) = monitor(&h);

        let (tx, mut source) = channel();
        drop(tx);
        let err = monitor.watch(&mut source).await.unwrap_err();

        assert!(err.to_string().contains("event stream ended"));
    }

    #[tokio::test(start_paused = true)]
    async fn source_ending_after_shutdown_is_clean() {
        let h = harness(|_| {});
        let (monitor, shutdown) = monitor(&h);
        shutdown.cancel();

        let (tx, mut source) = channel();
        drop(tx);

        assert!(monitor.watch(&mut source).await.is_ok());
        assert!(h.runner.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_run_shows_failure_and_clears_state() {
        let h = harness(|_| {});
        h.runner.panic_on("lsblk");
        let dispatcher = Dispatcher::new(h.provisioner.clone(), h.state.clone());

        let outcome = dispatcher.run_now().await.unwrap();

        assert!(matches!(outcome, RunOutcome::Internal(_)));
        assert_eq!(h.light.last(), Some(100));
        assert!(!h.state.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn second_dispatch_is_rejected_while_first_runs() {
        let h = harness(|_| {});
        no_usb_disks(&h);
        let dispatcher = Dispatcher::new(h.provisioner.clone(), h.state.clone());

        let Dispatch::Started(first) = dispatcher.try_dispatch() else {
            panic!("first dispatch should start");
        };
        assert!(matches!(dispatcher.try_dispatch(), Dispatch::Rejected));

        assert_eq!(first.await.unwrap(), RunOutcome::NoDevice);
        assert!(matches!(dispatcher.try_dispatch(), Dispatch::Started(_)));
    }
}
