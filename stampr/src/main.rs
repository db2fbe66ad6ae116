mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use stampr_core::config::Config;
use stampr_core::discovery::Discovery;
use stampr_core::monitor::{ArrivalMonitor, Dispatcher, UdevadmMonitor};
use stampr_core::platform::{self, SysfsHardware};
use stampr_core::preflight;
use stampr_core::provision::{Provisioner, RunOutcome};
use stampr_core::run_state::RunState;
use stampr_core::runner::{CommandRunner, SystemRunner};
use stampr_core::signal::{Illumination, NullOutput, StatusSignal, SysfsPwm};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "stampr")]
#[command(about = "An unattended USB duplicator", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file [default: /etc/stampr/stampr.toml]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Image file to write, overriding the configuration
    #[arg(short, long, global = true)]
    image: Option<PathBuf>,

    /// Write the image only; do not grow the partition or filesystem
    #[arg(long, global = true)]
    no_expand: bool,

    /// Partition to grow after writing
    #[arg(short, long, global = true)]
    partition: Option<u32>,

    /// Append logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Run without the status LED
    #[arg(long, global = true)]
    no_led: bool,
}

#[derive(Subcommand, Clone, Copy, Default)]
enum Commands {
    /// Provision every USB disk that is plugged in (default)
    #[default]
    Watch,
    /// Provision the USB disk that is attached now, then exit
    Once,
    /// List disks and show which one would be provisioned
    List,
}

impl Cli {
    fn config(&self) -> Result<Config> {
        let mut config = Config::load(self.config.as_deref())?;
        if let Some(image) = &self.image {
            config.image_path = image.clone();
        }
        if self.no_expand {
            config.expand.enabled = false;
        }
        if let Some(partition) = self.partition {
            config.expand.partition = partition;
        }
        if let Some(log_file) = &self.log_file {
            config.log_file = Some(log_file.clone());
        }
        if self.no_led {
            config.led.enabled = false;
        }
        config.validate()?;
        Ok(config)
    }
}

fn discovery(config: &Config, runner: Arc<dyn CommandRunner>) -> Discovery {
    let system_disk = if config.safety.exclude_system_disk {
        platform::system_disk_name()
    } else {
        None
    };
    Discovery::new(
        runner,
        Arc::new(SysfsHardware),
        config.safety.ambiguous_candidates,
    )
    .excluding(system_disk)
}

fn open_light(config: &Config) -> Result<Arc<dyn Illumination>> {
    if !config.led.enabled {
        info!("Status LED disabled");
        return Ok(Arc::new(NullOutput));
    }
    let led = &config.led;
    let pwm = SysfsPwm::open(led.chip, led.channel, led.frequency_hz).with_context(|| {
        format!(
            "Failed to set up the status LED on pwmchip{}/pwm{}",
            led.chip, led.channel
        )
    })?;
    Ok(Arc::new(pwm))
}

/// Runs the startup checks and assembles the pipeline.
fn prepare(config: Config) -> Result<(Dispatcher, StatusSignal)> {
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new());
    let signal = StatusSignal::new(open_light(&config)?);
    preflight::check_all(&config, runner.as_ref(), &signal)?;

    let discovery = discovery(&config, runner.clone());
    let provisioner = Provisioner::new(config, runner, signal.clone(), discovery);
    Ok((Dispatcher::new(Arc::new(provisioner), RunState::new()), signal))
}

async fn watch(config: Config) -> Result<ExitCode> {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    ctrlc::set_handler(move || {
        token.cancel();
    })?;

    let (dispatcher, signal) = prepare(config)?;
    let monitor = ArrivalMonitor::new(dispatcher, shutdown);
    let result = monitor.run(UdevadmMonitor::spawn).await;

    info!("Cleaning up...");
    signal.shutdown().await;
    result.context("Device monitor failed")?;
    Ok(ExitCode::SUCCESS)
}

async fn once(config: Config) -> Result<ExitCode> {
    let (dispatcher, signal) = prepare(config)?;
    let outcome = dispatcher.run_now().await;
    signal.shutdown().await;

    Ok(match outcome {
        Some(outcome) if outcome.is_success() => ExitCode::SUCCESS,
        Some(RunOutcome::NoDevice) => ExitCode::from(2),
        _ => ExitCode::FAILURE,
    })
}

async fn list(config: Config) -> Result<ExitCode> {
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new());
    let discovery = discovery(&config, runner);

    let disks: Vec<_> = discovery
        .list()
        .await?
        .into_iter()
        .filter(|d| d.is_disk())
        .collect();
    if disks.is_empty() {
        println!("No disks found.");
        return Ok(ExitCode::SUCCESS);
    }

    let candidate = match discovery.find_candidate().await {
        Ok(candidate) => candidate,
        Err(e) => {
            println!("{} {e}", style("WARNING:").yellow().bold());
            None
        }
    };

    println!(
        "\n  {:<16} {:<10} {:<10} {}",
        "DEVICE", "SIZE", "TRANSPORT", "MOUNTED"
    );
    println!("  {:-<16} {:-<10} {:-<10} {:-<20}", "", "", "", "");
    for disk in &disks {
        let mounted: Vec<String> = disk
            .mounted_nodes()
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        let mounted = if mounted.is_empty() {
            "(Not mounted)".to_string()
        } else {
            mounted.join(", ")
        };
        let marker = match &candidate {
            Some(c) if c.name == disk.name => {
                style("<- will be provisioned").green().bold().to_string()
            }
            _ => String::new(),
        };
        println!(
            "  {:<16} {:<10} {:<10} {mounted} {marker}",
            disk.path().display(),
            disk.size.as_deref().unwrap_or("?"),
            disk.tran.as_deref().unwrap_or("-"),
        );
    }

    if candidate.is_none() {
        println!("\nNo USB disk qualifies for provisioning.");
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or_default();
    let config = cli.config()?;

    let log_file = match command {
        Commands::List => None,
        _ => config.log_file.clone(),
    };
    let _log_guard = logging::init(log_file.as_deref());
    info!("stampr v{}", env!("CARGO_PKG_VERSION"));

    let result = match command {
        Commands::Watch => watch(config).await,
        Commands::Once => once(config).await,
        Commands::List => list(config).await,
    };
    if let Err(e) = &result {
        error!("{e:#}");
    }
    result
}
