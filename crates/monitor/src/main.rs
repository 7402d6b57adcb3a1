//! usb-loop-monitor
//!
//! Runs USB transfers from a poll-driven event loop and reports each
//! completion. The loop lives on its own thread; this side only waits for
//! completions, Ctrl-C or the configured duration.

use anyhow::{Context, Result};
use bridge::DeviceSubsystem;
use bridge::libusb::LibusbSubsystem;
use clap::Parser;
use common::setup_logging;
use monitor::config::{self, MonitorConfig};
use monitor::{LoopEvent, LoopWorker, RunSummary, WorkerConfig};
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-loop-monitor")]
#[command(
    author,
    version,
    about = "Run USB transfers from a poll-driven event loop"
)]
#[command(long_about = "
Drives a libusb context from a single-threaded poll(2) loop and runs the
configured control, interrupt and bulk transfer jobs against one device.

EXAMPLES:
    # Run the configured jobs
    usb-loop-monitor --device 0x046d:0xc52b

    # Stop after ten seconds
    usb-loop-monitor --duration 10

    # Show the descriptors libusb wants polled
    usb-loop-monitor --list-pollfds

CONFIGURATION:
    The monitor looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-loop-monitor/monitor.toml
    3. /etc/usb-loop-monitor/monitor.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Device to open (overrides the config file)
    #[arg(short, long, value_name = "VID:PID")]
    device: Option<String>,

    /// Stop after this many seconds
    #[arg(long, value_name = "SECS")]
    duration: Option<u64>,

    /// Print the polled descriptors and the next libusb timeout, then exit
    #[arg(long)]
    list_pollfds: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = MonitorConfig::default();
        let path = MonitorConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        MonitorConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        MonitorConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.monitor.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-loop-monitor v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    if args.list_pollfds {
        return list_pollfds();
    }

    let device = match args.device.as_deref() {
        Some(id) => Some(config::parse_device_id(id).context("Invalid --device")?),
        None => config.device_id()?,
    };
    let duration = args
        .duration
        .or(config.monitor.duration_secs)
        .map(Duration::from_secs);

    let (events_tx, events_rx) = async_channel::unbounded();
    let worker = LoopWorker::spawn(
        WorkerConfig {
            device,
            jobs: config.jobs.clone(),
        },
        events_tx,
    )
    .await?;

    let summary = watch(events_rx, duration).await;

    info!("Shutting down USB loop...");
    worker.shutdown();

    print!("{}", summary);
    Ok(())
}

/// Collect completions until the loop stops, Ctrl-C or the deadline
async fn watch(events: async_channel::Receiver<LoopEvent>, duration: Option<Duration>) -> RunSummary {
    let mut summary = RunSummary::default();

    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(LoopEvent::Completed(report)) => {
                    if report.status.is_success() {
                        info!(
                            "{} #{}: {} bytes {:02x?}",
                            report.job, report.round, report.actual_length, report.preview
                        );
                    } else {
                        warn!("{} #{}: {}", report.job, report.round, report.status);
                    }
                    summary.record(&report);
                }
                Ok(LoopEvent::JobFinished { job, rounds }) => {
                    debug!("Job '{}' finished after {} rounds", job, rounds);
                    summary.mark_finished(&job);
                }
                Ok(LoopEvent::Stopped) => {
                    info!("USB loop stopped");
                    break;
                }
                Err(_) => {
                    error!("USB loop event channel closed");
                    break;
                }
            },
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down...");
                break;
            }
            _ = &mut deadline => {
                info!("Run duration elapsed");
                break;
            }
        }
    }

    summary
}

fn list_pollfds() -> Result<()> {
    let subsystem = LibusbSubsystem::new().context("Failed to initialize libusb")?;

    let pollfds = subsystem.pollfds();
    println!("{} descriptors:", pollfds.len());
    for pollfd in &pollfds {
        println!("  fd {:<4} {}", pollfd.fd, pollfd.interest);
    }

    let timeout = subsystem
        .next_timeout()
        .context("Failed to query next libusb timeout")?;
    println!("next timeout: {:?}", timeout);
    Ok(())
}
