//! CLI entry point for the TCSPC Arduino.
//!
//! Drives the detector plugin the same way a data-acquisition host would:
//!
//! ```bash
//! tcspc ports
//! tcspc schema
//! tcspc snapshot --output single.csv
//! tcspc live --max-time 10 --output run.csv
//! tcspc --config lab.toml --log-level debug rate
//! ```
//!
//! Without a serial port in the configuration, or when the port cannot be opened, every
//! command runs against the simulation.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tcspc_arduino::config::AppConfig;
use tcspc_arduino::controller::TcspcController;
use tcspc_arduino::core::ParameterValue;
use tcspc_arduino::hardware::serial;
use tcspc_arduino::logging;
use tcspc_arduino::plugin::{
    DataExport, DataFromPlugin, DataKind, DetectorPlugin, GrabMode, TcspcViewer,
};
use tcspc_arduino::storage;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

/// How long to wait for the final export once the worker went idle.
const FINAL_EXPORT_GRACE: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "tcspc")]
#[command(about = "Acquire TCSPC histograms from an Arduino histogrammer", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/default.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports and the connection that would be used
    Ports,

    /// Print the effective configuration as TOML
    Config,

    /// Print the plugin settings schema as JSON
    Schema,

    /// Record a single histogram
    Snapshot {
        /// Write the histogram as CSV
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Accumulate histograms until a limit is reached or Ctrl-C
    Live {
        /// Accumulation time in seconds (0 disables)
        #[arg(long)]
        max_time: Option<f64>,

        /// Stop once the largest bin reaches this count (0 disables)
        #[arg(long)]
        max_counts: Option<u64>,

        /// Write the final histograms as CSV
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Measure the count rate once
    Rate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
    .context("Failed to load configuration")?;

    if let Some(level) = cli.log_level {
        config.application.log_level = level;
        config.validate().context("Invalid --log-level")?;
    }
    logging::init_from_config(&config).context("Failed to initialise logging")?;
    debug!(application = %config.application.name, "Configuration loaded");

    match cli.command {
        Commands::Ports => list_ports(&config),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Schema => {
            let viewer = TcspcViewer::new(config.device, config.simulation);
            println!("{}", serde_json::to_string_pretty(&viewer.settings_schema())?);
            Ok(())
        }
        Commands::Snapshot { output } => snapshot(config, output).await,
        Commands::Live {
            max_time,
            max_counts,
            output,
        } => live(config, max_time, max_counts, output).await,
        Commands::Rate => rate(config).await,
    }
}

fn list_ports(config: &AppConfig) -> Result<()> {
    let ports = serial::available_ports();
    if ports.is_empty() {
        println!("No serial ports found");
    } else {
        println!("Serial ports:");
        for port in &ports {
            println!("  {}", port);
        }
    }

    match &config.device.port {
        Some(port) => println!("Configured port: {} ({} baud)", port, config.device.baudrate),
        None if ports.is_empty() => println!("No port configured: simulation will be used"),
        None => println!("No port configured: {} will be used", ports[0]),
    }
    Ok(())
}

async fn init_viewer(config: AppConfig) -> Result<(TcspcViewer, broadcast::Receiver<DataExport>)> {
    let viewer = TcspcViewer::new(config.device, config.simulation);
    let exports = viewer.subscribe();
    let status = viewer.ini_detector().await?;
    if !status.initialized {
        bail!("Initialisation failed: {}", status.info);
    }
    info!("{}", status.info);
    Ok((viewer, exports))
}

async fn next_persisted(exports: &mut broadcast::Receiver<DataExport>) -> Result<DataExport> {
    loop {
        match exports.recv().await {
            Ok(export) if export.kind == DataKind::Persisted => return Ok(export),
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "Skipped temporary exports"),
            Err(RecvError::Closed) => bail!("Export channel closed"),
        }
    }
}

fn summarise(export: &DataExport) -> Result<&DataFromPlugin> {
    let Some(data) = export.data.first() else {
        bail!("Export carries no data");
    };
    for (label, array) in data.labels.iter().zip(&data.arrays) {
        let max = array.iter().copied().fold(0.0_f64, f64::max);
        let sum: f64 = array.iter().sum();
        println!("{:>8}: {} counts, peak {}", label, sum, max);
    }
    Ok(data)
}

fn save(export: &DataExport, output: Option<&Path>) -> Result<()> {
    let data = summarise(export)?;
    if let Some(path) = output {
        storage::write_data_csv(path, data)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Saved to {}", path.display());
    }
    Ok(())
}

fn save_run(export: &DataExport, output: Option<&Path>) -> Result<()> {
    let data = summarise(export)?;
    if let Some(path) = output {
        let (Some(current), Some(total)) = (data.array("current"), data.array("total")) else {
            bail!("Final export lacks the current or total histogram");
        };
        storage::write_histogram_csv(path, &data.axis.data, current, total)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Saved to {}", path.display());
    }
    Ok(())
}

async fn snapshot(config: AppConfig, output: Option<PathBuf>) -> Result<()> {
    let (viewer, mut exports) = init_viewer(config).await?;
    viewer.grab_data(GrabMode::Single).await?;
    let export = next_persisted(&mut exports).await?;
    viewer.close().await?;
    save(&export, output.as_deref())
}

async fn live(
    config: AppConfig,
    max_time: Option<f64>,
    max_counts: Option<u64>,
    output: Option<PathBuf>,
) -> Result<()> {
    let (viewer, mut exports) = init_viewer(config).await?;
    if let Some(max_time) = max_time {
        viewer.commit_settings("max_time", ParameterValue::Float(max_time)).await?;
    }
    if let Some(max_counts) = max_counts {
        viewer.commit_settings("max_counts", max_counts.into()).await?;
    }

    viewer.grab_data(GrabMode::Live).await?;
    info!("Live acquisition running, press Ctrl-C to stop");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(Duration::from_millis(250));

    let final_export = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Stop requested");
                viewer.stop().await?;
                break None;
            }
            received = exports.recv() => match received {
                Ok(export) if export.kind == DataKind::Persisted => break Some(export),
                Ok(export) => {
                    let peak = export
                        .data
                        .first()
                        .and_then(|d| d.array("total"))
                        .map(|total| total.iter().copied().fold(0.0_f64, f64::max));
                    debug!(peak = ?peak, "Histogram update");
                }
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "Skipped temporary exports"),
                Err(RecvError::Closed) => break None,
            },
            _ = ticker.tick() => {
                if !viewer.is_live() {
                    break tokio::time::timeout(FINAL_EXPORT_GRACE, next_persisted(&mut exports))
                        .await
                        .ok()
                        .and_then(Result::ok);
                }
            }
        }
    };

    let error = viewer.last_error();
    viewer.close().await?;

    if let Some(error) = error {
        bail!("Acquisition failed: {}", error);
    }
    match final_export {
        Some(export) => save_run(&export, output.as_deref()),
        None => {
            warn!("Acquisition stopped before reaching a limit; nothing saved");
            Ok(())
        }
    }
}

async fn rate(config: AppConfig) -> Result<()> {
    let mut controller = TcspcController::new(config.device, config.simulation);
    let mode = controller.connect().await?;
    let rate = controller.read_rate().await;
    controller.disconnect().await;
    println!("{}: {:.1} counts/s", mode, rate?);
    Ok(())
}
