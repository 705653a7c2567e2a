//! Closed-loop auto-calibration.
//!
//! Reads detector output as JSON lines (see `test_bench::source`) from a file
//! or stdin and centers the stage on the marker through the chosen backend.
//! `--backend sim` runs against a simulated stage and camera instead.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use hardware::CommandChannel;
use shared::calibration_config::CalibrationConfig;
use shared::config_storage::ConfigStorage;
use test_bench::{CalibrationRun, FrameSource, JsonLinesSource, RunReport};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Moonraker JSON-RPC over WebSocket
    Moonraker,
    /// Workcell command/control Unix sockets
    Workcell,
    /// Simulated stage and camera, no detector input
    Sim,
}

#[derive(Parser, Debug)]
#[command(name = "auto_calibrate")]
#[command(about = "Center the camera stage on a fiducial marker")]
#[command(version)]
struct Args {
    /// Command channel backend
    #[arg(short, long, value_enum, default_value = "moonraker")]
    backend: Backend,

    /// Detector JSON-lines file (defaults to stdin)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Calibration config JSON (defaults to ~/.cf_config/calibration.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Moonraker WebSocket URL (overrides config)
    #[arg(long)]
    url: Option<String>,

    /// Initial target scale (overrides config)
    #[arg(long)]
    target_scale: Option<f64>,

    /// Frames to simulate with `--backend sim`
    #[arg(long, default_value = "500")]
    sim_frames: usize,

    /// Write the effective configuration to the default location and exit
    #[arg(long)]
    save_config: bool,
}

fn load_config(args: &Args) -> Result<CalibrationConfig> {
    let mut config = match &args.config {
        Some(path) => CalibrationConfig::load_from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => ConfigStorage::new()?.calibration_config_or_default()?,
    };
    if let Some(url) = &args.url {
        config.moonraker.url = url.clone();
    }
    if let Some(scale) = args.target_scale {
        config.target_scale = scale;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = load_config(&args)?;

    if args.save_config {
        let storage = ConfigStorage::new()?;
        let path = storage.save_calibration_config(&config)?;
        println!("Saved configuration to {}", path.display());
        return Ok(());
    }

    let report = match args.backend {
        Backend::Sim => run_simulated(&config, args.sim_frames)?,
        backend => {
            let channel = open_channel(backend, &config)?;
            let source: Box<dyn FrameSource> = match &args.input {
                Some(path) => Box::new(
                    JsonLinesSource::open(path)
                        .with_context(|| format!("Failed to open {}", path.display()))?,
                ),
                None => Box::new(JsonLinesSource::stdin()),
            };
            CalibrationRun::new(channel, source, &config).run()?
        }
    };

    print_report(&report);
    Ok(())
}

fn open_channel(backend: Backend, config: &CalibrationConfig) -> Result<Box<dyn CommandChannel>> {
    match backend {
        #[cfg(feature = "moonraker")]
        Backend::Moonraker => {
            info!("Using Moonraker at {}", config.moonraker.url);
            Ok(Box::new(hardware::moonraker::MoonrakerChannel::from_settings(
                &config.moonraker,
            )))
        }
        #[cfg(all(unix, feature = "workcell"))]
        Backend::Workcell => {
            info!(
                "Waiting for the workcell consumer on {}",
                config.workcell.control_socket.display()
            );
            Ok(Box::new(hardware::workcell::WorkcellChannel::new(
                config.workcell.clone(),
            )))
        }
        other => bail!("Backend {other:?} is not available in this build"),
    }
}

#[cfg(feature = "workcell")]
fn run_simulated(config: &CalibrationConfig, frames: usize) -> Result<RunReport> {
    use test_bench::sim::{bench, CameraModel};

    let (stage, camera) = bench(50.0, CameraModel::default(), frames);
    let toolhead = stage.toolhead().clone();
    let report = CalibrationRun::new(stage, camera, config).run()?;
    println!("Final stage position: {:?}", toolhead.borrow().position());
    Ok(report)
}

#[cfg(not(feature = "workcell"))]
fn run_simulated(_config: &CalibrationConfig, _frames: usize) -> Result<RunReport> {
    bail!("Simulation needs the workcell feature")
}

fn print_report(report: &RunReport) {
    println!("Stage:              {}", report.final_stage);
    println!("Completed:          {}", report.completed);
    println!("Frames:             {}", report.frames);
    println!("Commands sent:      {}", report.commands_sent);
    println!("Transient failures: {}", report.transient_failures);
    println!("Target scale:       {:.3}", report.target_scale);
    println!("Stopped:            {:?}", report.stop_reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_command_line_overrides_are_validated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("calibration.json");
        CalibrationConfig::default().save_to_file(&path).unwrap();
        let path = path.to_str().unwrap();

        let args = Args::parse_from(["auto_calibrate", "--config", path, "--target-scale", "0.3"]);
        assert_eq!(load_config(&args).unwrap().target_scale, 0.3);

        let args = Args::parse_from(["auto_calibrate", "--config", path, "--target-scale", "NaN"]);
        assert!(load_config(&args).is_err());
    }
}
