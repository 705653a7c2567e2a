//! Stand-in for the firmware side of the workcell sockets.
//!
//! Runs a [`WorkcellConsumer`] against a simulated toolhead so the controller
//! can be exercised on a machine without a printer. Start `auto_calibrate
//! --backend workcell` first, then this.

use std::path::PathBuf;
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use hardware::workcell::{SimulatedToolhead, TickOutcome, WorkcellConsumer};
use shared::calibration_config::CalibrationConfig;
use shared::config_storage::ConfigStorage;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "workcell_consumer")]
#[command(about = "Simulated firmware consumer for the workcell IPC backend")]
#[command(version)]
struct Args {
    /// Marker to center on
    #[arg(short, long)]
    marker_id: u32,

    /// Simulated feed rate in mm/s
    #[arg(short, long, default_value = "50.0")]
    feed_rate: f64,

    /// Command datagram socket path (overrides config)
    #[arg(long)]
    command_socket: Option<PathBuf>,

    /// Control stream socket path (overrides config)
    #[arg(long)]
    control_socket: Option<PathBuf>,

    /// Calibration config JSON (defaults to ~/.cf_config/calibration.json)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => CalibrationConfig::load_from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => ConfigStorage::new()?.calibration_config_or_default()?,
    };

    let mut settings = config.workcell;
    if let Some(path) = args.command_socket {
        settings.command_socket = path;
    }
    if let Some(path) = args.control_socket {
        settings.control_socket = path;
    }

    let mut consumer = WorkcellConsumer::new(&settings);
    let mut toolhead = SimulatedToolhead::new(args.feed_rate);
    let clock = Instant::now();

    consumer.start(args.marker_id)?;
    info!(
        "Consumer running on {} (marker {})",
        settings.command_socket.display(),
        args.marker_id
    );

    loop {
        let tick = consumer.tick(clock.elapsed().as_secs_f64(), &mut toolhead);
        match &tick.outcome {
            TickOutcome::Executed(script) => {
                info!("Executed {script:?}, position {:?}", toolhead.position());
            }
            TickOutcome::Rejected { script, reason } => warn!("Rejected {script:?}: {reason}"),
            TickOutcome::Finished { marker_id } => {
                info!("Controller finished marker {marker_id}");
                break;
            }
            TickOutcome::Stopped => break,
            other => debug!("{other:?}"),
        }
        thread::sleep(tick.next_poll);
    }

    println!("Final position: {:?}", toolhead.position());
    Ok(())
}
