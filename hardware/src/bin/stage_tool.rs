//! Manual control of the camera stage through Moonraker.
//!
//! Subcommands:
//! - `home`: home all axes
//! - `jog`: one feedback-style step (up/down/left/right) scaled by a multiplier
//! - `height`: move to a calibration stage's approach height or an explicit Z
//! - `send`: run raw G-code lines
//! - `repl`: interactive G-code prompt

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hardware::moonraker::MoonrakerChannel;
use hardware::{CommandChannel, Completion};
use shared::calibration_config::CalibrationConfig;
use shared::config_storage::ConfigStorage;
use shared::feedback::Command as Direction;
use shared::gcode::{CommandAssembler, HeightTarget, MotionProgram};
use shared::stage::CalibrationStage;
use strum::IntoEnumIterator;
use tracing::info;

/// Camera stage control over Moonraker JSON-RPC
#[derive(Parser, Debug)]
#[command(name = "stage_tool")]
#[command(about = "Manual control of the marker centering camera stage")]
#[command(version)]
struct Args {
    /// Moonraker WebSocket URL (defaults to the stored configuration)
    #[arg(long, global = true)]
    url: Option<String>,

    /// Response timeout in seconds (0 waits indefinitely)
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Calibration config JSON (defaults to ~/.cf_config/calibration.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Home all axes
    Home,

    /// Take one step in a direction
    Jog {
        /// up, down, left or right
        #[arg(value_parser = parse_direction)]
        direction: Direction,

        /// Step multiplier applied to the base distance
        #[arg(short, long, default_value = "1.0")]
        multiplier: f64,
    },

    /// Move to an approach height
    Height {
        /// Calibration stage whose height to use (S1, S2, S3)
        #[arg(short, long, conflicts_with = "z")]
        stage: Option<String>,

        /// Explicit absolute Z
        #[arg(short, long)]
        z: Option<f64>,
    },

    /// Run raw G-code lines as one script
    Send {
        /// G-code lines
        #[arg(required = true)]
        lines: Vec<String>,

        /// Wait for motion to finish before returning
        #[arg(short, long)]
        wait: bool,
    },

    /// Interactive G-code REPL
    Repl,
}

fn parse_direction(s: &str) -> Result<Direction, String> {
    Direction::iter()
        .filter(|d| !d.is_centered())
        .find(|d| d.to_string().eq_ignore_ascii_case(s))
        .ok_or_else(|| format!("unknown direction '{s}', expected up, down, left or right"))
}

fn parse_stage(s: &str) -> Result<CalibrationStage> {
    CalibrationStage::iter()
        .find(|stage| stage.to_string().eq_ignore_ascii_case(s))
        .with_context(|| format!("unknown stage '{s}'"))
}

fn load_config(path: Option<&PathBuf>) -> Result<CalibrationConfig> {
    match path {
        Some(path) => CalibrationConfig::load_from_file(path)
            .with_context(|| format!("Failed to load {}", path.display())),
        None => Ok(ConfigStorage::new()?.calibration_config_or_default()?),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    let url = args.url.unwrap_or_else(|| config.moonraker.url.clone());
    let timeout = match args.timeout {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => config.moonraker.response_timeout(),
    };

    info!("Connecting to Moonraker at {url}...");
    let mut channel = MoonrakerChannel::new(url, timeout);
    channel.connect()?;

    let mut assembler = CommandAssembler::new(config.base_distance, config.stage_heights);

    let result = match args.command {
        Command::Home => cmd_home(&mut channel, &mut assembler),
        Command::Jog {
            direction,
            multiplier,
        } => cmd_jog(&mut channel, &mut assembler, direction, multiplier),
        Command::Height { stage, z } => {
            let target = match (stage, z) {
                (Some(stage), _) => HeightTarget::from(parse_stage(&stage)?),
                (None, Some(z)) => HeightTarget::from(z),
                (None, None) => bail!("Specify --stage or --z"),
            };
            cmd_height(&mut channel, &mut assembler, target)
        }
        Command::Send { lines, wait } => cmd_send(&mut channel, &lines, wait),
        Command::Repl => cmd_repl(&mut channel),
    };

    channel.disconnect()?;
    result
}

fn cmd_home(channel: &mut MoonrakerChannel, assembler: &mut CommandAssembler) -> Result<()> {
    let program = MotionProgram::from(assembler.home());
    channel.send_program(&program, Completion::WaitForMoves)?;
    println!("Homed");
    Ok(())
}

fn cmd_jog(
    channel: &mut MoonrakerChannel,
    assembler: &mut CommandAssembler,
    direction: Direction,
    multiplier: f64,
) -> Result<()> {
    let mut program = MotionProgram::from(assembler.set_relative());
    if let Some(step) = assembler.move_command(direction, multiplier) {
        program.push(step);
    }
    channel.send_program(&program, Completion::WaitForMoves)?;
    println!("{}", program.to_script().replace('\n', "; "));
    Ok(())
}

fn cmd_height(
    channel: &mut MoonrakerChannel,
    assembler: &mut CommandAssembler,
    target: HeightTarget,
) -> Result<()> {
    let program = MotionProgram::from(vec![
        assembler.set_absolute(),
        assembler.set_height(target),
        assembler.set_relative(),
    ]);
    channel.send_program(&program, Completion::WaitForMoves)?;
    println!("{}", program.to_script().replace('\n', "; "));
    Ok(())
}

fn cmd_send(channel: &mut MoonrakerChannel, lines: &[String], wait: bool) -> Result<()> {
    let mut script = lines.join("\n");
    if wait {
        script.push_str("\nM400");
    }
    let response = channel.send_script(&script)?;
    println!("{response}");
    Ok(())
}

fn cmd_repl(channel: &mut MoonrakerChannel) -> Result<()> {
    println!("G-code REPL - one line per command, 'quit' to exit");
    println!("Examples: G28, G91, G1 X1.5, G1 Z100");
    println!();

    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if stdin.read_line(&mut input)? == 0 {
            break; // EOF
        }

        let line = input.trim();
        if line.is_empty() {
            continue;
        }

        if line.eq_ignore_ascii_case("quit") || line.eq_ignore_ascii_case("exit") {
            println!("Bye!");
            break;
        }

        match channel.send_script(line) {
            Ok(response) => println!("{response}"),
            Err(e) if e.is_transient() && channel.is_connected() => println!("Error: {e}"),
            Err(e) => {
                println!("Error: {e}");
                println!("Reconnecting...");
                channel.connect()?;
            }
        }
    }

    Ok(())
}
