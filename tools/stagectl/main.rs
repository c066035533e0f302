/*
 * Stage Control CLI
 *
 * Command-line probe and control tool for the linear stage. Useful for
 * commissioning a new setup (discover the driver, reference, test moves)
 * without starting the graphical front-end.
 *
 * NOTE:
 * Do not run move commands while the GUI owns the port. The serial
 * protocol is half-duplex with a single in-flight exchange; two processes
 * interleaving commands on one port will confuse the controller.
 */

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use stage_control::config::Settings;
use stage_control::discovery;
use stage_control::stage::{JogDirection, MovementOutcome, StageControl};

#[derive(Parser)]
#[command(name = "stagectl")]
#[command(about = "Linear stage control and diagnostics", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/default.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serial port override ("auto" for descriptor discovery)
    #[arg(long)]
    port: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Locate the stepper driver among the serial ports
    Discover,

    /// Show referencing state, readiness and position
    Status,

    /// Reference the stage against the configured limit switch
    Reference,

    /// Move to an absolute position in millimeters
    MoveAbs {
        /// Target position in mm (0 at the reference switch)
        position_mm: f64,

        /// Speed in mm/s
        #[arg(long, default_value_t = 3.0)]
        speed: f64,
    },

    /// Move relative to the current position in millimeters
    MoveRel {
        /// Travel distance in mm, positive away from the reference
        distance_mm: f64,

        /// Speed in mm/s
        #[arg(long, default_value_t = 3.0)]
        speed: f64,
    },

    /// Jog at constant speed for a while, then stop with the brake ramp
    Jog {
        /// Jog direction
        direction: Direction,

        /// How long to jog, in seconds
        #[arg(long, default_value_t = 1.0)]
        seconds: f64,
    },

    /// Stop the motor immediately
    Stop,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Direction {
    /// Away from the reference switch
    Up,
    /// Toward the reference switch
    Down,
}

impl From<Direction> for JogDirection {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Up => JogDirection::AwayFromReference,
            Direction::Down => JogDirection::TowardReference,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::from_path(path)?,
        None => Settings::new(None).unwrap_or_default(),
    };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&settings.log_level),
    )
    .init();

    if matches!(cli.command, Commands::Discover) {
        let port = discovery::find_port()?;
        println!("stepper driver found on {port}");
        return Ok(());
    }

    let mut stage_settings = settings.stage.clone();
    if let Some(port) = cli.port {
        stage_settings.port = port;
    }

    let stage = Arc::new(StageControl::from_settings(&stage_settings));
    if stage.has_connection_error() {
        bail!("stepper driver not reachable; check the cable or pass --port");
    }

    // Emergency stop on interrupt goes through the same command guard as
    // every other caller, so it serializes cleanly behind an in-flight
    // exchange.
    {
        let stage = stage.clone();
        ctrlc::set_handler(move || {
            let _ = stage.stop();
            eprintln!("Keyboard interrupt: motor stopped");
            std::process::exit(130);
        })?;
    }

    match cli.command {
        Commands::Discover => unreachable!("handled above"),
        Commands::Status => {
            // Hold one scope across the queries so the port opens only once.
            let _session = stage.acquire()?;
            let substeps = stage.read_substeps()?;
            let referenced = stage.is_referenced()?;
            let status = stage.fetch_status()?;
            println!("referenced:          {referenced}");
            println!("ready:               {}", status.is_ready());
            println!("positioning error:   {}", status.has_positioning_error());
            println!("microstep resolution: {substeps}");
            if referenced {
                let steps = stage.get_position()?;
                let mm = stage.get_position_mm()?;
                println!("position:            {steps} steps ({mm:.3} mm)");
            }
        }
        Commands::Reference => {
            println!("referencing against the '{}' limit switch...", stage.reference_point());
            match stage.do_referencing()? {
                MovementOutcome::Completed => println!("referencing complete"),
                MovementOutcome::EndedPrematurely => {
                    bail!("referencing ended prematurely; check the stage")
                }
            }
        }
        Commands::MoveAbs { position_mm, speed } => {
            stage.read_substeps()?;
            stage.move_absolute_mm(position_mm, speed)?;
            match stage.wait_movement()? {
                MovementOutcome::Completed => {
                    println!("at {:.3} mm", stage.get_position_mm()?);
                }
                MovementOutcome::EndedPrematurely => {
                    bail!("movement ended prematurely; reference the stage again")
                }
            }
        }
        Commands::MoveRel { distance_mm, speed } => {
            stage.read_substeps()?;
            stage.move_relative_mm(distance_mm, speed)?;
            match stage.wait_movement()? {
                MovementOutcome::Completed => {
                    println!("at {:.3} mm", stage.get_position_mm()?);
                }
                MovementOutcome::EndedPrematurely => {
                    bail!("movement ended prematurely; reference the stage again")
                }
            }
        }
        Commands::Jog { direction, seconds } => {
            stage.move_inf_start(direction.into(), stage.default_speed())?;
            std::thread::sleep(Duration::from_secs_f64(seconds.max(0.0)));
            stage.stop_soft()?;
            stage.wait_movement()?;
        }
        Commands::Stop => {
            stage.stop()?;
            println!("motor stopped");
        }
    }

    Ok(())
}
