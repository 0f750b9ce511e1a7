//! Command line tool for the liquid handler motion core.
//!
//! Runs against the simulated driver so configs, calibration files and
//! protocols can be exercised without a robot:
//! - `home`: home every axis and print the resulting positions
//! - `demo`: pick up a tip, move liquid between two wells and drop the tip
//! - `calibrate-deck`: measure the deck attitude over a simulated flat deck
//! - `show-config`: print the effective robot config as JSON

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use hardware::{Axis, SimHandle, SimulatedDriver};
use liquid_handler::calibration::{FileCalibrationStore, InMemoryCalibrationStore, ProbeMethod};
use liquid_handler::labware::BuiltinLabware;
use liquid_handler::publisher::{CommandMessage, CommandOutcome, CommandStage};
use liquid_handler::{
    CriticalPoint, Mount, PipetteOverrides, PipetteRegistry, Point, Robot, RobotConfig,
};
use strum::IntoEnumIterator;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Liquid handler motion core tool
#[derive(Parser, Debug)]
#[command(name = "lh_tool")]
#[command(about = "Drive the liquid handler motion core against a simulated gantry")]
#[command(version)]
struct Args {
    /// Robot config file (JSON). Built-in defaults when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding calibration records. In-memory when omitted
    #[arg(long, global = true)]
    calibration_dir: Option<PathBuf>,

    /// Print every published command
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

/// Instrument to load for a command
#[derive(ClapArgs, Debug)]
struct InstrumentArgs {
    /// Pipette model to load
    #[arg(long, default_value = "p300_single_v2.0")]
    pipette: String,

    /// Mount to load the pipette on
    #[arg(long, default_value = "right")]
    mount: Mount,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Home all axes and print where they ended up
    Home,

    /// Transfer liquid between two wells with a fresh tip
    Demo {
        #[command(flatten)]
        instrument: InstrumentArgs,

        #[arg(long, default_value = "opentrons_96_tiprack_300ul")]
        tiprack: String,

        #[arg(long, default_value = "corning_96_wellplate_360ul_flat")]
        plate: String,

        /// Volume to move, µL
        #[arg(long, default_value = "100")]
        volume: f64,

        /// Return the tip to its rack instead of dropping it in the trash
        #[arg(long)]
        return_tip: bool,
    },

    /// Measure the deck attitude with a pipette's calibration probe
    CalibrateDeck {
        #[command(flatten)]
        instrument: InstrumentArgs,

        /// Use capacitive sweeps instead of contact probes
        #[arg(long)]
        non_contact: bool,
    },

    /// Print the effective config
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => RobotConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => RobotConfig::default(),
    };

    if let Command::ShowConfig = args.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let driver = SimulatedDriver::new(config.home_position.clone(), config.lower_limits.clone());
    let sim = driver.handle();
    let robot = build_robot(driver, config, args.calibration_dir.as_ref())?;
    if args.verbose {
        robot.publisher().subscribe(log_command);
    }

    match args.command {
        Command::Home => cmd_home(&robot).await,
        Command::Demo {
            instrument,
            tiprack,
            plate,
            volume,
            return_tip,
        } => cmd_demo(&robot, &instrument, &tiprack, &plate, volume, return_tip).await,
        Command::CalibrateDeck {
            instrument,
            non_contact,
        } => {
            let method = if non_contact {
                ProbeMethod::NonContact
            } else {
                ProbeMethod::Contact
            };
            cmd_calibrate_deck(&robot, &sim, &instrument, method).await
        }
        Command::ShowConfig => Ok(()),
    }
}

fn build_robot(
    driver: SimulatedDriver,
    config: RobotConfig,
    calibration_dir: Option<&PathBuf>,
) -> Result<Robot<SimulatedDriver>> {
    let robot = match calibration_dir {
        Some(dir) => {
            info!("Using calibration records under {}", dir.display());
            Robot::with_components(
                driver,
                config,
                PipetteRegistry::builtin(),
                Arc::new(BuiltinLabware::new()),
                Arc::new(FileCalibrationStore::with_path(dir.clone())),
            )?
        }
        None => Robot::with_components(
            driver,
            config,
            PipetteRegistry::builtin(),
            Arc::new(BuiltinLabware::new()),
            Arc::new(InMemoryCalibrationStore::new()),
        )?,
    };
    Ok(robot)
}

fn log_command(message: &CommandMessage) {
    match (&message.stage, &message.outcome) {
        (CommandStage::Before, _) => info!("> {}", message.payload),
        (CommandStage::After, Some(CommandOutcome::Failed(e))) => {
            warn!("< {} failed: {}", message.payload, e)
        }
        (CommandStage::After, _) => info!("< {}", message.payload),
    }
}

// ==================== Home Command ====================

async fn cmd_home(robot: &Robot<SimulatedDriver>) -> Result<()> {
    robot.home().await?;
    let positions = robot.axis_positions().await?;
    for axis in Axis::iter() {
        if let Some(value) = positions.get(&axis) {
            println!("{axis}: {value:.3}");
        }
    }
    Ok(())
}

// ==================== Demo Command ====================

/// First two free slots other than the trash, front to back.
fn free_slots(robot: &Robot<SimulatedDriver>) -> Result<(String, String)> {
    let layout = robot.deck_layout();
    let mut slots = layout
        .slot_names()
        .filter(|name| *name != layout.trash_slot())
        .map(str::to_string);
    match (slots.next(), slots.next()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(anyhow!("deck has fewer than two free slots")),
    }
}

async fn cmd_demo(
    robot: &Robot<SimulatedDriver>,
    instrument: &InstrumentArgs,
    tiprack: &str,
    plate_name: &str,
    volume: f64,
    return_tip: bool,
) -> Result<()> {
    let (pipette, mount) = (instrument.pipette.as_str(), instrument.mount);
    let (rack_slot, plate_slot) = free_slots(robot)?;
    let rack = robot.load_labware_in_slot(tiprack, &rack_slot)?;
    let plate = robot.load_labware_in_slot(plate_name, &plate_slot)?;
    robot.load_instrument(pipette, mount, &[rack], &PipetteOverrides::default())?;
    info!(
        "Loaded {} in {}, {} in {}, {} on {}",
        tiprack, rack_slot, plate_name, plate_slot, pipette, mount
    );

    robot.home().await?;
    robot.pick_up_tip(mount, None, None, None).await?;

    let source = robot.well(plate, "A1")?;
    let dest = robot.well(plate, "B1")?;
    robot
        .aspirate(mount, Some(volume), Some(source.bottom(1.0)), 1.0)
        .await?;
    robot.delay(Duration::from_millis(500)).await?;
    robot
        .dispense(mount, Some(volume), Some(dest.bottom(1.0)), 1.0)
        .await?;
    robot.blow_out(mount, Some(dest.top(0.0))).await?;
    robot.touch_tip(mount, None, 1.0, -1.0, 60.0).await?;

    if return_tip {
        robot.return_tip(mount, true).await?;
    } else {
        robot.drop_tip(mount, None, true).await?;
    }

    let tracker = robot.tip_tracker(rack)?;
    let at = robot.position(mount, CriticalPoint::Nozzle).await?;
    println!(
        "Moved {volume} µL A1 -> B1; {} tips left in {}; nozzle at ({:.2}, {:.2}, {:.2})",
        tracker.available(),
        rack_slot,
        at.x,
        at.y,
        at.z
    );
    Ok(())
}

// ==================== Calibrate Deck Command ====================

/// Flat deck at z=0 with a square hole at the centre of each attitude slot,
/// in the machine frame of `mount` under an identity attitude.
fn install_flat_deck(robot: &Robot<SimulatedDriver>, sim: &SimHandle, mount: Mount, probe: Point) {
    let layout = robot.deck_layout();
    let holes: Vec<Point> = layout
        .attitude_slots()
        .iter()
        .filter_map(|slot| layout.slot_center(slot).ok())
        .collect();
    let half = robot.config().calibration.slot_width_mm / 2.0;
    let reference = robot.config().mount_offset(mount) + probe;
    sim.set_probe_surface(Arc::new(move |_axis: Axis, x: f64, y: f64| {
        let (x, y) = (x + reference.x, y + reference.y);
        let in_hole = holes
            .iter()
            .any(|h| (x - h.x).abs() < half && (y - h.y).abs() < half);
        (!in_hole).then_some(-reference.z)
    }));
}

async fn cmd_calibrate_deck(
    robot: &Robot<SimulatedDriver>,
    sim: &SimHandle,
    instrument: &InstrumentArgs,
    method: ProbeMethod,
) -> Result<()> {
    let mount = instrument.mount;
    robot.load_instrument(&instrument.pipette, mount, &[], &PipetteOverrides::default())?;
    robot.home().await?;

    let probe = robot.position(mount, CriticalPoint::CalibrationProbe).await?
        - robot.position(mount, CriticalPoint::Mount).await?;
    install_flat_deck(robot, sim, mount, probe);

    let attitude = robot.calibrate_deck(mount, method).await?;
    println!("Deck attitude:");
    for row in attitude.row_iter() {
        println!(
            "  [{:>10.5} {:>10.5} {:>10.5} {:>10.5}]",
            row[0], row[1], row[2], row[3]
        );
    }
    Ok(())
}
