//! Motion core for a liquid-handling gantry robot.
//!
//! The robot moves pipettes over a deck of labware. This crate keeps track of
//! where everything is and turns protocol-level requests ("aspirate 50 µL from
//! A1") into homed, calibrated, collision-avoiding moves:
//!
//! - [`pose`] - tree of tracked objects and their absolute positions
//! - [`deck`] / [`labware`] - slots, labware, wells and hardware modules
//! - [`gantry`] - world/machine coordinate transforms and the motion controller
//! - [`planner`] - arc and direct waypoint generation
//! - [`pipette`] - pipette models and the volume/tip state machine
//! - [`tips`] - tip availability across tip racks
//! - [`calibration`] - offset records, storage and probing routines
//! - [`robot`] - the async robot session tying it all together
//! - [`blocking`] - synchronous facade over the async session

pub mod blocking;
pub mod calibration;
pub mod config;
pub mod deck;
pub mod error;
pub mod gantry;
pub mod labware;
pub mod modules;
pub mod pipette;
pub mod planner;
pub mod pose;
pub mod publisher;
pub mod robot;
pub mod tips;
pub mod types;

pub use blocking::BlockingRobot;
pub use config::{CalibrationSettings, RobotConfig};
pub use deck::{DeckKind, DeckLayout, LabwareParent, Well};
pub use error::{ErrorKind, RobotError, RobotResult, Severity};
pub use pipette::{Pipette, PipetteOverrides, PipetteRegistry};
pub use planner::MoveStrategy;
pub use pose::{ObjectId, Pose, PoseGraph};
pub use robot::Robot;
pub use types::{CriticalPoint, Location, Mount, Point};
