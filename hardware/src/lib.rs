//! Motor controller drivers for the liquid-handling gantry.
//!
//! The gantry exposes six single-letter axes: `X`/`Y` for the shared gantry,
//! `Z`/`A` for the left and right mount heights and `B`/`C` for the left and
//! right plungers. Everything above this crate talks to the controller through
//! the [`MotorDriver`] trait.
//!
//! - [`GcodeDriver`] speaks the Smoothieware G-code dialect over a serial port
//! - [`SimulatedDriver`] keeps axis state in memory for tests and dry runs

pub mod axis;
pub mod driver;
pub mod errors;
pub mod gcode;
pub mod sim;

pub use axis::{Axis, AxisMap};
pub use driver::{DriverControl, MotorDriver};
pub use errors::{DriverError, DriverResult};
pub use gcode::GcodeDriver;
pub use sim::{DriverCommand, ProbeSurface, SimHandle, SimulatedDriver};
