//! Calibration: persistent offset records and the routines that measure them.
//!
//! Routines talk to the hardware only through [`SurfaceProbe`], so the
//! search logic can be exercised against synthetic surfaces.

pub mod edge;
pub mod file_store;
pub mod routines;
pub mod store;

use hardware::Axis;
use robot_math::SweepError;
use thiserror::Error;

use crate::error::RobotResult;
use crate::types::Point;

pub use edge::{find_edge, find_slot_center, probe_surface_height};
pub use file_store::FileCalibrationStore;
pub use routines::{
    calibrate_deck_attitude, calibrate_gripper_offset, calibrate_pipette_offset,
    calibrate_tip_length, measure_nozzle_height, DeckPoint,
};
pub use store::{
    CalibrationRecord, CalibrationSource, CalibrationStore, InMemoryCalibrationStore, StoreError,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("probe triggered at z={contact:.3}, above the expected maximum {expected_max:.3}")]
    EarlyCapacitiveSense { contact: f64, expected_max: f64 },

    #[error(
        "non-contact sweep measured a slot {measured:.3} mm wide, expected {expected:.3} ± {tolerance:.3} mm"
    )]
    InaccurateNonContactSweep {
        measured: f64,
        expected: f64,
        tolerance: f64,
    },

    #[error("no edge found along {axis} after {steps} steps")]
    EdgeNotFound { axis: Axis, steps: usize },

    #[error("no surface found below ({x:.3}, {y:.3})")]
    SurfaceNotFound { x: f64, y: f64 },

    #[error("sweep analysis failed: {0}")]
    Sweep(#[from] SweepError),
}

/// How slot edges are located.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbeMethod {
    /// Repeated Z probes with a shrinking stride
    #[default]
    Contact,
    /// Continuous capacitive sweeps across the slot
    NonContact,
}

/// Gantry axis a sweep or edge search runs along.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepAxis {
    X,
    Y,
}

impl SweepAxis {
    pub fn hardware_axis(self) -> Axis {
        match self {
            SweepAxis::X => Axis::X,
            SweepAxis::Y => Axis::Y,
        }
    }

    pub fn component(self, point: &Point) -> f64 {
        match self {
            SweepAxis::X => point.x,
            SweepAxis::Y => point.y,
        }
    }

    pub fn with_component(self, mut point: Point, value: f64) -> Point {
        match self {
            SweepAxis::X => point.x = value,
            SweepAxis::Y => point.y = value,
        }
        point
    }
}

/// Something that can touch or sense the deck at a world position.
///
/// All coordinates are those of the probing critical point.
pub trait SurfaceProbe {
    /// Move above `(x, y)` at `start_z`, then descend up to `distance`.
    /// Returns the contact height, or `None` if nothing was touched.
    fn probe_z(&mut self, x: f64, y: f64, start_z: f64, distance: f64) -> RobotResult<Option<f64>>;

    /// Sweep along `axis` from `start` to `end`, holding the other
    /// coordinates at `fixed`. Returns the samples and the position of each.
    fn sweep(
        &mut self,
        axis: SweepAxis,
        fixed: Point,
        start: f64,
        end: f64,
    ) -> RobotResult<(Vec<f64>, Vec<f64>)>;
}
