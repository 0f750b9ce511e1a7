use std::fmt;
use std::str::FromStr;

use hardware::Axis;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use strum::EnumIter;

use crate::pose::ObjectId;

/// A point in deck coordinates, millimetres.
///
/// x increases to the right, y toward the back, z up; the origin is the
/// front-left corner of the deck surface.
pub type Point = Vector3<f64>;

/// Gantry attachment point.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Mount {
    Left,
    Right,
}

impl Mount {
    /// Height axis driving this mount.
    pub fn z_axis(&self) -> Axis {
        match self {
            Mount::Left => Axis::Z,
            Mount::Right => Axis::A,
        }
    }

    /// Plunger axis of the instrument on this mount.
    pub fn plunger_axis(&self) -> Axis {
        match self {
            Mount::Left => Axis::B,
            Mount::Right => Axis::C,
        }
    }

    pub fn other(&self) -> Mount {
        match self {
            Mount::Left => Mount::Right,
            Mount::Right => Mount::Left,
        }
    }
}

impl fmt::Display for Mount {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Mount::Left => write!(f, "left"),
            Mount::Right => write!(f, "right"),
        }
    }
}

impl FromStr for Mount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "left" | "l" => Ok(Mount::Left),
            "right" | "r" => Ok(Mount::Right),
            other => Err(format!("invalid mount '{other}': expected left or right")),
        }
    }
}

/// Sub-point of an instrument used as its position when targeting moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CriticalPoint {
    /// End of the attached tip, or the nozzle when no tip is attached
    #[default]
    Tip,
    /// Nozzle end, ignoring any attached tip
    Nozzle,
    /// Mount reference point; instrument geometry ignored
    Mount,
    /// End of the calibration probe fitted to the nozzle
    CalibrationProbe,
}

/// A target point, optionally tied to the labware and well it belongs to.
///
/// The labware/well association lets the planner recognise moves within a
/// single container.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub point: Point,
    pub labware: Option<ObjectId>,
    pub well: Option<ObjectId>,
}

impl Location {
    /// A bare point with no container association.
    pub fn new(point: Point) -> Self {
        Self {
            point,
            labware: None,
            well: None,
        }
    }

    pub fn in_well(point: Point, labware: ObjectId, well: ObjectId) -> Self {
        Self {
            point,
            labware: Some(labware),
            well: Some(well),
        }
    }

    /// Same container association, point shifted by `delta`.
    pub fn moved(&self, delta: Point) -> Self {
        Self {
            point: self.point + delta,
            ..*self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_axes() {
        assert_eq!(Mount::Left.z_axis(), Axis::Z);
        assert_eq!(Mount::Right.z_axis(), Axis::A);
        assert_eq!(Mount::Left.plunger_axis(), Axis::B);
        assert_eq!(Mount::Right.other(), Mount::Left);
    }

    #[test]
    fn test_mount_parse() {
        assert_eq!("LEFT".parse::<Mount>().unwrap(), Mount::Left);
        assert_eq!("r".parse::<Mount>().unwrap(), Mount::Right);
        assert!("middle".parse::<Mount>().is_err());
        assert_eq!(Mount::Left.to_string(), "left");
    }
}
