use hardware::{Axis, DriverError};
use robot_math::SingularMatrixError;
use thiserror::Error;

use crate::calibration::{CalibrationError, StoreError};
use crate::pose::{ObjectId, PoseError};
use crate::types::Mount;

/// Broad class of a [`RobotError`], used to decide how a caller should react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request does not make sense in the current state
    Precondition,
    /// The controller or a peripheral failed
    Hardware,
    /// A calibration routine produced an unusable result
    Calibration,
    /// A value was outside its allowed range
    Limit,
    /// Motion was stopped by a halt
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Nothing moved or state was rolled back; the command can be retried
    Recoverable,
    /// Position or hardware state is no longer trustworthy
    Fatal,
}

#[derive(Error, Debug)]
pub enum RobotError {
    #[error("no tip attached to {mount} pipette")]
    NoTipAttached { mount: Mount },

    #[error("{mount} pipette already has a tip attached")]
    TipAttached { mount: Mount },

    #[error("axes {axes:?} must be homed before moving")]
    MustHome { axes: Vec<Axis> },

    #[error("no instrument attached to {mount} mount")]
    NoInstrument { mount: Mount },

    #[error("{mount} mount already holds {model}")]
    MountOccupied { mount: Mount, model: String },

    #[error("cannot aspirate {requested:.3} uL: holding {current:.3} uL of {max:.3} uL")]
    VolumeExceedsCapacity { requested: f64, current: f64, max: f64 },

    #[error("invalid volume {0} uL")]
    InvalidVolume(f64),

    #[error("no tips available in the assigned tip racks")]
    OutOfTips,

    #[error("well {well} of {labware} has no tip")]
    TipMissing { labware: String, well: String },

    #[error("well {well} of {labware} already holds a tip")]
    TipPresent { labware: String, well: String },

    #[error("{mount} pipette does not know where its tip came from")]
    UnknownTipOrigin { mount: Mount },

    #[error("{mount} pipette has no previous location")]
    NoPreviousLocation { mount: Mount },

    #[error("unknown pipette model '{0}'")]
    UnknownModel(String),

    #[error("invalid plunger positions for {model}: {reason}")]
    InvalidPlungerPositions { model: String, reason: String },

    #[error("invalid slot '{0}'")]
    InvalidSlot(String),

    #[error("slot {slot} is occupied by {occupant}")]
    SlotOccupied { slot: String, occupant: String },

    #[error("labware definition '{0}' not found")]
    DefinitionNotFound(String),

    #[error("labware {0} is not loaded")]
    UnknownLabware(ObjectId),

    #[error("labware {labware} has no well '{well}'")]
    UnknownWell { labware: String, well: String },

    #[error("{0} is not a tip rack")]
    NotATipRack(String),

    #[error("module {0} is not loaded")]
    UnknownModule(ObjectId),

    #[error("{module} does not support {command}")]
    UnsupportedModuleCommand { module: String, command: String },

    #[error("{what} {value} is outside [{min}, {max}]")]
    OutOfRange {
        what: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("thermocycler lid is closed; open it before accessing its labware")]
    ThermocyclerLidClosed,

    #[error("robot is halted; reset before issuing commands")]
    Halted,

    #[error(transparent)]
    Pose(#[from] PoseError),

    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("calibration error: {0}")]
    Calibration(#[from] CalibrationError),

    #[error("calibration storage error: {0}")]
    Store(#[from] StoreError),

    #[error("singular attitude: {0}")]
    SingularAttitude(#[from] SingularMatrixError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Task(String),
}

pub type RobotResult<T> = Result<T, RobotError>;

impl RobotError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RobotError::Halted | RobotError::Driver(DriverError::Halted) => ErrorKind::Halted,
            RobotError::Driver(DriverError::OutOfRange { .. }) | RobotError::OutOfRange { .. } => {
                ErrorKind::Limit
            }
            RobotError::Driver(_)
            | RobotError::Store(_)
            | RobotError::Io(_)
            | RobotError::Task(_) => ErrorKind::Hardware,
            RobotError::Calibration(_) | RobotError::SingularAttitude(_) => ErrorKind::Calibration,
            RobotError::VolumeExceedsCapacity { .. } | RobotError::InvalidVolume(_) => {
                ErrorKind::Limit
            }
            _ => ErrorKind::Precondition,
        }
    }

    pub fn severity(&self) -> Severity {
        match self.kind() {
            ErrorKind::Hardware | ErrorKind::Halted => Severity::Fatal,
            ErrorKind::Precondition | ErrorKind::Calibration | ErrorKind::Limit => {
                Severity::Recoverable
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let err = RobotError::NoTipAttached { mount: Mount::Left };
        assert_eq!(err.kind(), ErrorKind::Precondition);
        assert_eq!(err.severity(), Severity::Recoverable);

        let err = RobotError::from(DriverError::Halted);
        assert_eq!(err.kind(), ErrorKind::Halted);
        assert_eq!(err.severity(), Severity::Fatal);

        let err = RobotError::from(DriverError::Timeout {
            command: "G28.2 X".to_string(),
        });
        assert_eq!(err.kind(), ErrorKind::Hardware);

        let err = RobotError::OutOfRange {
            what: "temperature".to_string(),
            value: 120.0,
            min: 4.0,
            max: 95.0,
        };
        assert_eq!(err.kind(), ErrorKind::Limit);
        assert_eq!(err.to_string(), "temperature 120 is outside [4, 95]");
    }
}
