use thiserror::Error;

use crate::axis::Axis;

/// Errors raised by motor controller drivers.
#[derive(Error, Debug)]
pub enum DriverError {
    /// IO error on the transport
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port could not be opened or configured
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// No complete response within the transport timeout
    #[error("timed out waiting for response to `{command}`")]
    Timeout { command: String },

    /// Controller entered an alarm state (motion stopped, axes must be rehomed)
    #[error("controller alarm after `{command}`: {message}")]
    Alarm { command: String, message: String },

    /// Controller rejected the command
    #[error("controller error after `{command}`: {message}")]
    Controller { command: String, message: String },

    /// Response could not be parsed
    #[error("parse error: {0}")]
    Parse(String),

    /// Motion was halted through the control line
    #[error("motion halted")]
    Halted,

    /// Target lies outside the axis travel range
    #[error("axis {axis} target {target:.3} outside travel range [{min:.3}, {max:.3}]")]
    OutOfRange {
        axis: Axis,
        target: f64,
        min: f64,
        max: f64,
    },

    /// Probe travelled its full distance without triggering
    #[error("probe on axis {axis} did not trigger within {distance:.3} mm")]
    ProbeMissed { axis: Axis, distance: f64 },

    /// Operation not available on this driver
    #[error("operation not supported: {0}")]
    Unsupported(String),
}

/// Result type for driver operations
pub type DriverResult<T> = Result<T, DriverError>;
