//! robot-math - Transform and signal math for gantry calibration
//!
//! This crate provides the numeric building blocks used by the liquid-handler
//! motion core:
//!
//! - **Affine** - 4x4 homogeneous deck attitude transforms, inversion and
//!   three-point solving
//! - **Signal** - smoothing, finite differences and edge detection over
//!   sampled proximity sweeps

pub mod affine;
pub mod signal;

pub use affine::{
    apply_transform, identity_attitude, invert_attitude, round_to, solve_attitude,
    SingularMatrixError,
};
pub use signal::{finite_difference, find_sweep_edges, moving_average, SweepEdges, SweepError};
