//! Motor driver boundary.
//!
//! All positions are machine coordinates in millimetres keyed by [`Axis`].
//! Drivers are synchronous; the motion layer above serializes access behind a
//! single lock and treats every call as a potential suspend point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::axis::{Axis, AxisMap};
use crate::errors::{DriverError, DriverResult};

/// Poll interval used by drivers while a pause is in effect.
pub const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Out-of-band pause/halt lines shared between a driver and its owner.
///
/// Clones share state, so the owner can pause or halt the controller while
/// another task holds the driver itself.
#[derive(Debug, Clone, Default)]
pub struct DriverControl {
    paused: Arc<AtomicBool>,
    halted: Arc<AtomicBool>,
}

impl DriverControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block the start of the next controller command.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Stop immediately; every subsequent command fails with [`DriverError::Halted`]
    /// until [`clear_halt`](Self::clear_halt) is called.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    pub fn clear_halt(&self) {
        self.halted.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Wait out a pause, then fail if halted.
    ///
    /// Drivers call this before issuing each command.
    pub fn gate(&self) -> DriverResult<()> {
        while self.is_paused() && !self.is_halted() {
            std::thread::sleep(PAUSE_POLL_INTERVAL);
        }
        if self.is_halted() {
            return Err(DriverError::Halted);
        }
        Ok(())
    }
}

/// Trait for gantry motor controllers.
///
/// Implemented by the G-code serial driver for real hardware and by
/// [`SimulatedDriver`](crate::SimulatedDriver) for tests.
pub trait MotorDriver: Send {
    /// Home the given axes and return the full position afterwards.
    fn home(&mut self, axes: &[Axis]) -> DriverResult<AxisMap>;

    /// Move the given axes to absolute targets.
    ///
    /// # Arguments
    /// * `target` - Absolute machine positions; axes not present are left alone
    /// * `home_flagged_axes` - Home any target axis the controller has flagged
    ///   as lost (after an alarm) before moving
    /// * `speed` - Feed rate in mm/s, or `None` for the controller default
    fn move_axes(
        &mut self,
        target: &AxisMap,
        home_flagged_axes: bool,
        speed: Option<f64>,
    ) -> DriverResult<()>;

    /// Move `axis` downward by up to `distance` until the probe triggers.
    ///
    /// Returns the full position at the trigger point.
    fn probe_axis(&mut self, axis: Axis, distance: f64) -> DriverResult<AxisMap>;

    /// Read the controller's current position.
    fn current_position(&mut self) -> DriverResult<AxisMap>;

    /// Set motor currents in amps for the given axes.
    fn set_active_current(&mut self, currents: &AxisMap) -> DriverResult<()>;

    /// Handle to this driver's pause/halt lines.
    fn control(&self) -> DriverControl;

    /// Sweep `axis` from `start` to `end` while sampling the capacitive sensor
    /// carried by the `sensor` mount axis.
    ///
    /// Returns evenly spaced samples covering the sweep, first sample at `start`.
    fn capacitive_sweep(
        &mut self,
        _sensor: Axis,
        axis: Axis,
        _start: f64,
        _end: f64,
        _speed: f64,
    ) -> DriverResult<Vec<f64>> {
        Err(DriverError::Unsupported(format!(
            "capacitive sweep on axis {axis}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_clones_share_state() {
        let control = DriverControl::new();
        let other = control.clone();

        other.halt();
        assert!(control.is_halted());
        assert!(matches!(control.gate(), Err(DriverError::Halted)));

        control.clear_halt();
        assert!(other.gate().is_ok());
    }

    #[test]
    fn test_gate_releases_on_resume() {
        let control = DriverControl::new();
        control.pause();

        let remote = control.clone();
        let resumer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            remote.resume();
        });

        assert!(control.gate().is_ok());
        assert!(!control.is_paused());
        resumer.join().unwrap();
    }
}
