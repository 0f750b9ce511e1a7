//! In-memory motion controller.
//!
//! Axis positions change instantly. Every command is appended to a shared log
//! so tests can assert on ordering, and faults can be injected through a
//! [`SimHandle`] after the driver has been handed to its owner.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use strum::IntoEnumIterator;
use tracing::debug;

use crate::axis::{Axis, AxisMap};
use crate::driver::{DriverControl, MotorDriver};
use crate::errors::{DriverError, DriverResult};

/// Spacing between capacitive samples during a sweep, mm.
pub const SWEEP_SAMPLE_SPACING_MM: f64 = 0.1;

/// Contact height (machine Z of the probed mount axis) at a machine XY, or
/// `None` where there is nothing to touch.
pub type ProbeSurface = Arc<dyn Fn(Axis, f64, f64) -> Option<f64> + Send + Sync>;

/// A command received by the simulated controller.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCommand {
    Home(Vec<Axis>),
    Move {
        target: AxisMap,
        speed: Option<f64>,
    },
    Probe {
        axis: Axis,
        distance: f64,
    },
    SetCurrent(AxisMap),
    Sweep {
        axis: Axis,
        start: f64,
        end: f64,
    },
}

struct SimState {
    position: AxisMap,
    home_position: AxisMap,
    limits: BTreeMap<Axis, (f64, f64)>,
    currents: AxisMap,
    flagged: BTreeSet<Axis>,
    log: Vec<DriverCommand>,
    fail_next_move: Option<String>,
    probe_surface: Option<ProbeSurface>,
}

/// Shared access to a [`SimulatedDriver`]'s state.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All commands received so far.
    pub fn commands(&self) -> Vec<DriverCommand> {
        self.state().log.clone()
    }

    /// Only the move targets received so far.
    pub fn moves(&self) -> Vec<AxisMap> {
        self.state()
            .log
            .iter()
            .filter_map(|c| match c {
                DriverCommand::Move { target, .. } => Some(target.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear_log(&self) {
        self.state().log.clear();
    }

    /// Make the next move fail with a controller alarm carrying `message`.
    pub fn fail_next_move(&self, message: impl Into<String>) {
        self.state().fail_next_move = Some(message.into());
    }

    pub fn set_probe_surface(&self, surface: ProbeSurface) {
        self.state().probe_surface = Some(surface);
    }

    pub fn position(&self) -> AxisMap {
        self.state().position.clone()
    }

    pub fn currents(&self) -> AxisMap {
        self.state().currents.clone()
    }

    pub fn flagged_axes(&self) -> BTreeSet<Axis> {
        self.state().flagged.clone()
    }
}

/// Simulated motion controller.
pub struct SimulatedDriver {
    handle: SimHandle,
    control: DriverControl,
}

impl SimulatedDriver {
    /// Create a simulated controller with the given home positions.
    ///
    /// Every axis starts flagged (unhomed) at zero. Gantry and mount travel is
    /// limited to `[min, home]`, with `min` taken from `lower_limits` or `-∞`.
    /// Plungers only honour their lower limit.
    pub fn new(home_position: AxisMap, lower_limits: AxisMap) -> Self {
        let mut limits = BTreeMap::new();
        for axis in Axis::iter() {
            let max = if axis.is_plunger() {
                f64::INFINITY
            } else {
                home_position.get(&axis).copied().unwrap_or(f64::INFINITY)
            };
            let min = lower_limits.get(&axis).copied().unwrap_or(f64::NEG_INFINITY);
            limits.insert(axis, (min, max));
        }
        let state = SimState {
            position: Axis::iter().map(|a| (a, 0.0)).collect(),
            home_position,
            limits,
            currents: AxisMap::new(),
            flagged: Axis::iter().collect(),
            log: Vec::new(),
            fail_next_move: None,
            probe_surface: None,
        };
        Self {
            handle: SimHandle {
                state: Arc::new(Mutex::new(state)),
            },
            control: DriverControl::new(),
        }
    }

    pub fn handle(&self) -> SimHandle {
        self.handle.clone()
    }
}

impl MotorDriver for SimulatedDriver {
    fn home(&mut self, axes: &[Axis]) -> DriverResult<AxisMap> {
        self.control.gate()?;
        let mut state = self.handle.state();
        state.log.push(DriverCommand::Home(axes.to_vec()));
        for axis in axes {
            let home = state.home_position.get(axis).copied().unwrap_or(0.0);
            state.position.insert(*axis, home);
            state.flagged.remove(axis);
        }
        debug!("sim: homed {axes:?}");
        Ok(state.position.clone())
    }

    fn move_axes(
        &mut self,
        target: &AxisMap,
        home_flagged_axes: bool,
        speed: Option<f64>,
    ) -> DriverResult<()> {
        self.control.gate()?;
        let mut state = self.handle.state();

        if home_flagged_axes {
            let lost: Vec<Axis> = target
                .keys()
                .copied()
                .filter(|a| state.flagged.contains(a))
                .collect();
            if !lost.is_empty() {
                state.log.push(DriverCommand::Home(lost.clone()));
                for axis in lost {
                    let home = state.home_position.get(&axis).copied().unwrap_or(0.0);
                    state.position.insert(axis, home);
                    state.flagged.remove(&axis);
                }
            }
        }

        state.log.push(DriverCommand::Move {
            target: target.clone(),
            speed,
        });

        if let Some(message) = state.fail_next_move.take() {
            state.flagged = Axis::iter().collect();
            return Err(DriverError::Alarm {
                command: "move".to_string(),
                message,
            });
        }

        for (axis, value) in target {
            let (min, max) = state.limits[axis];
            if *value < min - 1e-9 || *value > max + 1e-9 {
                return Err(DriverError::OutOfRange {
                    axis: *axis,
                    target: *value,
                    min,
                    max,
                });
            }
        }
        for (axis, value) in target {
            state.position.insert(*axis, *value);
        }
        Ok(())
    }

    fn probe_axis(&mut self, axis: Axis, distance: f64) -> DriverResult<AxisMap> {
        self.control.gate()?;
        let mut state = self.handle.state();
        state.log.push(DriverCommand::Probe { axis, distance });

        let start = state.position[&axis];
        let x = state.position[&Axis::X];
        let y = state.position[&Axis::Y];
        let contact = state
            .probe_surface
            .as_ref()
            .and_then(|surface| surface(axis, x, y));

        match contact {
            Some(z) if z <= start && z >= start - distance.abs() => {
                state.position.insert(axis, z);
                Ok(state.position.clone())
            }
            _ => {
                state.position.insert(axis, start - distance.abs());
                Err(DriverError::ProbeMissed { axis, distance })
            }
        }
    }

    fn current_position(&mut self) -> DriverResult<AxisMap> {
        self.control.gate()?;
        Ok(self.handle.state().position.clone())
    }

    fn set_active_current(&mut self, currents: &AxisMap) -> DriverResult<()> {
        self.control.gate()?;
        let mut state = self.handle.state();
        state.log.push(DriverCommand::SetCurrent(currents.clone()));
        for (axis, amps) in currents {
            state.currents.insert(*axis, *amps);
        }
        Ok(())
    }

    fn control(&self) -> DriverControl {
        self.control.clone()
    }

    fn capacitive_sweep(
        &mut self,
        sensor: Axis,
        axis: Axis,
        start: f64,
        end: f64,
        _speed: f64,
    ) -> DriverResult<Vec<f64>> {
        self.control.gate()?;
        if !axis.is_gantry() {
            return Err(DriverError::Unsupported(format!("sweep on axis {axis}")));
        }
        let mut state = self.handle.state();
        state.log.push(DriverCommand::Sweep { axis, start, end });

        let Some(surface) = state.probe_surface.clone() else {
            return Err(DriverError::Unsupported(
                "sweep without a probe surface".to_string(),
            ));
        };

        let height = state.position[&sensor];
        let n = ((end - start).abs() / SWEEP_SAMPLE_SPACING_MM).round() as usize + 1;
        let step = if n > 1 { (end - start) / (n - 1) as f64 } else { 0.0 };

        let samples = (0..n)
            .map(|i| {
                let p = start + step * i as f64;
                let (x, y) = match axis {
                    Axis::X => (p, state.position[&Axis::Y]),
                    _ => (state.position[&Axis::X], p),
                };
                let gap = surface(sensor, x, y)
                    .map(|z| (height - z).max(0.0))
                    .unwrap_or(f64::INFINITY);
                100.0 / (1.0 + gap)
            })
            .collect();

        state.position.insert(axis, end);
        Ok(samples)
    }
}
