//! Gantry kinematics and the motion controller.
//!
//! World (deck) coordinates are converted to machine coordinates with the
//! deck attitude: `machine = attitude * (world - mount_offset)`. The
//! [`MotionController`] owns the motor driver and keeps a cache of the last
//! known axis positions, which is dropped whenever a move fails.

use std::collections::BTreeSet;

use hardware::{Axis, AxisMap, DriverError, MotorDriver};
use nalgebra::Matrix4;
use robot_math::{apply_transform, invert_attitude, SingularMatrixError};
use tracing::{debug, info, warn};

use crate::error::{RobotError, RobotResult};
use crate::types::{Mount, Point};

/// Which way [`GantryTransform::translate`] converts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformDirection {
    WorldToMachine,
    MachineToWorld,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GantryTransform {
    attitude: Matrix4<f64>,
    inverse: Matrix4<f64>,
    left_offset: Point,
    right_offset: Point,
}

impl GantryTransform {
    pub fn new(
        attitude: Matrix4<f64>,
        left_offset: Point,
        right_offset: Point,
    ) -> Result<Self, SingularMatrixError> {
        let inverse = invert_attitude(&attitude)?;
        Ok(Self {
            attitude,
            inverse,
            left_offset,
            right_offset,
        })
    }

    pub fn attitude(&self) -> &Matrix4<f64> {
        &self.attitude
    }

    /// Same mount offsets, new attitude.
    pub fn with_attitude(&self, attitude: Matrix4<f64>) -> Result<Self, SingularMatrixError> {
        Self::new(attitude, self.left_offset, self.right_offset)
    }

    pub fn mount_offset(&self, mount: Mount) -> Point {
        match mount {
            Mount::Left => self.left_offset,
            Mount::Right => self.right_offset,
        }
    }

    pub fn world_to_machine(&self, world: Point, mount: Mount) -> Point {
        apply_transform(&self.attitude, world - self.mount_offset(mount))
    }

    pub fn machine_to_world(&self, machine: Point, mount: Mount) -> Point {
        apply_transform(&self.inverse, machine) + self.mount_offset(mount)
    }

    pub fn translate(&self, point: Point, mount: Mount, direction: TransformDirection) -> Point {
        match direction {
            TransformDirection::WorldToMachine => self.world_to_machine(point, mount),
            TransformDirection::MachineToWorld => self.machine_to_world(point, mount),
        }
    }
}

/// A target where omitted axes keep their current value.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PartialPoint {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
}

impl PartialPoint {
    pub fn xyz(point: Point) -> Self {
        Self {
            x: Some(point.x),
            y: Some(point.y),
            z: Some(point.z),
        }
    }

    pub fn xy(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            z: None,
        }
    }

    pub fn z(z: f64) -> Self {
        Self {
            z: Some(z),
            ..Self::default()
        }
    }

    pub fn resolve(&self, current: Point) -> Point {
        Point::new(
            self.x.unwrap_or(current.x),
            self.y.unwrap_or(current.y),
            self.z.unwrap_or(current.z),
        )
    }

    fn has_xy(&self) -> bool {
        self.x.is_some() || self.y.is_some()
    }
}

fn axis_value(position: &AxisMap, axis: Axis) -> f64 {
    position.get(&axis).copied().unwrap_or(0.0)
}

pub struct MotionController<D: MotorDriver> {
    driver: D,
    transform: GantryTransform,
    home_position: AxisMap,
    position: Option<AxisMap>,
    homed: BTreeSet<Axis>,
    default_speed: f64,
}

impl<D: MotorDriver> MotionController<D> {
    pub fn new(driver: D, transform: GantryTransform, home_position: AxisMap, default_speed: f64) -> Self {
        Self {
            driver,
            transform,
            home_position,
            position: None,
            homed: BTreeSet::new(),
            default_speed,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn transform(&self) -> &GantryTransform {
        &self.transform
    }

    pub fn set_transform(&mut self, transform: GantryTransform) {
        self.transform = transform;
    }

    pub fn default_speed(&self) -> f64 {
        self.default_speed
    }

    pub fn is_homed(&self, axes: &[Axis]) -> bool {
        axes.iter().all(|a| self.homed.contains(a))
    }

    fn require_homed(&self, axes: impl IntoIterator<Item = Axis>) -> RobotResult<()> {
        let missing: Vec<Axis> = axes.into_iter().filter(|a| !self.homed.contains(a)).collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(RobotError::MustHome { axes: missing })
        }
    }

    /// Forget the cached position; the next read goes to the controller.
    pub fn invalidate(&mut self) {
        if self.position.take().is_some() {
            debug!("Position cache invalidated");
        }
    }

    /// Forget homing state, e.g. after a halt.
    pub fn clear_homed(&mut self) {
        self.homed.clear();
        self.invalidate();
    }

    pub fn cached_position(&self) -> Option<&AxisMap> {
        self.position.as_ref()
    }

    /// Axis positions, from the cache unless `refresh` or the cache is empty.
    pub fn current_position(&mut self, refresh: bool) -> RobotResult<AxisMap> {
        if !refresh {
            if let Some(position) = &self.position {
                return Ok(position.clone());
            }
        }
        match self.driver.current_position() {
            Ok(position) => {
                self.position = Some(position.clone());
                Ok(position)
            }
            Err(e) => {
                self.invalidate();
                Err(e.into())
            }
        }
    }

    fn fail<T>(&mut self, error: DriverError) -> RobotResult<T> {
        warn!("Driver error, dropping cached position: {}", error);
        self.invalidate();
        if !matches!(error, DriverError::OutOfRange { .. }) {
            // The controller flags axes it loses track of; mirror that.
            self.homed.clear();
        }
        Err(error.into())
    }

    pub fn home(&mut self, axes: &[Axis]) -> RobotResult<AxisMap> {
        info!("Homing {:?}", axes);
        match self.driver.home(axes) {
            Ok(position) => {
                self.homed.extend(axes.iter().copied());
                self.position = Some(position.clone());
                Ok(position)
            }
            Err(e) => self.fail(e),
        }
    }

    /// Home mounts first so nothing drags across the deck, then the gantry,
    /// then plungers.
    pub fn home_all(&mut self) -> RobotResult<AxisMap> {
        self.home(&[Axis::Z, Axis::A])?;
        self.home(&[Axis::X, Axis::Y])?;
        self.home(&[Axis::B, Axis::C])
    }

    /// Move the given axes. Every target axis must be homed.
    pub fn move_axes(&mut self, target: &AxisMap, speed: Option<f64>) -> RobotResult<()> {
        self.require_homed(target.keys().copied())?;
        let mut current = self.current_position(false)?;
        match self.driver.move_axes(target, false, speed) {
            Ok(()) => {
                for (axis, value) in target {
                    current.insert(*axis, *value);
                }
                self.position = Some(current);
                Ok(())
            }
            Err(e) => self.fail(e),
        }
    }

    /// Machine coordinates of a mount as `(X, Y, mount Z)`.
    pub fn machine_point(&mut self, mount: Mount) -> RobotResult<Point> {
        let position = self.current_position(false)?;
        Ok(Point::new(
            axis_value(&position, Axis::X),
            axis_value(&position, Axis::Y),
            axis_value(&position, mount.z_axis()),
        ))
    }

    /// World position of a mount's reference point.
    pub fn mount_position(&mut self, mount: Mount) -> RobotResult<Point> {
        self.require_homed([Axis::X, Axis::Y, mount.z_axis()])?;
        let machine = self.machine_point(mount)?;
        Ok(self.transform.machine_to_world(machine, mount))
    }

    /// Highest world z the mount reference point can reach.
    pub fn max_mount_z(&mut self, mount: Mount) -> RobotResult<f64> {
        let mut machine = self.machine_point(mount)?;
        machine.z = axis_value(&self.home_position, mount.z_axis());
        Ok(self.transform.machine_to_world(machine, mount).z)
    }

    /// Move a mount's reference point in world coordinates.
    ///
    /// The XY leg runs first and the Z leg second. Axes with no requested
    /// value are not commanded at all, so they cannot drift through the
    /// world/machine round trip.
    pub fn move_mount(&mut self, mount: Mount, target: PartialPoint, speed: Option<f64>) -> RobotResult<Point> {
        let z_axis = mount.z_axis();
        self.require_homed([Axis::X, Axis::Y, z_axis])?;

        let machine_now = self.machine_point(mount)?;
        let world_now = self.transform.machine_to_world(machine_now, mount);
        let world_target = target.resolve(world_now);
        let machine_target = self.transform.world_to_machine(world_target, mount);
        let z_max = axis_value(&self.home_position, z_axis);

        if target.has_xy() {
            let mut xy = AxisMap::new();
            xy.insert(Axis::X, machine_target.x);
            xy.insert(Axis::Y, machine_target.y);
            self.move_axes(&xy, speed)?;
        }
        if target.z.is_some() {
            let mut z = AxisMap::new();
            z.insert(z_axis, machine_target.z.min(z_max));
            self.move_axes(&z, speed)?;
        }
        self.mount_position(mount)
    }

    /// Raise a mount to its home height.
    pub fn retract(&mut self, mount: Mount) -> RobotResult<()> {
        let z_axis = mount.z_axis();
        if !self.homed.contains(&z_axis) {
            return self.home(&[z_axis]).map(|_| ());
        }
        let mut target = AxisMap::new();
        target.insert(z_axis, axis_value(&self.home_position, z_axis));
        self.move_axes(&target, None)
    }

    pub fn move_plunger(&mut self, mount: Mount, position: f64, speed: Option<f64>) -> RobotResult<()> {
        let mut target = AxisMap::new();
        target.insert(mount.plunger_axis(), position);
        self.move_axes(&target, speed)
    }

    pub fn set_current(&mut self, currents: &AxisMap) -> RobotResult<()> {
        match self.driver.set_active_current(currents) {
            Ok(()) => Ok(()),
            Err(e) => self.fail(e),
        }
    }

    /// Lower a mount until its probe makes contact. Returns the world
    /// position of the mount at contact, or `None` if nothing was touched
    /// within `distance`.
    pub fn probe(&mut self, mount: Mount, distance: f64) -> RobotResult<Option<Point>> {
        let z_axis = mount.z_axis();
        self.require_homed([Axis::X, Axis::Y, z_axis])?;
        match self.driver.probe_axis(z_axis, distance) {
            Ok(position) => {
                self.position = Some(position);
                Ok(Some(self.mount_position(mount)?))
            }
            Err(DriverError::ProbeMissed { .. }) => {
                self.invalidate();
                Ok(None)
            }
            Err(e) => self.fail(e),
        }
    }

    /// Sweep one gantry axis between two world coordinates while reading the
    /// capacitive sensor on `mount`. Returns samples and the world coordinate
    /// of each.
    pub fn sweep(
        &mut self,
        mount: Mount,
        axis: Axis,
        world_start: f64,
        world_end: f64,
        speed: f64,
    ) -> RobotResult<(Vec<f64>, Vec<f64>)> {
        let pick = |p: Point| if axis == Axis::X { p.x } else { p.y };
        let with_axis = |mut p: Point, v: f64| {
            if axis == Axis::X {
                p.x = v;
            } else {
                p.y = v;
            }
            p
        };

        let world_now = self.mount_position(mount)?;
        let start = self.transform.world_to_machine(with_axis(world_now, world_start), mount);
        let end = self.transform.world_to_machine(with_axis(world_now, world_end), mount);
        self.move_mount(mount, PartialPoint::xyz(with_axis(world_now, world_start)), None)?;

        let samples = match self
            .driver
            .capacitive_sweep(mount.z_axis(), axis, pick(start), pick(end), speed)
        {
            Ok(samples) => samples,
            Err(e) => return self.fail(e),
        };
        self.invalidate();

        let n = samples.len();
        let positions = (0..n)
            .map(|i| {
                let t = if n > 1 { i as f64 / (n - 1) as f64 } else { 0.0 };
                let machine = start + (end - start) * t;
                pick(self.transform.machine_to_world(machine, mount))
            })
            .collect();
        Ok((samples, positions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use hardware::{DriverCommand, SimulatedDriver};
    use robot_math::identity_attitude;

    fn home_position() -> AxisMap {
        [
            (Axis::X, 418.0),
            (Axis::Y, 353.0),
            (Axis::Z, 218.0),
            (Axis::A, 218.0),
            (Axis::B, 19.0),
            (Axis::C, 19.0),
        ]
        .into_iter()
        .collect()
    }

    fn skewed() -> Matrix4<f64> {
        #[rustfmt::skip]
        let m = Matrix4::new(
            1.0,   0.002, 0.0, 1.5,
            -0.003, 1.0,  0.0, -2.0,
            0.0,   0.0,   1.0, 0.4,
            0.0,   0.0,   0.0, 1.0,
        );
        m
    }

    fn controller(attitude: Matrix4<f64>) -> (MotionController<SimulatedDriver>, hardware::SimHandle) {
        let driver = SimulatedDriver::new(home_position(), AxisMap::new());
        let handle = driver.handle();
        let transform =
            GantryTransform::new(attitude, Point::new(-34.0, 0.0, 0.0), Point::zeros()).unwrap();
        (MotionController::new(driver, transform, home_position(), 400.0), handle)
    }

    #[test]
    fn test_round_trip_transform() {
        let transform =
            GantryTransform::new(skewed(), Point::new(-34.0, 0.0, 0.0), Point::zeros()).unwrap();
        let world = Point::new(120.0, 80.0, 40.0);
        for mount in [Mount::Left, Mount::Right] {
            let machine = transform.translate(world, mount, TransformDirection::WorldToMachine);
            let back = transform.translate(machine, mount, TransformDirection::MachineToWorld);
            assert_relative_eq!(back, world, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_moves_require_homing() {
        let (mut motion, _) = controller(identity_attitude());
        let err = motion
            .move_mount(Mount::Right, PartialPoint::z(50.0), None)
            .unwrap_err();
        assert!(matches!(err, RobotError::MustHome { .. }));
    }

    #[test]
    fn test_home_all_order() {
        let (mut motion, handle) = controller(identity_attitude());
        motion.home_all().unwrap();
        let homes: Vec<Vec<Axis>> = handle
            .commands()
            .into_iter()
            .filter_map(|c| match c {
                DriverCommand::Home(axes) => Some(axes),
                _ => None,
            })
            .collect();
        assert_eq!(
            homes,
            vec![vec![Axis::Z, Axis::A], vec![Axis::X, Axis::Y], vec![Axis::B, Axis::C]]
        );
    }

    #[test]
    fn test_xy_before_z_and_no_drift() {
        let (mut motion, handle) = controller(skewed());
        motion.home_all().unwrap();
        let before = motion.machine_point(Mount::Left).unwrap();
        handle.clear_log();

        motion
            .move_mount(Mount::Left, PartialPoint::z(100.0), None)
            .unwrap();
        let after = motion.machine_point(Mount::Left).unwrap();
        // Only Z was commanded, so X and Y are bit-identical
        assert_eq!(after.x, before.x);
        assert_eq!(after.y, before.y);

        handle.clear_log();
        motion
            .move_mount(Mount::Left, PartialPoint::xyz(Point::new(100.0, 100.0, 50.0)), None)
            .unwrap();
        let moves = handle.moves();
        assert_eq!(moves.len(), 2);
        assert!(moves[0].contains_key(&Axis::X) && !moves[0].contains_key(&Axis::Z));
        assert!(moves[1].contains_key(&Axis::Z) && !moves[1].contains_key(&Axis::X));

        let world = motion.mount_position(Mount::Left).unwrap();
        assert_relative_eq!(world, Point::new(100.0, 100.0, 50.0), epsilon = 1e-9);
    }

    #[test]
    fn test_failure_invalidates_cache_and_homing() {
        let (mut motion, handle) = controller(identity_attitude());
        motion.home_all().unwrap();
        assert!(motion.cached_position().is_some());

        handle.fail_next_move("stall");
        assert!(motion
            .move_mount(Mount::Right, PartialPoint::z(10.0), None)
            .is_err());
        assert!(motion.cached_position().is_none());
        assert!(!motion.is_homed(&[Axis::A]));
    }

    #[test]
    fn test_z_is_clamped_to_home() {
        let (mut motion, _) = controller(identity_attitude());
        motion.home_all().unwrap();
        let pos = motion
            .move_mount(Mount::Right, PartialPoint::z(500.0), None)
            .unwrap();
        assert_relative_eq!(pos.z, 218.0);
        assert_relative_eq!(motion.max_mount_z(Mount::Right).unwrap(), 218.0);
    }
}
