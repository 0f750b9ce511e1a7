//! Synchronous access to a [`Robot`].
//!
//! [`BlockingRobot`] owns a small tokio runtime and drives the async session
//! on it, so scripts and tools without their own executor can call robot
//! commands as ordinary blocking functions. Pause, resume and halt never
//! wait on the runtime and can be called from any thread while a command is
//! running.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use hardware::{Axis, MotorDriver};
use nalgebra::Matrix4;
use tokio::runtime::{Builder, Runtime};

use crate::calibration::ProbeMethod;
use crate::config::RobotConfig;
use crate::deck::{LabwareParent, Well};
use crate::error::{RobotError, RobotResult};
use crate::modules::{ModuleCommand, ModuleModel};
use crate::pipette::{Pipette, PipetteOverrides};
use crate::planner::MoveStrategy;
use crate::pose::ObjectId;
use crate::robot::{Robot, RunState};
use crate::types::{CriticalPoint, Location, Mount, Point};

pub struct BlockingRobot<D: MotorDriver + 'static> {
    runtime: Runtime,
    robot: Arc<Robot<D>>,
}

impl<D: MotorDriver + 'static> BlockingRobot<D> {
    pub fn new(driver: D, config: RobotConfig) -> RobotResult<Self> {
        Self::from_robot(Robot::new(driver, config)?)
    }

    pub fn from_robot(robot: Robot<D>) -> RobotResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("robot-core")
            .enable_all()
            .build()?;
        Ok(Self {
            runtime,
            robot: Arc::new(robot),
        })
    }

    /// The async session, for callers that also run their own executor.
    pub fn robot(&self) -> &Arc<Robot<D>> {
        &self.robot
    }

    /// Run a command on the robot's runtime and wait for it.
    pub fn run<T, F, Fut>(&self, command: F) -> RobotResult<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Robot<D>>) -> Fut,
        Fut: Future<Output = RobotResult<T>> + Send + 'static,
    {
        let task = self.runtime.spawn(command(self.robot.clone()));
        self.runtime
            .block_on(task)
            .map_err(|e| RobotError::Task(e.to_string()))?
    }

    pub fn pause(&self) {
        self.robot.pause();
    }

    pub fn resume(&self) {
        self.robot.resume();
    }

    pub fn halt(&self) {
        self.robot.halt();
    }

    pub fn is_halted(&self) -> bool {
        self.robot.is_halted()
    }

    pub fn run_state(&self) -> RunState {
        self.robot.run_state()
    }

    pub fn reset(&self) -> RobotResult<()> {
        self.run(|robot| async move { robot.reset().await })
    }

    pub fn home(&self) -> RobotResult<()> {
        self.run(|robot| async move { robot.home().await })
    }

    pub fn home_axes(&self, axes: &[Axis]) -> RobotResult<()> {
        let axes = axes.to_vec();
        self.run(|robot| async move { robot.home_axes(&axes).await })
    }

    pub fn retract(&self, mount: Mount) -> RobotResult<()> {
        self.run(move |robot| async move { robot.retract(mount).await })
    }

    pub fn move_to(
        &self,
        mount: Mount,
        location: Location,
        strategy: MoveStrategy,
        speed: Option<f64>,
    ) -> RobotResult<()> {
        self.run(move |robot| async move { robot.move_to(mount, location, strategy, speed).await })
    }

    pub fn delay(&self, duration: Duration) -> RobotResult<()> {
        self.run(move |robot| async move { robot.delay(duration).await })
    }

    pub fn position(&self, mount: Mount, critical_point: CriticalPoint) -> RobotResult<Point> {
        self.run(move |robot| async move { robot.position(mount, critical_point).await })
    }

    pub fn load_labware(&self, load_name: &str, parent: LabwareParent) -> RobotResult<ObjectId> {
        self.robot.load_labware(load_name, parent)
    }

    pub fn load_labware_in_slot(&self, load_name: &str, slot: &str) -> RobotResult<ObjectId> {
        self.robot.load_labware_in_slot(load_name, slot)
    }

    pub fn load_module(&self, model: ModuleModel, slot: &str) -> RobotResult<ObjectId> {
        self.robot.load_module(model, slot)
    }

    pub fn module_command(&self, module: ObjectId, command: ModuleCommand) -> RobotResult<()> {
        self.robot.module_command(module, command)
    }

    pub fn load_instrument(
        &self,
        model: &str,
        mount: Mount,
        tip_racks: &[ObjectId],
        overrides: &PipetteOverrides,
    ) -> RobotResult<()> {
        self.robot.load_instrument(model, mount, tip_racks, overrides)
    }

    pub fn pipette(&self, mount: Mount) -> RobotResult<Pipette> {
        self.robot.pipette(mount)
    }

    pub fn well(&self, labware: ObjectId, name: &str) -> RobotResult<Well> {
        self.robot.well(labware, name)
    }

    pub fn aspirate(
        &self,
        mount: Mount,
        volume: Option<f64>,
        location: Option<Location>,
        rate: f64,
    ) -> RobotResult<()> {
        self.run(move |robot| async move { robot.aspirate(mount, volume, location, rate).await })
    }

    pub fn dispense(
        &self,
        mount: Mount,
        volume: Option<f64>,
        location: Option<Location>,
        rate: f64,
    ) -> RobotResult<()> {
        self.run(move |robot| async move { robot.dispense(mount, volume, location, rate).await })
    }

    pub fn blow_out(&self, mount: Mount, location: Option<Location>) -> RobotResult<()> {
        self.run(move |robot| async move { robot.blow_out(mount, location).await })
    }

    pub fn mix(
        &self,
        mount: Mount,
        repetitions: usize,
        volume: Option<f64>,
        location: Option<Location>,
        rate: f64,
    ) -> RobotResult<()> {
        self.run(move |robot| async move {
            robot.mix(mount, repetitions, volume, location, rate).await
        })
    }

    pub fn touch_tip(
        &self,
        mount: Mount,
        location: Option<Location>,
        radius: f64,
        v_offset: f64,
        speed: f64,
    ) -> RobotResult<()> {
        self.run(move |robot| async move {
            robot.touch_tip(mount, location, radius, v_offset, speed).await
        })
    }

    pub fn air_gap(&self, mount: Mount, volume: Option<f64>, height: f64) -> RobotResult<()> {
        self.run(move |robot| async move { robot.air_gap(mount, volume, height).await })
    }

    pub fn pick_up_tip(
        &self,
        mount: Mount,
        location: Option<Location>,
        presses: Option<usize>,
        increment: Option<f64>,
    ) -> RobotResult<()> {
        self.run(move |robot| async move {
            robot.pick_up_tip(mount, location, presses, increment).await
        })
    }

    pub fn drop_tip(&self, mount: Mount, location: Option<Location>, home_after: bool) -> RobotResult<()> {
        self.run(move |robot| async move { robot.drop_tip(mount, location, home_after).await })
    }

    pub fn return_tip(&self, mount: Mount, home_after: bool) -> RobotResult<()> {
        self.run(move |robot| async move { robot.return_tip(mount, home_after).await })
    }

    pub fn calibrate_pipette_offset(
        &self,
        mount: Mount,
        slot: &str,
        method: ProbeMethod,
    ) -> RobotResult<Point> {
        let slot = slot.to_string();
        self.run(move |robot| async move {
            robot.calibrate_pipette_offset(mount, &slot, method).await
        })
    }

    pub fn calibrate_tip_length(
        &self,
        mount: Mount,
        tiprack: ObjectId,
        reference: Point,
    ) -> RobotResult<f64> {
        self.run(move |robot| async move {
            robot.calibrate_tip_length(mount, tiprack, reference).await
        })
    }

    pub fn calibrate_deck(&self, mount: Mount, method: ProbeMethod) -> RobotResult<Matrix4<f64>> {
        self.run(move |robot| async move { robot.calibrate_deck(mount, method).await })
    }
}
