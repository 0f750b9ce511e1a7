//! The robot session.
//!
//! [`Robot`] owns the deck, the pose graph, attached instruments and the
//! motion controller. Everything that moves hardware goes through one FIFO
//! async lock around the [`MotionController`]; bookkeeping sits behind a
//! short synchronous lock that is never held across an await point, so
//! lookups can proceed while a move is in flight.

mod calibrate;
mod pause;
mod pipetting;

pub use pause::{PauseGate, RunState};

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use hardware::{Axis, AxisMap, DriverControl, MotorDriver};
use strum::IntoEnumIterator;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::calibration::{CalibrationStore, InMemoryCalibrationStore};
use crate::config::RobotConfig;
use crate::deck::{Deck, DeckLayout, LabwareParent, Well};
use crate::error::{RobotError, RobotResult};
use crate::gantry::{GantryTransform, MotionController, PartialPoint};
use crate::labware::{BuiltinLabware, LabwareDefinition, LabwareProvider, FIXED_TRASH};
use crate::modules::{ModuleCommand, ModuleModel, ModuleState};
use crate::pipette::{FlowRates, Pipette, PipetteOverrides, PipetteRegistry, PlungerPositions};
use crate::planner::{MotionPlanner, MoveStrategy, TravelHeights, WaypointKind};
use crate::pose::{ObjectId, Pose, PoseGraph};
use crate::publisher::{CommandPayload, CommandPublisher};
use crate::tips::{TipSelector, TipTracker};
use crate::types::{CriticalPoint, Location, Mount, Point};

/// Pose-graph nodes for the two mounts.
#[derive(Debug, Clone, Copy)]
struct MountNodes {
    left: ObjectId,
    right: ObjectId,
}

impl MountNodes {
    fn get(&self, mount: Mount) -> ObjectId {
        match mount {
            Mount::Left => self.left,
            Mount::Right => self.right,
        }
    }
}

/// A pipette on a mount and everything tracked alongside it.
#[derive(Debug, Clone)]
struct Instrument {
    pipette: Pipette,
    /// Nozzle node, under the mount node
    node: ObjectId,
    /// Tip end node, under the nozzle node
    tip_node: Option<ObjectId>,
    calibration_offset: Point,
    tip_racks: TipSelector,
    /// Rack and well the attached tip came from
    last_tip: Option<(ObjectId, String)>,
}

struct RobotState {
    graph: PoseGraph,
    deck: Deck,
    gantry: ObjectId,
    mounts: MountNodes,
    instruments: BTreeMap<Mount, Instrument>,
    trackers: BTreeMap<ObjectId, TipTracker>,
    planner: MotionPlanner,
    /// Mount that made the last planned move
    last_mount: Option<Mount>,
}

impl RobotState {
    fn new(
        mut graph: PoseGraph,
        config: &RobotConfig,
        labware: &dyn LabwareProvider,
    ) -> RobotResult<Self> {
        let mut deck = Deck::new(DeckLayout::for_kind(config.deck), &mut graph)?;
        let trash = labware
            .definition(FIXED_TRASH, None, None)
            .ok_or_else(|| RobotError::DefinitionNotFound(FIXED_TRASH.to_string()))?;
        deck.load_trash(&mut graph, trash)?;

        let gantry = graph.allocate_id();
        graph.create_root_object(gantry, Point::zeros())?;
        let left = graph.allocate_id();
        graph.track_object(gantry, left, config.mount_offset(Mount::Left))?;
        let right = graph.allocate_id();
        graph.track_object(gantry, right, config.mount_offset(Mount::Right))?;

        Ok(Self {
            graph,
            deck,
            gantry,
            mounts: MountNodes { left, right },
            instruments: BTreeMap::new(),
            trackers: BTreeMap::new(),
            planner: MotionPlanner::new(),
            last_mount: None,
        })
    }

    fn instrument(&self, mount: Mount) -> RobotResult<&Instrument> {
        self.instruments
            .get(&mount)
            .ok_or(RobotError::NoInstrument { mount })
    }

    fn instrument_mut(&mut self, mount: Mount) -> RobotResult<&mut Instrument> {
        self.instruments
            .get_mut(&mount)
            .ok_or(RobotError::NoInstrument { mount })
    }

    fn pipette(&self, mount: Mount) -> RobotResult<&Pipette> {
        Ok(&self.instrument(mount)?.pipette)
    }

    fn pipette_mut(&mut self, mount: Mount) -> RobotResult<&mut Pipette> {
        Ok(&mut self.instrument_mut(mount)?.pipette)
    }

    /// Offset from a mount's reference point to one of its critical points.
    /// A bare mount has all critical points at its reference point.
    fn critical_point_offset(&self, mount: Mount, critical_point: CriticalPoint) -> RobotResult<Point> {
        let Some(instrument) = self.instruments.get(&mount) else {
            return Ok(Point::zeros());
        };
        let node = match critical_point {
            CriticalPoint::Mount => return Ok(Point::zeros()),
            CriticalPoint::Tip => instrument.tip_node.unwrap_or(instrument.node),
            CriticalPoint::Nozzle | CriticalPoint::CalibrationProbe => instrument.node,
        };
        let mount_position = self.graph.get(self.mounts.get(mount))?.position;
        let mut offset = self.graph.get(node)?.position - mount_position;
        if critical_point == CriticalPoint::CalibrationProbe {
            offset += instrument.pipette.critical_point_offset(critical_point);
        }
        Ok(offset)
    }

    /// Replace a pipette's calibration offset, moving its nozzle node.
    fn set_pipette_offset(&mut self, mount: Mount, offset: Point) -> RobotResult<()> {
        let instrument = self
            .instruments
            .get_mut(&mount)
            .ok_or(RobotError::NoInstrument { mount })?;
        instrument.calibration_offset = offset;
        let nominal = instrument.pipette.config().model_offset();
        self.graph.set_local_offset(instrument.node, nominal + offset)?;
        Ok(())
    }

    fn reset_liquid_state(&mut self) {
        for instrument in self.instruments.values_mut() {
            instrument.pipette.set_current_volume(0.0);
            instrument.pipette.set_ready_to_aspirate(false);
        }
    }
}

fn location_key(deck: &Deck, parent: &LabwareParent) -> RobotResult<String> {
    Ok(match parent {
        LabwareParent::Slot(name) => deck.layout().normalize(name)?,
        LabwareParent::Module(id) => {
            let module = deck.module(*id)?;
            format!("{}/{}", module.slot, module.model)
        }
        LabwareParent::Labware(below) => {
            let below = deck.labware(*below)?;
            format!("{}/{}", below.slot, below.definition.load_name())
        }
    })
}

/// A liquid-handling robot session.
pub struct Robot<D: MotorDriver> {
    config: RobotConfig,
    registry: PipetteRegistry,
    labware: Arc<dyn LabwareProvider>,
    store: Arc<dyn CalibrationStore>,
    motion: AsyncMutex<MotionController<D>>,
    state: Mutex<RobotState>,
    publisher: CommandPublisher,
    gate: PauseGate,
    control: DriverControl,
    halted: AtomicBool,
}

impl<D: MotorDriver> Robot<D> {
    /// A session with the built-in pipette models and labware and an
    /// in-memory calibration store.
    pub fn new(driver: D, config: RobotConfig) -> RobotResult<Self> {
        Self::with_components(
            driver,
            config,
            PipetteRegistry::builtin(),
            Arc::new(BuiltinLabware::new()),
            Arc::new(InMemoryCalibrationStore::new()),
        )
    }

    pub fn with_components(
        driver: D,
        config: RobotConfig,
        registry: PipetteRegistry,
        labware: Arc<dyn LabwareProvider>,
        store: Arc<dyn CalibrationStore>,
    ) -> RobotResult<Self> {
        config.validate()?;
        let attitude = match store.deck_attitude()? {
            Some(record) => {
                info!(
                    "Using {:?} deck attitude from {}",
                    record.source, record.last_modified
                );
                record.value
            }
            None => config.default_attitude(),
        };
        let transform = GantryTransform::new(
            attitude,
            config.mount_offset(Mount::Left),
            config.mount_offset(Mount::Right),
        )?;
        let control = driver.control();
        let motion = MotionController::new(
            driver,
            transform,
            config.home_position.clone(),
            config.default_speed,
        );
        let state = RobotState::new(PoseGraph::new(), &config, labware.as_ref())?;
        info!("Robot '{}' ready with {:?} deck", config.name, config.deck);

        Ok(Self {
            config,
            registry,
            labware,
            store,
            motion: AsyncMutex::new(motion),
            state: Mutex::new(state),
            publisher: CommandPublisher::new(),
            gate: PauseGate::new(),
            control,
            halted: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &RobotConfig {
        &self.config
    }

    pub fn publisher(&self) -> &CommandPublisher {
        &self.publisher
    }

    pub fn calibration_store(&self) -> &Arc<dyn CalibrationStore> {
        &self.store
    }

    fn lock_state(&self) -> MutexGuard<'_, RobotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut RobotState) -> RobotResult<T>) -> RobotResult<T> {
        f(&mut self.lock_state())
    }

    fn check_halted(&self) -> RobotResult<()> {
        if self.halted.load(Ordering::SeqCst) {
            return Err(RobotError::Halted);
        }
        Ok(())
    }

    /// Called before every motion step.
    async fn checkpoint(&self) -> RobotResult<()> {
        self.check_halted()?;
        self.gate.wait().await
    }

    /// Run `command` between before/after notifications.
    async fn published<T, F>(&self, payload: CommandPayload, command: F) -> RobotResult<T>
    where
        F: Future<Output = RobotResult<T>>,
    {
        self.publisher.before(&payload);
        let result = command.await;
        self.publisher.after(&payload, &result);
        result
    }

    /// Publish the mounts' current positions into the pose graph.
    fn sync_poses(&self, motion: &mut MotionController<D>) -> RobotResult<()> {
        let mut worlds = Vec::new();
        for mount in Mount::iter() {
            if motion.is_homed(&[Axis::X, Axis::Y, mount.z_axis()]) {
                worlds.push((mount, motion.mount_position(mount)?));
            }
        }
        let Some(&(first, first_world)) = worlds.first() else {
            return Ok(());
        };
        let gantry = first_world - motion.transform().mount_offset(first);
        self.with_state(|s| {
            s.graph.set_local_offset(s.gantry, gantry)?;
            for (mount, world) in &worlds {
                s.graph.set_local_offset(s.mounts.get(*mount), *world - gantry)?;
            }
            Ok(())
        })
    }

    // ---------------------------------------------------------------------
    // Run control
    // ---------------------------------------------------------------------

    /// Hold every command at its next motion step.
    pub fn pause(&self) {
        self.gate.pause();
    }

    pub fn resume(&self) {
        self.gate.resume();
    }

    /// Stop immediately. The in-flight move fails, waiting commands fail, and
    /// nothing else runs until [`reset`](Self::reset).
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
        self.control.halt();
        self.gate.halt();
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn run_state(&self) -> RunState {
        self.gate.state()
    }

    /// Clear the halt and forget the deck, instruments and homing state.
    pub async fn reset(&self) -> RobotResult<()> {
        let mut motion = self.motion.lock().await;
        self.control.clear_halt();
        motion.clear_homed();
        {
            let mut state = self.lock_state();
            let mut graph = std::mem::take(&mut state.graph);
            graph.clear_all();
            *state = RobotState::new(graph, &self.config, self.labware.as_ref())?;
        }
        self.halted.store(false, Ordering::SeqCst);
        self.gate.clear();
        info!("Robot reset; home before moving");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Motion
    // ---------------------------------------------------------------------

    /// Home every axis. Liquid state is unknown afterwards, so every pipette
    /// is emptied and must prime again before aspirating.
    pub async fn home(&self) -> RobotResult<()> {
        self.published(CommandPayload::new("home", "Homing"), async {
            self.checkpoint().await?;
            let mut motion = self.motion.lock().await;
            motion.home_all()?;
            self.with_state(|s| {
                s.reset_liquid_state();
                s.planner.clear();
                s.last_mount = None;
                Ok(())
            })?;
            self.sync_poses(&mut motion)
        })
        .await
    }

    /// Home specific axes.
    pub async fn home_axes(&self, axes: &[Axis]) -> RobotResult<()> {
        self.checkpoint().await?;
        let mut motion = self.motion.lock().await;
        motion.home(axes)?;
        self.with_state(|s| {
            for (mount, instrument) in s.instruments.iter_mut() {
                if axes.contains(&mount.plunger_axis()) {
                    instrument.pipette.set_current_volume(0.0);
                    instrument.pipette.set_ready_to_aspirate(false);
                }
            }
            if axes.iter().any(|a| a.is_gantry() || a.is_mount_z()) {
                s.planner.clear();
            }
            Ok(())
        })?;
        self.sync_poses(&mut motion)
    }

    /// Raise a mount to the top of its travel.
    pub async fn retract(&self, mount: Mount) -> RobotResult<()> {
        self.checkpoint().await?;
        let mut motion = self.motion.lock().await;
        motion.retract(mount)?;
        self.with_state(|s| {
            s.planner.clear();
            Ok(())
        })?;
        self.sync_poses(&mut motion)
    }

    /// Move a mount's active critical point to `location`.
    pub async fn move_to(
        &self,
        mount: Mount,
        location: Location,
        strategy: MoveStrategy,
        speed: Option<f64>,
    ) -> RobotResult<()> {
        let text = format!(
            "Moving {} to {}",
            mount,
            self.lock_state().deck.describe_location(&location)
        );
        let payload = CommandPayload::new("move_to", text)
            .mount(mount)
            .location(Some(location));
        self.published(payload, async {
            let mut motion = self.motion.lock().await;
            self.move_locked(&mut motion, mount, &location, strategy, speed)
                .await
        })
        .await
    }

    async fn move_locked(
        &self,
        motion: &mut MotionController<D>,
        mount: Mount,
        location: &Location,
        strategy: MoveStrategy,
        speed: Option<f64>,
    ) -> RobotResult<()> {
        self.checkpoint().await?;
        let (offset, deck_max_z, labware_max_z, retract) = self.with_state(|s| {
            if let Some(module) = location.labware.and_then(|id| s.deck.module_under(id)) {
                if !module.is_accessible() {
                    return Err(RobotError::ThermocyclerLidClosed);
                }
            }
            let offset = s.critical_point_offset(mount, CriticalPoint::Tip)?;
            let deck_max_z = s.deck.highest_z(&s.graph)?;
            let labware_max_z = location
                .labware
                .map(|id| s.graph.max_z_in_subtree(id))
                .transpose()?;
            let retract = s.last_mount.filter(|m| *m != mount);
            Ok((offset, deck_max_z, labware_max_z, retract))
        })?;

        if let Some(other) = retract {
            debug!("Retracting {} mount before moving {}", other, mount);
            motion.retract(other)?;
            self.with_state(|s| {
                s.planner.clear();
                Ok(())
            })?;
        }

        let origin = motion.mount_position(mount)? + offset;
        let heights = TravelHeights {
            deck_max_z,
            labware_max_z,
            robot_max_z: motion.max_mount_z(mount)? + offset.z,
            arc_clearance: self.config.arc_clearance,
            minimum_z_margin: self.config.minimum_z_margin,
        };
        let path = self.with_state(|s| Ok(s.planner.plan(mount, origin, location, strategy, &heights)))?;
        let speed = speed.or(Some(motion.default_speed()));

        for waypoint in &path {
            let target = waypoint.point - offset;
            let partial = match waypoint.kind {
                WaypointKind::Rise | WaypointKind::Descend => PartialPoint::z(target.z),
                WaypointKind::Lateral => PartialPoint::xy(target.x, target.y),
                WaypointKind::Direct => PartialPoint::xyz(target),
            };
            let step = match self.checkpoint().await {
                Ok(()) => motion.move_mount(mount, partial, speed).map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = step {
                self.with_state(|s| {
                    s.planner.clear();
                    s.last_mount = Some(mount);
                    Ok(())
                })?;
                return Err(e);
            }
        }

        self.with_state(|s| {
            s.planner.record(mount, *location);
            s.last_mount = Some(mount);
            Ok(())
        })?;
        self.sync_poses(motion)
    }

    /// Wait in place, e.g. to let liquid settle. Holds the motion lock so no
    /// other command moves meanwhile; a halt cuts the wait short.
    pub async fn delay(&self, duration: Duration) -> RobotResult<()> {
        let payload = CommandPayload::new(
            "delay",
            format!("Delaying for {:.3} s", duration.as_secs_f64()),
        );
        self.published(payload, async {
            let _motion = self.motion.lock().await;
            self.checkpoint().await?;
            tokio::select! {
                _ = tokio::time::sleep(duration) => Ok(()),
                _ = self.gate.halted() => Err(RobotError::Halted),
            }
        })
        .await
    }

    /// World position of a mount's critical point.
    pub async fn position(&self, mount: Mount, critical_point: CriticalPoint) -> RobotResult<Point> {
        let mut motion = self.motion.lock().await;
        let mount_world = motion.mount_position(mount)?;
        let offset = self.with_state(|s| s.critical_point_offset(mount, critical_point))?;
        Ok(mount_world + offset)
    }

    /// Machine axis positions, refreshed from the controller.
    pub async fn axis_positions(&self) -> RobotResult<AxisMap> {
        self.motion.lock().await.current_position(true)
    }

    // ---------------------------------------------------------------------
    // Deck
    // ---------------------------------------------------------------------

    /// Absolute pose of any tracked object.
    pub fn pose(&self, id: ObjectId) -> RobotResult<Pose> {
        self.with_state(|s| Ok(s.graph.get(id)?))
    }

    /// Absolute pose of the node a mount's tip (or nozzle) is tracked by.
    pub fn instrument_pose(&self, mount: Mount) -> RobotResult<Pose> {
        self.with_state(|s| {
            let instrument = s.instrument(mount)?;
            Ok(s.graph.get(instrument.tip_node.unwrap_or(instrument.node))?)
        })
    }

    pub fn deck_layout(&self) -> DeckLayout {
        self.lock_state().deck.layout().clone()
    }

    pub fn load_labware(&self, load_name: &str, parent: LabwareParent) -> RobotResult<ObjectId> {
        let definition = self
            .labware
            .definition(load_name, None, None)
            .ok_or_else(|| RobotError::DefinitionNotFound(load_name.to_string()))?;
        self.load_labware_definition(definition, parent)
    }

    pub fn load_labware_in_slot(&self, load_name: &str, slot: &str) -> RobotResult<ObjectId> {
        self.load_labware(load_name, LabwareParent::Slot(slot.to_string()))
    }

    /// Load a definition, applying any stored labware offset for its
    /// location. Tip racks get a full tip tracker.
    pub fn load_labware_definition(
        &self,
        definition: LabwareDefinition,
        parent: LabwareParent,
    ) -> RobotResult<ObjectId> {
        self.check_halted()?;
        self.with_state(|s| {
            let key = location_key(&s.deck, &parent)?;
            let offset = self
                .store
                .labware_offset(&definition.uri(), &key)?
                .map(|record| record.value)
                .unwrap_or_else(Point::zeros);
            let tracker = definition.is_tiprack().then(|| {
                (
                    definition.display_name().to_string(),
                    definition.ordering.clone(),
                )
            });

            let id = s.deck.load_labware(&mut s.graph, definition, parent, offset)?;
            if let Some((name, ordering)) = tracker {
                s.trackers.insert(id, TipTracker::new(id, name, &ordering));
            }
            Ok(id)
        })
    }

    /// Remove a labware, anything stacked on it, and its tip state.
    pub fn unload_labware(&self, id: ObjectId) -> RobotResult<Vec<ObjectId>> {
        self.with_state(|s| {
            let removed = s.deck.unload_labware(&mut s.graph, id)?;
            for gone in &removed {
                s.trackers.remove(gone);
            }
            for instrument in s.instruments.values_mut() {
                let racks: Vec<ObjectId> = instrument
                    .tip_racks
                    .racks()
                    .iter()
                    .copied()
                    .filter(|r| !removed.contains(r))
                    .collect();
                if racks.len() != instrument.tip_racks.racks().len() {
                    instrument.tip_racks.set_racks(racks);
                }
            }
            s.planner.clear();
            Ok(removed)
        })
    }

    pub fn well(&self, labware: ObjectId, name: &str) -> RobotResult<Well> {
        self.with_state(|s| s.deck.well(&s.graph, labware, name))
    }

    pub fn wells(&self, labware: ObjectId) -> RobotResult<Vec<Well>> {
        self.with_state(|s| s.deck.wells(&s.graph, labware))
    }

    pub fn trash_location(&self) -> RobotResult<Location> {
        self.with_state(|s| s.deck.trash_location(&s.graph))
    }

    pub fn describe_location(&self, location: &Location) -> String {
        self.lock_state().deck.describe_location(location)
    }

    // ---------------------------------------------------------------------
    // Modules
    // ---------------------------------------------------------------------

    pub fn load_module(&self, model: ModuleModel, slot: &str) -> RobotResult<ObjectId> {
        self.check_halted()?;
        self.with_state(|s| s.deck.load_module(&mut s.graph, model, slot))
    }

    pub fn module_command(&self, module: ObjectId, command: ModuleCommand) -> RobotResult<()> {
        self.check_halted()?;
        let payload = CommandPayload::new("module", format!("Module {module}: {command:?}"));
        self.publisher.before(&payload);
        let result = self.with_state(|s| s.deck.module_mut(module)?.apply(command));
        self.publisher.after(&payload, &result);
        result
    }

    pub fn module_state(&self, module: ObjectId) -> RobotResult<ModuleState> {
        self.with_state(|s| Ok(s.deck.module(module)?.state().clone()))
    }

    // ---------------------------------------------------------------------
    // Instruments
    // ---------------------------------------------------------------------

    /// Attach a pipette. The mount must be empty and every tip rack must be
    /// a loaded tip rack. A stored pipette offset is applied.
    pub fn load_instrument(
        &self,
        model: &str,
        mount: Mount,
        tip_racks: &[ObjectId],
        overrides: &PipetteOverrides,
    ) -> RobotResult<()> {
        self.check_halted()?;
        self.with_state(|s| {
            if let Some(existing) = s.instruments.get(&mount) {
                return Err(RobotError::MountOccupied {
                    mount,
                    model: existing.pipette.model().to_string(),
                });
            }
            for rack in tip_racks {
                let labware = s.deck.labware(*rack)?;
                if !labware.definition.is_tiprack() {
                    return Err(RobotError::NotATipRack(labware.describe()));
                }
            }

            let pipette = self.registry.create_instrument(model, mount, overrides)?;
            let offset = self
                .store
                .pipette_offset(pipette.id(), mount)?
                .map(|record| record.value)
                .unwrap_or_else(Point::zeros);
            let node = s.graph.allocate_id();
            s.graph.track_object(
                s.mounts.get(mount),
                node,
                pipette.config().model_offset() + offset,
            )?;
            info!(
                "Loaded {} ({}) on {} mount, offset ({:.3}, {:.3}, {:.3})",
                pipette.model(),
                pipette.id(),
                mount,
                offset.x,
                offset.y,
                offset.z
            );

            s.instruments.insert(
                mount,
                Instrument {
                    pipette,
                    node,
                    tip_node: None,
                    calibration_offset: offset,
                    tip_racks: TipSelector::new(tip_racks.to_vec(), self.config.tip_exhaustion),
                    last_tip: None,
                },
            );
            Ok(())
        })
    }

    /// Detach and return the pipette on `mount`.
    pub fn unload_instrument(&self, mount: Mount) -> RobotResult<Pipette> {
        self.with_state(|s| {
            let instrument = s
                .instruments
                .remove(&mount)
                .ok_or(RobotError::NoInstrument { mount })?;
            s.graph.remove_object(instrument.node)?;
            if s.planner.previous(mount).is_some() {
                s.planner.clear();
            }
            info!("Unloaded {} from {} mount", instrument.pipette.model(), mount);
            Ok(instrument.pipette)
        })
    }

    /// Snapshot of the pipette on `mount`.
    pub fn pipette(&self, mount: Mount) -> RobotResult<Pipette> {
        self.with_state(|s| Ok(s.pipette(mount)?.clone()))
    }

    pub fn pipette_offset(&self, mount: Mount) -> RobotResult<Point> {
        self.with_state(|s| Ok(s.instrument(mount)?.calibration_offset))
    }

    pub fn set_flow_rates(&self, mount: Mount, rates: FlowRates) -> RobotResult<()> {
        self.with_state(|s| {
            s.pipette_mut(mount)?.set_flow_rates(rates);
            Ok(())
        })
    }

    pub fn update_plunger_positions(&self, mount: Mount, positions: PlungerPositions) -> RobotResult<()> {
        self.with_state(|s| s.pipette_mut(mount)?.update_plunger_positions(positions))
    }

    pub fn set_tip_racks(&self, mount: Mount, racks: &[ObjectId]) -> RobotResult<()> {
        self.with_state(|s| {
            for rack in racks {
                if !s.trackers.contains_key(rack) {
                    let labware = s.deck.labware(*rack)?;
                    return Err(RobotError::NotATipRack(labware.describe()));
                }
            }
            s.instrument_mut(mount)?.tip_racks.set_racks(racks.to_vec());
            Ok(())
        })
    }

    /// Start automatic tip selection for `mount` at `well` of `rack`.
    pub fn set_starting_tip(&self, mount: Mount, rack: ObjectId, well: &str) -> RobotResult<()> {
        self.with_state(|s| {
            let tracker = s
                .trackers
                .get(&rack)
                .ok_or_else(|| RobotError::NotATipRack(rack.to_string()))?;
            if !tracker.has_tip(well) {
                let labware = s.deck.labware(rack)?;
                return Err(RobotError::TipMissing {
                    labware: labware.describe(),
                    well: well.to_string(),
                });
            }
            s.instrument_mut(mount)?.tip_racks.set_starting_tip(rack, well);
            Ok(())
        })
    }

    pub fn tip_tracker(&self, rack: ObjectId) -> RobotResult<TipTracker> {
        self.with_state(|s| {
            s.trackers
                .get(&rack)
                .cloned()
                .ok_or_else(|| RobotError::NotATipRack(rack.to_string()))
        })
    }

    /// Mark every loaded tip rack full.
    pub fn reset_tipracks(&self) {
        for tracker in self.lock_state().trackers.values_mut() {
            tracker.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labware::FIXED_TRASH;
    use approx::assert_relative_eq;
    use hardware::SimulatedDriver;

    fn robot() -> Robot<SimulatedDriver> {
        let config = RobotConfig::default();
        let driver = SimulatedDriver::new(config.home_position.clone(), config.lower_limits.clone());
        Robot::new(driver, config).unwrap()
    }

    #[tokio::test]
    async fn test_moves_require_home() {
        let robot = robot();
        let err = robot
            .move_to(
                Mount::Right,
                Location::new(Point::new(100.0, 100.0, 100.0)),
                MoveStrategy::Direct,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RobotError::MustHome { .. }));
    }

    #[tokio::test]
    async fn test_home_publishes_mount_poses() {
        let robot = robot();
        robot.home().await.unwrap();
        let right = robot.position(Mount::Right, CriticalPoint::Mount).await.unwrap();
        assert_relative_eq!(right, Point::new(418.0, 353.0, 218.0));

        let gantry_pose = robot.with_state(|s| Ok(s.graph.get(s.mounts.get(Mount::Left))?)).unwrap();
        assert_relative_eq!(gantry_pose.position, Point::new(384.0, 353.0, 218.0));
    }

    #[test]
    fn test_trash_is_loaded_and_mount_exclusive() {
        let robot = robot();
        let trash = robot.with_state(|s| Ok(s.deck.trash())).unwrap().unwrap();
        assert_eq!(
            robot.with_state(|s| Ok(s.deck.labware(trash)?.definition.load_name().to_string())).unwrap(),
            FIXED_TRASH
        );

        robot
            .load_instrument("p300_single_v2.0", Mount::Left, &[], &PipetteOverrides::default())
            .unwrap();
        let err = robot
            .load_instrument("p20_single_v2.0", Mount::Left, &[], &PipetteOverrides::default())
            .unwrap_err();
        assert!(matches!(err, RobotError::MountOccupied { mount: Mount::Left, .. }));
    }

    #[test]
    fn test_non_tiprack_rejected_as_tip_rack() {
        let robot = robot();
        let plate = robot
            .load_labware_in_slot("corning_96_wellplate_360ul_flat", "2")
            .unwrap();
        let err = robot
            .load_instrument("p300_single_v2.0", Mount::Right, &[plate], &PipetteOverrides::default())
            .unwrap_err();
        assert!(matches!(err, RobotError::NotATipRack(_)));
    }

    #[tokio::test]
    async fn test_halt_then_reset() {
        let robot = robot();
        robot.home().await.unwrap();
        robot.halt();
        assert!(matches!(robot.home().await, Err(RobotError::Halted)));
        assert!(matches!(
            robot.load_labware_in_slot("nest_12_reservoir_15ml", "1"),
            Err(RobotError::Halted)
        ));

        robot.reset().await.unwrap();
        assert!(!robot.is_halted());
        // Homing state is gone after a reset
        let err = robot.position(Mount::Left, CriticalPoint::Mount).await.unwrap_err();
        assert!(matches!(err, RobotError::MustHome { .. }));
        robot.home().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_waits_and_halt_cuts_it_short() {
        let robot = Arc::new(robot());
        let started = tokio::time::Instant::now();
        robot.delay(Duration::from_secs(30)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(30));

        let waiter = {
            let robot = robot.clone();
            tokio::spawn(async move { robot.delay(Duration::from_secs(600)).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        robot.halt();
        assert!(matches!(waiter.await.unwrap(), Err(RobotError::Halted)));
        assert!(started.elapsed() < Duration::from_secs(600));
    }

    #[test]
    fn test_stored_labware_offset_applied_on_load() {
        let robot = robot();
        let definition = robot
            .labware
            .definition("corning_96_wellplate_360ul_flat", None, None)
            .unwrap();
        robot
            .calibration_store()
            .save_labware_offset(
                &definition.uri(),
                "2",
                Point::new(0.5, -0.5, 0.25),
                crate::calibration::CalibrationSource::User,
            )
            .unwrap();

        let plate = robot.load_labware_in_slot("corning_96_wellplate_360ul_flat", "2").unwrap();
        let shifted = robot.well(plate, "A1").unwrap();

        let plain = self::robot();
        let plate = plain.load_labware_in_slot("corning_96_wellplate_360ul_flat", "2").unwrap();
        let nominal = plain.well(plate, "A1").unwrap();
        assert_relative_eq!(
            shifted.top_center,
            nominal.top_center + Point::new(0.5, -0.5, 0.25),
            epsilon = 1e-9
        );
    }
}
