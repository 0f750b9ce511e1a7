//! Liquid handling and tip commands.
//!
//! Every public command holds the motion lock for its whole duration, so a
//! command's moves are never interleaved with another command's. Composite
//! commands (mix, return_tip) run their parts through the locked variants
//! and still publish each part.

use hardware::{Axis, AxisMap, MotorDriver};
use tracing::{debug, warn};

use super::Robot;
use crate::deck::Well;
use crate::error::{RobotError, RobotResult};
use crate::gantry::{MotionController, PartialPoint};
use crate::pipette::{PipetteQuirk, PlungerAction, TipGeometry};
use crate::planner::MoveStrategy;
use crate::pose::ObjectId;
use crate::publisher::CommandPayload;
use crate::types::{CriticalPoint, Location, Mount, Point};

/// Height the mount rises after a tip shake.
const SHAKE_RISE: f64 = 20.0;
/// Bounds on the lateral shake distance.
const SHAKE_MIN: f64 = 1.0;
const SHAKE_MAX: f64 = 2.25;

/// Everything needed to pick up a particular tip.
struct TipPick {
    rack: ObjectId,
    well: Well,
    tip: TipGeometry,
    /// Mount z offset to the nozzle before the tip is on
    nozzle_offset: Point,
}

impl<D: MotorDriver> Robot<D> {
    fn well_for(&self, location: &Location) -> RobotResult<Option<Well>> {
        self.with_state(|s| {
            location
                .well
                .map(|id| s.deck.well_by_id(&s.graph, id))
                .transpose()
        })
    }

    fn payload(&self, name: &'static str, mount: Mount, text: String) -> CommandPayload {
        CommandPayload::new(name, text).mount(mount)
    }

    fn describe_target(&self, location: &Option<Location>) -> String {
        location
            .as_ref()
            .map(|l| self.describe_location(l))
            .unwrap_or_else(|| "the current position".to_string())
    }

    fn set_axis_current(
        &self,
        motion: &mut MotionController<D>,
        axis: Axis,
        amps: f64,
    ) -> RobotResult<()> {
        let currents: AxisMap = [(axis, amps)].into_iter().collect();
        motion.set_current(&currents)
    }

    fn default_current(&self, axis: Axis) -> Option<f64> {
        self.config.default_currents.get(&axis).copied()
    }

    /// Drive the plunger to its bottom stop so the next aspirate starts from
    /// a known point.
    async fn prime_locked(&self, motion: &mut MotionController<D>, mount: Mount) -> RobotResult<()> {
        let (bottom, amps) = self.with_state(|s| {
            let pipette = s.pipette(mount)?;
            Ok((pipette.plunger_positions().bottom, pipette.config().plunger_current))
        })?;
        self.checkpoint().await?;
        self.set_axis_current(motion, mount.plunger_axis(), amps)?;
        motion.move_plunger(mount, bottom, None)?;
        self.with_state(|s| {
            s.pipette_mut(mount)?.set_ready_to_aspirate(true);
            Ok(())
        })
    }

    // ---------------------------------------------------------------------
    // Aspirate / dispense
    // ---------------------------------------------------------------------

    /// Aspirate `volume` µL (everything that fits when `None`) at `location`,
    /// or in place. `rate` scales the configured aspirate flow rate.
    pub async fn aspirate(
        &self,
        mount: Mount,
        volume: Option<f64>,
        location: Option<Location>,
        rate: f64,
    ) -> RobotResult<()> {
        let text = format!(
            "Aspirating {} from {} at {:.2}x speed",
            volume.map_or("to capacity".to_string(), |v| format!("{v:.2} uL")),
            self.describe_target(&location),
            rate
        );
        let mut payload = self.payload("aspirate", mount, text).location(location).rate(rate);
        if let Some(volume) = volume {
            payload = payload.volume(volume);
        }
        self.published(payload, async {
            let mut motion = self.motion.lock().await;
            self.aspirate_locked(&mut motion, mount, volume, location, rate)
                .await
        })
        .await
    }

    async fn aspirate_locked(
        &self,
        motion: &mut MotionController<D>,
        mount: Mount,
        volume: Option<f64>,
        location: Option<Location>,
        rate: f64,
    ) -> RobotResult<()> {
        let (volume, ready) = self.with_state(|s| {
            let pipette = s.pipette(mount)?;
            pipette.require_tip()?;
            Ok((pipette.resolve_aspirate_volume(volume)?, pipette.ready_to_aspirate()))
        })?;

        let result = async {
            if !ready {
                match &location {
                    Some(location) => {
                        let top = match self.well_for(location)? {
                            Some(well) => well.top(0.0),
                            None => *location,
                        };
                        self.move_locked(motion, mount, &top, MoveStrategy::Arc, None)
                            .await?;
                    }
                    None => warn!(
                        "{} pipette priming in place; it may already be in liquid",
                        mount
                    ),
                }
                self.prime_locked(motion, mount).await?;
            }
            if let Some(location) = &location {
                self.move_locked(motion, mount, location, MoveStrategy::Arc, None)
                    .await?;
            }

            let (target, speed, amps) = self.with_state(|s| {
                let pipette = s.pipette(mount)?;
                let target = pipette
                    .plunger_position(pipette.current_volume() + volume, PlungerAction::Aspirate);
                let speed = pipette
                    .plunger_speed(pipette.flow_rates().aspirate * rate, PlungerAction::Aspirate);
                Ok((target, speed, pipette.config().plunger_current))
            })?;
            self.checkpoint().await?;
            self.set_axis_current(motion, mount.plunger_axis(), amps)?;
            motion.move_plunger(mount, target, Some(speed))
        }
        .await;

        self.with_state(|s| {
            let pipette = s.pipette_mut(mount)?;
            match &result {
                Ok(()) => pipette.add_current_volume(volume),
                Err(_) => pipette.set_current_volume(0.0),
            }
            Ok(())
        })?;
        result
    }

    /// Dispense `volume` µL (everything held when `None`) at `location`, or
    /// in place. Requests beyond what is held are clamped.
    pub async fn dispense(
        &self,
        mount: Mount,
        volume: Option<f64>,
        location: Option<Location>,
        rate: f64,
    ) -> RobotResult<()> {
        let text = format!(
            "Dispensing {} into {} at {:.2}x speed",
            volume.map_or("everything".to_string(), |v| format!("{v:.2} uL")),
            self.describe_target(&location),
            rate
        );
        let mut payload = self.payload("dispense", mount, text).location(location).rate(rate);
        if let Some(volume) = volume {
            payload = payload.volume(volume);
        }
        self.published(payload, async {
            let mut motion = self.motion.lock().await;
            self.dispense_locked(&mut motion, mount, volume, location, rate)
                .await
        })
        .await
    }

    async fn dispense_locked(
        &self,
        motion: &mut MotionController<D>,
        mount: Mount,
        volume: Option<f64>,
        location: Option<Location>,
        rate: f64,
    ) -> RobotResult<()> {
        let volume = self.with_state(|s| {
            let pipette = s.pipette(mount)?;
            pipette.require_tip()?;
            pipette.resolve_dispense_volume(volume)
        })?;

        let result = async {
            if let Some(location) = &location {
                self.move_locked(motion, mount, location, MoveStrategy::Arc, None)
                    .await?;
            }
            let (target, speed, amps) = self.with_state(|s| {
                let pipette = s.pipette(mount)?;
                let target = pipette
                    .plunger_position(pipette.current_volume() - volume, PlungerAction::Dispense);
                let speed = pipette
                    .plunger_speed(pipette.flow_rates().dispense * rate, PlungerAction::Dispense);
                Ok((target, speed, pipette.config().plunger_current))
            })?;
            self.checkpoint().await?;
            self.set_axis_current(motion, mount.plunger_axis(), amps)?;
            motion.move_plunger(mount, target, Some(speed))
        }
        .await;

        self.with_state(|s| {
            let pipette = s.pipette_mut(mount)?;
            match &result {
                Ok(()) => pipette.remove_current_volume(volume),
                Err(_) => pipette.set_current_volume(0.0),
            }
            Ok(())
        })?;
        result
    }

    /// Push the plunger past the bottom stop to empty the tip. The pipette
    /// is left empty and unprimed whether or not the move succeeds.
    pub async fn blow_out(&self, mount: Mount, location: Option<Location>) -> RobotResult<()> {
        let text = format!("Blowing out at {}", self.describe_target(&location));
        let payload = self.payload("blow_out", mount, text).location(location);
        self.published(payload, async {
            let mut motion = self.motion.lock().await;
            self.blow_out_locked(&mut motion, mount, location).await
        })
        .await
    }

    async fn blow_out_locked(
        &self,
        motion: &mut MotionController<D>,
        mount: Mount,
        location: Option<Location>,
    ) -> RobotResult<()> {
        self.with_state(|s| s.pipette(mount)?.require_tip().map(|_| ()))?;

        let result = async {
            if let Some(location) = &location {
                self.move_locked(motion, mount, location, MoveStrategy::Arc, None)
                    .await?;
            }
            let (target, speed, amps) = self.with_state(|s| {
                let pipette = s.pipette(mount)?;
                let speed = pipette
                    .plunger_speed(pipette.flow_rates().blow_out, PlungerAction::BlowOut);
                Ok((
                    pipette.plunger_positions().blow_out,
                    speed,
                    pipette.config().plunger_current,
                ))
            })?;
            self.checkpoint().await?;
            self.set_axis_current(motion, mount.plunger_axis(), amps)?;
            motion.move_plunger(mount, target, Some(speed))
        }
        .await;

        self.with_state(|s| {
            let pipette = s.pipette_mut(mount)?;
            pipette.set_current_volume(0.0);
            pipette.set_ready_to_aspirate(false);
            Ok(())
        })?;
        result
    }

    /// Aspirate and dispense `repetitions` times at `location`, ending with a
    /// dispense. Zero repetitions does nothing.
    pub async fn mix(
        &self,
        mount: Mount,
        repetitions: usize,
        volume: Option<f64>,
        location: Option<Location>,
        rate: f64,
    ) -> RobotResult<()> {
        if repetitions == 0 {
            debug!("Mix with zero repetitions; nothing to do");
            return Ok(());
        }
        let volume = match volume {
            Some(volume) => volume,
            None => self.with_state(|s| Ok(s.pipette(mount)?.available_volume()))?,
        };
        let text = format!(
            "Mixing {} times with a volume of {:.2} uL at {}",
            repetitions,
            volume,
            self.describe_target(&location)
        );
        let payload = self
            .payload("mix", mount, text)
            .location(location)
            .volume(volume)
            .rate(rate);
        self.published(payload, async {
            let mut motion = self.motion.lock().await;
            let aspirate = |location: Option<Location>| {
                self.payload("aspirate", mount, format!("Aspirating {volume:.2} uL"))
                    .location(location)
                    .volume(volume)
                    .rate(rate)
            };
            let dispense = || {
                self.payload("dispense", mount, format!("Dispensing {volume:.2} uL"))
                    .volume(volume)
                    .rate(rate)
            };

            self.published(
                aspirate(location),
                self.aspirate_locked(&mut motion, mount, Some(volume), location, rate),
            )
            .await?;
            for _ in 1..repetitions {
                self.published(
                    dispense(),
                    self.dispense_locked(&mut motion, mount, Some(volume), None, rate),
                )
                .await?;
                self.published(
                    aspirate(None),
                    self.aspirate_locked(&mut motion, mount, Some(volume), None, rate),
                )
                .await?;
            }
            self.published(
                dispense(),
                self.dispense_locked(&mut motion, mount, Some(volume), None, rate),
            )
            .await
        })
        .await
    }

    // ---------------------------------------------------------------------
    // Touch tip / air gap
    // ---------------------------------------------------------------------

    /// Touch the tip against the four sides of a well, `v_offset` mm from its
    /// top. `radius` is the fraction of the well's half-width to travel.
    /// Without a location the previous well is used.
    pub async fn touch_tip(
        &self,
        mount: Mount,
        location: Option<Location>,
        radius: f64,
        v_offset: f64,
        speed: f64,
    ) -> RobotResult<()> {
        let text = format!("Touching tip at {}", self.describe_target(&location));
        let payload = self.payload("touch_tip", mount, text).location(location);
        self.published(payload, async {
            let mut motion = self.motion.lock().await;
            let target = match location {
                Some(location) => location,
                None => self
                    .with_state(|s| Ok(s.planner.previous(mount).copied()))?
                    .ok_or(RobotError::NoPreviousLocation { mount })?,
            };
            let well = self.well_for(&target)?.ok_or_else(|| RobotError::UnknownWell {
                labware: self.describe_location(&target),
                well: "(none)".to_string(),
            })?;
            self.with_state(|s| s.pipette(mount)?.require_tip().map(|_| ()))?;

            let center = well.top(v_offset);
            self.move_locked(&mut motion, mount, &center, MoveStrategy::Arc, None)
                .await?;
            let dx = well.geometry.width() / 2.0 * radius;
            let dy = well.geometry.length() / 2.0 * radius;
            let sides = [
                Point::new(dx, 0.0, 0.0),
                Point::new(-dx, 0.0, 0.0),
                Point::new(0.0, dy, 0.0),
                Point::new(0.0, -dy, 0.0),
            ];
            for side in sides {
                self.move_locked(
                    &mut motion,
                    mount,
                    &center.moved(side),
                    MoveStrategy::Direct,
                    Some(speed),
                )
                .await?;
            }
            self.move_locked(&mut motion, mount, &center, MoveStrategy::Direct, Some(speed))
                .await
        })
        .await
    }

    /// Draw air into the tip from `height` mm above the previous well.
    pub async fn air_gap(&self, mount: Mount, volume: Option<f64>, height: f64) -> RobotResult<()> {
        let text = format!(
            "Air gap of {}",
            volume.map_or("the remaining capacity".to_string(), |v| format!("{v:.2} uL"))
        );
        let mut payload = self.payload("air_gap", mount, text);
        if let Some(volume) = volume {
            payload = payload.volume(volume);
        }
        self.published(payload, async {
            let mut motion = self.motion.lock().await;
            self.with_state(|s| s.pipette(mount)?.require_tip().map(|_| ()))?;
            let previous = self
                .with_state(|s| Ok(s.planner.previous(mount).copied()))?
                .ok_or(RobotError::NoPreviousLocation { mount })?;
            let well = self
                .well_for(&previous)?
                .ok_or(RobotError::NoPreviousLocation { mount })?;
            self.move_locked(&mut motion, mount, &well.top(height), MoveStrategy::Arc, None)
                .await?;
            self.aspirate_locked(&mut motion, mount, volume, None, 1.0)
                .await
        })
        .await
    }

    // ---------------------------------------------------------------------
    // Tips
    // ---------------------------------------------------------------------

    /// Choose the tip to pick up and work out its geometry.
    fn plan_pick_up(&self, mount: Mount, location: Option<Location>) -> RobotResult<TipPick> {
        self.with_state(|s| {
            let instrument = s.instrument(mount)?;
            if instrument.pipette.has_tip() {
                return Err(RobotError::TipAttached { mount });
            }
            let channels = instrument.pipette.channels();
            let pipette_id = instrument.pipette.id().to_string();

            let (rack, well) = match location {
                Some(location) => {
                    let well_id = location.well.ok_or_else(|| {
                        RobotError::NotATipRack(s.deck.describe_location(&location))
                    })?;
                    let well = s.deck.well_by_id(&s.graph, well_id)?;
                    let tracker = s.trackers.get(&well.labware).ok_or_else(|| {
                        RobotError::NotATipRack(s.deck.describe_location(&location))
                    })?;
                    tracker.check_pick(&well.name, channels)?;
                    (well.labware, well)
                }
                None => {
                    let selector = instrument.tip_racks.clone();
                    let (rack, name) = selector.next(&mut s.trackers, channels)?;
                    (rack, s.deck.well(&s.graph, rack, &name)?)
                }
            };

            let definition = &s.deck.labware(rack)?.definition;
            let pipette = &s.instrument(mount)?.pipette;
            let rack_length = definition.tip_length().ok_or_else(|| {
                RobotError::NotATipRack(definition.display_name().to_string())
            })?;
            let overlap = definition
                .tip_overlap()
                .unwrap_or(pipette.config().default_tip_overlap);
            let length = match self
                .store
                .tip_length(&pipette_id, &definition.definition_hash())?
            {
                Some(record) => {
                    debug!("Using calibrated tip length {:.3}", record.value);
                    record.value - overlap
                }
                None => pipette.effective_tip_length(rack_length, Some(overlap)),
            };
            let tip = TipGeometry {
                length,
                diameter: well.diameter().unwrap_or_else(|| well.geometry.width()),
                max_volume: well.geometry.total_liquid_volume,
            };
            let nozzle_offset = s.critical_point_offset(mount, CriticalPoint::Nozzle)?;
            Ok(TipPick {
                rack,
                well,
                tip,
                nozzle_offset,
            })
        })
    }

    /// Lateral wiggle then a rise, to shake off neighbouring or stuck tips.
    fn shake(&self, motion: &mut MotionController<D>, mount: Mount, diameter: f64) -> RobotResult<()> {
        let distance = (diameter / 2.0).clamp(SHAKE_MIN, SHAKE_MAX);
        let here = motion.mount_position(mount)?;
        for x in [here.x - distance, here.x + distance, here.x] {
            motion.move_mount(mount, PartialPoint::xy(x, here.y), None)?;
        }
        motion.move_mount(mount, PartialPoint::z(here.z + SHAKE_RISE), None)?;
        Ok(())
    }

    /// Pick up a tip from `location`, or the next available tip in the
    /// mount's tip racks. Press count and depth increment default to the
    /// pipette's settings.
    pub async fn pick_up_tip(
        &self,
        mount: Mount,
        location: Option<Location>,
        presses: Option<usize>,
        increment: Option<f64>,
    ) -> RobotResult<()> {
        let text = format!("Picking up tip from {}", self.describe_target(&location));
        let payload = self.payload("pick_up_tip", mount, text).location(location);
        self.published(payload, async {
            let mut motion = self.motion.lock().await;
            self.pick_up_tip_locked(&mut motion, mount, location, presses, increment)
                .await
        })
        .await
    }

    pub(super) async fn pick_up_tip_locked(
        &self,
        motion: &mut MotionController<D>,
        mount: Mount,
        location: Option<Location>,
        presses: Option<usize>,
        increment: Option<f64>,
    ) -> RobotResult<()> {
        let pick = self.plan_pick_up(mount, location)?;
        let (settings, channels, shake) = self.with_state(|s| {
            let pipette = s.pipette(mount)?;
            Ok((
                pipette.pick_up_settings(),
                pipette.channels(),
                pipette.config().has_quirk(PipetteQuirk::PickupTipShake),
            ))
        })?;
        let presses = presses.unwrap_or(settings.presses);
        let increment = increment.unwrap_or(settings.increment);

        let top = pick.well.top(0.0);
        self.move_locked(motion, mount, &top, MoveStrategy::Arc, None)
            .await?;

        let z_axis = mount.z_axis();
        let mount_top = top.point.z - pick.nozzle_offset.z;
        self.set_axis_current(motion, z_axis, settings.current_per_channel * channels as f64)?;
        let pressed = async {
            for press in 0..presses {
                self.checkpoint().await?;
                let depth = settings.distance + increment * press as f64;
                debug!("Pick-up press {} to {:.3} mm", press + 1, depth);
                motion.move_mount(mount, PartialPoint::z(mount_top - depth), Some(settings.speed))?;
                motion.move_mount(mount, PartialPoint::z(mount_top), None)?;
            }
            Ok::<(), RobotError>(())
        }
        .await;
        let restored = match self.default_current(z_axis) {
            Some(amps) => self.set_axis_current(motion, z_axis, amps),
            None => Ok(()),
        };
        pressed?;
        restored?;

        self.with_state(|s| {
            if let Some(tracker) = s.trackers.get_mut(&pick.rack) {
                tracker.use_tips(&pick.well.name, channels)?;
            }
            let tip_id = s.graph.allocate_id();
            let instrument = s.instrument_mut(mount)?;
            instrument.pipette.add_tip(pick.tip)?;
            instrument.tip_node = Some(tip_id);
            instrument.last_tip = Some((pick.rack, pick.well.name.clone()));
            let node = instrument.node;
            s.graph
                .track_object(node, tip_id, Point::new(0.0, 0.0, -pick.tip.length))?;
            Ok(())
        })?;

        self.checkpoint().await?;
        if shake {
            self.shake(motion, mount, pick.tip.diameter)?;
        } else {
            let here = motion.mount_position(mount)?;
            motion.move_mount(mount, PartialPoint::z(here.z + SHAKE_RISE), None)?;
        }
        self.with_state(|s| {
            s.planner.clear();
            Ok(())
        })?;
        self.prime_locked(motion, mount).await
    }

    /// Eject the tip at `location`, or into the trash. With `home_after` the
    /// plunger is homed afterwards so the ejector fully retracts.
    pub async fn drop_tip(
        &self,
        mount: Mount,
        location: Option<Location>,
        home_after: bool,
    ) -> RobotResult<()> {
        let text = format!(
            "Dropping tip into {}",
            location
                .as_ref()
                .map(|l| self.describe_location(l))
                .unwrap_or_else(|| "the trash".to_string())
        );
        let payload = self.payload("drop_tip", mount, text).location(location);
        self.published(payload, async {
            let mut motion = self.motion.lock().await;
            self.drop_tip_locked(&mut motion, mount, location, home_after)
                .await
        })
        .await
    }

    async fn drop_tip_locked(
        &self,
        motion: &mut MotionController<D>,
        mount: Mount,
        location: Option<Location>,
        home_after: bool,
    ) -> RobotResult<()> {
        let (positions, config, diameter) = self.with_state(|s| {
            let pipette = s.pipette(mount)?;
            let tip = pipette.require_tip()?;
            Ok((pipette.plunger_positions(), pipette.config().clone(), tip.diameter))
        })?;
        let target = match location {
            Some(location) => location,
            None => self.trash_location()?,
        };

        let plunger = mount.plunger_axis();
        let result = async {
            self.move_locked(motion, mount, &target, MoveStrategy::Arc, None)
                .await?;
            self.checkpoint().await?;
            self.set_axis_current(motion, plunger, config.plunger_current)?;
            motion.move_plunger(mount, positions.bottom, None)?;
            self.set_axis_current(motion, plunger, config.drop_tip_current)?;
            motion.move_plunger(mount, positions.drop_tip, Some(config.drop_tip_speed))?;
            self.set_axis_current(motion, plunger, config.plunger_current)?;

            if config.has_quirk(PipetteQuirk::DropTipShake) {
                self.shake(motion, mount, diameter)?;
            }
            self.checkpoint().await?;
            if home_after {
                motion.home(&[plunger])?;
            } else {
                motion.move_plunger(mount, positions.bottom, None)?;
            }
            Ok::<(), RobotError>(())
        }
        .await;

        self.with_state(|s| {
            match &result {
                Ok(()) => {
                    let instrument = s.instrument_mut(mount)?;
                    instrument.pipette.remove_tip()?;
                    instrument.last_tip = None;
                    let tip_node = instrument.tip_node.take();
                    if let Some(tip_node) = tip_node {
                        s.graph.remove_object(tip_node)?;
                    }
                    s.planner.clear();
                }
                Err(_) => s.pipette_mut(mount)?.set_current_volume(0.0),
            }
            Ok(())
        })?;
        result
    }

    /// Put the attached tip back where it was picked up and mark that well
    /// full again.
    pub async fn return_tip(&self, mount: Mount, home_after: bool) -> RobotResult<()> {
        let payload = self.payload("return_tip", mount, "Returning tip".to_string());
        self.published(payload, async {
            let mut motion = self.motion.lock().await;
            let (rack, name, channels, drop_at) = self.with_state(|s| {
                let instrument = s.instrument(mount)?;
                let tip = instrument.pipette.require_tip()?;
                let (rack, name) = instrument
                    .last_tip
                    .clone()
                    .ok_or(RobotError::UnknownTipOrigin { mount })?;
                let height = instrument.pipette.config().return_tip_height * tip.length;
                let channels = instrument.pipette.channels();
                let well = s.deck.well(&s.graph, rack, &name)?;
                Ok((rack, name, channels, well.top(-height)))
            })?;

            let text = format!("Dropping tip into {}", self.describe_location(&drop_at));
            self.published(
                self.payload("drop_tip", mount, text).location(Some(drop_at)),
                self.drop_tip_locked(&mut motion, mount, Some(drop_at), home_after),
            )
            .await?;

            self.with_state(|s| match s.trackers.get_mut(&rack) {
                Some(tracker) => tracker.return_tips(&name, channels),
                None => Ok(()),
            })
        })
        .await
    }
}
