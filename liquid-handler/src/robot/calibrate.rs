//! Calibration commands on a live robot.
//!
//! The search routines in [`crate::calibration`] run against a
//! [`RobotProbe`], which turns critical-point coordinates into mount moves.
//! Each command puts back the offsets that were in effect if the
//! measurement fails.

use hardware::MotorDriver;
use nalgebra::Matrix4;
use robot_math::identity_attitude;
use tracing::{info, warn};

use super::Robot;
use crate::calibration::{self, DeckPoint, ProbeMethod, SurfaceProbe, SweepAxis};
use crate::error::{RobotError, RobotResult};
use crate::gantry::{MotionController, PartialPoint};
use crate::pose::ObjectId;
use crate::publisher::CommandPayload;
use crate::types::{CriticalPoint, Mount, Point};

/// Probes with one mount's critical point.
struct RobotProbe<'a, D: MotorDriver> {
    motion: &'a mut MotionController<D>,
    mount: Mount,
    /// Critical point relative to the mount reference point
    offset: Point,
    speed: f64,
    sweep_speed: f64,
}

impl<D: MotorDriver> RobotProbe<'_, D> {
    /// Bring the critical point to `(x, y, z)`, rising first so lateral moves
    /// never drag across the deck.
    fn approach(&mut self, x: f64, y: f64, z: f64) -> RobotResult<()> {
        let mount_z = z - self.offset.z;
        let here = self.motion.mount_position(self.mount)?;
        if here.z < mount_z {
            self.motion
                .move_mount(self.mount, PartialPoint::z(mount_z), None)?;
        }
        self.motion.move_mount(
            self.mount,
            PartialPoint::xy(x - self.offset.x, y - self.offset.y),
            None,
        )?;
        self.motion
            .move_mount(self.mount, PartialPoint::z(mount_z), Some(self.speed))?;
        Ok(())
    }
}

impl<D: MotorDriver> SurfaceProbe for RobotProbe<'_, D> {
    fn probe_z(&mut self, x: f64, y: f64, start_z: f64, distance: f64) -> RobotResult<Option<f64>> {
        self.approach(x, y, start_z)?;
        Ok(self
            .motion
            .probe(self.mount, distance)?
            .map(|contact| contact.z + self.offset.z))
    }

    fn sweep(
        &mut self,
        axis: SweepAxis,
        fixed: Point,
        start: f64,
        end: f64,
    ) -> RobotResult<(Vec<f64>, Vec<f64>)> {
        let begin = axis.with_component(fixed, start);
        self.approach(begin.x, begin.y, fixed.z)?;
        let shift = axis.component(&self.offset);
        let (samples, positions) = self.motion.sweep(
            self.mount,
            axis.hardware_axis(),
            start - shift,
            end - shift,
            self.sweep_speed,
        )?;
        Ok((samples, positions.into_iter().map(|p| p + shift).collect()))
    }
}

impl<D: MotorDriver> Robot<D> {
    fn probe<'a>(
        &self,
        motion: &'a mut MotionController<D>,
        mount: Mount,
        offset: Point,
    ) -> RobotProbe<'a, D> {
        RobotProbe {
            motion,
            mount,
            offset,
            speed: self.config.calibration.probe_speed_mm_s,
            sweep_speed: self.config.calibration.sweep_speed_mm_s,
        }
    }

    /// Critical point used to probe: the tip when one is on, otherwise the
    /// calibration probe.
    fn probing_point(&self, mount: Mount) -> RobotResult<CriticalPoint> {
        self.with_state(|s| {
            Ok(match s.instruments.get(&mount) {
                Some(instrument) if instrument.pipette.has_tip() => CriticalPoint::Tip,
                Some(_) => CriticalPoint::CalibrationProbe,
                None => CriticalPoint::Mount,
            })
        })
    }

    /// Measure and store the offset of the pipette on `mount` against the
    /// calibration square in `slot`. The previous offset stays in effect if
    /// the measurement fails.
    pub async fn calibrate_pipette_offset(
        &self,
        mount: Mount,
        slot: &str,
        method: ProbeMethod,
    ) -> RobotResult<Point> {
        let payload = CommandPayload::new(
            "calibrate_pipette_offset",
            format!("Calibrating {mount} pipette offset on slot {slot}"),
        )
        .mount(mount);
        self.published(payload, async {
            let nominal = self.deck_layout().slot_center(slot)?;
            let mut motion = self.motion.lock().await;
            self.checkpoint().await?;

            let (previous, pipette_id) = self.with_state(|s| {
                let instrument = s.instrument(mount)?;
                Ok((instrument.calibration_offset, instrument.pipette.id().to_string()))
            })?;
            let point = self.probing_point(mount)?;
            let offset = self.with_state(|s| {
                s.set_pipette_offset(mount, Point::zeros())?;
                s.critical_point_offset(mount, point)
            })?;

            let measured = {
                let mut probe = self.probe(&mut motion, mount, offset);
                calibration::calibrate_pipette_offset(
                    &mut probe,
                    &self.config.calibration,
                    self.store.as_ref(),
                    &pipette_id,
                    mount,
                    nominal,
                    method,
                )
            };
            let applied = match &measured {
                Ok(offset) => *offset,
                Err(e) => {
                    warn!("Pipette offset calibration failed, keeping previous offset: {}", e);
                    previous
                }
            };
            self.with_state(|s| {
                s.set_pipette_offset(mount, applied)?;
                s.planner.clear();
                Ok(())
            })?;
            let offset = measured?;
            motion.retract(mount)?;
            self.sync_poses(&mut motion)?;
            Ok(offset)
        })
        .await
    }

    /// Measure the length of tips from `tiprack` against a flat reference
    /// surface at `reference`.
    ///
    /// The bare nozzle is touched off first, then a tip is picked up from
    /// the rack and touched off again. The tip stays on afterwards with the
    /// measured length applied.
    pub async fn calibrate_tip_length(
        &self,
        mount: Mount,
        tiprack: ObjectId,
        reference: Point,
    ) -> RobotResult<f64> {
        let payload = CommandPayload::new(
            "calibrate_tip_length",
            format!("Calibrating {mount} tip length"),
        )
        .mount(mount);
        self.published(payload, async {
            let mut motion = self.motion.lock().await;
            self.checkpoint().await?;

            let (pipette_id, channels, default_overlap) = self.with_state(|s| {
                let pipette = s.pipette(mount)?;
                if pipette.has_tip() {
                    return Err(RobotError::TipAttached { mount });
                }
                Ok((
                    pipette.id().to_string(),
                    pipette.channels(),
                    pipette.config().default_tip_overlap,
                ))
            })?;
            let (hash, overlap, tip_location) = self.with_state(|s| {
                let definition = &s.deck.labware(tiprack)?.definition;
                let tracker = s
                    .trackers
                    .get(&tiprack)
                    .ok_or_else(|| RobotError::NotATipRack(definition.display_name().to_string()))?;
                let well = tracker.next_tip(channels, None).ok_or(RobotError::OutOfTips)?;
                Ok((
                    definition.definition_hash(),
                    definition.tip_overlap().unwrap_or(default_overlap),
                    s.deck.well(&s.graph, tiprack, &well)?.top(0.0),
                ))
            })?;

            let nozzle = self.with_state(|s| s.critical_point_offset(mount, CriticalPoint::Nozzle))?;
            let nozzle_height = {
                let mut probe = self.probe(&mut motion, mount, nozzle);
                calibration::measure_nozzle_height(&mut probe, &self.config.calibration, reference)?
            };
            motion.retract(mount)?;
            self.with_state(|s| {
                s.planner.clear();
                Ok(())
            })?;

            self.pick_up_tip_locked(&mut motion, mount, Some(tip_location), None, None)
                .await?;
            let nominal_length = self.with_state(|s| Ok(s.pipette(mount)?.require_tip()?.length))?;

            let length = {
                let mut probe = self.probe(&mut motion, mount, nozzle);
                calibration::calibrate_tip_length(
                    &mut probe,
                    &self.config.calibration,
                    self.store.as_ref(),
                    &pipette_id,
                    &hash,
                    reference,
                    nozzle_height,
                    nominal_length,
                    overlap,
                )?
            };

            self.with_state(|s| {
                let effective = length - overlap;
                let instrument = s.instrument_mut(mount)?;
                instrument.pipette.set_tip_length(effective)?;
                let tip_node = instrument.tip_node;
                if let Some(tip_node) = tip_node {
                    s.graph
                        .set_local_offset(tip_node, Point::new(0.0, 0.0, -effective))?;
                }
                s.planner.clear();
                Ok(())
            })?;
            motion.retract(mount)?;
            self.sync_poses(&mut motion)?;
            Ok(length)
        })
        .await
    }

    /// Solve and store the deck attitude by locating the calibration
    /// squares in three slots. The previous attitude stays in effect if any
    /// measurement fails.
    pub async fn calibrate_deck(&self, mount: Mount, method: ProbeMethod) -> RobotResult<Matrix4<f64>> {
        let payload = CommandPayload::new(
            "calibrate_deck",
            format!("Calibrating deck attitude with {mount} mount"),
        )
        .mount(mount);
        self.published(payload, async {
            let layout = self.deck_layout();
            let mut points = Vec::with_capacity(3);
            for slot in layout.attitude_slots() {
                points.push(DeckPoint {
                    slot: slot.to_string(),
                    nominal: layout.slot_center(slot)?,
                });
            }
            let points: [DeckPoint; 3] = points
                .try_into()
                .map_err(|_| RobotError::Config("deck calibration needs three slots".to_string()))?;

            let mut motion = self.motion.lock().await;
            self.checkpoint().await?;
            let point = self.probing_point(mount)?;
            let offset = self.with_state(|s| s.critical_point_offset(mount, point))?;

            let previous = motion.transform().clone();
            motion.set_transform(previous.with_attitude(identity_attitude())?);
            let reference_offset = previous.mount_offset(mount) + offset;

            let measured = {
                let mut probe = self.probe(&mut motion, mount, offset);
                calibration::calibrate_deck_attitude(
                    &mut probe,
                    &self.config.calibration,
                    self.store.as_ref(),
                    &points,
                    reference_offset,
                    method,
                )
            };
            let attitude = match measured {
                Ok(attitude) => attitude,
                Err(e) => {
                    warn!("Deck calibration failed, keeping previous attitude: {}", e);
                    motion.set_transform(previous);
                    return Err(e);
                }
            };
            motion.set_transform(previous.with_attitude(attitude)?);
            self.with_state(|s| {
                s.planner.clear();
                Ok(())
            })?;
            info!("Deck attitude updated");
            motion.retract(mount)?;
            self.sync_poses(&mut motion)?;
            Ok(attitude)
        })
        .await
    }

    /// Forget the stored and applied pipette offset for `mount`.
    pub fn clear_pipette_offset(&self, mount: Mount) -> RobotResult<()> {
        self.with_state(|s| {
            let id = s.pipette(mount)?.id().to_string();
            self.store.clear_pipette_offset(&id, mount)?;
            s.set_pipette_offset(mount, Point::zeros())
        })
    }

    /// Forget the stored deck attitude and go back to the configured default.
    pub async fn clear_deck_calibration(&self) -> RobotResult<()> {
        let mut motion = self.motion.lock().await;
        self.store.clear_deck_attitude()?;
        let transform = motion.transform().with_attitude(self.config.default_attitude())?;
        motion.set_transform(transform);
        self.with_state(|s| {
            s.planner.clear();
            Ok(())
        })?;
        if motion.is_homed(&[hardware::Axis::X, hardware::Axis::Y]) {
            self.sync_poses(&mut motion)?;
        }
        Ok(())
    }
}
