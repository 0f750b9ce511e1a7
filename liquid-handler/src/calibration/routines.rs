//! Calibration procedures.
//!
//! Each routine measures through a [`SurfaceProbe`] and writes its result to
//! the [`CalibrationStore`] only once the whole measurement has succeeded.
//! Restoring in-memory offsets after a failure is the caller's job, since
//! only the caller knows what was in effect before.

use nalgebra::Matrix4;
use robot_math::solve_attitude;
use tracing::info;

use super::edge::{find_slot_center, probe_surface_height};
use super::store::{CalibrationSource, CalibrationStore};
use super::{ProbeMethod, SurfaceProbe};
use crate::config::CalibrationSettings;
use crate::error::RobotResult;
use crate::types::{Mount, Point};

/// A calibration square on the deck and where it should be.
#[derive(Debug, Clone, PartialEq)]
pub struct DeckPoint {
    pub slot: String,
    pub nominal: Point,
}

/// Measure a pipette's offset from its nominal position.
///
/// The probe must report positions computed with a zero pipette offset.
/// Returns the offset that was saved.
pub fn calibrate_pipette_offset<P: SurfaceProbe + ?Sized>(
    probe: &mut P,
    settings: &CalibrationSettings,
    store: &dyn CalibrationStore,
    pipette_id: &str,
    mount: Mount,
    nominal: Point,
    method: ProbeMethod,
) -> RobotResult<Point> {
    let measured = find_slot_center(probe, settings, nominal, method)?;
    let offset = nominal - measured;
    store.save_pipette_offset(pipette_id, mount, offset, CalibrationSource::User)?;
    info!(
        "Pipette {} on {} mount offset ({:.3}, {:.3}, {:.3})",
        pipette_id, mount, offset.x, offset.y, offset.z
    );
    Ok(offset)
}

/// Contact height of the bare nozzle on a flat reference surface.
pub fn measure_nozzle_height<P: SurfaceProbe + ?Sized>(
    probe: &mut P,
    settings: &CalibrationSettings,
    reference: Point,
) -> RobotResult<f64> {
    probe_surface_height(probe, settings, reference.x, reference.y, reference.z)
}

/// Measure the length of the attached tip against the nozzle contact height.
///
/// The probe must report nozzle positions. `nominal_length` is the expected
/// distance from nozzle to tip end and sets where the search starts; the
/// saved value adds back `overlap` so it is comparable to a rack's declared
/// tip length.
#[allow(clippy::too_many_arguments)]
pub fn calibrate_tip_length<P: SurfaceProbe + ?Sized>(
    probe: &mut P,
    settings: &CalibrationSettings,
    store: &dyn CalibrationStore,
    pipette_id: &str,
    tiprack_hash: &str,
    reference: Point,
    nozzle_height: f64,
    nominal_length: f64,
    overlap: f64,
) -> RobotResult<f64> {
    let contact = probe_surface_height(
        probe,
        settings,
        reference.x,
        reference.y,
        nozzle_height + nominal_length,
    )?;
    let length = contact - nozzle_height + overlap;
    store.save_tip_length(pipette_id, tiprack_hash, length, CalibrationSource::User)?;
    info!(
        "Tip length for {} on rack {}: {:.3} mm",
        pipette_id,
        &tiprack_hash[..tiprack_hash.len().min(12)],
        length
    );
    Ok(length)
}

/// Solve the deck attitude from three calibration squares.
///
/// The probe must report positions under an identity attitude.
/// `reference_offset` is the probing critical point's offset from the
/// machine origin of its mount (mount offset plus instrument offset), so
/// that measured and nominal points can be expressed in the frame the
/// attitude acts on.
pub fn calibrate_deck_attitude<P: SurfaceProbe + ?Sized>(
    probe: &mut P,
    settings: &CalibrationSettings,
    store: &dyn CalibrationStore,
    points: &[DeckPoint; 3],
    reference_offset: Point,
    method: ProbeMethod,
) -> RobotResult<Matrix4<f64>> {
    let mut expected = [Point::zeros(); 3];
    let mut measured = [Point::zeros(); 3];
    for (i, point) in points.iter().enumerate() {
        let found = find_slot_center(probe, settings, point.nominal, method)?;
        info!("Deck point {} measured at {:?}", point.slot, found);
        expected[i] = point.nominal - reference_offset;
        measured[i] = found - reference_offset;
    }

    let attitude = solve_attitude(expected, measured)?;
    store.save_deck_attitude(&attitude, CalibrationSource::User)?;
    Ok(attitude)
}

/// Calibrate a gripper from its front and rear jaw probes.
///
/// Each jaw gets a full slot search; the saved offset is their mean.
pub fn calibrate_gripper_offset<F, R>(
    front: &mut F,
    rear: &mut R,
    settings: &CalibrationSettings,
    store: &dyn CalibrationStore,
    gripper_id: &str,
    nominal: Point,
    method: ProbeMethod,
) -> RobotResult<Point>
where
    F: SurfaceProbe + ?Sized,
    R: SurfaceProbe + ?Sized,
{
    let front_offset = nominal - find_slot_center(front, settings, nominal, method)?;
    let rear_offset = nominal - find_slot_center(rear, settings, nominal, method)?;
    let offset = (front_offset + rear_offset) / 2.0;
    store.save_gripper_offset(gripper_id, offset, CalibrationSource::User)?;
    info!(
        "Gripper {} offset ({:.3}, {:.3}, {:.3})",
        gripper_id, offset.x, offset.y, offset.z
    );
    Ok(offset)
}
