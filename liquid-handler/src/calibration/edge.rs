//! Locating a calibration slot.
//!
//! The slot is a square hole in the deck. Probing on the deck surface touches
//! at the surface height; probing over the hole touches nothing (or touches
//! much lower). Contact searches walk each edge with a shrinking stride until
//! the touch state flips; non-contact searches sweep across the slot and take
//! the edges from the capacitive signal.

use robot_math::find_sweep_edges;
use tracing::{debug, info, warn};

use super::{CalibrationError, ProbeMethod, SurfaceProbe, SweepAxis};
use crate::config::CalibrationSettings;
use crate::error::RobotResult;
use crate::types::Point;

/// Probe the deck surface at `(x, y)` starting `transit_height_mm` above
/// `nominal_z`. Fails if nothing is touched or if contact happens before the
/// probe has descended at all.
pub fn probe_surface_height<P: SurfaceProbe + ?Sized>(
    probe: &mut P,
    settings: &CalibrationSettings,
    x: f64,
    y: f64,
    nominal_z: f64,
) -> RobotResult<f64> {
    let start_z = nominal_z + settings.transit_height_mm;
    let contact = probe
        .probe_z(x, y, start_z, settings.probe_distance_mm)?
        .ok_or(CalibrationError::SurfaceNotFound { x, y })?;
    if contact >= start_z {
        return Err(CalibrationError::EarlyCapacitiveSense {
            contact,
            expected_max: start_z,
        }
        .into());
    }
    debug!("Surface at ({:.3}, {:.3}) is z={:.3}", x, y, contact);
    Ok(contact)
}

/// Touch at `position` along `axis` and classify the result against the
/// measured deck surface `surface_z`.
fn touches_surface<P: SurfaceProbe + ?Sized>(
    probe: &mut P,
    settings: &CalibrationSettings,
    axis: SweepAxis,
    fixed: Point,
    position: f64,
    surface_z: f64,
) -> RobotResult<bool> {
    let at = axis.with_component(fixed, position);
    let contact = probe.probe_z(
        at.x,
        at.y,
        surface_z + settings.transit_height_mm,
        settings.probe_distance_mm,
    )?;
    match contact {
        Some(z) if z > surface_z + settings.early_sense_tolerance_mm => {
            Err(CalibrationError::EarlyCapacitiveSense {
                contact: z,
                expected_max: surface_z + settings.early_sense_tolerance_mm,
            }
            .into())
        }
        Some(z) => Ok((z - surface_z).abs() <= settings.edge_hit_tolerance_mm),
        None => Ok(false),
    }
}

/// Find one slot edge along `axis`, starting at its nominal position.
///
/// `direction_if_hit` is the sign of the step taken when the probe touches
/// the deck, i.e. the direction from the deck surface towards the hole.
/// Returns the edge position, centred between the last touching and the
/// last missing probe.
pub fn find_edge<P: SurfaceProbe + ?Sized>(
    probe: &mut P,
    settings: &CalibrationSettings,
    axis: SweepAxis,
    nominal: Point,
    surface_z: f64,
    direction_if_hit: f64,
) -> RobotResult<f64> {
    let direction = direction_if_hit.signum();
    let strides: Vec<f64> = settings
        .search_strides_mm
        .iter()
        .copied()
        .filter(|s| *s >= settings.min_valid_stride_mm)
        .collect();
    if strides.is_empty() {
        return Err(CalibrationError::EdgeNotFound {
            axis: axis.hardware_axis(),
            steps: 0,
        }
        .into());
    }

    let mut position = axis.component(&nominal);
    let mut hit = touches_surface(probe, settings, axis, nominal, position, surface_z)?;
    let mut bracket = (position, position);

    for stride in strides {
        let mut steps = 0;
        loop {
            let previous = position;
            let sign = if hit { direction } else { -direction };
            position += sign * stride;
            let now = touches_surface(probe, settings, axis, nominal, position, surface_z)?;
            steps += 1;
            if now != hit {
                hit = now;
                bracket = (previous, position);
                break;
            }
            if steps >= settings.max_steps_per_stride {
                warn!(
                    "No edge along {:?} within {} steps of {} mm",
                    axis, steps, stride
                );
                return Err(CalibrationError::EdgeNotFound {
                    axis: axis.hardware_axis(),
                    steps,
                }
                .into());
            }
        }
    }

    let edge = (bracket.0 + bracket.1) / 2.0;
    debug!("Edge along {:?} at {:.4}", axis, edge);
    Ok(edge)
}

fn sweep_center<P: SurfaceProbe + ?Sized>(
    probe: &mut P,
    settings: &CalibrationSettings,
    axis: SweepAxis,
    fixed: Point,
) -> RobotResult<f64> {
    let half_span = settings.slot_width_mm / 2.0 + settings.search_strides_mm.iter().sum::<f64>();
    let center = axis.component(&fixed);
    let (samples, positions) = probe.sweep(axis, fixed, center - half_span, center + half_span)?;
    let edges = find_sweep_edges(&samples, &positions, settings.sweep_smoothing_window)
        .map_err(CalibrationError::from)?;

    let width = edges.width();
    if (width - settings.slot_width_mm).abs() > settings.slot_width_tolerance_mm {
        warn!(
            "Sweep along {:?} measured {:.3} mm, expected {:.3} mm",
            axis, width, settings.slot_width_mm
        );
        return Err(CalibrationError::InaccurateNonContactSweep {
            measured: width,
            expected: settings.slot_width_mm,
            tolerance: settings.slot_width_tolerance_mm,
        }
        .into());
    }
    Ok(edges.center())
}

/// Measure the true center of a calibration slot.
///
/// The deck height is probed once beside the slot, then the slot is located
/// in X and then in Y. The returned z is the measured deck surface.
pub fn find_slot_center<P: SurfaceProbe + ?Sized>(
    probe: &mut P,
    settings: &CalibrationSettings,
    nominal: Point,
    method: ProbeMethod,
) -> RobotResult<Point> {
    let half = settings.slot_width_mm / 2.0;
    let surface_z =
        probe_surface_height(probe, settings, nominal.x + 2.0 * half, nominal.y, nominal.z)?;

    let center = match method {
        ProbeMethod::Contact => {
            let left = find_edge(
                probe,
                settings,
                SweepAxis::X,
                Point::new(nominal.x - half, nominal.y, surface_z),
                surface_z,
                1.0,
            )?;
            let right = find_edge(
                probe,
                settings,
                SweepAxis::X,
                Point::new(nominal.x + half, nominal.y, surface_z),
                surface_z,
                -1.0,
            )?;
            let x = (left + right) / 2.0;
            let front = find_edge(
                probe,
                settings,
                SweepAxis::Y,
                Point::new(x, nominal.y - half, surface_z),
                surface_z,
                1.0,
            )?;
            let back = find_edge(
                probe,
                settings,
                SweepAxis::Y,
                Point::new(x, nominal.y + half, surface_z),
                surface_z,
                -1.0,
            )?;
            Point::new(x, (front + back) / 2.0, surface_z)
        }
        ProbeMethod::NonContact => {
            let above = Point::new(nominal.x, nominal.y, surface_z + settings.early_sense_tolerance_mm);
            let x = sweep_center(probe, settings, SweepAxis::X, above)?;
            let y = sweep_center(probe, settings, SweepAxis::Y, Point::new(x, above.y, above.z))?;
            Point::new(x, y, surface_z)
        }
    };

    info!(
        "Slot nominally at ({:.3}, {:.3}, {:.3}) found at ({:.3}, {:.3}, {:.3})",
        nominal.x, nominal.y, nominal.z, center.x, center.y, center.z
    );
    Ok(center)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::RobotError;
    use approx::assert_relative_eq;

    /// A flat deck at `surface_z` with a square hole of side `width`.
    pub(crate) struct FakeDeck {
        pub center: Point,
        pub width: f64,
        pub surface_z: f64,
        pub hole_floor: Option<f64>,
        pub probes: usize,
    }

    impl FakeDeck {
        pub fn new(center: Point, width: f64) -> Self {
            Self {
                center,
                width,
                surface_z: center.z,
                hole_floor: None,
                probes: 0,
            }
        }

        fn surface_at(&self, x: f64, y: f64) -> Option<f64> {
            let half = self.width / 2.0;
            let inside = (x - self.center.x).abs() < half && (y - self.center.y).abs() < half;
            if inside {
                self.hole_floor
            } else {
                Some(self.surface_z)
            }
        }
    }

    impl SurfaceProbe for FakeDeck {
        fn probe_z(&mut self, x: f64, y: f64, start_z: f64, distance: f64) -> RobotResult<Option<f64>> {
            self.probes += 1;
            Ok(self
                .surface_at(x, y)
                .filter(|z| *z <= start_z && *z >= start_z - distance))
        }

        fn sweep(
            &mut self,
            axis: SweepAxis,
            fixed: Point,
            start: f64,
            end: f64,
        ) -> RobotResult<(Vec<f64>, Vec<f64>)> {
            let n = ((end - start).abs() / 0.1).round() as usize + 1;
            let step = (end - start) / (n - 1) as f64;
            let positions: Vec<f64> = (0..n).map(|i| start + step * i as f64).collect();
            let samples = positions
                .iter()
                .map(|p| {
                    let at = axis.with_component(fixed, *p);
                    match self.surface_at(at.x, at.y) {
                        Some(z) => 100.0 / (1.0 + (fixed.z - z).max(0.0)),
                        None => 0.0,
                    }
                })
                .collect();
            Ok((samples, positions))
        }
    }

    #[test]
    fn test_find_edge_converges_within_final_stride() {
        let settings = CalibrationSettings::default();
        let mut deck = FakeDeck::new(Point::new(100.0, 50.0, 0.0), 20.0);
        // Left edge really sits at 90; start the search 2.3 mm off
        let edge = find_edge(
            &mut deck,
            &settings,
            SweepAxis::X,
            Point::new(92.3, 50.0, 0.0),
            0.0,
            1.0,
        )
        .unwrap();
        assert!((edge - 90.0).abs() <= 0.025, "edge at {edge}");
    }

    #[test]
    fn test_slot_center_contact() {
        let settings = CalibrationSettings::default();
        let truth = Point::new(101.2, 48.7, 0.4);
        let mut deck = FakeDeck::new(truth, 20.0);

        let center = find_slot_center(
            &mut deck,
            &settings,
            Point::new(100.0, 50.0, 0.0),
            ProbeMethod::Contact,
        )
        .unwrap();
        assert_relative_eq!(center.x, truth.x, epsilon = 0.025);
        assert_relative_eq!(center.y, truth.y, epsilon = 0.025);
        assert_relative_eq!(center.z, truth.z);
    }

    #[test]
    fn test_slot_center_non_contact() {
        let settings = CalibrationSettings::default();
        let truth = Point::new(99.4, 50.6, 0.0);
        let mut deck = FakeDeck::new(truth, 20.0);

        let center = find_slot_center(
            &mut deck,
            &settings,
            Point::new(100.0, 50.0, 0.0),
            ProbeMethod::NonContact,
        )
        .unwrap();
        assert_relative_eq!(center.x, truth.x, epsilon = 0.15);
        assert_relative_eq!(center.y, truth.y, epsilon = 0.15);
    }

    #[test]
    fn test_wrong_slot_width_is_rejected() {
        let settings = CalibrationSettings::default();
        let mut deck = FakeDeck::new(Point::new(100.0, 50.0, 0.0), 14.0);
        let err = find_slot_center(
            &mut deck,
            &settings,
            Point::new(100.0, 50.0, 0.0),
            ProbeMethod::NonContact,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RobotError::Calibration(CalibrationError::InaccurateNonContactSweep { .. })
        ));
    }

    #[test]
    fn test_early_sense_is_rejected() {
        let settings = CalibrationSettings::default();
        // Deck is 3 mm higher than the search expects
        let mut deck = FakeDeck::new(Point::new(100.0, 50.0, 0.0), 20.0);
        let err = find_edge(
            &mut deck,
            &settings,
            SweepAxis::X,
            Point::new(88.0, 50.0, 0.0),
            -3.0,
            1.0,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RobotError::Calibration(CalibrationError::EarlyCapacitiveSense { .. })
        ));
    }

    #[test]
    fn test_missing_surface() {
        let settings = CalibrationSettings::default();
        let mut deck = FakeDeck::new(Point::new(100.0, 50.0, 0.0), 20.0);
        // Nominal z far above the real deck: probe runs out of travel
        let err = probe_surface_height(&mut deck, &settings, 130.0, 50.0, 40.0).unwrap_err();
        assert!(matches!(
            err,
            RobotError::Calibration(CalibrationError::SurfaceNotFound { .. })
        ));
    }
}
