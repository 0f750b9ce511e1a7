//! Pipette state.
//!
//! A [`Pipette`] tracks the volume it holds, whether a tip is attached and
//! whether the plunger has been primed at the bottom stop. It converts
//! volumes and flow rates into plunger positions and speeds, but does no
//! motion itself.

mod models;

use robot_math::round_to;
use tracing::debug;

use crate::error::{RobotError, RobotResult};
use crate::types::{CriticalPoint, Mount, Point};

pub use models::{
    PickUpSettings, PipetteGeneration, PipetteModelConfig, PipetteOverrides, PipetteQuirk,
    PipetteRegistry, PlungerDirection, PlungerPositions, UlPerMm,
};

/// Plunger positions are rounded to this many decimals.
pub const PLUNGER_DECIMALS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlungerAction {
    Aspirate,
    Dispense,
    BlowOut,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowRates {
    pub aspirate: f64,
    pub dispense: f64,
    pub blow_out: f64,
}

/// Geometry of an attached tip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TipGeometry {
    /// How far the tip end sits below the nozzle, after overlap
    pub length: f64,
    pub diameter: f64,
    pub max_volume: f64,
}

#[derive(Debug, Clone)]
pub struct Pipette {
    id: String,
    mount: Mount,
    config: PipetteModelConfig,
    plunger_positions: PlungerPositions,
    flow_rates: FlowRates,
    pick_up: PickUpSettings,
    max_volume_override: Option<f64>,
    current_volume: f64,
    tip: Option<TipGeometry>,
    ready_to_aspirate: bool,
}

impl Pipette {
    pub fn new(
        config: PipetteModelConfig,
        mount: Mount,
        overrides: &PipetteOverrides,
    ) -> RobotResult<Self> {
        let plunger_positions = overrides
            .plunger_positions
            .unwrap_or(config.plunger_positions);
        plunger_positions
            .validate(config.plunger_direction())
            .map_err(|reason| RobotError::InvalidPlungerPositions {
                model: config.model.clone(),
                reason,
            })?;

        let flow_rates = FlowRates {
            aspirate: overrides
                .aspirate_flow_rate
                .unwrap_or(config.default_aspirate_flow_rate),
            dispense: overrides
                .dispense_flow_rate
                .unwrap_or(config.default_dispense_flow_rate),
            blow_out: overrides
                .blow_out_flow_rate
                .unwrap_or(config.default_blow_out_flow_rate),
        };
        let mut pick_up = config.pick_up;
        if let Some(presses) = overrides.pick_up_presses {
            pick_up.presses = presses;
        }
        if let Some(increment) = overrides.pick_up_increment {
            pick_up.increment = increment;
        }
        if let Some(distance) = overrides.pick_up_distance {
            pick_up.distance = distance;
        }
        if let Some(current) = overrides.pick_up_current_per_channel {
            pick_up.current_per_channel = current;
        }
        if let Some(max) = overrides.max_volume {
            if max <= 0.0 || max > config.max_volume {
                return Err(RobotError::OutOfRange {
                    what: "max volume".to_string(),
                    value: max,
                    min: 0.0,
                    max: config.max_volume,
                });
            }
        }

        let id = overrides
            .pipette_id
            .clone()
            .unwrap_or_else(|| format!("{}_{}", config.model, mount));

        Ok(Self {
            id,
            mount,
            plunger_positions,
            flow_rates,
            pick_up,
            max_volume_override: overrides.max_volume,
            config,
            current_volume: 0.0,
            tip: None,
            ready_to_aspirate: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mount(&self) -> Mount {
        self.mount
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn config(&self) -> &PipetteModelConfig {
        &self.config
    }

    pub fn channels(&self) -> usize {
        self.config.channels
    }

    pub fn plunger_positions(&self) -> PlungerPositions {
        self.plunger_positions
    }

    pub fn pick_up_settings(&self) -> PickUpSettings {
        self.pick_up
    }

    pub fn flow_rates(&self) -> FlowRates {
        self.flow_rates
    }

    pub fn set_flow_rates(&mut self, rates: FlowRates) {
        self.flow_rates = rates;
    }

    pub fn update_plunger_positions(&mut self, positions: PlungerPositions) -> RobotResult<()> {
        positions
            .validate(self.config.plunger_direction())
            .map_err(|reason| RobotError::InvalidPlungerPositions {
                model: self.config.model.clone(),
                reason,
            })?;
        self.plunger_positions = positions;
        Ok(())
    }

    pub fn current_volume(&self) -> f64 {
        self.current_volume
    }

    /// Usable volume: the model maximum, capped by any override and by the
    /// attached tip's capacity.
    pub fn working_volume(&self) -> f64 {
        let mut max = self.config.max_volume;
        if let Some(cap) = self.max_volume_override {
            max = max.min(cap);
        }
        if let Some(tip) = self.tip {
            max = max.min(tip.max_volume);
        }
        max
    }

    pub fn available_volume(&self) -> f64 {
        (self.working_volume() - self.current_volume).max(0.0)
    }

    pub fn ready_to_aspirate(&self) -> bool {
        self.ready_to_aspirate
    }

    pub fn set_ready_to_aspirate(&mut self, ready: bool) {
        self.ready_to_aspirate = ready;
    }

    pub fn has_tip(&self) -> bool {
        self.tip.is_some()
    }

    pub fn tip(&self) -> Option<TipGeometry> {
        self.tip
    }

    pub fn require_tip(&self) -> RobotResult<TipGeometry> {
        self.tip.ok_or(RobotError::NoTipAttached { mount: self.mount })
    }

    pub fn add_tip(&mut self, tip: TipGeometry) -> RobotResult<()> {
        if self.tip.is_some() {
            return Err(RobotError::TipAttached { mount: self.mount });
        }
        debug!("{} pipette: tip attached, length {:.3}", self.mount, tip.length);
        self.tip = Some(tip);
        Ok(())
    }

    /// Replace the attached tip's length, e.g. after tip-length calibration.
    pub fn set_tip_length(&mut self, length: f64) -> RobotResult<()> {
        let tip = self
            .tip
            .as_mut()
            .ok_or(RobotError::NoTipAttached { mount: self.mount })?;
        tip.length = length;
        Ok(())
    }

    /// Detach the tip. Whatever was held is gone with it.
    pub fn remove_tip(&mut self) -> RobotResult<TipGeometry> {
        let tip = self
            .tip
            .take()
            .ok_or(RobotError::NoTipAttached { mount: self.mount })?;
        self.current_volume = 0.0;
        self.ready_to_aspirate = false;
        Ok(tip)
    }

    /// Volume for an aspirate request; `None` means fill to capacity.
    pub fn resolve_aspirate_volume(&self, requested: Option<f64>) -> RobotResult<f64> {
        let volume = requested.unwrap_or_else(|| self.available_volume());
        if volume < 0.0 || !volume.is_finite() {
            return Err(RobotError::InvalidVolume(volume));
        }
        if self.current_volume + volume > self.working_volume() + 1e-9 {
            return Err(RobotError::VolumeExceedsCapacity {
                requested: volume,
                current: self.current_volume,
                max: self.working_volume(),
            });
        }
        Ok(volume)
    }

    /// Volume for a dispense request; `None` means everything held. Requests
    /// beyond what is held are clamped.
    pub fn resolve_dispense_volume(&self, requested: Option<f64>) -> RobotResult<f64> {
        let volume = requested.unwrap_or(self.current_volume);
        if volume < 0.0 || !volume.is_finite() {
            return Err(RobotError::InvalidVolume(volume));
        }
        Ok(volume.min(self.current_volume))
    }

    pub fn add_current_volume(&mut self, volume: f64) {
        self.current_volume = (self.current_volume + volume).min(self.working_volume());
    }

    pub fn remove_current_volume(&mut self, volume: f64) {
        self.current_volume = (self.current_volume - volume).max(0.0);
    }

    pub fn set_current_volume(&mut self, volume: f64) {
        self.current_volume = volume.clamp(0.0, self.working_volume());
    }

    pub fn ul_per_mm(&self, ul: f64, action: PlungerAction) -> f64 {
        match action {
            PlungerAction::Aspirate => self.config.ul_per_mm_aspirate.evaluate(ul),
            PlungerAction::Dispense | PlungerAction::BlowOut => {
                self.config.ul_per_mm_dispense.evaluate(ul)
            }
        }
    }

    /// Plunger coordinate at which the pipette holds `ul`.
    pub fn plunger_position(&self, ul: f64, action: PlungerAction) -> f64 {
        let mm = ul / self.ul_per_mm(ul, action);
        let bottom = self.plunger_positions.bottom;
        let position = match self.config.plunger_direction() {
            PlungerDirection::AscendingFromBottom => bottom + mm,
            PlungerDirection::DescendingFromBottom => bottom - mm,
        };
        round_to(position, PLUNGER_DECIMALS)
    }

    /// Plunger speed in mm/s for a flow rate in µL/s.
    pub fn plunger_speed(&self, ul_per_s: f64, action: PlungerAction) -> f64 {
        ul_per_s / self.ul_per_mm(self.config.max_volume, action)
    }

    /// Flow rate in µL/s for a plunger speed in mm/s.
    pub fn plunger_flow_rate(&self, mm_per_s: f64, action: PlungerAction) -> f64 {
        mm_per_s * self.ul_per_mm(self.config.max_volume, action)
    }

    /// Offset from the nozzle to a critical point.
    pub fn critical_point_offset(&self, critical_point: CriticalPoint) -> Point {
        match critical_point {
            CriticalPoint::Tip => {
                let length = self.tip.map(|t| t.length).unwrap_or(0.0);
                Point::new(0.0, 0.0, -length)
            }
            CriticalPoint::Nozzle | CriticalPoint::Mount => Point::zeros(),
            CriticalPoint::CalibrationProbe => {
                Point::new(0.0, 0.0, -self.config.calibration_probe_length)
            }
        }
    }

    /// Tip length to use for a rack, given its declared length and overlap.
    pub fn effective_tip_length(&self, rack_tip_length: f64, rack_overlap: Option<f64>) -> f64 {
        rack_tip_length - rack_overlap.unwrap_or(self.config.default_tip_overlap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn p300() -> Pipette {
        PipetteRegistry::builtin()
            .create_instrument("p300_single_v2.0", Mount::Left, &PipetteOverrides::default())
            .unwrap()
    }

    fn tip(volume: f64) -> TipGeometry {
        TipGeometry {
            length: 51.83,
            diameter: 5.23,
            max_volume: volume,
        }
    }

    #[test]
    fn test_default_id_and_state() {
        let pipette = p300();
        assert_eq!(pipette.id(), "p300_single_v2.0_left");
        assert!(!pipette.has_tip());
        assert!(!pipette.ready_to_aspirate());
        assert_eq!(pipette.current_volume(), 0.0);
    }

    #[test]
    fn test_plunger_direction_by_generation() {
        let registry = PipetteRegistry::builtin();
        let ot2 = p300();
        let flex = registry
            .create_instrument("flex_1channel_1000", Mount::Right, &PipetteOverrides::default())
            .unwrap();

        let ot2_pos = ot2.plunger_position(100.0, PlungerAction::Aspirate);
        assert!(ot2_pos > ot2.plunger_positions().bottom);
        assert_relative_eq!(ot2_pos, round_to(1.5 + 100.0 / 17.5, 6));

        let flex_pos = flex.plunger_position(100.0, PlungerAction::Aspirate);
        assert!(flex_pos < flex.plunger_positions().bottom);
    }

    #[test]
    fn test_aspirate_volume_defaults_and_limits() {
        let mut pipette = p300();
        pipette.add_tip(tip(200.0)).unwrap();
        assert_relative_eq!(pipette.working_volume(), 200.0);
        assert_relative_eq!(pipette.resolve_aspirate_volume(None).unwrap(), 200.0);

        pipette.add_current_volume(150.0);
        assert_relative_eq!(pipette.resolve_aspirate_volume(None).unwrap(), 50.0);
        assert!(matches!(
            pipette.resolve_aspirate_volume(Some(60.0)),
            Err(RobotError::VolumeExceedsCapacity { .. })
        ));
        assert!(matches!(
            pipette.resolve_aspirate_volume(Some(-1.0)),
            Err(RobotError::InvalidVolume(_))
        ));
    }

    #[test]
    fn test_dispense_clamps_to_held_volume() {
        let mut pipette = p300();
        pipette.add_tip(tip(300.0)).unwrap();
        pipette.add_current_volume(40.0);
        assert_relative_eq!(pipette.resolve_dispense_volume(None).unwrap(), 40.0);
        assert_relative_eq!(pipette.resolve_dispense_volume(Some(80.0)).unwrap(), 40.0);
    }

    #[test]
    fn test_tip_lifecycle() {
        let mut pipette = p300();
        assert!(matches!(
            pipette.require_tip(),
            Err(RobotError::NoTipAttached { mount: Mount::Left })
        ));
        pipette.add_tip(tip(300.0)).unwrap();
        assert!(matches!(
            pipette.add_tip(tip(300.0)),
            Err(RobotError::TipAttached { .. })
        ));
        pipette.add_current_volume(10.0);
        pipette.set_ready_to_aspirate(true);

        pipette.remove_tip().unwrap();
        assert_eq!(pipette.current_volume(), 0.0);
        assert!(!pipette.ready_to_aspirate());
        assert!(pipette.remove_tip().is_err());
    }

    #[test]
    fn test_overrides() {
        let overrides = PipetteOverrides {
            pipette_id: Some("P3HSV2020061802".to_string()),
            max_volume: Some(200.0),
            aspirate_flow_rate: Some(50.0),
            ..Default::default()
        };
        let pipette = PipetteRegistry::builtin()
            .create_instrument("p300_single_v2.0", Mount::Right, &overrides)
            .unwrap();
        assert_eq!(pipette.id(), "P3HSV2020061802");
        assert_relative_eq!(pipette.working_volume(), 200.0);
        assert_relative_eq!(pipette.flow_rates().aspirate, 50.0);

        let bad = PipetteOverrides {
            plunger_positions: Some(PlungerPositions {
                top: 0.5,
                bottom: 71.5,
                blow_out: 76.5,
                drop_tip: 90.5,
            }),
            ..Default::default()
        };
        assert!(matches!(
            PipetteRegistry::builtin().create_instrument("p300_single_v2.0", Mount::Left, &bad),
            Err(RobotError::InvalidPlungerPositions { .. })
        ));
    }

    #[test]
    fn test_speed_conversion_round_trips() {
        let pipette = p300();
        let speed = pipette.plunger_speed(92.86, PlungerAction::Aspirate);
        assert_relative_eq!(
            pipette.plunger_flow_rate(speed, PlungerAction::Aspirate),
            92.86,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_critical_points() {
        let mut pipette = p300();
        assert_eq!(pipette.critical_point_offset(CriticalPoint::Tip), Point::zeros());
        pipette.add_tip(tip(300.0)).unwrap();
        assert_relative_eq!(pipette.critical_point_offset(CriticalPoint::Tip).z, -51.83);
        assert_eq!(pipette.critical_point_offset(CriticalPoint::Nozzle), Point::zeros());
    }
}
