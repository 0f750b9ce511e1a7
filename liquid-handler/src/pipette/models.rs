//! Pipette model configurations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{RobotError, RobotResult};
use crate::types::{Mount, Point};

use super::Pipette;

/// Which way the plunger travels as volume is drawn up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlungerDirection {
    /// Aspirating moves the plunger to larger coordinates (OT-2 pipettes)
    AscendingFromBottom,
    /// Aspirating moves the plunger to smaller coordinates (Flex pipettes)
    DescendingFromBottom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipetteGeneration {
    Gen1,
    Gen2,
    Flex,
}

impl PipetteGeneration {
    pub fn plunger_direction(&self) -> PlungerDirection {
        match self {
            PipetteGeneration::Gen1 | PipetteGeneration::Gen2 => {
                PlungerDirection::AscendingFromBottom
            }
            PipetteGeneration::Flex => PlungerDirection::DescendingFromBottom,
        }
    }
}

/// Named plunger stops, in plunger-axis millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlungerPositions {
    pub top: f64,
    pub bottom: f64,
    pub blow_out: f64,
    pub drop_tip: f64,
}

impl PlungerPositions {
    /// Stops must be strictly ordered top, bottom, blow-out, drop-tip along
    /// the aspirate direction reversed.
    pub fn validate(&self, direction: PlungerDirection) -> Result<(), String> {
        let order = [self.top, self.bottom, self.blow_out, self.drop_tip];
        let ok = order.windows(2).all(|w| match direction {
            PlungerDirection::AscendingFromBottom => w[0] > w[1],
            PlungerDirection::DescendingFromBottom => w[0] < w[1],
        });
        if ok {
            Ok(())
        } else {
            let relation = match direction {
                PlungerDirection::AscendingFromBottom => ">",
                PlungerDirection::DescendingFromBottom => "<",
            };
            Err(format!(
                "expected top {r} bottom {r} blow_out {r} drop_tip, got {:.3}, {:.3}, {:.3}, {:.3}",
                self.top,
                self.bottom,
                self.blow_out,
                self.drop_tip,
                r = relation
            ))
        }
    }
}

/// Piecewise-linear µL per plunger millimetre.
///
/// Each row is `[max_volume, slope, intercept]`; the first row whose
/// `max_volume` is at least the queried volume gives
/// `slope * volume + intercept`. Volumes past the last row use the last row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UlPerMm(pub Vec<[f64; 3]>);

impl UlPerMm {
    pub fn constant(ul_per_mm: f64) -> Self {
        Self(vec![[f64::MAX, 0.0, ul_per_mm]])
    }

    pub fn evaluate(&self, ul: f64) -> f64 {
        let row = self
            .0
            .iter()
            .find(|row| ul <= row[0])
            .or_else(|| self.0.last());
        match row {
            Some([_, slope, intercept]) => slope * ul + intercept,
            None => 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PipetteQuirk {
    /// Wiggle after pick-up to free neighbouring tips
    PickupTipShake,
    /// Wiggle after ejecting to shake the tip loose
    DropTipShake,
}

/// Pick-up press parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PickUpSettings {
    /// Mount-axis current during the press, per channel, amps
    pub current_per_channel: f64,
    /// How far the first press descends below the rack top
    pub distance: f64,
    /// Extra depth added by each subsequent press
    pub increment: f64,
    pub presses: usize,
    pub speed: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipetteModelConfig {
    pub model: String,
    pub display_name: String,
    pub generation: PipetteGeneration,
    pub channels: usize,
    pub max_volume: f64,
    pub min_volume: f64,
    pub plunger_positions: PlungerPositions,
    pub ul_per_mm_aspirate: UlPerMm,
    pub ul_per_mm_dispense: UlPerMm,
    /// µL/s
    pub default_aspirate_flow_rate: f64,
    pub default_dispense_flow_rate: f64,
    pub default_blow_out_flow_rate: f64,
    /// Nozzle position relative to the mount
    pub model_offset: [f64; 3],
    pub calibration_probe_length: f64,
    pub pick_up: PickUpSettings,
    /// Plunger current while moving liquid, amps
    pub plunger_current: f64,
    pub drop_tip_current: f64,
    /// Plunger speed while ejecting, mm/s
    pub drop_tip_speed: f64,
    /// How far into the rack a returned tip is lowered, as a fraction of tip length
    pub return_tip_height: f64,
    /// Overlap with the nozzle when the tip rack does not specify one
    pub default_tip_overlap: f64,
    #[serde(default)]
    pub quirks: Vec<PipetteQuirk>,
}

impl PipetteModelConfig {
    pub fn plunger_direction(&self) -> PlungerDirection {
        self.generation.plunger_direction()
    }

    pub fn model_offset(&self) -> Point {
        Point::new(self.model_offset[0], self.model_offset[1], self.model_offset[2])
    }

    pub fn has_quirk(&self, quirk: PipetteQuirk) -> bool {
        self.quirks.contains(&quirk)
    }
}

/// Per-instance changes applied on top of a model config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipetteOverrides {
    /// Identity used to key calibration records; defaults to `<model>_<mount>`
    pub pipette_id: Option<String>,
    pub plunger_positions: Option<PlungerPositions>,
    /// Working volume cap, for example when only smaller tips are in use
    pub max_volume: Option<f64>,
    pub aspirate_flow_rate: Option<f64>,
    pub dispense_flow_rate: Option<f64>,
    pub blow_out_flow_rate: Option<f64>,
    pub pick_up_presses: Option<usize>,
    pub pick_up_increment: Option<f64>,
    pub pick_up_distance: Option<f64>,
    pub pick_up_current_per_channel: Option<f64>,
}

/// Model configs by name.
#[derive(Debug, Clone, Default)]
pub struct PipetteRegistry {
    models: BTreeMap<String, PipetteModelConfig>,
}

impl PipetteRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry holding every built-in model.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for config in builtin_models() {
            registry.register(config);
        }
        registry
    }

    pub fn register(&mut self, config: PipetteModelConfig) {
        self.models.insert(config.model.clone(), config);
    }

    pub fn get(&self, model: &str) -> Option<&PipetteModelConfig> {
        self.models.get(model)
    }

    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    /// Build a pipette for `mount` from a named model and overrides.
    pub fn create_instrument(
        &self,
        model: &str,
        mount: Mount,
        overrides: &PipetteOverrides,
    ) -> RobotResult<Pipette> {
        let config = self
            .get(model)
            .ok_or_else(|| RobotError::UnknownModel(model.to_string()))?;
        Pipette::new(config.clone(), mount, overrides)
    }
}

struct ModelSpec {
    model: &'static str,
    display_name: &'static str,
    generation: PipetteGeneration,
    channels: usize,
    max_volume: f64,
    min_volume: f64,
    aspirate: Vec<[f64; 3]>,
    dispense: Vec<[f64; 3]>,
    flow_rate: f64,
    blow_out_flow_rate: f64,
    tip_overlap: f64,
    quirks: Vec<PipetteQuirk>,
}

fn build(spec: ModelSpec) -> PipetteModelConfig {
    let (plunger_positions, model_offset, pick_up, drop_tip_speed) = match spec.generation {
        PipetteGeneration::Gen1 => (
            PlungerPositions {
                top: 19.5,
                bottom: 2.0,
                blow_out: 0.5,
                drop_tip: -4.0,
            },
            [0.0, 0.0, -25.8],
            PickUpSettings {
                current_per_channel: 0.1,
                distance: 10.0,
                increment: 1.0,
                presses: 3,
                speed: 30.0,
            },
            5.0,
        ),
        PipetteGeneration::Gen2 => (
            PlungerPositions {
                top: 19.5,
                bottom: 1.5,
                blow_out: 0.0,
                drop_tip: -3.5,
            },
            [0.0, 31.0, -37.7],
            PickUpSettings {
                current_per_channel: 0.15,
                distance: 17.0,
                increment: 0.0,
                presses: 1,
                speed: 30.0,
            },
            10.0,
        ),
        PipetteGeneration::Flex => (
            PlungerPositions {
                top: 0.5,
                bottom: 71.5,
                blow_out: 76.5,
                drop_tip: 90.5,
            },
            [-8.0, -22.0, -36.0],
            PickUpSettings {
                current_per_channel: 0.2,
                distance: 13.0,
                increment: 0.0,
                presses: 1,
                speed: 10.0,
            },
            10.0,
        ),
    };

    PipetteModelConfig {
        model: spec.model.to_string(),
        display_name: spec.display_name.to_string(),
        generation: spec.generation,
        channels: spec.channels,
        max_volume: spec.max_volume,
        min_volume: spec.min_volume,
        plunger_positions,
        ul_per_mm_aspirate: UlPerMm(spec.aspirate),
        ul_per_mm_dispense: UlPerMm(spec.dispense),
        default_aspirate_flow_rate: spec.flow_rate,
        default_dispense_flow_rate: spec.flow_rate,
        default_blow_out_flow_rate: spec.blow_out_flow_rate,
        model_offset,
        calibration_probe_length: 44.5,
        pick_up,
        plunger_current: 0.5,
        drop_tip_current: 0.7,
        drop_tip_speed,
        return_tip_height: 0.5,
        default_tip_overlap: spec.tip_overlap,
        quirks: spec.quirks,
    }
}

fn builtin_models() -> Vec<PipetteModelConfig> {
    use PipetteGeneration::*;
    use PipetteQuirk::*;

    vec![
        build(ModelSpec {
            model: "p10_single_v1",
            display_name: "P10 Single-Channel GEN1",
            generation: Gen1,
            channels: 1,
            max_volume: 10.0,
            min_volume: 1.0,
            aspirate: vec![[f64::MAX, 0.0, 0.77]],
            dispense: vec![[f64::MAX, 0.0, 0.77]],
            flow_rate: 5.0,
            blow_out_flow_rate: 1000.0,
            tip_overlap: 3.29,
            quirks: vec![PickupTipShake, DropTipShake],
        }),
        build(ModelSpec {
            model: "p300_single_v1",
            display_name: "P300 Single-Channel GEN1",
            generation: Gen1,
            channels: 1,
            max_volume: 300.0,
            min_volume: 30.0,
            aspirate: vec![[f64::MAX, 0.0, 18.5]],
            dispense: vec![[f64::MAX, 0.0, 18.5]],
            flow_rate: 150.0,
            blow_out_flow_rate: 1000.0,
            tip_overlap: 7.47,
            quirks: vec![PickupTipShake, DropTipShake],
        }),
        build(ModelSpec {
            model: "p20_single_v2.0",
            display_name: "P20 Single-Channel GEN2",
            generation: Gen2,
            channels: 1,
            max_volume: 20.0,
            min_volume: 1.0,
            aspirate: vec![[1.0, 0.5, 1.0], [20.0, 0.005, 1.5]],
            dispense: vec![[20.0, 0.0, 1.55]],
            flow_rate: 3.78,
            blow_out_flow_rate: 3.78,
            tip_overlap: 8.25,
            quirks: vec![],
        }),
        build(ModelSpec {
            model: "p300_single_v2.0",
            display_name: "P300 Single-Channel GEN2",
            generation: Gen2,
            channels: 1,
            max_volume: 300.0,
            min_volume: 20.0,
            aspirate: vec![[5.0, 0.2, 17.0], [300.0, 0.005, 17.0]],
            dispense: vec![[300.0, 0.0, 17.8]],
            flow_rate: 92.86,
            blow_out_flow_rate: 92.86,
            tip_overlap: 7.47,
            quirks: vec![DropTipShake],
        }),
        build(ModelSpec {
            model: "p300_multi_v2.0",
            display_name: "P300 8-Channel GEN2",
            generation: Gen2,
            channels: 8,
            max_volume: 300.0,
            min_volume: 20.0,
            aspirate: vec![[5.0, 0.2, 17.0], [300.0, 0.005, 17.0]],
            dispense: vec![[300.0, 0.0, 17.8]],
            flow_rate: 94.0,
            blow_out_flow_rate: 94.0,
            tip_overlap: 7.47,
            quirks: vec![PickupTipShake],
        }),
        build(ModelSpec {
            model: "p1000_single_v2.0",
            display_name: "P1000 Single-Channel GEN2",
            generation: Gen2,
            channels: 1,
            max_volume: 1000.0,
            min_volume: 100.0,
            aspirate: vec![[10.0, 1.0, 50.0], [1000.0, 0.01, 60.0]],
            dispense: vec![[1000.0, 0.0, 65.0]],
            flow_rate: 274.7,
            blow_out_flow_rate: 274.7,
            tip_overlap: 7.95,
            quirks: vec![DropTipShake],
        }),
        build(ModelSpec {
            model: "flex_1channel_1000",
            display_name: "Flex 1-Channel 1000 μL",
            generation: Flex,
            channels: 1,
            max_volume: 1000.0,
            min_volume: 5.0,
            aspirate: vec![[100.0, 0.05, 14.0], [1000.0, 0.001, 18.9]],
            dispense: vec![[1000.0, 0.0, 19.4]],
            flow_rate: 478.0,
            blow_out_flow_rate: 80.0,
            tip_overlap: 10.5,
            quirks: vec![],
        }),
        build(ModelSpec {
            model: "flex_8channel_1000",
            display_name: "Flex 8-Channel 1000 μL",
            generation: Flex,
            channels: 8,
            max_volume: 1000.0,
            min_volume: 5.0,
            aspirate: vec![[100.0, 0.05, 14.0], [1000.0, 0.001, 18.9]],
            dispense: vec![[1000.0, 0.0, 19.4]],
            flow_rate: 478.0,
            blow_out_flow_rate: 80.0,
            tip_overlap: 10.5,
            quirks: vec![PickupTipShake],
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_ul_per_mm_piecewise() {
        let table = UlPerMm(vec![[5.0, 0.2, 17.0], [300.0, 0.005, 17.0]]);
        assert_relative_eq!(table.evaluate(5.0), 18.0);
        assert_relative_eq!(table.evaluate(200.0), 18.0);
        // Past the last row the last row still applies
        assert_relative_eq!(table.evaluate(400.0), 19.0);
        assert_relative_eq!(UlPerMm::constant(0.77).evaluate(8.0), 0.77);
    }

    #[test]
    fn test_builtin_plunger_positions_are_ordered() {
        let registry = PipetteRegistry::builtin();
        for name in registry.model_names() {
            let config = registry.get(name).unwrap();
            config
                .plunger_positions
                .validate(config.plunger_direction())
                .unwrap();
        }
    }

    #[test]
    fn test_validate_rejects_wrong_direction() {
        let ot2 = PlungerPositions {
            top: 19.5,
            bottom: 2.0,
            blow_out: 0.5,
            drop_tip: -4.0,
        };
        assert!(ot2.validate(PlungerDirection::AscendingFromBottom).is_ok());
        assert!(ot2.validate(PlungerDirection::DescendingFromBottom).is_err());

        let swapped = PlungerPositions {
            blow_out: 3.0,
            ..ot2
        };
        assert!(swapped.validate(PlungerDirection::AscendingFromBottom).is_err());
    }

    #[test]
    fn test_unknown_model() {
        let registry = PipetteRegistry::builtin();
        assert!(matches!(
            registry.create_instrument("p5000_single", Mount::Left, &PipetteOverrides::default()),
            Err(RobotError::UnknownModel(_))
        ));
        assert_eq!(registry.model_names().count(), 8);
    }
}
