//! Robot configuration.
//!
//! Loaded from a JSON file; any missing key falls back to the OT-2 style
//! defaults below.

use std::fs;
use std::path::Path;

use hardware::{Axis, AxisMap};
use nalgebra::Matrix4;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::deck::DeckKind;
use crate::error::{RobotError, RobotResult};
use crate::tips::TipExhaustion;
use crate::types::{Mount, Point};

/// Contact probing and sweep parameters for the calibration routines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    /// Search strides, coarse to fine
    pub search_strides_mm: Vec<f64>,
    /// Strides below this are skipped
    pub min_valid_stride_mm: f64,
    pub max_steps_per_stride: usize,
    /// A contact this far above the expected surface aborts the search
    pub early_sense_tolerance_mm: f64,
    /// A contact within this band of the expected surface counts as a hit
    pub edge_hit_tolerance_mm: f64,
    /// How far each probe descends before giving up
    pub probe_distance_mm: f64,
    pub sweep_smoothing_window: usize,
    /// Nominal width of the calibration square
    pub slot_width_mm: f64,
    pub slot_width_tolerance_mm: f64,
    /// Height above the expected surface each probe starts from
    pub transit_height_mm: f64,
    pub probe_speed_mm_s: f64,
    pub sweep_speed_mm_s: f64,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            search_strides_mm: vec![3.0, 1.0, 0.25, 0.1, 0.025],
            min_valid_stride_mm: 0.01,
            max_steps_per_stride: 20,
            early_sense_tolerance_mm: 0.5,
            edge_hit_tolerance_mm: 0.5,
            probe_distance_mm: 10.0,
            sweep_smoothing_window: 5,
            slot_width_mm: 20.0,
            slot_width_tolerance_mm: 1.0,
            transit_height_mm: 5.0,
            probe_speed_mm_s: 5.0,
            sweep_speed_mm_s: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    pub name: String,
    pub deck: DeckKind,
    /// Machine coordinates reached by homing each axis
    pub home_position: AxisMap,
    /// Lowest machine coordinate each axis may be commanded to
    pub lower_limits: AxisMap,
    /// World offset of the left mount from the gantry reference point
    pub left_mount_offset: [f64; 3],
    /// World offset of the right mount from the gantry reference point
    pub right_mount_offset: [f64; 3],
    /// Deck attitude used until a calibrated one is stored, row major
    pub default_deck_attitude: [[f64; 4]; 4],
    /// Gantry speed when none is requested, mm/s
    pub default_speed: f64,
    /// Extra height added above the tallest object for arc moves
    pub arc_clearance: f64,
    /// Extra height above the shared labware for moves within one labware
    pub minimum_z_margin: f64,
    /// Hold currents applied after a pick-up or drop-tip press, amps
    pub default_currents: AxisMap,
    pub tip_exhaustion: TipExhaustion,
    pub calibration: CalibrationSettings,
}

impl Default for RobotConfig {
    fn default() -> Self {
        let home_position = [
            (Axis::X, 418.0),
            (Axis::Y, 353.0),
            (Axis::Z, 218.0),
            (Axis::A, 218.0),
            (Axis::B, 19.0),
            (Axis::C, 19.0),
        ]
        .into_iter()
        .collect();
        let lower_limits = [
            (Axis::X, 0.0),
            (Axis::Y, 0.0),
            (Axis::Z, -10.0),
            (Axis::A, -10.0),
        ]
        .into_iter()
        .collect();
        let default_currents = [
            (Axis::X, 1.25),
            (Axis::Y, 1.25),
            (Axis::Z, 0.8),
            (Axis::A, 0.8),
            (Axis::B, 0.05),
            (Axis::C, 0.05),
        ]
        .into_iter()
        .collect();
        Self {
            name: "liquid-handler".to_string(),
            deck: DeckKind::Ot2,
            home_position,
            lower_limits,
            left_mount_offset: [-34.0, 0.0, 0.0],
            right_mount_offset: [0.0, 0.0, 0.0],
            default_deck_attitude: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
                [0.0, 0.0, 0.0, 1.0],
            ],
            default_speed: 400.0,
            arc_clearance: 10.0,
            minimum_z_margin: 1.0,
            default_currents,
            tip_exhaustion: TipExhaustion::Error,
            calibration: CalibrationSettings::default(),
        }
    }
}

impl RobotConfig {
    pub fn flex() -> Self {
        let mut config = Self {
            deck: DeckKind::Flex,
            ..Self::default()
        };
        config.home_position.insert(Axis::X, 477.2);
        config.home_position.insert(Axis::Y, 493.8);
        config.home_position.insert(Axis::Z, 253.0);
        config.home_position.insert(Axis::A, 253.0);
        config.home_position.insert(Axis::B, 0.0);
        config.home_position.insert(Axis::C, 0.0);
        config.left_mount_offset = [-13.5, -60.5, 0.0];
        config.right_mount_offset = [40.5, -60.5, 0.0];
        config
    }

    /// Read a config file. Missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> RobotResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        info!("Loaded robot config '{}' from {}", config.name, path.display());
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> RobotResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> RobotResult<()> {
        for axis in [Axis::X, Axis::Y, Axis::Z, Axis::A] {
            if !self.home_position.contains_key(&axis) {
                return Err(RobotError::Config(format!(
                    "home_position is missing axis {axis}"
                )));
            }
        }
        if self.arc_clearance < 0.0 || self.minimum_z_margin < 0.0 {
            return Err(RobotError::Config(
                "arc_clearance and minimum_z_margin must be non-negative".to_string(),
            ));
        }
        if self.calibration.search_strides_mm.is_empty() {
            return Err(RobotError::Config(
                "calibration.search_strides_mm must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn mount_offset(&self, mount: Mount) -> Point {
        let o = match mount {
            Mount::Left => self.left_mount_offset,
            Mount::Right => self.right_mount_offset,
        };
        Point::new(o[0], o[1], o[2])
    }

    pub fn default_attitude(&self) -> Matrix4<f64> {
        Matrix4::from_fn(|r, c| self.default_deck_attitude[r][c])
    }

    pub fn home(&self, axis: Axis) -> f64 {
        self.home_position.get(&axis).copied().unwrap_or(0.0)
    }
}
