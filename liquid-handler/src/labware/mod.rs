//! Labware definitions.
//!
//! Definitions use the JSON layout shared with protocol files (camelCase keys,
//! a column-major `ordering` of well names, wells keyed by name). Only the
//! fields motion planning needs are modelled; unknown keys are ignored.

mod builtin;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::Point;

pub use builtin::{BuiltinLabware, FIXED_TRASH};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Offset3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl From<Offset3> for Point {
    fn from(o: Offset3) -> Self {
        Point::new(o.x, o.y, o.z)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabwareMetadata {
    pub display_name: String,
    #[serde(default)]
    pub display_category: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabwareParameters {
    pub load_name: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub is_tiprack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tip_length: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tip_overlap: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabwareDimensions {
    pub x_dimension: f64,
    pub y_dimension: f64,
    pub z_dimension: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WellShape {
    Circular,
    Rectangular,
}

/// One well. `x`, `y`, `z` locate the centre of the well bottom relative to
/// the labware origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WellDefinition {
    pub depth: f64,
    pub total_liquid_volume: f64,
    pub shape: WellShape,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diameter: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_dimension: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y_dimension: Option<f64>,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl WellDefinition {
    /// Width across the well along x.
    pub fn width(&self) -> f64 {
        match self.shape {
            WellShape::Circular => self.diameter.unwrap_or(0.0),
            WellShape::Rectangular => self.x_dimension.unwrap_or(0.0),
        }
    }

    /// Width across the well along y.
    pub fn length(&self) -> f64 {
        match self.shape {
            WellShape::Circular => self.diameter.unwrap_or(0.0),
            WellShape::Rectangular => self.y_dimension.unwrap_or(0.0),
        }
    }

    /// Offset of the top-centre of the well from the labware origin.
    pub fn top_offset(&self) -> Point {
        Point::new(self.x, self.y, self.z + self.depth)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabwareDefinition {
    pub namespace: String,
    pub version: u32,
    #[serde(default)]
    pub metadata: LabwareMetadata,
    pub parameters: LabwareParameters,
    pub dimensions: LabwareDimensions,
    #[serde(default)]
    pub corner_offset_from_slot: Offset3,
    pub ordering: Vec<Vec<String>>,
    pub wells: BTreeMap<String, WellDefinition>,
}

impl LabwareDefinition {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn load_name(&self) -> &str {
        &self.parameters.load_name
    }

    pub fn display_name(&self) -> &str {
        if self.metadata.display_name.is_empty() {
            &self.parameters.load_name
        } else {
            &self.metadata.display_name
        }
    }

    /// `namespace/load_name/version`
    pub fn uri(&self) -> String {
        format!(
            "{}/{}/{}",
            self.namespace, self.parameters.load_name, self.version
        )
    }

    /// Hex SHA-256 of the canonical JSON form. Tip-length calibrations are
    /// keyed by this so an edited definition invalidates old records.
    pub fn definition_hash(&self) -> String {
        // Struct fields serialize in declaration order and wells are a
        // BTreeMap, so the encoding is stable.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    pub fn is_tiprack(&self) -> bool {
        self.parameters.is_tiprack
    }

    pub fn tip_length(&self) -> Option<f64> {
        self.parameters.tip_length
    }

    pub fn tip_overlap(&self) -> Option<f64> {
        self.parameters.tip_overlap
    }

    pub fn well(&self, name: &str) -> Option<&WellDefinition> {
        self.wells.get(name)
    }

    /// Well names in column-major order (A1, B1, ... H1, A2, ...).
    pub fn well_names(&self) -> impl Iterator<Item = &str> {
        self.ordering.iter().flatten().map(String::as_str)
    }
}

/// Source of labware definitions by load name.
pub trait LabwareProvider: Send + Sync {
    /// Find a definition. `namespace` and `version` narrow the match when given.
    fn definition(
        &self,
        load_name: &str,
        namespace: Option<&str>,
        version: Option<u32>,
    ) -> Option<LabwareDefinition>;
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINI_PLATE: &str = r#"{
        "namespace": "custom_beta",
        "version": 1,
        "metadata": {"displayName": "Mini Plate", "displayCategory": "wellPlate"},
        "parameters": {"loadName": "mini_plate", "format": "irregular", "isTiprack": false},
        "dimensions": {"xDimension": 127.76, "yDimension": 85.48, "zDimension": 15.0},
        "cornerOffsetFromSlot": {"x": 0, "y": 0, "z": 0},
        "ordering": [["A1", "B1"], ["A2", "B2"]],
        "brand": {"brand": "ignored"},
        "wells": {
            "A1": {"depth": 10, "totalLiquidVolume": 200, "shape": "circular", "diameter": 6, "x": 10, "y": 70, "z": 5},
            "B1": {"depth": 10, "totalLiquidVolume": 200, "shape": "circular", "diameter": 6, "x": 10, "y": 61, "z": 5},
            "A2": {"depth": 10, "totalLiquidVolume": 200, "shape": "rectangular", "xDimension": 8, "yDimension": 8, "x": 19, "y": 70, "z": 5},
            "B2": {"depth": 10, "totalLiquidVolume": 200, "shape": "rectangular", "xDimension": 8, "yDimension": 8, "x": 19, "y": 61, "z": 5}
        }
    }"#;

    #[test]
    fn test_parse_definition() {
        let def = LabwareDefinition::from_json(MINI_PLATE).unwrap();
        assert_eq!(def.uri(), "custom_beta/mini_plate/1");
        assert_eq!(def.display_name(), "Mini Plate");
        assert!(!def.is_tiprack());
        assert_eq!(def.well_names().collect::<Vec<_>>(), vec!["A1", "B1", "A2", "B2"]);

        let a1 = def.well("A1").unwrap();
        assert_eq!(a1.top_offset(), Point::new(10.0, 70.0, 15.0));
        assert_eq!(a1.width(), 6.0);
        assert_eq!(def.well("B2").unwrap().length(), 8.0);
    }

    #[test]
    fn test_definition_hash_tracks_content() {
        let def = LabwareDefinition::from_json(MINI_PLATE).unwrap();
        let same = LabwareDefinition::from_json(MINI_PLATE).unwrap();
        assert_eq!(def.definition_hash(), same.definition_hash());
        assert_eq!(def.definition_hash().len(), 64);

        let mut edited = def.clone();
        edited.dimensions.z_dimension = 16.0;
        assert_ne!(def.definition_hash(), edited.definition_hash());
    }
}
