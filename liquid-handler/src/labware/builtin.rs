use std::collections::BTreeMap;

use super::{
    LabwareDefinition, LabwareDimensions, LabwareMetadata, LabwareParameters, LabwareProvider,
    Offset3, WellDefinition, WellShape,
};

const NAMESPACE: &str = "opentrons";
const ROWS: [char; 8] = ['A', 'B', 'C', 'D', 'E', 'F', 'G', 'H'];
const WELL_PITCH: f64 = 9.0;
const A1_X: f64 = 14.38;
const A1_Y: f64 = 74.24;
const FOOTPRINT_X: f64 = 127.76;
const FOOTPRINT_Y: f64 = 85.48;

/// Load name of the fixed trash loaded into every deck's trash slot.
pub const FIXED_TRASH: &str = "opentrons_1_trash_1100ml_fixed";

/// Definitions compiled into the crate.
#[derive(Debug, Clone)]
pub struct BuiltinLabware {
    definitions: BTreeMap<String, LabwareDefinition>,
}

impl Default for BuiltinLabware {
    fn default() -> Self {
        Self::new()
    }
}

impl BuiltinLabware {
    pub fn new() -> Self {
        let definitions = [
            tiprack_96("opentrons_96_tiprack_20ul", "Opentrons 96 Tip Rack 20 µL", 39.2, 8.25, 3.27, 20.0, 64.69),
            tiprack_96("opentrons_96_tiprack_300ul", "Opentrons 96 Tip Rack 300 µL", 59.3, 7.47, 5.23, 300.0, 64.49),
            tiprack_96("opentrons_96_filtertiprack_200ul", "Opentrons 96 Filter Tip Rack 200 µL", 59.3, 7.47, 5.23, 200.0, 64.49),
            tiprack_96("opentrons_96_tiprack_1000ul", "Opentrons 96 Tip Rack 1000 µL", 88.0, 7.95, 7.62, 1000.0, 97.47),
            well_plate_96(),
            reservoir_12(),
            fixed_trash(),
        ]
        .into_iter()
        .map(|def| (def.parameters.load_name.clone(), def))
        .collect();
        Self { definitions }
    }

    /// Add or replace a definition.
    pub fn insert(&mut self, definition: LabwareDefinition) {
        self.definitions
            .insert(definition.parameters.load_name.clone(), definition);
    }

    pub fn load_names(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }
}

impl LabwareProvider for BuiltinLabware {
    fn definition(
        &self,
        load_name: &str,
        namespace: Option<&str>,
        version: Option<u32>,
    ) -> Option<LabwareDefinition> {
        self.definitions
            .get(load_name)
            .filter(|def| namespace.map_or(true, |ns| ns == def.namespace))
            .filter(|def| version.map_or(true, |v| v == def.version))
            .cloned()
    }
}

fn grid_ordering(rows: usize, columns: usize) -> Vec<Vec<String>> {
    (1..=columns)
        .map(|col| ROWS[..rows].iter().map(|row| format!("{row}{col}")).collect())
        .collect()
}

fn grid_wells(rows: usize, columns: usize, well: impl Fn(f64, f64) -> WellDefinition) -> BTreeMap<String, WellDefinition> {
    let mut wells = BTreeMap::new();
    for col in 0..columns {
        for (r, row) in ROWS[..rows].iter().enumerate() {
            let x = A1_X + col as f64 * WELL_PITCH;
            let y = A1_Y - r as f64 * WELL_PITCH;
            wells.insert(format!("{row}{}", col + 1), well(x, y));
        }
    }
    wells
}

fn tiprack_96(
    load_name: &str,
    display_name: &str,
    tip_length: f64,
    tip_overlap: f64,
    diameter: f64,
    volume: f64,
    height: f64,
) -> LabwareDefinition {
    LabwareDefinition {
        namespace: NAMESPACE.to_string(),
        version: 1,
        metadata: LabwareMetadata {
            display_name: display_name.to_string(),
            display_category: "tipRack".to_string(),
        },
        parameters: LabwareParameters {
            load_name: load_name.to_string(),
            format: "96Standard".to_string(),
            is_tiprack: true,
            tip_length: Some(tip_length),
            tip_overlap: Some(tip_overlap),
        },
        dimensions: LabwareDimensions {
            x_dimension: FOOTPRINT_X,
            y_dimension: FOOTPRINT_Y,
            z_dimension: height,
        },
        corner_offset_from_slot: Offset3::default(),
        ordering: grid_ordering(8, 12),
        wells: grid_wells(8, 12, |x, y| WellDefinition {
            depth: tip_length,
            total_liquid_volume: volume,
            shape: WellShape::Circular,
            diameter: Some(diameter),
            x_dimension: None,
            y_dimension: None,
            x,
            y,
            z: height - tip_length,
        }),
    }
}

fn well_plate_96() -> LabwareDefinition {
    LabwareDefinition {
        namespace: NAMESPACE.to_string(),
        version: 2,
        metadata: LabwareMetadata {
            display_name: "Corning 96 Well Plate 360 µL Flat".to_string(),
            display_category: "wellPlate".to_string(),
        },
        parameters: LabwareParameters {
            load_name: "corning_96_wellplate_360ul_flat".to_string(),
            format: "96Standard".to_string(),
            is_tiprack: false,
            tip_length: None,
            tip_overlap: None,
        },
        dimensions: LabwareDimensions {
            x_dimension: FOOTPRINT_X,
            y_dimension: FOOTPRINT_Y,
            z_dimension: 14.22,
        },
        corner_offset_from_slot: Offset3::default(),
        ordering: grid_ordering(8, 12),
        wells: grid_wells(8, 12, |x, y| WellDefinition {
            depth: 10.67,
            total_liquid_volume: 360.0,
            shape: WellShape::Circular,
            diameter: Some(6.86),
            x_dimension: None,
            y_dimension: None,
            x,
            y,
            z: 3.55,
        }),
    }
}

fn reservoir_12() -> LabwareDefinition {
    let ordering: Vec<Vec<String>> = (1..=12).map(|col| vec![format!("A{col}")]).collect();
    let wells = (0..12)
        .map(|col| {
            (
                format!("A{}", col + 1),
                WellDefinition {
                    depth: 26.85,
                    total_liquid_volume: 15_000.0,
                    shape: WellShape::Rectangular,
                    diameter: None,
                    x_dimension: Some(8.2),
                    y_dimension: Some(71.2),
                    x: A1_X + col as f64 * WELL_PITCH,
                    y: 42.78,
                    z: 4.55,
                },
            )
        })
        .collect();

    LabwareDefinition {
        namespace: NAMESPACE.to_string(),
        version: 1,
        metadata: LabwareMetadata {
            display_name: "NEST 12 Well Reservoir 15 mL".to_string(),
            display_category: "reservoir".to_string(),
        },
        parameters: LabwareParameters {
            load_name: "nest_12_reservoir_15ml".to_string(),
            format: "trough".to_string(),
            is_tiprack: false,
            tip_length: None,
            tip_overlap: None,
        },
        dimensions: LabwareDimensions {
            x_dimension: FOOTPRINT_X,
            y_dimension: FOOTPRINT_Y,
            z_dimension: 31.4,
        },
        corner_offset_from_slot: Offset3::default(),
        ordering,
        wells,
    }
}

fn fixed_trash() -> LabwareDefinition {
    let mut wells = BTreeMap::new();
    wells.insert(
        "A1".to_string(),
        WellDefinition {
            depth: 77.0,
            total_liquid_volume: 1_100_000.0,
            shape: WellShape::Rectangular,
            diameter: None,
            x_dimension: Some(107.11),
            y_dimension: Some(165.67),
            x: 82.84,
            y: 80.0,
            z: 5.0,
        },
    );

    LabwareDefinition {
        namespace: NAMESPACE.to_string(),
        version: 1,
        metadata: LabwareMetadata {
            display_name: "Fixed Trash".to_string(),
            display_category: "trash".to_string(),
        },
        parameters: LabwareParameters {
            load_name: FIXED_TRASH.to_string(),
            format: "trash".to_string(),
            is_tiprack: false,
            tip_length: None,
            tip_overlap: None,
        },
        dimensions: LabwareDimensions {
            x_dimension: 172.86,
            y_dimension: 165.86,
            z_dimension: 82.0,
        },
        corner_offset_from_slot: Offset3 {
            x: 0.0,
            y: 0.0,
            z: 0.0,
        },
        ordering: vec![vec!["A1".to_string()]],
        wells,
    }
}
