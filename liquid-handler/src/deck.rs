//! Deck slots, loaded labware and modules.
//!
//! The deck is a pose-graph root with one node per slot. Labware is tracked
//! under its slot (or module, or the labware it stacks on), with a node per
//! well at the well's top centre and one extent node at the labware's top.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{RobotError, RobotResult};
use crate::labware::{LabwareDefinition, WellDefinition};
use crate::modules::{DeckModule, ModuleModel};
use crate::pose::{ObjectId, PoseGraph};
use crate::types::{Location, Point};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeckKind {
    #[default]
    Flex,
    Ot2,
}

/// Slot names and positions for one deck type.
#[derive(Debug, Clone)]
pub struct DeckLayout {
    kind: DeckKind,
    slots: Vec<(String, Point)>,
    trash_slot: String,
}

const FLEX_ROWS: [char; 4] = ['D', 'C', 'B', 'A'];
const FLEX_COLUMN_X: [f64; 3] = [0.0, 164.0, 328.0];
const FLEX_ROW_Y: [f64; 4] = [0.0, 107.0, 214.0, 321.0];
const OT2_SLOT_X: f64 = 132.5;
const OT2_SLOT_Y: f64 = 90.5;

/// Footprint of a standard slot, x by y.
pub const SLOT_FOOTPRINT: (f64, f64) = (127.76, 85.48);

impl DeckLayout {
    /// Twelve lettered slots, A1 at the back left, trash in A3.
    pub fn flex() -> Self {
        let mut slots = Vec::new();
        for (r, row) in FLEX_ROWS.iter().enumerate() {
            for (c, x) in FLEX_COLUMN_X.iter().enumerate() {
                slots.push((format!("{row}{}", c + 1), Point::new(*x, FLEX_ROW_Y[r], 0.0)));
            }
        }
        Self {
            kind: DeckKind::Flex,
            slots,
            trash_slot: "A3".to_string(),
        }
    }

    /// Slots 1-12 in rows of three from the front left, trash in 12.
    pub fn ot2() -> Self {
        let slots = (0..12)
            .map(|i| {
                let col = (i % 3) as f64;
                let row = (i / 3) as f64;
                ((i + 1).to_string(), Point::new(col * OT2_SLOT_X, row * OT2_SLOT_Y, 0.0))
            })
            .collect();
        Self {
            kind: DeckKind::Ot2,
            slots,
            trash_slot: "12".to_string(),
        }
    }

    pub fn for_kind(kind: DeckKind) -> Self {
        match kind {
            DeckKind::Flex => Self::flex(),
            DeckKind::Ot2 => Self::ot2(),
        }
    }

    pub fn kind(&self) -> DeckKind {
        self.kind
    }

    pub fn trash_slot(&self) -> &str {
        &self.trash_slot
    }

    pub fn slot_names(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|(name, _)| name.as_str())
    }

    /// Canonical slot name. Numbered OT-2 names and lettered Flex names are
    /// accepted on either deck.
    pub fn normalize(&self, name: &str) -> RobotResult<String> {
        let name = name.trim().to_ascii_uppercase();
        let index = if let Ok(n) = name.parse::<usize>() {
            (1..=12).contains(&n).then(|| n - 1)
        } else {
            let mut chars = name.chars();
            match (chars.next(), chars.next(), chars.next()) {
                (Some(row), Some(col), None) => {
                    let r = FLEX_ROWS.iter().position(|c| *c == row);
                    let c = col.to_digit(10).map(|d| d as usize).filter(|d| (1..=3).contains(d));
                    r.zip(c).map(|(r, c)| r * 3 + c - 1)
                }
                _ => None,
            }
        };
        index
            .and_then(|i| self.slots.get(i))
            .map(|(n, _)| n.clone())
            .ok_or(RobotError::InvalidSlot(name))
    }

    pub fn slot_position(&self, name: &str) -> RobotResult<Point> {
        let canonical = self.normalize(name)?;
        self.slots
            .iter()
            .find(|(n, _)| *n == canonical)
            .map(|(_, p)| *p)
            .ok_or(RobotError::InvalidSlot(canonical))
    }

    /// Centre of a slot at deck height, where its calibration square sits.
    pub fn slot_center(&self, name: &str) -> RobotResult<Point> {
        let corner = self.slot_position(name)?;
        Ok(corner + Point::new(SLOT_FOOTPRINT.0 / 2.0, SLOT_FOOTPRINT.1 / 2.0, 0.0))
    }

    /// Slots probed when solving the deck attitude.
    pub fn attitude_slots(&self) -> [&'static str; 3] {
        match self.kind {
            DeckKind::Ot2 => ["1", "3", "7"],
            DeckKind::Flex => ["D1", "D3", "B1"],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabwareParent {
    Slot(String),
    Module(ObjectId),
    /// Stacked on top of another labware, such as an adapter
    Labware(ObjectId),
}

#[derive(Debug, Clone)]
pub struct Labware {
    pub id: ObjectId,
    pub definition: LabwareDefinition,
    pub parent: LabwareParent,
    /// Deck slot the labware ultimately sits in
    pub slot: String,
    pub calibration_offset: Point,
    wells: BTreeMap<String, ObjectId>,
    stacked: Option<ObjectId>,
}

impl Labware {
    pub fn well_id(&self, name: &str) -> Option<ObjectId> {
        self.wells.get(name).copied()
    }

    pub fn describe(&self) -> String {
        format!("{} on slot {}", self.definition.display_name(), self.slot)
    }
}

/// Snapshot of one well's geometry and absolute top centre.
#[derive(Debug, Clone, PartialEq)]
pub struct Well {
    pub id: ObjectId,
    pub labware: ObjectId,
    pub name: String,
    pub geometry: WellDefinition,
    pub top_center: Point,
}

impl Well {
    /// `z` millimetres above the top centre.
    pub fn top(&self, z: f64) -> Location {
        self.at(self.top_center + Point::new(0.0, 0.0, z))
    }

    /// `z` millimetres above the bottom centre.
    pub fn bottom(&self, z: f64) -> Location {
        self.at(self.top_center + Point::new(0.0, 0.0, z - self.geometry.depth))
    }

    pub fn center(&self) -> Location {
        self.at(self.top_center - Point::new(0.0, 0.0, self.geometry.depth / 2.0))
    }

    pub fn depth(&self) -> f64 {
        self.geometry.depth
    }

    pub fn diameter(&self) -> Option<f64> {
        self.geometry.diameter
    }

    fn at(&self, point: Point) -> Location {
        Location::in_well(point, self.labware, self.id)
    }
}

pub struct Deck {
    layout: DeckLayout,
    root: ObjectId,
    slots: BTreeMap<String, ObjectId>,
    occupants: BTreeMap<String, ObjectId>,
    labware: BTreeMap<ObjectId, Labware>,
    modules: BTreeMap<ObjectId, DeckModule>,
    well_owners: HashMap<ObjectId, (ObjectId, String)>,
    trash: Option<ObjectId>,
}

impl Deck {
    /// Register the deck root and its slots in `graph`.
    pub fn new(layout: DeckLayout, graph: &mut PoseGraph) -> RobotResult<Self> {
        let root = graph.allocate_id();
        graph.create_root_object(root, Point::zeros())?;
        let mut slots = BTreeMap::new();
        for (name, position) in &layout.slots {
            let id = graph.allocate_id();
            graph.track_object(root, id, *position)?;
            slots.insert(name.clone(), id);
        }
        Ok(Self {
            layout,
            root,
            slots,
            occupants: BTreeMap::new(),
            labware: BTreeMap::new(),
            modules: BTreeMap::new(),
            well_owners: HashMap::new(),
            trash: None,
        })
    }

    pub fn layout(&self) -> &DeckLayout {
        &self.layout
    }

    pub fn root(&self) -> ObjectId {
        self.root
    }

    pub fn slot_id(&self, name: &str) -> RobotResult<ObjectId> {
        let canonical = self.layout.normalize(name)?;
        self.slots
            .get(&canonical)
            .copied()
            .ok_or(RobotError::InvalidSlot(canonical))
    }

    /// What occupies a slot, if anything.
    pub fn occupant(&self, slot: &str) -> RobotResult<Option<ObjectId>> {
        let canonical = self.layout.normalize(slot)?;
        Ok(self.occupants.get(&canonical).copied())
    }

    fn describe_object(&self, id: ObjectId) -> String {
        if let Some(lw) = self.labware.get(&id) {
            lw.definition.display_name().to_string()
        } else if let Some(module) = self.modules.get(&id) {
            module.model.to_string()
        } else {
            id.to_string()
        }
    }

    fn claim_slot(&self, slot: &str) -> RobotResult<(String, ObjectId)> {
        let canonical = self.layout.normalize(slot)?;
        if let Some(occupant) = self.occupants.get(&canonical) {
            return Err(RobotError::SlotOccupied {
                slot: canonical,
                occupant: self.describe_object(*occupant),
            });
        }
        let id = self
            .slots
            .get(&canonical)
            .copied()
            .ok_or_else(|| RobotError::InvalidSlot(canonical.clone()))?;
        Ok((canonical, id))
    }

    /// Track a labware and its wells. `calibration_offset` is applied once
    /// to the labware node, so every well inherits it.
    pub fn load_labware(
        &mut self,
        graph: &mut PoseGraph,
        definition: LabwareDefinition,
        parent: LabwareParent,
        calibration_offset: Point,
    ) -> RobotResult<ObjectId> {
        let (parent_node, slot, base) = match &parent {
            LabwareParent::Slot(name) => {
                let (slot, node) = self.claim_slot(name)?;
                (node, slot, Point::zeros())
            }
            LabwareParent::Module(module_id) => {
                let module = self
                    .modules
                    .get(module_id)
                    .ok_or(RobotError::UnknownModule(*module_id))?;
                if let Some(existing) = module.labware {
                    return Err(RobotError::SlotOccupied {
                        slot: module.slot.clone(),
                        occupant: self.describe_object(existing),
                    });
                }
                (*module_id, module.slot.clone(), Point::zeros())
            }
            LabwareParent::Labware(below) => {
                let lw = self.labware(*below)?;
                if let Some(existing) = lw.stacked {
                    return Err(RobotError::SlotOccupied {
                        slot: lw.slot.clone(),
                        occupant: self.describe_object(existing),
                    });
                }
                let height = lw.definition.dimensions.z_dimension;
                (*below, lw.slot.clone(), Point::new(0.0, 0.0, height))
            }
        };

        let id = graph.allocate_id();
        let corner: Point = definition.corner_offset_from_slot.into();
        graph.track_object(parent_node, id, base + corner + calibration_offset)?;

        let dims = definition.dimensions;
        let extent = graph.allocate_id();
        graph.track_object(
            id,
            extent,
            Point::new(dims.x_dimension / 2.0, dims.y_dimension / 2.0, dims.z_dimension),
        )?;

        let mut wells = BTreeMap::new();
        for name in definition.well_names() {
            let Some(well) = definition.well(name) else {
                continue;
            };
            let well_id = graph.allocate_id();
            graph.track_object(id, well_id, well.top_offset())?;
            wells.insert(name.to_string(), well_id);
            self.well_owners.insert(well_id, (id, name.to_string()));
        }

        match &parent {
            LabwareParent::Slot(_) => {
                self.occupants.insert(slot.clone(), id);
            }
            LabwareParent::Module(module_id) => {
                if let Some(module) = self.modules.get_mut(module_id) {
                    module.labware = Some(id);
                }
            }
            LabwareParent::Labware(below) => {
                if let Some(lw) = self.labware.get_mut(below) {
                    lw.stacked = Some(id);
                }
            }
        }

        info!(
            "Loaded {} ({}) into slot {} as {}",
            definition.display_name(),
            definition.uri(),
            slot,
            id
        );
        self.labware.insert(
            id,
            Labware {
                id,
                definition,
                parent,
                slot,
                calibration_offset,
                wells,
                stacked: None,
            },
        );
        Ok(id)
    }

    /// Load the fixed trash into the layout's trash slot.
    pub fn load_trash(&mut self, graph: &mut PoseGraph, definition: LabwareDefinition) -> RobotResult<ObjectId> {
        let slot = self.layout.trash_slot.clone();
        let id = self.load_labware(graph, definition, LabwareParent::Slot(slot), Point::zeros())?;
        self.trash = Some(id);
        Ok(id)
    }

    /// Remove a labware and anything stacked on it.
    pub fn unload_labware(&mut self, graph: &mut PoseGraph, id: ObjectId) -> RobotResult<Vec<ObjectId>> {
        let lw = self.labware(id)?.clone();
        let removed = graph.remove_object(id)?;
        let mut unloaded = Vec::new();
        for gone in &removed {
            if self.labware.remove(gone).is_some() {
                unloaded.push(*gone);
            }
            self.well_owners.remove(gone);
        }
        match &lw.parent {
            LabwareParent::Slot(_) => {
                self.occupants.remove(&lw.slot);
            }
            LabwareParent::Module(module_id) => {
                if let Some(module) = self.modules.get_mut(module_id) {
                    module.labware = None;
                }
            }
            LabwareParent::Labware(below) => {
                if let Some(below) = self.labware.get_mut(below) {
                    below.stacked = None;
                }
            }
        }
        if self.trash == Some(id) {
            self.trash = None;
        }
        debug!("Unloaded {:?} from slot {}", unloaded, lw.slot);
        Ok(unloaded)
    }

    pub fn load_module(&mut self, graph: &mut PoseGraph, model: ModuleModel, slot: &str) -> RobotResult<ObjectId> {
        let (slot, slot_node) = self.claim_slot(slot)?;
        let extra_slot = if model.is_thermocycler() {
            let (required, behind) = match self.layout.kind {
                DeckKind::Ot2 => ("7", "10"),
                DeckKind::Flex => ("B1", "A1"),
            };
            if slot != required {
                return Err(RobotError::InvalidSlot(format!(
                    "{slot} (thermocycler must be loaded in {required})"
                )));
            }
            Some(self.claim_slot(behind)?.0)
        } else {
            None
        };

        let id = graph.allocate_id();
        graph.track_object(slot_node, id, model.labware_offset())?;
        self.occupants.insert(slot.clone(), id);
        if let Some(extra) = extra_slot {
            self.occupants.insert(extra, id);
        }
        info!("Loaded {} into slot {} as {}", model, slot, id);
        self.modules.insert(id, DeckModule::new(id, model, slot));
        Ok(id)
    }

    pub fn labware(&self, id: ObjectId) -> RobotResult<&Labware> {
        self.labware.get(&id).ok_or(RobotError::UnknownLabware(id))
    }

    pub fn all_labware(&self) -> impl Iterator<Item = &Labware> {
        self.labware.values()
    }

    pub fn module(&self, id: ObjectId) -> RobotResult<&DeckModule> {
        self.modules.get(&id).ok_or(RobotError::UnknownModule(id))
    }

    pub fn module_mut(&mut self, id: ObjectId) -> RobotResult<&mut DeckModule> {
        self.modules.get_mut(&id).ok_or(RobotError::UnknownModule(id))
    }

    /// The module a labware sits on, directly or through an adapter.
    pub fn module_under(&self, labware: ObjectId) -> Option<&DeckModule> {
        let mut current = self.labware.get(&labware)?;
        loop {
            match &current.parent {
                LabwareParent::Module(id) => return self.modules.get(id),
                LabwareParent::Labware(below) => current = self.labware.get(below)?,
                LabwareParent::Slot(_) => return None,
            }
        }
    }

    pub fn well(&self, graph: &PoseGraph, labware: ObjectId, name: &str) -> RobotResult<Well> {
        let lw = self.labware(labware)?;
        let id = lw.well_id(name).ok_or_else(|| RobotError::UnknownWell {
            labware: lw.definition.display_name().to_string(),
            well: name.to_string(),
        })?;
        self.well_snapshot(graph, lw, id, name)
    }

    pub fn well_by_id(&self, graph: &PoseGraph, well: ObjectId) -> RobotResult<Well> {
        let (labware, name) = self
            .well_owners
            .get(&well)
            .ok_or(RobotError::Pose(crate::pose::PoseError::NotTracked(well)))?;
        let lw = self.labware(*labware)?;
        self.well_snapshot(graph, lw, well, name)
    }

    /// Every well of a labware in column-major order.
    pub fn wells(&self, graph: &PoseGraph, labware: ObjectId) -> RobotResult<Vec<Well>> {
        let lw = self.labware(labware)?;
        lw.definition
            .well_names()
            .filter_map(|name| lw.well_id(name).map(|id| (id, name)))
            .map(|(id, name)| self.well_snapshot(graph, lw, id, name))
            .collect()
    }

    fn well_snapshot(&self, graph: &PoseGraph, lw: &Labware, id: ObjectId, name: &str) -> RobotResult<Well> {
        let geometry = *lw.definition.well(name).ok_or_else(|| RobotError::UnknownWell {
            labware: lw.definition.display_name().to_string(),
            well: name.to_string(),
        })?;
        Ok(Well {
            id,
            labware: lw.id,
            name: name.to_string(),
            geometry,
            top_center: graph.get(id)?.position,
        })
    }

    pub fn trash(&self) -> Option<ObjectId> {
        self.trash
    }

    /// Where tips are dropped when no location is given.
    pub fn trash_location(&self, graph: &PoseGraph) -> RobotResult<Location> {
        let trash = self
            .trash
            .ok_or_else(|| RobotError::DefinitionNotFound("fixed trash".to_string()))?;
        let first = self
            .labware(trash)?
            .definition
            .well_names()
            .next()
            .map(str::to_string)
            .ok_or_else(|| RobotError::DefinitionNotFound("trash well".to_string()))?;
        Ok(self.well(graph, trash, &first)?.top(0.0))
    }

    /// Highest point of anything on the deck.
    pub fn highest_z(&self, graph: &PoseGraph) -> RobotResult<f64> {
        Ok(graph.max_z_in_subtree(self.root)?)
    }

    /// Human-readable description of a location, for command messages.
    pub fn describe_location(&self, location: &Location) -> String {
        let well = location
            .well
            .and_then(|w| self.well_owners.get(&w))
            .map(|(_, name)| name.clone());
        let labware = location.labware.and_then(|id| self.labware.get(&id));
        match (well, labware) {
            (Some(well), Some(lw)) => format!("{} of {}", well, lw.describe()),
            (None, Some(lw)) => lw.describe(),
            _ => format!(
                "({:.2}, {:.2}, {:.2})",
                location.point.x, location.point.y, location.point.z
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labware::{BuiltinLabware, LabwareProvider, FIXED_TRASH};
    use approx::assert_relative_eq;

    fn builtin(name: &str) -> LabwareDefinition {
        BuiltinLabware::new().definition(name, None, None).unwrap()
    }

    #[test]
    fn test_slot_names_normalize_across_decks() {
        let flex = DeckLayout::flex();
        assert_eq!(flex.normalize("a1").unwrap(), "A1");
        assert_eq!(flex.normalize("1").unwrap(), "D1");
        assert_eq!(flex.slot_position("A3").unwrap(), Point::new(328.0, 321.0, 0.0));
        assert!(matches!(flex.normalize("E1"), Err(RobotError::InvalidSlot(_))));

        let ot2 = DeckLayout::ot2();
        assert_eq!(ot2.normalize("D1").unwrap(), "1");
        assert_eq!(ot2.slot_position("5").unwrap(), Point::new(132.5, 90.5, 0.0));
        assert!(ot2.normalize("13").is_err());
    }

    #[test]
    fn test_wells_follow_labware_offset() {
        let mut graph = PoseGraph::new();
        let mut deck = Deck::new(DeckLayout::ot2(), &mut graph).unwrap();
        let plate = deck
            .load_labware(
                &mut graph,
                builtin("corning_96_wellplate_360ul_flat"),
                LabwareParent::Slot("2".to_string()),
                Point::new(0.5, -0.25, 0.1),
            )
            .unwrap();

        let a1 = deck.well(&graph, plate, "A1").unwrap();
        let expected = Point::new(132.5 + 14.38 + 0.5, 74.24 - 0.25, 3.55 + 10.67 + 0.1);
        assert_relative_eq!(a1.top_center, expected, epsilon = 1e-9);
        assert_relative_eq!(a1.bottom(1.0).point.z, 3.55 + 0.1 + 1.0, epsilon = 1e-9);
        assert_eq!(a1.top(0.0).well, Some(a1.id));
        assert_eq!(deck.wells(&graph, plate).unwrap().len(), 96);
        assert_relative_eq!(deck.highest_z(&graph).unwrap(), 14.22 + 0.1, epsilon = 1e-9);
    }

    #[test]
    fn test_slot_occupancy() {
        let mut graph = PoseGraph::new();
        let mut deck = Deck::new(DeckLayout::flex(), &mut graph).unwrap();
        deck.load_labware(
            &mut graph,
            builtin("opentrons_96_tiprack_300ul"),
            LabwareParent::Slot("B2".to_string()),
            Point::zeros(),
        )
        .unwrap();
        let err = deck
            .load_labware(
                &mut graph,
                builtin("corning_96_wellplate_360ul_flat"),
                LabwareParent::Slot("b2".to_string()),
                Point::zeros(),
            )
            .unwrap_err();
        assert!(matches!(err, RobotError::SlotOccupied { .. }));
    }

    #[test]
    fn test_unload_frees_slot_and_nodes() {
        let mut graph = PoseGraph::new();
        let mut deck = Deck::new(DeckLayout::flex(), &mut graph).unwrap();
        let before = graph.len();
        let plate = deck
            .load_labware(
                &mut graph,
                builtin("corning_96_wellplate_360ul_flat"),
                LabwareParent::Slot("C1".to_string()),
                Point::zeros(),
            )
            .unwrap();
        let well = deck.well(&graph, plate, "H12").unwrap();

        deck.unload_labware(&mut graph, plate).unwrap();
        assert_eq!(graph.len(), before);
        assert!(!graph.contains(well.id));
        assert_eq!(deck.occupant("C1").unwrap(), None);
    }

    #[test]
    fn test_module_raises_labware() {
        let mut graph = PoseGraph::new();
        let mut deck = Deck::new(DeckLayout::ot2(), &mut graph).unwrap();
        let module = deck
            .load_module(&mut graph, ModuleModel::TemperatureModuleV2, "3")
            .unwrap();
        let plate = deck
            .load_labware(
                &mut graph,
                builtin("corning_96_wellplate_360ul_flat"),
                LabwareParent::Module(module),
                Point::zeros(),
            )
            .unwrap();
        let a1 = deck.well(&graph, plate, "A1").unwrap();
        assert_relative_eq!(a1.top_center.z, 80.09 + 3.55 + 10.67, epsilon = 1e-9);
        assert_eq!(deck.module_under(plate).map(|m| m.id), Some(module));
        assert!(deck.load_module(&mut graph, ModuleModel::MagneticModuleV2, "3").is_err());
    }

    #[test]
    fn test_thermocycler_claims_two_slots() {
        let mut graph = PoseGraph::new();
        let mut deck = Deck::new(DeckLayout::ot2(), &mut graph).unwrap();
        assert!(deck
            .load_module(&mut graph, ModuleModel::ThermocyclerModuleV1, "4")
            .is_err());
        let tc = deck
            .load_module(&mut graph, ModuleModel::ThermocyclerModuleV1, "7")
            .unwrap();
        assert_eq!(deck.occupant("10").unwrap(), Some(tc));
    }

    #[test]
    fn test_trash_location() {
        let mut graph = PoseGraph::new();
        let mut deck = Deck::new(DeckLayout::ot2(), &mut graph).unwrap();
        deck.load_trash(&mut graph, builtin(FIXED_TRASH)).unwrap();
        let trash = deck.trash_location(&graph).unwrap();
        assert_relative_eq!(trash.point.z, 82.0, epsilon = 1e-9);
        assert!(trash.labware.is_some());
    }
}
