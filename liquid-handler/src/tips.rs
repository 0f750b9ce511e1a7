//! Tip availability.
//!
//! Each tip rack has a [`TipTracker`] recording which wells still hold a tip.
//! A [`TipSelector`] walks a pipette's assigned racks in order to find the next
//! usable tip, and decides what happens when they are all used.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{RobotError, RobotResult};
use crate::pose::ObjectId;

/// What to do when every assigned rack is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TipExhaustion {
    /// Fail with [`RobotError::OutOfTips`]
    #[default]
    Error,
    /// Mark every assigned rack full again and start over
    Cycle,
}

#[derive(Debug, Clone)]
pub struct TipTracker {
    labware: ObjectId,
    name: String,
    columns: Vec<Vec<String>>,
    present: HashMap<String, bool>,
    last_used: Option<String>,
}

impl TipTracker {
    /// A full rack. `columns` is the rack's column-major well ordering.
    pub fn new(labware: ObjectId, name: impl Into<String>, columns: &[Vec<String>]) -> Self {
        let present = columns.iter().flatten().map(|w| (w.clone(), true)).collect();
        Self {
            labware,
            name: name.into(),
            columns: columns.to_vec(),
            present,
            last_used: None,
        }
    }

    pub fn labware(&self) -> ObjectId {
        self.labware
    }

    pub fn has_tip(&self, well: &str) -> bool {
        self.present.get(well).copied().unwrap_or(false)
    }

    pub fn available(&self) -> usize {
        self.present.values().filter(|p| **p).count()
    }

    /// Wells covered by a pick-up of `channels` tips starting at `well`: the
    /// well itself and the next `channels - 1` below it in the same column.
    fn span(&self, well: &str, channels: usize) -> Option<&[String]> {
        self.columns.iter().find_map(|column| {
            let start = column.iter().position(|w| w == well)?;
            column.get(start..start + channels.max(1))
        })
    }

    /// First well, in column-major order, from which `channels` tips can be
    /// picked up together. Searching starts at `starting` when given.
    pub fn next_tip(&self, channels: usize, starting: Option<&str>) -> Option<String> {
        let mut started = starting.is_none();
        self.columns
            .iter()
            .flatten()
            .filter(|well| {
                started = started || starting == Some(well.as_str());
                started
            })
            .find(|well| {
                self.span(well, channels)
                    .is_some_and(|span| span.iter().all(|w| self.has_tip(w)))
            })
            .cloned()
    }

    /// Whether `channels` tips can be picked up together starting at `well`.
    pub fn check_pick(&self, well: &str, channels: usize) -> RobotResult<()> {
        let span = self
            .span(well, channels)
            .ok_or_else(|| self.missing(well))?;
        match span.iter().find(|w| !self.has_tip(w)) {
            Some(empty) => Err(self.missing(empty)),
            None => Ok(()),
        }
    }

    /// Mark the tips under a pick-up as gone.
    pub fn use_tips(&mut self, well: &str, channels: usize) -> RobotResult<()> {
        self.check_pick(well, channels)?;
        let span = self
            .span(well, channels)
            .map(<[String]>::to_vec)
            .unwrap_or_default();
        for w in &span {
            self.present.insert(w.clone(), false);
        }
        self.last_used = Some(well.to_string());
        Ok(())
    }

    /// Put tips back. Every well in the span must be empty.
    pub fn return_tips(&mut self, well: &str, channels: usize) -> RobotResult<()> {
        let span = self
            .span(well, channels)
            .ok_or_else(|| self.missing(well))?
            .to_vec();
        if let Some(full) = span.iter().find(|w| self.has_tip(w)) {
            return Err(RobotError::TipPresent {
                labware: self.name.clone(),
                well: full.clone(),
            });
        }
        for w in &span {
            self.present.insert(w.clone(), true);
        }
        Ok(())
    }

    /// Well most recently picked from.
    pub fn previous_tip(&self) -> Option<&str> {
        self.last_used.as_deref()
    }

    /// Mark every well full.
    pub fn reset(&mut self) {
        for present in self.present.values_mut() {
            *present = true;
        }
        self.last_used = None;
    }

    fn missing(&self, well: &str) -> RobotError {
        RobotError::TipMissing {
            labware: self.name.clone(),
            well: well.to_string(),
        }
    }
}

/// Chooses tips from an ordered list of racks.
#[derive(Debug, Clone)]
pub struct TipSelector {
    racks: Vec<ObjectId>,
    exhaustion: TipExhaustion,
    starting_tip: Option<(ObjectId, String)>,
}

impl TipSelector {
    pub fn new(racks: Vec<ObjectId>, exhaustion: TipExhaustion) -> Self {
        Self {
            racks,
            exhaustion,
            starting_tip: None,
        }
    }

    pub fn racks(&self) -> &[ObjectId] {
        &self.racks
    }

    pub fn set_racks(&mut self, racks: Vec<ObjectId>) {
        self.racks = racks;
        self.starting_tip = None;
    }

    /// Begin searching at this well of this rack; earlier racks are skipped.
    pub fn set_starting_tip(&mut self, rack: ObjectId, well: impl Into<String>) {
        self.starting_tip = Some((rack, well.into()));
    }

    /// Next `(rack, well)` with `channels` tips available.
    pub fn next(
        &self,
        trackers: &mut BTreeMap<ObjectId, TipTracker>,
        channels: usize,
    ) -> RobotResult<(ObjectId, String)> {
        if let Some(found) = self.search(trackers, channels) {
            return Ok(found);
        }
        match self.exhaustion {
            TipExhaustion::Error => Err(RobotError::OutOfTips),
            TipExhaustion::Cycle => {
                warn!("Tip racks exhausted; reusing racks {:?}", self.racks);
                for rack in &self.racks {
                    if let Some(tracker) = trackers.get_mut(rack) {
                        tracker.reset();
                    }
                }
                self.search(trackers, channels).ok_or(RobotError::OutOfTips)
            }
        }
    }

    fn search(
        &self,
        trackers: &BTreeMap<ObjectId, TipTracker>,
        channels: usize,
    ) -> Option<(ObjectId, String)> {
        let mut racks = self.racks.iter().peekable();
        let mut start = None;
        if let Some((first, well)) = &self.starting_tip {
            while racks.next_if(|r| *r != first).is_some() {}
            start = Some(well.as_str());
        }
        for rack in racks {
            let Some(tracker) = trackers.get(rack) else {
                continue;
            };
            if let Some(well) = tracker.next_tip(channels, start.take()) {
                return Some((*rack, well));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::PoseGraph;

    fn columns(rows: &[char], cols: usize) -> Vec<Vec<String>> {
        (1..=cols)
            .map(|c| rows.iter().map(|r| format!("{r}{c}")).collect())
            .collect()
    }

    fn rack(graph: &mut PoseGraph) -> TipTracker {
        let rows = ['A', 'B', 'C', 'D', 'E', 'F', 'G', 'H'];
        TipTracker::new(graph.allocate_id(), "rack", &columns(&rows, 12))
    }

    #[test]
    fn test_single_channel_walks_column_major() {
        let mut graph = PoseGraph::new();
        let mut tracker = rack(&mut graph);
        assert_eq!(tracker.next_tip(1, None).as_deref(), Some("A1"));
        tracker.use_tips("A1", 1).unwrap();
        assert_eq!(tracker.next_tip(1, None).as_deref(), Some("B1"));
        assert!(!tracker.has_tip("A1"));
        assert_eq!(tracker.previous_tip(), Some("A1"));
        assert_eq!(tracker.next_tip(1, Some("C3")).as_deref(), Some("C3"));
    }

    #[test]
    fn test_multi_channel_needs_full_span() {
        let mut graph = PoseGraph::new();
        let mut tracker = rack(&mut graph);
        tracker.use_tips("C1", 1).unwrap();
        // Column 1 is broken, so eight tips come from column 2
        assert_eq!(tracker.next_tip(8, None).as_deref(), Some("A2"));
        tracker.use_tips("A2", 8).unwrap();
        assert_eq!(tracker.available(), 96 - 9);
        assert!(matches!(
            tracker.use_tips("B3", 8),
            Err(RobotError::TipMissing { .. })
        ));
    }

    #[test]
    fn test_check_pick_leaves_rack_untouched() {
        let mut graph = PoseGraph::new();
        let tracker = rack(&mut graph);
        assert!(tracker.check_pick("A1", 8).is_ok());
        assert!(tracker.check_pick("H4", 1).is_ok());
        // Seven rows below B1 do not exist in the column
        assert!(matches!(
            tracker.check_pick("B1", 8),
            Err(RobotError::TipMissing { well, .. }) if well == "B1"
        ));
        assert_eq!(tracker.available(), 96);
        assert_eq!(tracker.previous_tip(), None);
    }

    #[test]
    fn test_return_and_reset() {
        let mut graph = PoseGraph::new();
        let mut tracker = rack(&mut graph);
        tracker.use_tips("A1", 1).unwrap();
        assert!(matches!(
            tracker.return_tips("B1", 1),
            Err(RobotError::TipPresent { .. })
        ));
        tracker.return_tips("A1", 1).unwrap();
        assert!(tracker.has_tip("A1"));

        tracker.use_tips("A5", 8).unwrap();
        tracker.reset();
        assert_eq!(tracker.available(), 96);
    }

    #[test]
    fn test_selector_errors_by_default() {
        let mut graph = PoseGraph::new();
        let small = TipTracker::new(graph.allocate_id(), "small", &columns(&['A', 'B'], 1));
        let id = small.labware();
        let mut trackers: BTreeMap<_, _> = [(id, small)].into_iter().collect();
        let selector = TipSelector::new(vec![id], TipExhaustion::Error);

        for expected in ["A1", "B1"] {
            let (rack, well) = selector.next(&mut trackers, 1).unwrap();
            assert_eq!(well, expected);
            trackers.get_mut(&rack).unwrap().use_tips(&well, 1).unwrap();
        }
        assert!(matches!(
            selector.next(&mut trackers, 1),
            Err(RobotError::OutOfTips)
        ));
    }

    #[test]
    fn test_selector_cycles_when_asked() {
        let mut graph = PoseGraph::new();
        let first = TipTracker::new(graph.allocate_id(), "first", &columns(&['A'], 1));
        let second = TipTracker::new(graph.allocate_id(), "second", &columns(&['A'], 1));
        let ids = vec![first.labware(), second.labware()];
        let mut trackers: BTreeMap<_, _> = [first, second]
            .into_iter()
            .map(|t| (t.labware(), t))
            .collect();
        let selector = TipSelector::new(ids.clone(), TipExhaustion::Cycle);

        for rack in &ids {
            let (found, well) = selector.next(&mut trackers, 1).unwrap();
            assert_eq!(found, *rack);
            trackers.get_mut(&found).unwrap().use_tips(&well, 1).unwrap();
        }
        let (again, _) = selector.next(&mut trackers, 1).unwrap();
        assert_eq!(again, ids[0]);
    }

    #[test]
    fn test_selector_starting_tip() {
        let mut graph = PoseGraph::new();
        let first = TipTracker::new(graph.allocate_id(), "first", &columns(&['A', 'B'], 2));
        let second = TipTracker::new(graph.allocate_id(), "second", &columns(&['A', 'B'], 2));
        let ids = vec![first.labware(), second.labware()];
        let mut trackers: BTreeMap<_, _> = [first, second]
            .into_iter()
            .map(|t| (t.labware(), t))
            .collect();
        let mut selector = TipSelector::new(ids.clone(), TipExhaustion::Error);
        selector.set_starting_tip(ids[1], "B1");
        assert_eq!(selector.next(&mut trackers, 1).unwrap(), (ids[1], "B1".to_string()));
    }
}
