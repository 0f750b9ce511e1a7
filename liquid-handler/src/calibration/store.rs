//! Calibration record storage.
//!
//! Absence of a record means "use the identity / zero offset".

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use nalgebra::Matrix4;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Mount, Point};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed calibration record: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Where a calibration value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationSource {
    #[default]
    Default,
    Factory,
    User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord<T> {
    pub value: T,
    pub source: CalibrationSource,
    pub last_modified: DateTime<Utc>,
}

impl<T> CalibrationRecord<T> {
    /// A record stamped with the current time.
    pub fn new(value: T, source: CalibrationSource) -> Self {
        Self {
            value,
            source,
            last_modified: Utc::now(),
        }
    }
}

/// Load/save interface for every kind of calibration offset.
pub trait CalibrationStore: Send + Sync {
    fn deck_attitude(&self) -> StoreResult<Option<CalibrationRecord<Matrix4<f64>>>>;
    fn save_deck_attitude(&self, attitude: &Matrix4<f64>, source: CalibrationSource)
        -> StoreResult<()>;
    fn clear_deck_attitude(&self) -> StoreResult<bool>;

    fn pipette_offset(
        &self,
        pipette_id: &str,
        mount: Mount,
    ) -> StoreResult<Option<CalibrationRecord<Point>>>;
    fn save_pipette_offset(
        &self,
        pipette_id: &str,
        mount: Mount,
        offset: Point,
        source: CalibrationSource,
    ) -> StoreResult<()>;
    fn clear_pipette_offset(&self, pipette_id: &str, mount: Mount) -> StoreResult<bool>;

    /// Tip length for a pipette on a tip rack, keyed by the rack's definition hash.
    fn tip_length(
        &self,
        pipette_id: &str,
        tiprack_hash: &str,
    ) -> StoreResult<Option<CalibrationRecord<f64>>>;
    fn save_tip_length(
        &self,
        pipette_id: &str,
        tiprack_hash: &str,
        length: f64,
        source: CalibrationSource,
    ) -> StoreResult<()>;

    fn labware_offset(
        &self,
        uri: &str,
        location: &str,
    ) -> StoreResult<Option<CalibrationRecord<Point>>>;
    fn save_labware_offset(
        &self,
        uri: &str,
        location: &str,
        offset: Point,
        source: CalibrationSource,
    ) -> StoreResult<()>;

    fn gripper_offset(&self, gripper_id: &str) -> StoreResult<Option<CalibrationRecord<Point>>>;
    fn save_gripper_offset(
        &self,
        gripper_id: &str,
        offset: Point,
        source: CalibrationSource,
    ) -> StoreResult<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    deck: Option<CalibrationRecord<Matrix4<f64>>>,
    pipettes: HashMap<(String, Mount), CalibrationRecord<Point>>,
    tips: HashMap<(String, String), CalibrationRecord<f64>>,
    labware: HashMap<(String, String), CalibrationRecord<Point>>,
    grippers: HashMap<String, CalibrationRecord<Point>>,
}

/// Store that keeps records for the life of the process.
#[derive(Debug, Default)]
pub struct InMemoryCalibrationStore {
    state: Mutex<MemoryState>,
}

impl InMemoryCalibrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CalibrationStore for InMemoryCalibrationStore {
    fn deck_attitude(&self) -> StoreResult<Option<CalibrationRecord<Matrix4<f64>>>> {
        Ok(self.state().deck.clone())
    }

    fn save_deck_attitude(
        &self,
        attitude: &Matrix4<f64>,
        source: CalibrationSource,
    ) -> StoreResult<()> {
        self.state().deck = Some(CalibrationRecord::new(*attitude, source));
        Ok(())
    }

    fn clear_deck_attitude(&self) -> StoreResult<bool> {
        Ok(self.state().deck.take().is_some())
    }

    fn pipette_offset(
        &self,
        pipette_id: &str,
        mount: Mount,
    ) -> StoreResult<Option<CalibrationRecord<Point>>> {
        Ok(self
            .state()
            .pipettes
            .get(&(pipette_id.to_string(), mount))
            .cloned())
    }

    fn save_pipette_offset(
        &self,
        pipette_id: &str,
        mount: Mount,
        offset: Point,
        source: CalibrationSource,
    ) -> StoreResult<()> {
        self.state().pipettes.insert(
            (pipette_id.to_string(), mount),
            CalibrationRecord::new(offset, source),
        );
        Ok(())
    }

    fn clear_pipette_offset(&self, pipette_id: &str, mount: Mount) -> StoreResult<bool> {
        Ok(self
            .state()
            .pipettes
            .remove(&(pipette_id.to_string(), mount))
            .is_some())
    }

    fn tip_length(
        &self,
        pipette_id: &str,
        tiprack_hash: &str,
    ) -> StoreResult<Option<CalibrationRecord<f64>>> {
        Ok(self
            .state()
            .tips
            .get(&(pipette_id.to_string(), tiprack_hash.to_string()))
            .cloned())
    }

    fn save_tip_length(
        &self,
        pipette_id: &str,
        tiprack_hash: &str,
        length: f64,
        source: CalibrationSource,
    ) -> StoreResult<()> {
        self.state().tips.insert(
            (pipette_id.to_string(), tiprack_hash.to_string()),
            CalibrationRecord::new(length, source),
        );
        Ok(())
    }

    fn labware_offset(
        &self,
        uri: &str,
        location: &str,
    ) -> StoreResult<Option<CalibrationRecord<Point>>> {
        Ok(self
            .state()
            .labware
            .get(&(uri.to_string(), location.to_string()))
            .cloned())
    }

    fn save_labware_offset(
        &self,
        uri: &str,
        location: &str,
        offset: Point,
        source: CalibrationSource,
    ) -> StoreResult<()> {
        self.state().labware.insert(
            (uri.to_string(), location.to_string()),
            CalibrationRecord::new(offset, source),
        );
        Ok(())
    }

    fn gripper_offset(&self, gripper_id: &str) -> StoreResult<Option<CalibrationRecord<Point>>> {
        Ok(self.state().grippers.get(gripper_id).cloned())
    }

    fn save_gripper_offset(
        &self,
        gripper_id: &str,
        offset: Point,
        source: CalibrationSource,
    ) -> StoreResult<()> {
        self.state()
            .grippers
            .insert(gripper_id.to_string(), CalibrationRecord::new(offset, source));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_records_are_none() {
        let store = InMemoryCalibrationStore::new();
        assert!(store.deck_attitude().unwrap().is_none());
        assert!(store.pipette_offset("P3HS", Mount::Left).unwrap().is_none());
        assert!(store.tip_length("P3HS", "abc").unwrap().is_none());
        assert!(!store.clear_pipette_offset("P3HS", Mount::Left).unwrap());
    }

    #[test]
    fn test_pipette_offsets_are_keyed_by_mount() {
        let store = InMemoryCalibrationStore::new();
        store
            .save_pipette_offset("P3HS", Mount::Left, Point::new(1.0, 2.0, 3.0), CalibrationSource::User)
            .unwrap();

        let record = store.pipette_offset("P3HS", Mount::Left).unwrap().unwrap();
        assert_eq!(record.value, Point::new(1.0, 2.0, 3.0));
        assert_eq!(record.source, CalibrationSource::User);
        assert!(store.pipette_offset("P3HS", Mount::Right).unwrap().is_none());

        assert!(store.clear_pipette_offset("P3HS", Mount::Left).unwrap());
        assert!(store.pipette_offset("P3HS", Mount::Left).unwrap().is_none());
    }
}
