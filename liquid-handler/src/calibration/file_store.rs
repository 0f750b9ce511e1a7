//! JSON-file calibration storage.
//!
//! Layout under the root directory (`~/.lh_config` by default):
//!
//! ```text
//! deck_calibration.json
//! pipette_offsets/<mount>/<pipette_id>.json
//! tip_lengths/<pipette_id>.json        (tip rack hash -> record)
//! labware_offsets.json
//! gripper_offsets/<gripper_id>.json
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use nalgebra::Matrix4;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::store::{CalibrationRecord, CalibrationSource, CalibrationStore, StoreResult};
use crate::types::{Mount, Point};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LabwareOffsetEntry {
    uri: String,
    location: String,
    record: CalibrationRecord<Point>,
}

#[derive(Debug, Clone)]
pub struct FileCalibrationStore {
    root_path: PathBuf,
}

fn safe_name(id: &str) -> String {
    id.chars()
        .map(|c| if c == '/' || c == '\\' || c.is_whitespace() { '_' } else { c })
        .collect()
}

fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&contents)?))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    debug!("Wrote calibration record {}", path.display());
    Ok(())
}

fn remove_file(path: &Path) -> StoreResult<bool> {
    if !path.exists() {
        return Ok(false);
    }
    fs::remove_file(path)?;
    Ok(true)
}

impl FileCalibrationStore {
    /// Store rooted at `~/.lh_config`.
    pub fn new() -> std::io::Result<Self> {
        let home = std::env::var("HOME")
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::NotFound, "HOME not set"))?;
        Ok(Self {
            root_path: PathBuf::from(home).join(".lh_config"),
        })
    }

    pub fn with_path(root_path: PathBuf) -> Self {
        Self { root_path }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    fn deck_path(&self) -> PathBuf {
        self.root_path.join("deck_calibration.json")
    }

    fn pipette_path(&self, pipette_id: &str, mount: Mount) -> PathBuf {
        self.root_path
            .join("pipette_offsets")
            .join(mount.to_string())
            .join(format!("{}.json", safe_name(pipette_id)))
    }

    fn tip_length_path(&self, pipette_id: &str) -> PathBuf {
        self.root_path
            .join("tip_lengths")
            .join(format!("{}.json", safe_name(pipette_id)))
    }

    fn labware_path(&self) -> PathBuf {
        self.root_path.join("labware_offsets.json")
    }

    fn gripper_path(&self, gripper_id: &str) -> PathBuf {
        self.root_path
            .join("gripper_offsets")
            .join(format!("{}.json", safe_name(gripper_id)))
    }

    fn tip_lengths(&self, pipette_id: &str) -> StoreResult<BTreeMap<String, CalibrationRecord<f64>>> {
        Ok(read_json(&self.tip_length_path(pipette_id))?.unwrap_or_default())
    }

    fn labware_entries(&self) -> StoreResult<Vec<LabwareOffsetEntry>> {
        Ok(read_json(&self.labware_path())?.unwrap_or_default())
    }
}

impl Default for FileCalibrationStore {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self::with_path(PathBuf::from(".lh_config")))
    }
}

impl CalibrationStore for FileCalibrationStore {
    fn deck_attitude(&self) -> StoreResult<Option<CalibrationRecord<Matrix4<f64>>>> {
        read_json(&self.deck_path())
    }

    fn save_deck_attitude(
        &self,
        attitude: &Matrix4<f64>,
        source: CalibrationSource,
    ) -> StoreResult<()> {
        write_json(&self.deck_path(), &CalibrationRecord::new(*attitude, source))
    }

    fn clear_deck_attitude(&self) -> StoreResult<bool> {
        remove_file(&self.deck_path())
    }

    fn pipette_offset(
        &self,
        pipette_id: &str,
        mount: Mount,
    ) -> StoreResult<Option<CalibrationRecord<Point>>> {
        read_json(&self.pipette_path(pipette_id, mount))
    }

    fn save_pipette_offset(
        &self,
        pipette_id: &str,
        mount: Mount,
        offset: Point,
        source: CalibrationSource,
    ) -> StoreResult<()> {
        write_json(
            &self.pipette_path(pipette_id, mount),
            &CalibrationRecord::new(offset, source),
        )
    }

    fn clear_pipette_offset(&self, pipette_id: &str, mount: Mount) -> StoreResult<bool> {
        remove_file(&self.pipette_path(pipette_id, mount))
    }

    fn tip_length(
        &self,
        pipette_id: &str,
        tiprack_hash: &str,
    ) -> StoreResult<Option<CalibrationRecord<f64>>> {
        Ok(self.tip_lengths(pipette_id)?.remove(tiprack_hash))
    }

    fn save_tip_length(
        &self,
        pipette_id: &str,
        tiprack_hash: &str,
        length: f64,
        source: CalibrationSource,
    ) -> StoreResult<()> {
        let mut lengths = self.tip_lengths(pipette_id)?;
        lengths.insert(tiprack_hash.to_string(), CalibrationRecord::new(length, source));
        write_json(&self.tip_length_path(pipette_id), &lengths)
    }

    fn labware_offset(
        &self,
        uri: &str,
        location: &str,
    ) -> StoreResult<Option<CalibrationRecord<Point>>> {
        Ok(self
            .labware_entries()?
            .into_iter()
            .find(|e| e.uri == uri && e.location == location)
            .map(|e| e.record))
    }

    fn save_labware_offset(
        &self,
        uri: &str,
        location: &str,
        offset: Point,
        source: CalibrationSource,
    ) -> StoreResult<()> {
        let mut entries = self.labware_entries()?;
        entries.retain(|e| !(e.uri == uri && e.location == location));
        entries.push(LabwareOffsetEntry {
            uri: uri.to_string(),
            location: location.to_string(),
            record: CalibrationRecord::new(offset, source),
        });
        write_json(&self.labware_path(), &entries)
    }

    fn gripper_offset(&self, gripper_id: &str) -> StoreResult<Option<CalibrationRecord<Point>>> {
        read_json(&self.gripper_path(gripper_id))
    }

    fn save_gripper_offset(
        &self,
        gripper_id: &str,
        offset: Point,
        source: CalibrationSource,
    ) -> StoreResult<()> {
        write_json(
            &self.gripper_path(gripper_id),
            &CalibrationRecord::new(offset, source),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::StoreError;
    use approx::assert_relative_eq;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn create_test_store() -> FileCalibrationStore {
        let temp_dir = std::env::temp_dir().join(format!(
            "lh_config_test_{}",
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        FileCalibrationStore::with_path(temp_dir)
    }

    fn cleanup(store: &FileCalibrationStore) {
        let _ = fs::remove_dir_all(store.root_path());
    }

    #[test]
    fn test_deck_attitude_round_trip() {
        let store = create_test_store();
        assert!(store.deck_attitude().unwrap().is_none());

        let mut attitude = Matrix4::identity();
        attitude[(0, 3)] = 1.25;
        attitude[(1, 0)] = -0.002;
        store
            .save_deck_attitude(&attitude, CalibrationSource::User)
            .unwrap();

        let record = store.deck_attitude().unwrap().unwrap();
        assert_relative_eq!(record.value, attitude);
        assert_eq!(record.source, CalibrationSource::User);
        assert!(store.root_path().join("deck_calibration.json").exists());

        assert!(store.clear_deck_attitude().unwrap());
        assert!(store.deck_attitude().unwrap().is_none());
        cleanup(&store);
    }

    #[test]
    fn test_pipette_offset_layout() {
        let store = create_test_store();
        store
            .save_pipette_offset("P3HSV2", Mount::Right, Point::new(0.5, -0.25, 1.0), CalibrationSource::User)
            .unwrap();
        assert!(store
            .root_path()
            .join("pipette_offsets/right/P3HSV2.json")
            .exists());

        let record = store.pipette_offset("P3HSV2", Mount::Right).unwrap().unwrap();
        assert_relative_eq!(record.value, Point::new(0.5, -0.25, 1.0));
        assert!(store.pipette_offset("P3HSV2", Mount::Left).unwrap().is_none());
        cleanup(&store);
    }

    #[test]
    fn test_tip_lengths_share_one_file_per_pipette() {
        let store = create_test_store();
        store
            .save_tip_length("P3HSV2", "aaaa", 51.7, CalibrationSource::User)
            .unwrap();
        store
            .save_tip_length("P3HSV2", "bbbb", 85.9, CalibrationSource::Factory)
            .unwrap();

        assert_relative_eq!(store.tip_length("P3HSV2", "aaaa").unwrap().unwrap().value, 51.7);
        assert_relative_eq!(store.tip_length("P3HSV2", "bbbb").unwrap().unwrap().value, 85.9);
        assert!(store.tip_length("P3HSV2", "cccc").unwrap().is_none());
        cleanup(&store);
    }

    #[test]
    fn test_labware_offset_replaces_existing_entry() {
        let store = create_test_store();
        let uri = "opentrons/corning_96_wellplate_360ul_flat/2";
        store
            .save_labware_offset(uri, "A2", Point::new(1.0, 0.0, 0.0), CalibrationSource::User)
            .unwrap();
        store
            .save_labware_offset(uri, "A2", Point::new(0.0, 2.0, 0.0), CalibrationSource::User)
            .unwrap();
        store
            .save_labware_offset(uri, "B2", Point::new(0.0, 0.0, 3.0), CalibrationSource::User)
            .unwrap();

        let record = store.labware_offset(uri, "A2").unwrap().unwrap();
        assert_relative_eq!(record.value, Point::new(0.0, 2.0, 0.0));
        assert!(store.labware_offset(uri, "C1").unwrap().is_none());
        cleanup(&store);
    }

    #[test]
    fn test_corrupt_record_is_an_error() {
        let store = create_test_store();
        fs::create_dir_all(store.root_path()).unwrap();
        fs::write(store.root_path().join("deck_calibration.json"), "{not json").unwrap();
        assert!(matches!(store.deck_attitude(), Err(StoreError::Json(_))));
        cleanup(&store);
    }
}
