use std::fs;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use approx::assert_relative_eq;
use hardware::{Axis, SimHandle, SimulatedDriver};
use liquid_handler::calibration::{
    CalibrationSource, CalibrationStore, FileCalibrationStore, ProbeMethod,
};
use liquid_handler::labware::BuiltinLabware;
use liquid_handler::{
    CriticalPoint, Location, MoveStrategy, Mount, PipetteOverrides, PipetteRegistry, Point,
    Robot, RobotConfig,
};
use nalgebra::Matrix4;

const PIPETTE_ID: &str = "p300_single_v2.0_right";

fn create_test_store(name: &str) -> Arc<FileCalibrationStore> {
    let root = std::env::temp_dir().join(format!(
        "lh_stored_{}_{}",
        name,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));
    Arc::new(FileCalibrationStore::with_path(root))
}

fn cleanup(store: &FileCalibrationStore) {
    let _ = fs::remove_dir_all(store.root_path());
}

fn robot_with_store(store: Arc<FileCalibrationStore>) -> (Robot<SimulatedDriver>, SimHandle) {
    let config = RobotConfig::default();
    let driver = SimulatedDriver::new(config.home_position.clone(), config.lower_limits.clone());
    let handle = driver.handle();
    let robot = Robot::with_components(
        driver,
        config,
        PipetteRegistry::builtin(),
        Arc::new(BuiltinLabware::new()),
        store,
    )
    .unwrap();
    (robot, handle)
}

#[tokio::test]
async fn test_stored_pipette_offset_applied_on_load() {
    let store = create_test_store("pipette");
    let stored = Point::new(0.4, -0.3, 1.2);
    store
        .save_pipette_offset(PIPETTE_ID, Mount::Right, stored, CalibrationSource::User)
        .unwrap();

    let (robot, _sim) = robot_with_store(store.clone());
    robot
        .load_instrument("p300_single_v2.0", Mount::Right, &[], &PipetteOverrides::default())
        .unwrap();
    robot.home().await.unwrap();
    assert_relative_eq!(robot.pipette_offset(Mount::Right).unwrap(), stored);

    let nozzle = robot.position(Mount::Right, CriticalPoint::Nozzle).await.unwrap();
    let mount = robot.position(Mount::Right, CriticalPoint::Mount).await.unwrap();
    let model_offset = robot.pipette(Mount::Right).unwrap().config().model_offset();
    assert_relative_eq!(nozzle - mount, model_offset + stored, epsilon = 1e-9);

    cleanup(&store);
}

#[tokio::test]
async fn test_failed_calibration_keeps_stored_offset() {
    let store = create_test_store("rollback");
    let stored = Point::new(0.4, -0.3, 1.2);
    store
        .save_pipette_offset(PIPETTE_ID, Mount::Right, stored, CalibrationSource::User)
        .unwrap();

    let (robot, _sim) = robot_with_store(store.clone());
    robot
        .load_instrument("p300_single_v2.0", Mount::Right, &[], &PipetteOverrides::default())
        .unwrap();
    robot.home().await.unwrap();

    // No probe surface: every probe descends without touching anything
    assert!(robot
        .calibrate_pipette_offset(Mount::Right, "5", ProbeMethod::Contact)
        .await
        .is_err());
    assert_relative_eq!(robot.pipette_offset(Mount::Right).unwrap(), stored);
    let record = store.pipette_offset(PIPETTE_ID, Mount::Right).unwrap().unwrap();
    assert_relative_eq!(record.value, stored);
    assert_eq!(record.source, CalibrationSource::User);

    cleanup(&store);
}

#[tokio::test]
async fn test_stored_deck_attitude_shifts_machine_targets() {
    let store = create_test_store("deck");
    let mut attitude = Matrix4::identity();
    attitude[(0, 3)] = 1.5;
    attitude[(1, 3)] = -0.5;
    store
        .save_deck_attitude(&attitude, CalibrationSource::User)
        .unwrap();

    let (robot, sim) = robot_with_store(store.clone());
    robot.home().await.unwrap();
    let target = Point::new(200.0, 150.0, 120.0);
    robot
        .move_to(Mount::Right, Location::new(target), MoveStrategy::Direct, None)
        .await
        .unwrap();

    let machine = sim.position();
    assert_relative_eq!(machine[&Axis::X], 201.5, epsilon = 1e-9);
    assert_relative_eq!(machine[&Axis::Y], 149.5, epsilon = 1e-9);
    assert_relative_eq!(machine[&Axis::A], 120.0, epsilon = 1e-9);
    let world = robot.position(Mount::Right, CriticalPoint::Mount).await.unwrap();
    assert_relative_eq!(world, target, epsilon = 1e-9);

    robot.clear_deck_calibration().await.unwrap();
    assert!(store.deck_attitude().unwrap().is_none());

    cleanup(&store);
}
