use std::sync::{Arc, Mutex};

use approx::assert_relative_eq;
use hardware::{Axis, SimHandle, SimulatedDriver};
use liquid_handler::publisher::{CommandMessage, CommandOutcome, CommandStage};
use liquid_handler::{
    CriticalPoint, Location, MoveStrategy, Mount, Point, PipetteOverrides, Robot, RobotConfig,
    RobotError,
};

fn sim_robot(config: RobotConfig) -> (Robot<SimulatedDriver>, SimHandle) {
    let driver = SimulatedDriver::new(config.home_position.clone(), config.lower_limits.clone());
    let handle = driver.handle();
    (Robot::new(driver, config).unwrap(), handle)
}

fn record_commands(robot: &Robot<SimulatedDriver>) -> Arc<Mutex<Vec<CommandMessage>>> {
    let messages = Arc::new(Mutex::new(Vec::new()));
    let sink = messages.clone();
    robot.publisher().subscribe(move |message| {
        sink.lock().unwrap().push(message.clone());
    });
    messages
}

#[tokio::test]
async fn test_flex_transfer_cycle() {
    let (robot, _sim) = sim_robot(RobotConfig::flex());
    robot.home().await.unwrap();

    let rack = robot
        .load_labware_in_slot("opentrons_96_filtertiprack_200ul", "B2")
        .unwrap();
    let plate = robot
        .load_labware_in_slot("corning_96_wellplate_360ul_flat", "A2")
        .unwrap();
    robot
        .load_instrument("flex_1channel_1000", Mount::Left, &[rack], &PipetteOverrides::default())
        .unwrap();
    let messages = record_commands(&robot);

    robot.pick_up_tip(Mount::Left, None, None, None).await.unwrap();
    let pipette = robot.pipette(Mount::Left).unwrap();
    assert!(pipette.has_tip());
    assert!(pipette.ready_to_aspirate());
    // Filter tips cap the working volume below the pipette's own maximum
    assert_relative_eq!(pipette.working_volume(), 200.0);
    assert!(!robot.tip_tracker(rack).unwrap().has_tip("A1"));

    let source = robot.well(plate, "A1").unwrap();
    let dest = robot.well(plate, "A2").unwrap();
    robot
        .aspirate(Mount::Left, Some(150.0), Some(source.bottom(1.0)), 1.0)
        .await
        .unwrap();
    assert_relative_eq!(robot.pipette(Mount::Left).unwrap().current_volume(), 150.0);

    let err = robot
        .aspirate(Mount::Left, Some(100.0), None, 1.0)
        .await
        .unwrap_err();
    assert!(matches!(err, RobotError::VolumeExceedsCapacity { .. }));
    assert_relative_eq!(robot.pipette(Mount::Left).unwrap().current_volume(), 150.0);

    robot
        .dispense(Mount::Left, None, Some(dest.bottom(1.0)), 1.0)
        .await
        .unwrap();
    assert_relative_eq!(robot.pipette(Mount::Left).unwrap().current_volume(), 0.0);

    robot.drop_tip(Mount::Left, None, true).await.unwrap();
    let pipette = robot.pipette(Mount::Left).unwrap();
    assert!(!pipette.has_tip());
    assert!(!pipette.ready_to_aspirate());

    let messages = messages.lock().unwrap();
    let names: Vec<&str> = messages
        .iter()
        .filter(|m| m.stage == CommandStage::Before)
        .map(|m| m.payload.name)
        .collect();
    assert_eq!(names, vec!["pick_up_tip", "aspirate", "aspirate", "dispense", "drop_tip"]);
    let failed = messages
        .iter()
        .filter(|m| matches!(m.outcome, Some(CommandOutcome::Failed(_))))
        .count();
    assert_eq!(failed, 1);
}

#[tokio::test]
async fn test_critical_points_follow_instrument_geometry() {
    let (robot, _sim) = sim_robot(RobotConfig::default());
    let rack = robot
        .load_labware_in_slot("opentrons_96_tiprack_300ul", "1")
        .unwrap();
    robot
        .load_instrument("p300_single_v2.0", Mount::Right, &[rack], &PipetteOverrides::default())
        .unwrap();
    robot.home().await.unwrap();

    let target = Point::new(200.0, 150.0, 150.0);
    robot
        .move_to(
            Mount::Right,
            Location::new(target),
            MoveStrategy::Direct,
            None,
        )
        .await
        .unwrap();
    // No tip yet, so the tip critical point is the nozzle
    let nozzle = robot.position(Mount::Right, CriticalPoint::Nozzle).await.unwrap();
    let tip = robot.position(Mount::Right, CriticalPoint::Tip).await.unwrap();
    assert_relative_eq!(tip, nozzle, epsilon = 1e-9);

    let mount = robot.position(Mount::Right, CriticalPoint::Mount).await.unwrap();
    let model_offset = robot.pipette(Mount::Right).unwrap().config().model_offset();
    assert_relative_eq!(nozzle - mount, model_offset, epsilon = 1e-9);

    robot.pick_up_tip(Mount::Right, None, None, None).await.unwrap();
    let nozzle = robot.position(Mount::Right, CriticalPoint::Nozzle).await.unwrap();
    let tip = robot.position(Mount::Right, CriticalPoint::Tip).await.unwrap();
    let length = robot.pipette(Mount::Right).unwrap().tip().unwrap().length;
    assert_relative_eq!(nozzle - tip, Point::new(0.0, 0.0, length), epsilon = 1e-9);
}

#[tokio::test]
async fn test_arc_move_rises_before_crossing_the_deck() {
    let (robot, sim) = sim_robot(RobotConfig::default());
    let plate = robot
        .load_labware_in_slot("corning_96_wellplate_360ul_flat", "1")
        .unwrap();
    let rack = robot
        .load_labware_in_slot("opentrons_96_tiprack_300ul", "3")
        .unwrap();
    robot
        .load_instrument("p300_single_v2.0", Mount::Right, &[], &PipetteOverrides::default())
        .unwrap();
    robot.home().await.unwrap();

    let well = robot.well(plate, "A1").unwrap();
    robot
        .move_to(Mount::Right, well.top(0.0), MoveStrategy::Arc, None)
        .await
        .unwrap();
    sim.clear_log();

    let tip_well = robot.well(rack, "A1").unwrap();
    robot
        .move_to(Mount::Right, tip_well.top(0.0), MoveStrategy::Arc, None)
        .await
        .unwrap();

    let moves = sim.moves();
    assert_eq!(moves.len(), 3);
    let rise = &moves[0];
    assert_eq!(rise.keys().copied().collect::<Vec<_>>(), vec![Axis::A]);
    assert_eq!(moves[1].keys().copied().collect::<Vec<_>>(), vec![Axis::X, Axis::Y]);
    let descend = &moves[2];
    assert_eq!(descend.keys().copied().collect::<Vec<_>>(), vec![Axis::A]);
    assert!(rise[&Axis::A] > descend[&Axis::A]);

    let at = robot.position(Mount::Right, CriticalPoint::Tip).await.unwrap();
    assert_relative_eq!(at, tip_well.top(0.0).point, epsilon = 1e-9);
}

#[tokio::test]
async fn test_other_mount_retracts_before_moving() {
    let (robot, sim) = sim_robot(RobotConfig::default());
    robot.home().await.unwrap();
    robot
        .move_to(
            Mount::Right,
            Location::new(Point::new(200.0, 150.0, 100.0)),
            MoveStrategy::Direct,
            None,
        )
        .await
        .unwrap();
    sim.clear_log();

    robot
        .move_to(
            Mount::Left,
            Location::new(Point::new(150.0, 150.0, 120.0)),
            MoveStrategy::Direct,
            None,
        )
        .await
        .unwrap();
    let moves = sim.moves();
    assert_relative_eq!(moves[0][&Axis::A], 218.0);
    assert_relative_eq!(sim.position()[&Axis::A], 218.0);
    assert_relative_eq!(sim.position()[&Axis::Z], 120.0);
}

#[tokio::test]
async fn test_failed_motion_requires_rehome() {
    let (robot, sim) = sim_robot(RobotConfig::default());
    robot.home().await.unwrap();

    sim.fail_next_move("stall detected");
    let err = robot
        .move_to(
            Mount::Right,
            Location::new(Point::new(100.0, 100.0, 100.0)),
            MoveStrategy::Direct,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RobotError::Driver(_)));

    let err = robot
        .move_to(
            Mount::Right,
            Location::new(Point::new(100.0, 100.0, 100.0)),
            MoveStrategy::Direct,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RobotError::MustHome { .. }));

    robot.home().await.unwrap();
    robot
        .move_to(
            Mount::Right,
            Location::new(Point::new(100.0, 100.0, 100.0)),
            MoveStrategy::Direct,
            None,
        )
        .await
        .unwrap();
}
