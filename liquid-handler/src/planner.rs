//! Waypoint planning.
//!
//! Arc moves rise to a safe travel height, cross the deck, then descend.
//! Direct moves go straight to the target. Moves that stay inside one well
//! are always direct, and moves within one labware only clear that labware.

use crate::types::{Location, Mount, Point};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MoveStrategy {
    #[default]
    Arc,
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaypointKind {
    Rise,
    Lateral,
    Descend,
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Waypoint {
    pub point: Point,
    pub kind: WaypointKind,
}

/// Heights the planner needs from the deck for one move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TravelHeights {
    /// Highest point of anything on the deck
    pub deck_max_z: f64,
    /// Highest point of the destination labware, if any
    pub labware_max_z: Option<f64>,
    /// Highest z the critical point can reach
    pub robot_max_z: f64,
    pub arc_clearance: f64,
    pub minimum_z_margin: f64,
}

#[derive(Debug, Clone, Default)]
pub struct MotionPlanner {
    last: Option<(Mount, Location)>,
}

impl MotionPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Where `mount` last finished a planned move, if it was the last mount
    /// to move.
    pub fn previous(&self, mount: Mount) -> Option<&Location> {
        self.last
            .as_ref()
            .filter(|(m, _)| *m == mount)
            .map(|(_, loc)| loc)
    }

    pub fn record(&mut self, mount: Mount, location: Location) {
        self.last = Some((mount, location));
    }

    pub fn clear(&mut self) {
        self.last = None;
    }

    /// Waypoints taking `mount`'s critical point from `origin` to
    /// `destination`.
    pub fn plan(
        &self,
        mount: Mount,
        origin: Point,
        destination: &Location,
        strategy: MoveStrategy,
        heights: &TravelHeights,
    ) -> Vec<Waypoint> {
        let target = Point::new(
            destination.point.x,
            destination.point.y,
            destination.point.z.min(heights.robot_max_z),
        );
        let previous = self.previous(mount);
        let same_well = destination.well.is_some()
            && previous.is_some_and(|p| p.well == destination.well);

        if strategy == MoveStrategy::Direct || same_well {
            return vec![Waypoint {
                point: target,
                kind: WaypointKind::Direct,
            }];
        }

        let same_labware = destination.labware.is_some()
            && previous.is_some_and(|p| p.labware == destination.labware);
        let clearance_z = match (same_labware, heights.labware_max_z) {
            (true, Some(labware_z)) => labware_z + heights.minimum_z_margin,
            _ => heights.deck_max_z + heights.arc_clearance,
        };
        let travel_z = clearance_z
            .max(origin.z)
            .max(target.z)
            .min(heights.robot_max_z);

        vec![
            Waypoint {
                point: Point::new(origin.x, origin.y, travel_z),
                kind: WaypointKind::Rise,
            },
            Waypoint {
                point: Point::new(target.x, target.y, travel_z),
                kind: WaypointKind::Lateral,
            },
            Waypoint {
                point: target,
                kind: WaypointKind::Descend,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::PoseGraph;
    use approx::assert_relative_eq;

    fn heights() -> TravelHeights {
        TravelHeights {
            deck_max_z: 82.0,
            labware_max_z: Some(14.22),
            robot_max_z: 180.0,
            arc_clearance: 10.0,
            minimum_z_margin: 1.0,
        }
    }

    #[test]
    fn test_arc_rises_above_deck() {
        let planner = MotionPlanner::new();
        let origin = Point::new(10.0, 10.0, 30.0);
        let dest = Location::new(Point::new(200.0, 100.0, 5.0));
        let path = planner.plan(Mount::Left, origin, &dest, MoveStrategy::Arc, &heights());

        assert_eq!(path.len(), 3);
        assert_eq!(
            path.iter().map(|w| w.kind).collect::<Vec<_>>(),
            vec![WaypointKind::Rise, WaypointKind::Lateral, WaypointKind::Descend]
        );
        assert_relative_eq!(path[0].point.z, 92.0);
        assert_relative_eq!(path[0].point.x, 10.0);
        assert_relative_eq!(path[1].point.z, 92.0);
        assert_relative_eq!(path[2].point, dest.point);
    }

    #[test]
    fn test_travel_height_clamped_to_robot_max() {
        let planner = MotionPlanner::new();
        let tall = TravelHeights {
            deck_max_z: 175.0,
            ..heights()
        };
        let path = planner.plan(
            Mount::Right,
            Point::zeros(),
            &Location::new(Point::new(50.0, 50.0, 250.0)),
            MoveStrategy::Arc,
            &tall,
        );
        assert!(path.iter().all(|w| w.point.z <= 180.0));
        assert_relative_eq!(path[2].point.z, 180.0);
    }

    #[test]
    fn test_same_labware_uses_small_margin() {
        let mut graph = PoseGraph::new();
        let plate = graph.allocate_id();
        let a1 = graph.allocate_id();
        let a2 = graph.allocate_id();

        let mut planner = MotionPlanner::new();
        planner.record(Mount::Left, Location::in_well(Point::new(10.0, 70.0, 15.0), plate, a1));
        let dest = Location::in_well(Point::new(19.0, 70.0, 15.0), plate, a2);
        let path = planner.plan(
            Mount::Left,
            Point::new(10.0, 70.0, 15.0),
            &dest,
            MoveStrategy::Arc,
            &heights(),
        );
        assert_relative_eq!(path[0].point.z, 15.22);

        // The heuristic only applies to the mount that made the last move
        let other = planner.plan(
            Mount::Right,
            Point::new(10.0, 70.0, 15.0),
            &dest,
            MoveStrategy::Arc,
            &heights(),
        );
        assert_relative_eq!(other[0].point.z, 92.0);
    }

    #[test]
    fn test_same_well_is_direct() {
        let mut graph = PoseGraph::new();
        let plate = graph.allocate_id();
        let a1 = graph.allocate_id();

        let mut planner = MotionPlanner::new();
        planner.record(Mount::Left, Location::in_well(Point::new(10.0, 70.0, 15.0), plate, a1));
        let dest = Location::in_well(Point::new(10.0, 70.0, 5.0), plate, a1);
        let path = planner.plan(
            Mount::Left,
            Point::new(10.0, 70.0, 15.0),
            &dest,
            MoveStrategy::Arc,
            &heights(),
        );
        assert_eq!(path.len(), 1);
        assert_eq!(path[0].kind, WaypointKind::Direct);
    }
}
