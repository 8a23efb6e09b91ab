//! Fixed world layouts selectable by number.

use crate::geometry::Point;

/// Name given to a robot mirrored from a peer's populate request.
pub const PEER_ROBOT_NAME: &str = "Peer";

/// Goal of the mirrored peer robot.
pub const PEER_GOAL_NAME: &str = "PeerGoal";

/// Goal of this process's own robot.
pub const LOCAL_GOAL_NAME: &str = "YourGoal";

/// Name of the lazily created local robot.
pub const LOCAL_ROBOT_NAME: &str = "You";

/// One selectable world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorldLayout {
    pub local_robot: Point,
    pub local_goal: Point,
    pub peer_robot: Point,
    pub peer_goal: Point,
    pub wall: Option<(Point, Point)>,
}

const WORLD_0: WorldLayout = WorldLayout {
    local_robot: Point::new(50, 60),
    local_goal: Point::new(450, 440),
    peer_robot: Point::new(50, 60),
    peer_goal: Point::new(450, 440),
    wall: None,
};

const WORLD_1: WorldLayout = WorldLayout {
    local_robot: Point::new(450, 450),
    local_goal: Point::new(50, 60),
    peer_robot: Point::new(450, 450),
    peer_goal: Point::new(50, 60),
    wall: None,
};

// The only world where the local and peer robot start apart
const WORLD_2: WorldLayout = WorldLayout {
    local_robot: Point::new(20, 20),
    local_goal: Point::new(480, 480),
    peer_robot: Point::new(40, 40),
    peer_goal: Point::new(480, 480),
    wall: None,
};

const WORLD_3: WorldLayout = WorldLayout {
    local_robot: Point::new(480, 40),
    local_goal: Point::new(40, 480),
    peer_robot: Point::new(480, 40),
    peer_goal: Point::new(40, 480),
    wall: None,
};

const WORLD_4: WorldLayout = WorldLayout {
    wall: Some((Point::new(480, 300), Point::new(150, 300))),
    ..WORLD_0
};

const WORLD_5: WorldLayout = WorldLayout {
    wall: Some((Point::new(20, 100), Point::new(350, 100))),
    ..WORLD_1
};

/// All layouts, indexed by world number.
pub const LAYOUTS: [WorldLayout; 6] = [WORLD_0, WORLD_1, WORLD_2, WORLD_3, WORLD_4, WORLD_5];

/// Looks up a layout; `None` for numbers outside 0..=5.
pub fn layout(world_number: i64) -> Option<&'static WorldLayout> {
    usize::try_from(world_number).ok().and_then(|n| LAYOUTS.get(n))
}
