//! Entities living in a robot world.
//!
//! All four kinds are plain data. The world store owns the canonical copy of
//! every entity and hands out clones; constructors are crate-private so the
//! store's factories are the only way to create one.

use crate::geometry::{ObjectId, Point};
use serde::{Deserialize, Serialize};

/// Default robot speed in canvas units per tick.
pub const DEFAULT_SPEED: f32 = 10.0;

/// A simulated robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Robot {
    pub id: ObjectId,
    pub name: String,
    pub position: Point,

    /// Whether the robot's behaviour loop is running
    pub acting: bool,

    /// Whether the robot accepts inbound protocol sessions
    pub communicating: bool,

    /// Canvas units per tick
    pub speed: f32,

    /// Goal the robot drives towards while acting
    pub goal: Option<ObjectId>,
}

impl Robot {
    pub(crate) fn new(name: &str, position: Point) -> Self {
        Self {
            id: ObjectId::new(),
            name: name.to_string(),
            position,
            acting: false,
            communicating: false,
            speed: DEFAULT_SPEED,
            goal: None,
        }
    }

    pub fn as_debug_string(&self) -> String {
        format!(
            "Robot {} ({}) at {}, acting: {}, communicating: {}, speed: {}",
            self.name, self.id, self.position, self.acting, self.communicating, self.speed
        )
    }
}

/// An obstacle between two points. Walls have no name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wall {
    pub id: ObjectId,
    pub point1: Point,
    pub point2: Point,
}

impl Wall {
    pub(crate) fn new(point1: Point, point2: Point) -> Self {
        Self {
            id: ObjectId::new(),
            point1,
            point2,
        }
    }

    /// Walls are the same obstacle when their endpoint pairs match.
    pub fn same_endpoints(&self, other: &Wall) -> bool {
        self.point1 == other.point1 && self.point2 == other.point2
    }

    pub fn as_debug_string(&self) -> String {
        format!("Wall ({}) from {} to {}", self.id, self.point1, self.point2)
    }
}

/// A target a robot seeks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub id: ObjectId,
    pub name: String,
    pub position: Point,
}

impl Goal {
    pub(crate) fn new(name: &str, position: Point) -> Self {
        Self {
            id: ObjectId::new(),
            name: name.to_string(),
            position,
        }
    }

    pub fn as_debug_string(&self) -> String {
        format!("Goal {} ({}) at {}", self.name, self.id, self.position)
    }
}

/// An intermediate routing point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WayPoint {
    pub id: ObjectId,
    pub name: String,
    pub position: Point,
}

impl WayPoint {
    pub(crate) fn new(name: &str, position: Point) -> Self {
        Self {
            id: ObjectId::new(),
            name: name.to_string(),
            position,
        }
    }

    pub fn as_debug_string(&self) -> String {
        format!("WayPoint {} ({}) at {}", self.name, self.id, self.position)
    }
}

/// Arena slot holding any entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Entity {
    Robot(Robot),
    Wall(Wall),
    Goal(Goal),
    WayPoint(WayPoint),
}

impl Entity {
    pub fn id(&self) -> ObjectId {
        match self {
            Entity::Robot(r) => r.id,
            Entity::Wall(w) => w.id,
            Entity::Goal(g) => g.id,
            Entity::WayPoint(w) => w.id,
        }
    }

    pub fn as_debug_string(&self) -> String {
        match self {
            Entity::Robot(r) => r.as_debug_string(),
            Entity::Wall(w) => w.as_debug_string(),
            Entity::Goal(g) => g.as_debug_string(),
            Entity::WayPoint(w) => w.as_debug_string(),
        }
    }
}
