//! The world store - authoritative registry of every entity in one process.
//!
//! Entities live in an arena keyed by [`ObjectId`]; four ordered id lists
//! (robots, walls, goals, waypoints) keep insertion order per kind. All of it
//! sits behind a single `RwLock`, so structural mutations are serialized and
//! readers always see a consistent post-mutation snapshot.
//!
//! # Notification
//!
//! Mutators take a `notify` flag. When set, attached observers are called
//! once, synchronously, after the lock has been released. A mutation made
//! from inside an observer callback does not start a nested fan-out: its
//! notification is folded into another round once the current one is done.
//! Work an observer wants to do against the world should go through
//! [`RobotWorld::defer`].

use crate::error::CoreError;
use crate::geometry::{segments_intersect, ObjectId, Point, OFF_SCREEN};
use crate::layout::{layout, WorldLayout, LOCAL_GOAL_NAME, LOCAL_ROBOT_NAME, PEER_GOAL_NAME, PEER_ROBOT_NAME};
use crate::model::{Entity, Goal, Robot, Wall, WayPoint};
use crate::observer::{ObserverHandle, ObserverRegistry, WorldObserver};
use crate::sync::{lock, read, write};

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::ThreadId;
use tracing::{debug, info};

/// Marks the current thread as running a fan-out of one world until dropped.
struct FanOutGuard<'a> {
    threads: &'a Mutex<HashSet<ThreadId>>,
    thread: ThreadId,
}

impl<'a> FanOutGuard<'a> {
    fn enter(threads: &'a Mutex<HashSet<ThreadId>>) -> Self {
        let thread = std::thread::current().id();
        lock(threads).insert(thread);
        FanOutGuard { threads, thread }
    }
}

impl Drop for FanOutGuard<'_> {
    fn drop(&mut self) {
        lock(self.threads).remove(&self.thread);
    }
}

type Deferred = Box<dyn FnOnce(&RobotWorld) + Send>;

/// Result of advancing one robot by one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// No robot with that id
    Missing,
    /// The robot is not acting
    Idle,
    /// The robot is acting but has no (existing) goal
    NoGoal,
    /// The robot moved to the given position
    Moved(Point),
    /// The robot reached its goal and stopped acting
    Arrived(Point),
    /// The step would cross this wall; the robot stopped acting
    Blocked(ObjectId),
}

/// Serializable copy of the whole population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub robots: Vec<Robot>,
    pub walls: Vec<Wall>,
    pub goals: Vec<Goal>,
    pub way_points: Vec<WayPoint>,
    pub local_robot: Option<ObjectId>,
}

#[derive(Default)]
struct WorldState {
    entities: HashMap<ObjectId, Entity>,
    robots: Vec<ObjectId>,
    walls: Vec<ObjectId>,
    goals: Vec<ObjectId>,
    way_points: Vec<ObjectId>,
    local_robot: Option<ObjectId>,
}

impl WorldState {
    fn robot(&self, id: &ObjectId) -> Option<&Robot> {
        match self.entities.get(id) {
            Some(Entity::Robot(r)) => Some(r),
            _ => None,
        }
    }

    fn robot_mut(&mut self, id: &ObjectId) -> Option<&mut Robot> {
        match self.entities.get_mut(id) {
            Some(Entity::Robot(r)) => Some(r),
            _ => None,
        }
    }

    fn wall(&self, id: &ObjectId) -> Option<&Wall> {
        match self.entities.get(id) {
            Some(Entity::Wall(w)) => Some(w),
            _ => None,
        }
    }

    fn goal(&self, id: &ObjectId) -> Option<&Goal> {
        match self.entities.get(id) {
            Some(Entity::Goal(g)) => Some(g),
            _ => None,
        }
    }

    fn way_point(&self, id: &ObjectId) -> Option<&WayPoint> {
        match self.entities.get(id) {
            Some(Entity::WayPoint(w)) => Some(w),
            _ => None,
        }
    }

    fn robots(&self) -> impl Iterator<Item = &Robot> {
        self.robots.iter().filter_map(|id| self.robot(id))
    }

    fn walls(&self) -> impl Iterator<Item = &Wall> {
        self.walls.iter().filter_map(|id| self.wall(id))
    }

    fn goals(&self) -> impl Iterator<Item = &Goal> {
        self.goals.iter().filter_map(|id| self.goal(id))
    }

    fn way_points(&self) -> impl Iterator<Item = &WayPoint> {
        self.way_points.iter().filter_map(|id| self.way_point(id))
    }

    fn insert(&mut self, entity: Entity) {
        let id = entity.id();
        match &entity {
            Entity::Robot(_) => self.robots.push(id),
            Entity::Wall(_) => self.walls.push(id),
            Entity::Goal(_) => self.goals.push(id),
            Entity::WayPoint(_) => self.way_points.push(id),
        }
        self.entities.insert(id, entity);
    }

    fn remove(&mut self, id: &ObjectId) -> bool {
        if self.entities.remove(id).is_none() {
            return false;
        }
        self.robots.retain(|r| r != id);
        self.walls.retain(|w| w != id);
        self.goals.retain(|g| g != id);
        self.way_points.retain(|w| w != id);
        if self.local_robot.as_ref() == Some(id) {
            self.local_robot = None;
        }
        true
    }

    fn clear(&mut self) {
        *self = WorldState::default();
    }

    fn retain(&mut self, keep: &HashSet<ObjectId>) {
        self.entities.retain(|id, _| keep.contains(id));
        self.robots.retain(|id| keep.contains(id));
        self.walls.retain(|id| keep.contains(id));
        self.goals.retain(|id| keep.contains(id));
        self.way_points.retain(|id| keep.contains(id));
        if let Some(local) = self.local_robot {
            if !keep.contains(&local) {
                self.local_robot = None;
            }
        }
    }

    fn local_robot_mut(&mut self) -> &mut Robot {
        let id = match self.local_robot.filter(|id| self.robot(id).is_some()) {
            Some(id) => id,
            None => {
                let robot = Robot::new(LOCAL_ROBOT_NAME, OFF_SCREEN);
                let id = robot.id;
                self.insert(Entity::Robot(robot));
                self.local_robot = Some(id);
                id
            }
        };
        match self.entities.get_mut(&id) {
            Some(Entity::Robot(r)) => r,
            _ => unreachable!("local robot {} was just ensured", id),
        }
    }

    fn apply_layout(&mut self, layout: &WorldLayout, from_request: bool) {
        if from_request {
            let goal = Goal::new(PEER_GOAL_NAME, layout.peer_goal);
            let mut robot = Robot::new(PEER_ROBOT_NAME, layout.peer_robot);
            robot.goal = Some(goal.id);
            self.insert(Entity::Robot(robot));
            self.insert(Entity::Goal(goal));
        } else {
            let goal = Goal::new(LOCAL_GOAL_NAME, layout.local_goal);
            let robot = self.local_robot_mut();
            robot.position = layout.local_robot;
            robot.goal = Some(goal.id);
            self.insert(Entity::Goal(goal));
        }

        if let Some((p1, p2)) = layout.wall {
            self.insert(Entity::Wall(Wall::new(p1, p2)));
        }
    }
}

/// The authoritative world for one process.
///
/// Shared between the control thread and network endpoints as
/// `Arc<RobotWorld>`.
pub struct RobotWorld {
    state: RwLock<WorldState>,
    observers: ObserverRegistry,
    deferred: Mutex<VecDeque<Deferred>>,
    /// Set when a notification was requested during a running fan-out
    renotify: AtomicBool,
    /// Threads currently inside this world's fan-out
    fan_out_threads: Mutex<HashSet<ThreadId>>,
}

impl RobotWorld {
    /// Creates an empty world with no observers.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(WorldState::default()),
            observers: ObserverRegistry::new(),
            deferred: Mutex::new(VecDeque::new()),
            renotify: AtomicBool::new(false),
            fan_out_threads: Mutex::new(HashSet::new()),
        }
    }

    /// Creates an Arc-wrapped world for sharing.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> RwLockReadGuard<'_, WorldState> {
        read(&self.state)
    }

    fn write(&self) -> RwLockWriteGuard<'_, WorldState> {
        write(&self.state)
    }

    // ── Observers ──────────────────────────────────────────────────

    pub fn attach(&self, observer: Arc<dyn WorldObserver>) -> ObserverHandle {
        self.observers.attach(observer)
    }

    /// Returns false if the handle was not attached.
    pub fn detach(&self, handle: ObserverHandle) -> bool {
        self.observers.detach(handle)
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn enable_notification(&self) {
        self.observers.set_enabled(true);
    }

    pub fn disable_notification(&self) {
        self.observers.set_enabled(false);
    }

    /// Runs `f` against this world once the current notification round has
    /// finished, or right away when called outside of one.
    pub fn defer<F>(&self, f: F)
    where
        F: FnOnce(&RobotWorld) + Send + 'static,
    {
        if self.in_fan_out() {
            lock(&self.deferred).push_back(Box::new(f));
        } else {
            f(self);
        }
    }

    /// Calls every attached observer.
    pub fn notify_observers(&self) {
        if !self.observers.is_enabled() {
            return;
        }
        if self.in_fan_out() {
            self.renotify.store(true, Ordering::SeqCst);
            return;
        }

        let _guard = FanOutGuard::enter(&self.fan_out_threads);
        loop {
            for observer in self.observers.snapshot() {
                observer.on_world_changed(self);
            }
            self.run_deferred();
            if !self.renotify.swap(false, Ordering::SeqCst) {
                break;
            }
        }
    }

    /// Whether the calling thread is inside this world's observer fan-out.
    fn in_fan_out(&self) -> bool {
        lock(&self.fan_out_threads).contains(&std::thread::current().id())
    }

    fn run_deferred(&self) {
        loop {
            let next = lock(&self.deferred).pop_front();
            match next {
                Some(f) => f(self),
                None => break,
            }
        }
    }

    fn notify_if(&self, notify: bool) {
        if notify {
            self.notify_observers();
        }
    }

    // ── Factories ──────────────────────────────────────────────────

    pub fn new_robot(&self, name: &str, position: Point, notify: bool) -> Robot {
        let robot = Robot::new(name, position);
        self.write().insert(Entity::Robot(robot.clone()));
        self.notify_if(notify);
        robot
    }

    pub fn new_wall(&self, point1: Point, point2: Point, notify: bool) -> Wall {
        let wall = Wall::new(point1, point2);
        self.write().insert(Entity::Wall(wall.clone()));
        self.notify_if(notify);
        wall
    }

    pub fn new_goal(&self, name: &str, position: Point, notify: bool) -> Goal {
        let goal = Goal::new(name, position);
        self.write().insert(Entity::Goal(goal.clone()));
        self.notify_if(notify);
        goal
    }

    pub fn new_way_point(&self, name: &str, position: Point, notify: bool) -> WayPoint {
        let way_point = WayPoint::new(name, position);
        self.write().insert(Entity::WayPoint(way_point.clone()));
        self.notify_if(notify);
        way_point
    }

    // ── Deletion ───────────────────────────────────────────────────

    /// Removes the robot with the same id. Returns false (and does not
    /// notify) if there is none.
    pub fn delete_robot(&self, robot: &Robot, notify: bool) -> bool {
        let removed = {
            let mut state = self.write();
            state.robot(&robot.id).is_some() && state.remove(&robot.id)
        };
        if removed {
            self.notify_if(notify);
        }
        removed
    }

    /// Removes the first wall with the same endpoint pair.
    pub fn delete_wall(&self, wall: &Wall, notify: bool) -> bool {
        let removed = {
            let mut state = self.write();
            let found = state.walls().find(|w| w.same_endpoints(wall)).map(|w| w.id);
            match found {
                Some(id) => state.remove(&id),
                None => false,
            }
        };
        if removed {
            self.notify_if(notify);
        }
        removed
    }

    pub fn delete_goal(&self, goal: &Goal, notify: bool) -> bool {
        let removed = {
            let mut state = self.write();
            state.goal(&goal.id).is_some() && state.remove(&goal.id)
        };
        if removed {
            self.notify_if(notify);
        }
        removed
    }

    pub fn delete_way_point(&self, way_point: &WayPoint, notify: bool) -> bool {
        let removed = {
            let mut state = self.write();
            state.way_point(&way_point.id).is_some() && state.remove(&way_point.id)
        };
        if removed {
            self.notify_if(notify);
        }
        removed
    }

    // ── Lookup ─────────────────────────────────────────────────────

    pub fn get_robot(&self, id: ObjectId) -> Option<Robot> {
        self.read().robot(&id).cloned()
    }

    /// First robot with this name, in insertion order.
    pub fn get_robot_by_name(&self, name: &str) -> Option<Robot> {
        self.read().robots().find(|r| r.name == name).cloned()
    }

    pub fn get_wall(&self, id: ObjectId) -> Option<Wall> {
        self.read().wall(&id).cloned()
    }

    pub fn get_goal(&self, id: ObjectId) -> Option<Goal> {
        self.read().goal(&id).cloned()
    }

    /// First goal with this name, in insertion order.
    pub fn get_goal_by_name(&self, name: &str) -> Option<Goal> {
        self.read().goals().find(|g| g.name == name).cloned()
    }

    pub fn get_way_point(&self, id: ObjectId) -> Option<WayPoint> {
        self.read().way_point(&id).cloned()
    }

    /// First waypoint with this name, in insertion order.
    pub fn get_way_point_by_name(&self, name: &str) -> Option<WayPoint> {
        self.read().way_points().find(|w| w.name == name).cloned()
    }

    pub fn robots(&self) -> Vec<Robot> {
        self.read().robots().cloned().collect()
    }

    pub fn walls(&self) -> Vec<Wall> {
        self.read().walls().cloned().collect()
    }

    pub fn goals(&self) -> Vec<Goal> {
        self.read().goals().cloned().collect()
    }

    pub fn way_points(&self) -> Vec<WayPoint> {
        self.read().way_points().cloned().collect()
    }

    /// Ids of every entity, in kind order robots, walls, goals, waypoints.
    pub fn entity_ids(&self) -> Vec<ObjectId> {
        let state = self.read();
        state
            .robots
            .iter()
            .chain(&state.walls)
            .chain(&state.goals)
            .chain(&state.way_points)
            .copied()
            .collect()
    }

    pub fn entity_count(&self) -> usize {
        self.read().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entity_count() == 0
    }

    pub fn snapshot(&self) -> WorldSnapshot {
        let state = self.read();
        WorldSnapshot {
            robots: state.robots().cloned().collect(),
            walls: state.walls().cloned().collect(),
            goals: state.goals().cloned().collect(),
            way_points: state.way_points().cloned().collect(),
            local_robot: state.local_robot,
        }
    }

    // ── Local robot ────────────────────────────────────────────────

    /// Returns this process's robot, creating "You" off screen on first use.
    ///
    /// Creation does not notify observers.
    pub fn get_local_robot(&self) -> Robot {
        {
            let state = self.read();
            if let Some(robot) = state.local_robot.and_then(|id| state.robot(&id)) {
                return robot.clone();
            }
        }
        self.write().local_robot_mut().clone()
    }

    /// Returns the local robot without creating one.
    pub fn local_robot(&self) -> Option<Robot> {
        let state = self.read();
        state.local_robot.and_then(|id| state.robot(&id)).cloned()
    }

    // ── Robot state ────────────────────────────────────────────────

    fn update_robot<F>(&self, id: ObjectId, notify: bool, f: F) -> bool
    where
        F: FnOnce(&mut Robot),
    {
        let found = match self.write().robot_mut(&id) {
            Some(robot) => {
                f(robot);
                true
            }
            None => false,
        };
        if found {
            self.notify_if(notify);
        }
        found
    }

    pub fn set_robot_position(&self, id: ObjectId, position: Point, notify: bool) -> bool {
        self.update_robot(id, notify, |r| r.position = position)
    }

    pub fn set_robot_acting(&self, id: ObjectId, acting: bool, notify: bool) -> bool {
        self.update_robot(id, notify, |r| r.acting = acting)
    }

    pub fn set_robot_communicating(&self, id: ObjectId, communicating: bool, notify: bool) -> bool {
        self.update_robot(id, notify, |r| r.communicating = communicating)
    }

    pub fn set_robot_speed(&self, id: ObjectId, speed: f32, notify: bool) -> bool {
        self.update_robot(id, notify, |r| r.speed = speed)
    }

    pub fn set_robot_goal(&self, id: ObjectId, goal: Option<ObjectId>, notify: bool) -> bool {
        self.update_robot(id, notify, |r| r.goal = goal)
    }

    /// Moves an acting robot one tick towards its goal.
    ///
    /// The robot covers `speed` units (at least one). It stops acting when it
    /// arrives or when the step would cross a wall, in which case it stays
    /// where it is.
    pub fn step_robot(&self, id: ObjectId) -> StepOutcome {
        let outcome = {
            let mut state = self.write();
            let (position, speed, goal) = match state.robot(&id) {
                None => return StepOutcome::Missing,
                Some(r) if !r.acting => return StepOutcome::Idle,
                Some(r) => (r.position, r.speed, r.goal),
            };
            let target = match goal.and_then(|g| state.goal(&g)) {
                Some(g) => g.position,
                None => return StepOutcome::NoGoal,
            };

            let delta = target.to_vector() - position.to_vector();
            let distance = delta.norm();
            let step = f64::from(speed).max(1.0);
            let (next, arrived) = if distance <= step {
                (target, true)
            } else {
                (Point::from_vector(position.to_vector() + delta / distance * step), false)
            };

            let blocking = state
                .walls()
                .find(|w| segments_intersect(position, next, w.point1, w.point2))
                .map(|w| w.id);

            let robot = match state.robot_mut(&id) {
                Some(r) => r,
                None => return StepOutcome::Missing,
            };
            match blocking {
                Some(wall) => {
                    robot.acting = false;
                    StepOutcome::Blocked(wall)
                }
                None => {
                    robot.position = next;
                    if arrived {
                        robot.acting = false;
                        StepOutcome::Arrived(next)
                    } else {
                        StepOutcome::Moved(next)
                    }
                }
            }
        };

        match outcome {
            StepOutcome::Arrived(p) => debug!("Robot {} arrived at {}", id, p),
            StepOutcome::Blocked(wall) => info!("Robot {} blocked by wall {}", id, wall),
            _ => {}
        }
        self.notify_observers();
        outcome
    }

    // ── Bulk operations ────────────────────────────────────────────

    /// Populates one of the numbered layouts (0..=5).
    ///
    /// With `from_request == false` the local robot is placed and given
    /// "YourGoal"; otherwise a "Peer" robot and "PeerGoal" mirror a remote
    /// populate. Unknown numbers change nothing. Observers are notified once
    /// in every case.
    pub fn populate(&self, world_number: i64, from_request: bool) {
        match layout(world_number) {
            Some(layout) => {
                self.write().apply_layout(layout, from_request);
                info!(
                    "Populated world {} ({})",
                    world_number,
                    if from_request { "peer" } else { "local" }
                );
            }
            None => debug!("Unknown world selection: {}", world_number),
        }
        self.notify_observers();
    }

    /// Removes every entity and forgets the local robot.
    pub fn unpopulate(&self, notify: bool) {
        self.write().clear();
        self.notify_if(notify);
    }

    /// Removes every entity whose id is not in `keep`.
    pub fn unpopulate_except(&self, keep: &[ObjectId], notify: bool) {
        let keep: HashSet<ObjectId> = keep.iter().copied().collect();
        self.write().retain(&keep);
        self.notify_if(notify);
    }

    /// Explicit teardown: silences and detaches every observer, then clears
    /// the world.
    pub fn shutdown(&self) {
        self.disable_notification();
        self.observers.clear();
        self.unpopulate(false);
    }

    // ── Export ─────────────────────────────────────────────────────

    /// One-line summary of the world.
    pub fn as_string(&self) -> String {
        let state = self.read();
        format!(
            "RobotWorld: {} robots, {} walls, {} goals, {} waypoints",
            state.robots.len(),
            state.walls.len(),
            state.goals.len(),
            state.way_points.len()
        )
    }

    /// Summary followed by every entity, one per line, in the order robots,
    /// waypoints, goals, walls.
    pub fn as_debug_string(&self) -> String {
        let summary = self.as_string();
        let state = self.read();
        let mut out = summary;
        out.push('\n');

        let lines = state
            .robots()
            .map(Robot::as_debug_string)
            .chain(state.way_points().map(WayPoint::as_debug_string))
            .chain(state.goals().map(Goal::as_debug_string))
            .chain(state.walls().map(Wall::as_debug_string));
        for line in lines {
            out.push_str(&line);
            out.push('\n');
        }
        out
    }

    /// Script of factory calls that rebuilds the current population,
    /// robots first, then walls, waypoints and goals.
    ///
    /// Only names, positions and wall endpoints are captured; ids and robot
    /// state are not.
    pub fn as_code(&self) -> String {
        let state = self.read();
        let mut out = String::new();
        for robot in state.robots() {
            out.push_str(&Statement::Robot(robot.name.clone(), robot.position).to_string());
        }
        for wall in state.walls() {
            out.push_str(&Statement::Wall(wall.point1, wall.point2).to_string());
        }
        for way_point in state.way_points() {
            out.push_str(&Statement::WayPoint(way_point.name.clone(), way_point.position).to_string());
        }
        for goal in state.goals() {
            out.push_str(&Statement::Goal(goal.name.clone(), goal.position).to_string());
        }
        out
    }

    /// Replays a script produced by [`as_code`](Self::as_code).
    ///
    /// The whole script is parsed before anything is created, so a bad line
    /// leaves the world untouched. Returns the number of entities created
    /// and notifies once.
    pub fn replay_code(&self, code: &str) -> Result<usize, CoreError> {
        let statements = code
            .lines()
            .enumerate()
            .filter(|(_, line)| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("//")
            })
            .map(|(index, line)| Statement::parse(line.trim(), index + 1))
            .collect::<Result<Vec<_>, _>>()?;

        {
            let mut state = self.write();
            for statement in &statements {
                state.insert(statement.to_entity());
            }
        }
        self.notify_observers();
        Ok(statements.len())
    }
}

impl Default for RobotWorld {
    fn default() -> Self {
        Self::new()
    }
}

/// One line of an `as_code` script.
#[derive(Debug, Clone, PartialEq)]
enum Statement {
    Robot(String, Point),
    Wall(Point, Point),
    WayPoint(String, Point),
    Goal(String, Point),
}

fn quote(name: &str) -> String {
    serde_json::Value::String(name.to_string()).to_string()
}

fn point_code(p: Point) -> String {
    format!("Point::new({}, {})", p.x, p.y)
}

impl std::fmt::Display for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Statement::Robot(name, p) => {
                writeln!(f, "world.new_robot({}, {}, false);", quote(name), point_code(*p))
            }
            Statement::Wall(p1, p2) => {
                writeln!(f, "world.new_wall({}, {}, false);", point_code(*p1), point_code(*p2))
            }
            Statement::WayPoint(name, p) => {
                writeln!(f, "world.new_way_point({}, {}, false);", quote(name), point_code(*p))
            }
            Statement::Goal(name, p) => {
                writeln!(f, "world.new_goal({}, {}, false);", quote(name), point_code(*p))
            }
        }
    }
}

impl Statement {
    fn parse(line: &str, line_number: usize) -> Result<Self, CoreError> {
        let mut p = ScriptParser {
            rest: line,
            line: line_number,
        };
        p.expect("world.")?;

        let statement = if p.eat("new_robot(") {
            let name = p.name()?;
            p.expect(",")?;
            Statement::Robot(name, p.point()?)
        } else if p.eat("new_wall(") {
            let p1 = p.point()?;
            p.expect(",")?;
            Statement::Wall(p1, p.point()?)
        } else if p.eat("new_way_point(") {
            let name = p.name()?;
            p.expect(",")?;
            Statement::WayPoint(name, p.point()?)
        } else if p.eat("new_goal(") {
            let name = p.name()?;
            p.expect(",")?;
            Statement::Goal(name, p.point()?)
        } else {
            return Err(p.error("unknown factory call"));
        };

        p.expect(",")?;
        if !(p.eat("false") || p.eat("true")) {
            return Err(p.error("expected notify flag"));
        }
        p.expect(")")?;
        p.expect(";")?;
        if !p.rest.trim().is_empty() {
            return Err(p.error("trailing text"));
        }
        Ok(statement)
    }

    fn to_entity(&self) -> Entity {
        match self {
            Statement::Robot(name, p) => Entity::Robot(Robot::new(name, *p)),
            Statement::Wall(p1, p2) => Entity::Wall(Wall::new(*p1, *p2)),
            Statement::WayPoint(name, p) => Entity::WayPoint(WayPoint::new(name, *p)),
            Statement::Goal(name, p) => Entity::Goal(Goal::new(name, *p)),
        }
    }
}

struct ScriptParser<'a> {
    rest: &'a str,
    line: usize,
}

impl<'a> ScriptParser<'a> {
    fn error(&self, reason: &str) -> CoreError {
        CoreError::script(self.line, format!("{} at '{}'", reason, self.rest))
    }

    fn eat(&mut self, token: &str) -> bool {
        let trimmed = self.rest.trim_start();
        match trimmed.strip_prefix(token) {
            Some(rest) => {
                self.rest = rest;
                true
            }
            None => false,
        }
    }

    fn expect(&mut self, token: &str) -> Result<(), CoreError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", token)))
        }
    }

    fn name(&mut self) -> Result<String, CoreError> {
        let trimmed = self.rest.trim_start();
        let mut stream = serde_json::Deserializer::from_str(trimmed).into_iter::<String>();
        match stream.next() {
            Some(Ok(name)) => {
                self.rest = &trimmed[stream.byte_offset()..];
                Ok(name)
            }
            _ => Err(self.error("expected quoted name")),
        }
    }

    fn integer(&mut self) -> Result<i32, CoreError> {
        let trimmed = self.rest.trim_start();
        let end = trimmed
            .char_indices()
            .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && c == '-')))
            .map(|(i, _)| i)
            .unwrap_or(trimmed.len());
        let value = trimmed[..end]
            .parse::<i32>()
            .map_err(|_| self.error("expected integer"))?;
        self.rest = &trimmed[end..];
        Ok(value)
    }

    fn point(&mut self) -> Result<Point, CoreError> {
        self.expect("Point::new(")?;
        let x = self.integer()?;
        self.expect(",")?;
        let y = self.integer()?;
        self.expect(")")?;
        Ok(Point::new(x, y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(world: &RobotWorld) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&count);
        world.attach(Arc::new(move |_: &RobotWorld| {
            observed.fetch_add(1, Ordering::SeqCst);
        }));
        count
    }

    /// Names and positions only, for comparing worlds built separately.
    fn structure(world: &RobotWorld) -> (Vec<(String, Point)>, Vec<(Point, Point)>, Vec<(String, Point)>, Vec<(String, Point)>) {
        (
            world.robots().into_iter().map(|r| (r.name, r.position)).collect(),
            world.walls().into_iter().map(|w| (w.point1, w.point2)).collect(),
            world.way_points().into_iter().map(|w| (w.name, w.position)).collect(),
            world.goals().into_iter().map(|g| (g.name, g.position)).collect(),
        )
    }

    #[test]
    fn test_factories_preserve_insertion_order() {
        let world = RobotWorld::new();
        world.new_robot("a", Point::new(1, 1), false);
        world.new_robot("b", Point::new(2, 2), false);
        world.new_robot("c", Point::new(3, 3), false);

        let names: Vec<_> = world.robots().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_factories_notify_when_asked() {
        let world = RobotWorld::new();
        let count = counting(&world);

        world.new_goal("g", Point::new(0, 0), true);
        world.new_wall(Point::new(0, 0), Point::new(1, 1), false);
        world.new_way_point("w", Point::new(0, 0), true);

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_populate_world_0_local() {
        let world = RobotWorld::new();
        world.populate(0, false);

        assert_eq!(world.get_local_robot().position, Point::new(50, 60));
        let goals = world.goals();
        assert_eq!(goals.len(), 1);
        assert_eq!(goals[0].name, "YourGoal");
        assert_eq!(goals[0].position, Point::new(450, 440));
        assert_eq!(world.get_local_robot().goal, Some(goals[0].id));
        assert!(world.walls().is_empty());
    }

    #[test]
    fn test_populate_world_4_adds_wall() {
        let world = RobotWorld::new();
        world.populate(4, false);

        assert_eq!(world.get_local_robot().position, Point::new(50, 60));
        assert_eq!(world.goals().len(), 1);
        let walls = world.walls();
        assert_eq!(walls.len(), 1);
        assert_eq!(walls[0].point1, Point::new(480, 300));
        assert_eq!(walls[0].point2, Point::new(150, 300));
    }

    #[test]
    fn test_populate_from_request_mirrors_peer() {
        let world = RobotWorld::new();
        world.populate(2, true);

        let peer = world.get_robot_by_name("Peer").unwrap();
        assert_eq!(peer.position, Point::new(40, 40));
        let goal = world.get_goal_by_name("PeerGoal").unwrap();
        assert_eq!(goal.position, Point::new(480, 480));
        assert_eq!(peer.goal, Some(goal.id));
        assert!(world.local_robot().is_none());
    }

    #[test]
    fn test_every_layout_has_expected_entities() {
        for n in 0..6 {
            let local = RobotWorld::new();
            local.populate(n, false);
            let dump = local.as_debug_string();
            assert!(dump.contains("Robot You"), "world {}", n);
            assert!(dump.contains("Goal YourGoal"), "world {}", n);
            assert!(!dump.contains("Peer"), "world {}", n);
            assert_eq!(local.walls().len(), usize::from(n >= 4));

            let peer = RobotWorld::new();
            peer.populate(n, true);
            let dump = peer.as_debug_string();
            assert!(dump.contains("Robot Peer"), "world {}", n);
            assert!(dump.contains("Goal PeerGoal"), "world {}", n);
            assert!(!dump.contains("You"), "world {}", n);
        }
    }

    #[test]
    fn test_populate_notifies_once_even_for_unknown_world() {
        let world = RobotWorld::new();
        let count = counting(&world);

        world.populate(3, false);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        world.populate(42, false);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(world.goals().len(), 1);
    }

    #[test]
    fn test_local_robot_is_created_lazily_once() {
        let world = RobotWorld::new();
        let count = counting(&world);
        assert!(world.local_robot().is_none());

        let first = world.get_local_robot();
        let second = world.get_local_robot();
        assert_eq!(first.id, second.id);
        assert_eq!(first.name, "You");
        assert_eq!(first.position, OFF_SCREEN);
        assert_eq!(world.robots().len(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        world.unpopulate(false);
        assert_ne!(world.get_local_robot().id, first.id);
    }

    #[test]
    fn test_delete_missing_does_not_notify() {
        let world = RobotWorld::new();
        let robot = world.new_robot("r", Point::new(0, 0), false);
        let count = counting(&world);

        assert!(world.delete_robot(&robot, true));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(!world.delete_robot(&robot, true));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(world.robots().is_empty());
    }

    #[test]
    fn test_delete_missing_wall_goal_way_point_does_not_notify() {
        let world = RobotWorld::new();
        let wall = world.new_wall(Point::new(0, 0), Point::new(10, 0), false);
        let goal = world.new_goal("g", Point::new(1, 1), false);
        let way_point = world.new_way_point("w", Point::new(2, 2), false);
        let count = counting(&world);

        assert!(world.delete_wall(&wall, true));
        assert!(world.delete_goal(&goal, true));
        assert!(world.delete_way_point(&way_point, true));
        assert_eq!(count.load(Ordering::SeqCst), 3);

        assert!(!world.delete_wall(&wall, true));
        assert!(!world.delete_goal(&goal, true));
        assert!(!world.delete_way_point(&way_point, true));
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(world.is_empty());
    }

    #[test]
    fn test_delete_matches_by_id_not_name() {
        let world = RobotWorld::new();
        let first = world.new_robot("twin", Point::new(0, 0), false);
        let second = world.new_robot("twin", Point::new(5, 5), false);

        assert!(world.delete_robot(&second, false));
        let left = world.robots();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, first.id);
    }

    #[test]
    fn test_delete_wall_by_endpoints() {
        let world = RobotWorld::new();
        let wall = world.new_wall(Point::new(1, 1), Point::new(9, 9), false);
        let other = world.new_wall(Point::new(2, 2), Point::new(3, 3), false);

        assert!(world.delete_wall(&wall, false));
        assert!(!world.delete_wall(&wall, false));
        assert_eq!(world.walls(), vec![other]);
    }

    #[test]
    fn test_delete_goal_and_way_point() {
        let world = RobotWorld::new();
        let goal = world.new_goal("g", Point::new(1, 1), false);
        let way_point = world.new_way_point("w", Point::new(2, 2), false);

        assert!(world.delete_goal(&goal, false));
        assert!(world.delete_way_point(&way_point, false));
        assert!(world.is_empty());
        assert!(!world.delete_goal(&goal, false));
    }

    #[test]
    fn test_deleting_local_robot_forgets_it() {
        let world = RobotWorld::new();
        let local = world.get_local_robot();
        assert!(world.delete_robot(&local, false));
        assert!(world.local_robot().is_none());
    }

    #[test]
    fn test_lookups_are_total() {
        let world = RobotWorld::new();
        assert!(world.get_robot(ObjectId::new()).is_none());
        assert!(world.get_robot_by_name("nobody").is_none());
        assert!(world.get_wall(ObjectId::new()).is_none());
        assert!(world.get_goal_by_name("none").is_none());
        assert!(world.get_way_point_by_name("none").is_none());
    }

    #[test]
    fn test_lookup_by_name_returns_first_match() {
        let world = RobotWorld::new();
        let first = world.new_goal("dup", Point::new(1, 1), false);
        world.new_goal("dup", Point::new(2, 2), false);
        assert_eq!(world.get_goal_by_name("dup").unwrap().id, first.id);
    }

    #[test]
    fn test_lookup_by_id_checks_kind() {
        let world = RobotWorld::new();
        let goal = world.new_goal("g", Point::new(1, 1), false);
        assert!(world.get_robot(goal.id).is_none());
        assert!(world.get_goal(goal.id).is_some());
    }

    #[test]
    fn test_unpopulate_clears_everything() {
        let world = RobotWorld::new();
        world.populate(5, false);
        world.populate(5, true);
        world.new_way_point("w", Point::new(1, 1), false);
        let count = counting(&world);

        world.unpopulate(true);

        assert!(world.robots().is_empty());
        assert!(world.walls().is_empty());
        assert!(world.goals().is_empty());
        assert!(world.way_points().is_empty());
        assert!(world.local_robot().is_none());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unpopulate_except_keeps_listed_ids() {
        let world = RobotWorld::new();
        world.populate(4, false);
        world.populate(4, true);
        let local = world.get_local_robot();
        let peer = world.get_robot_by_name("Peer").unwrap();

        world.unpopulate_except(&[local.id], false);

        assert_eq!(world.robots(), vec![local.clone()]);
        assert!(world.goals().is_empty());
        assert!(world.walls().is_empty());
        assert!(world.get_robot(peer.id).is_none());
        assert_eq!(world.local_robot().map(|r| r.id), Some(local.id));
    }

    #[test]
    fn test_unpopulate_except_dropping_local_robot_forgets_it() {
        let world = RobotWorld::new();
        world.populate(0, false);
        let goal = world.get_goal_by_name("YourGoal").unwrap();

        world.unpopulate_except(&[goal.id], false);

        assert!(world.local_robot().is_none());
        assert_eq!(world.goals().len(), 1);
    }

    #[test]
    fn test_as_code_order_and_format() {
        let world = RobotWorld::new();
        world.new_goal("G", Point::new(4, 4), false);
        world.new_way_point("W", Point::new(3, 3), false);
        world.new_wall(Point::new(1, 2), Point::new(3, 4), false);
        world.new_robot("R", Point::new(-5, 6), false);

        let code = world.as_code();
        let lines: Vec<_> = code.lines().collect();
        assert_eq!(
            lines,
            vec![
                "world.new_robot(\"R\", Point::new(-5, 6), false);",
                "world.new_wall(Point::new(1, 2), Point::new(3, 4), false);",
                "world.new_way_point(\"W\", Point::new(3, 3), false);",
                "world.new_goal(\"G\", Point::new(4, 4), false);",
            ]
        );
    }

    #[test]
    fn test_replay_round_trip() {
        let world = RobotWorld::new();
        world.populate(5, false);
        world.populate(5, true);
        world.new_way_point("Quote \"this\", Point::new(1, 2)", Point::new(7, 8), false);

        let fresh = RobotWorld::new();
        let count = counting(&fresh);
        let created = fresh.replay_code(&world.as_code()).unwrap();

        assert_eq!(created, world.entity_count());
        assert_eq!(structure(&fresh), structure(&world));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_replay_rejects_bad_script_atomically() {
        let world = RobotWorld::new();
        let script = "world.new_goal(\"ok\", Point::new(1, 1), false);\nworld.new_tree(\"x\");\n";

        match world.replay_code(script) {
            Err(CoreError::Script { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected {:?}", other),
        }
        assert!(world.is_empty());
    }

    #[test]
    fn test_debug_string_order() {
        let world = RobotWorld::new();
        world.new_wall(Point::new(0, 0), Point::new(1, 1), false);
        world.new_goal("G", Point::new(0, 0), false);
        world.new_way_point("W", Point::new(0, 0), false);
        world.new_robot("R", Point::new(0, 0), false);

        let dump = world.as_debug_string();
        let kinds: Vec<_> = dump
            .lines()
            .map(|l| l.split_whitespace().next().unwrap_or_default().to_string())
            .collect();
        assert_eq!(kinds, vec!["RobotWorld:", "Robot", "WayPoint", "Goal", "Wall"]);
    }

    #[test]
    fn test_step_moves_towards_goal() {
        let world = RobotWorld::new();
        world.populate(0, false);
        let robot = world.get_local_robot();
        world.set_robot_acting(robot.id, true, false);

        match world.step_robot(robot.id) {
            StepOutcome::Moved(p) => {
                approx::assert_relative_eq!(p.distance(Point::new(50, 60)), 10.0, epsilon = 1.0);
                assert!(p.distance(Point::new(450, 440)) < Point::new(50, 60).distance(Point::new(450, 440)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_step_arrives_and_stops() {
        let world = RobotWorld::new();
        let goal = world.new_goal("g", Point::new(5, 0), false);
        let robot = world.new_robot("r", Point::new(0, 0), false);
        world.set_robot_goal(robot.id, Some(goal.id), false);
        world.set_robot_acting(robot.id, true, false);

        assert_eq!(world.step_robot(robot.id), StepOutcome::Arrived(Point::new(5, 0)));
        assert!(!world.get_robot(robot.id).unwrap().acting);
        assert_eq!(world.step_robot(robot.id), StepOutcome::Idle);
    }

    #[test]
    fn test_step_blocked_by_wall() {
        let world = RobotWorld::new();
        let goal = world.new_goal("g", Point::new(0, 100), false);
        let robot = world.new_robot("r", Point::new(0, 45), false);
        let wall = world.new_wall(Point::new(-50, 50), Point::new(50, 50), false);
        world.set_robot_goal(robot.id, Some(goal.id), false);
        world.set_robot_acting(robot.id, true, false);

        assert_eq!(world.step_robot(robot.id), StepOutcome::Blocked(wall.id));
        let robot = world.get_robot(robot.id).unwrap();
        assert_eq!(robot.position, Point::new(0, 45));
        assert!(!robot.acting);
    }

    #[test]
    fn test_step_without_goal_or_robot() {
        let world = RobotWorld::new();
        let robot = world.new_robot("r", Point::new(0, 0), false);
        world.set_robot_acting(robot.id, true, false);
        assert_eq!(world.step_robot(robot.id), StepOutcome::NoGoal);
        assert_eq!(world.step_robot(ObjectId::new()), StepOutcome::Missing);
    }

    #[test]
    fn test_observer_mutation_is_not_nested() {
        let world = Arc::new(RobotWorld::new());
        let depth = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));

        let (d, c) = (Arc::clone(&depth), Arc::clone(&calls));
        world.attach(Arc::new(move |w: &RobotWorld| {
            assert_eq!(d.fetch_add(1, Ordering::SeqCst), 0, "nested notification");
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                // Direct mutation from inside the callback
                w.new_goal("from observer", Point::new(1, 1), true);
            }
            d.fetch_sub(1, Ordering::SeqCst);
        }));

        world.new_goal("first", Point::new(0, 0), true);

        assert_eq!(world.goals().len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_observer_of_one_world_mutating_another() {
        let a = Arc::new(RobotWorld::new());
        let b = Arc::new(RobotWorld::new());
        let b_calls = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&b_calls);
        b.attach(Arc::new(move |_: &RobotWorld| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        let mirror = Arc::clone(&b);
        a.attach(Arc::new(move |_: &RobotWorld| {
            mirror.new_goal("mirror", Point::new(3, 3), true);
            mirror.defer(|w| {
                w.new_way_point("deferred", Point::new(4, 4), false);
            });
        }));

        a.new_goal("source", Point::new(0, 0), true);
        assert_eq!(b.goals().len(), 1);
        assert_eq!(b.way_points().len(), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);

        b.new_goal("later", Point::new(5, 5), true);
        assert_eq!(b_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_deferred_work_runs_after_fan_out() {
        let world = RobotWorld::new();
        let seen_during_callback = Arc::new(AtomicUsize::new(usize::MAX));

        let seen = Arc::clone(&seen_during_callback);
        world.attach(Arc::new(move |w: &RobotWorld| {
            if w.way_points().is_empty() {
                w.defer(|w| {
                    w.new_way_point("deferred", Point::new(2, 2), false);
                });
                seen.store(w.way_points().len(), Ordering::SeqCst);
            }
        }));

        world.new_goal("trigger", Point::new(0, 0), true);

        assert_eq!(seen_during_callback.load(Ordering::SeqCst), 0);
        assert_eq!(world.way_points().len(), 1);
    }

    #[test]
    fn test_defer_outside_notification_runs_now() {
        let world = RobotWorld::new();
        world.defer(|w| {
            w.new_goal("now", Point::new(0, 0), false);
        });
        assert_eq!(world.goals().len(), 1);
    }

    #[test]
    fn test_disable_notification_and_shutdown() {
        let world = RobotWorld::new();
        let count = counting(&world);

        world.disable_notification();
        world.populate(1, false);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        world.enable_notification();
        world.populate(1, true);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        world.shutdown();
        assert_eq!(world.observer_count(), 0);
        assert!(world.is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_mutation_keeps_world_consistent() {
        let world = RobotWorld::shared();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let world = Arc::clone(&world);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let robot = world.new_robot(&format!("r{}-{}", t, i), Point::new(i, t), true);
                        if i % 2 == 0 {
                            world.delete_robot(&robot, true);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(world.robots().len(), 4 * 25);
        assert_eq!(world.entity_count(), 4 * 25);
    }

    proptest! {
        #[test]
        fn prop_unpopulate_except_all_is_noop(world_number in 0i64..6, peers in 0usize..3) {
            let world = RobotWorld::new();
            world.populate(world_number, false);
            for _ in 0..peers {
                world.populate(world_number, true);
            }
            let before = world.snapshot();

            world.unpopulate_except(&world.entity_ids(), true);

            prop_assert_eq!(world.snapshot(), before);
        }

        #[test]
        fn prop_unpopulate_except_nothing_clears(world_number in 0i64..6, from_request in any::<bool>()) {
            let world = RobotWorld::new();
            world.populate(world_number, from_request);
            world.get_local_robot();

            world.unpopulate_except(&[], true);

            prop_assert!(world.is_empty());
            prop_assert!(world.local_robot().is_none());
        }

        #[test]
        fn prop_replay_reproduces_structure(
            robots in proptest::collection::vec(("[a-zA-Z \"\\\\]{0,8}", -500i32..500, -500i32..500), 0..5),
            walls in proptest::collection::vec((-500i32..500, -500i32..500, -500i32..500, -500i32..500), 0..4),
        ) {
            let world = RobotWorld::new();
            for (name, x, y) in &robots {
                world.new_robot(name, Point::new(*x, *y), false);
                world.new_goal(name, Point::new(*y, *x), false);
                world.new_way_point(name, Point::new(*x, *x), false);
            }
            for (x1, y1, x2, y2) in &walls {
                world.new_wall(Point::new(*x1, *y1), Point::new(*x2, *y2), false);
            }

            let fresh = RobotWorld::new();
            fresh.replay_code(&world.as_code()).unwrap();
            prop_assert_eq!(structure(&fresh), structure(&world));
        }
    }
}
