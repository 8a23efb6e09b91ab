//! RobotWorld Core - World model and peer messaging protocol
//!
//! This library holds everything a robot process needs besides its I/O:
//! 1. **World store**: the authoritative registry of robots, walls, goals and
//!    waypoints, with change notification for observers
//! 2. **Messaging protocol**: request/response message kinds, their byte codec
//!    and response handlers
//! 3. **Endpoint**: binds one robot to a `NetworkTransport`, answering peer
//!    requests and routing answers to its own requests

pub mod endpoint;
pub mod error;
pub mod geometry;
pub mod layout;
pub mod messaging;
pub mod model;
pub mod observer;
mod sync;
pub mod trace;
pub mod world;

// Re-export key types for convenience
pub use endpoint::{EndpointConfig, EndpointStats, RobotEndpoint};
pub use error::{CoreError, MessageError};
pub use geometry::{ObjectId, Point, OFF_SCREEN};
pub use messaging::{handler, ChannelHandler, LoggingHandler, Message, MessageType, ResponseHandler};
pub use model::{Entity, Goal, Robot, Wall, WayPoint};
pub use observer::{ObserverHandle, WorldObserver, WorldTracer};
pub use trace::{Trace, TraceSink, TraceTarget};
pub use world::{RobotWorld, StepOutcome, WorldSnapshot};
