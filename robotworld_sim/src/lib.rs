//! RobotWorld Deterministic Simulation Harness
//!
//! Runs several robot peers in one process against a virtual clock and a
//! routed in-memory network, so protocol behaviour under latency, loss and
//! partitions can be replayed exactly from a seed.
//!
//! # Core Principle
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: Virtual clock advances one tick at a time
//! - **Network**: Router with configurable latency, jitter, loss and partitions
//! - **Randomness**: All entropy derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimWorld                            │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ SimContext (Virtual Clock + Seeded RNG)              │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       │                        │                            │
//! │  ┌────▼─────┐             ┌────▼─────┐                      │
//! │  │ Endpoint │◄───────────►│ Endpoint │     ...              │
//! │  │ + World  │   Router    │ + World  │                      │
//! │  └──────────┘             └──────────┘                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use robotworld_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let runner = ScenarioRunner::new(42, 2).with_duration(5.0);
//! let result = runner.run(ScenarioId::SplitBrain).await;
//! assert!(result.passed);
//! ```

mod context;
mod error;
mod exporter;
mod network;
mod peer;
mod runner;
mod sync;
mod world;
pub mod scenarios;

pub use context::SimContext;
pub use error::SimError;
pub use exporter::{PeerFrame, SimEvent, SimExport, SimFrame};
pub use network::{NetworkMessage, SimNetwork, SimNetworkController};
pub use peer::{serve_duration, PeerNode, TcpEndpoint};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use world::{PeerHandle, RouterStats, SimConfig, SimEndpoint, SimWorld};
