//! JSON exporter for scenario runs.
//!
//! Exports per-frame snapshots of every peer's world so a run can be
//! inspected or replayed offline.

use crate::world::{RouterStats, SimWorld};

use robotworld_core::{EndpointStats, WorldSnapshot};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// A single frame of simulation data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFrame {
    /// Simulation time in seconds
    pub time_sec: f64,

    pub tick: u64,

    /// One entry per peer, in spawn order
    pub peers: Vec<PeerFrame>,

    pub router: RouterStats,

    /// Events (partitions, requests sent, etc.)
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub events: Vec<SimEvent>,
}

impl SimFrame {
    /// Captures the current state of every peer.
    pub fn capture(sim: &SimWorld, events: Vec<SimEvent>) -> Self {
        Self {
            time_sec: sim.time(),
            tick: sim.tick_count(),
            peers: sim
                .peers
                .iter()
                .map(|p| PeerFrame {
                    peer_id: p.id.to_string(),
                    world: p.world.snapshot(),
                    stats: p.endpoint.stats(),
                })
                .collect(),
            router: sim.router_stats(),
            events,
        }
    }
}

/// One peer's state in a frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerFrame {
    pub peer_id: String,
    pub world: WorldSnapshot,
    pub stats: EndpointStats,
}

/// Simulation event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimEvent {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl SimEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: None,
        }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: Some("warn".to_string()),
        }
    }
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Duration in seconds
    pub duration_sec: f64,

    /// All frames
    pub frames: Vec<SimFrame>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            passed: false,
            failure_reason: None,
        }
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: SimFrame) {
        self.duration_sec = frame.time_sec;
        self.frames.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, failure_reason: Option<String>) {
        self.passed = passed;
        self.failure_reason = failure_reason;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::SimConfig;

    #[test]
    fn test_capture_and_serialize() {
        let mut sim = SimWorld::new(SimConfig::default());
        sim.spawn_peers();
        sim.peers[0].world.populate(4, false);

        let mut export = SimExport::new("echo", 42);
        export.add_frame(SimFrame::capture(&sim, vec![SimEvent::info("populated")]));
        export.finalize(true, None);

        assert_eq!(export.frames[0].peers.len(), 2);
        assert_eq!(export.frames[0].peers[0].world.walls.len(), 1);

        let json = serde_json::to_string(&export).unwrap();
        let back: SimExport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.frames[0].peers[0].world, export.frames[0].peers[0].world);
        assert!(!json.contains("failure_reason"));
    }

    #[test]
    fn test_write_to_file() {
        let path = std::env::temp_dir().join(format!("robotworld-export-{}.json", std::process::id()));
        let export = SimExport::new("reconcile", 1);
        export.write_to_file(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\"scenario\": \"reconcile\""));
        let _ = std::fs::remove_file(path);
    }
}
