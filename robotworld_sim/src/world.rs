//! SimWorld - The simulation harness container.

use crate::context::SimContext;
use crate::error::SimError;
use crate::network::{NetworkMessage, SimNetwork, SimNetworkController};

use rand_distr::{Distribution, Normal};
use robotworld_core::{EndpointConfig, RobotEndpoint, RobotWorld, StepOutcome};
use robotworld_env::{NodeId, PacketEnvelope, RobotContext};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Endpoint type used for every simulated peer.
pub type SimEndpoint = RobotEndpoint<SimContext, SimNetwork>;

/// Configuration for a simulation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of peer processes to simulate
    pub num_peers: usize,

    /// Tick rate in Hz
    pub tick_rate_hz: u32,

    /// Maximum simulation duration in seconds
    pub max_duration_secs: f64,

    /// How long a peer waits for an answer before giving up
    pub response_timeout_ms: u64,

    /// Standard deviation of per-packet latency jitter in milliseconds
    pub latency_jitter_ms: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            num_peers: 2,
            tick_rate_hz: 30,
            max_duration_secs: 10.0,
            response_timeout_ms: 2000,
            latency_jitter_ms: 0.0,
        }
    }
}

impl SimConfig {
    /// Parses a JSON config; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, SimError> {
        let config: SimConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SimError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), SimError> {
        if self.tick_rate_hz == 0 {
            return Err(SimError::Config("tick_rate_hz must be positive".to_string()));
        }
        if self.latency_jitter_ms < 0.0 || !self.latency_jitter_ms.is_finite() {
            return Err(SimError::Config(format!(
                "latency_jitter_ms must be a non-negative number, got {}",
                self.latency_jitter_ms
            )));
        }
        Ok(())
    }

    /// Seconds of virtual time per tick.
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate_hz.max(1)))
    }
}

/// Handle to a simulated peer.
pub struct PeerHandle {
    /// Peer's node ID
    pub id: NodeId,

    /// The peer's own world
    pub world: Arc<RobotWorld>,

    /// The peer's protocol endpoint, bound to its local robot
    pub endpoint: Arc<SimEndpoint>,

    /// Sender to deliver packets to this peer
    inbox_tx: mpsc::Sender<(NodeId, PacketEnvelope)>,
}

/// Packet counters kept by the router.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    pub routed: u64,
    pub delivered: u64,
    pub dropped_partition: u64,
    pub dropped_loss: u64,
    pub dropped_unknown: u64,
    pub max_latency_ms: u64,
}

struct InFlight {
    deliver_at: Duration,
    message: NetworkMessage,
}

/// The SimWorld - container for the entire simulation.
pub struct SimWorld {
    /// Configuration
    pub config: SimConfig,

    /// Shared simulation context (virtual clock)
    pub context: Arc<SimContext>,

    /// Network controller for fault injection
    pub network_controller: Arc<SimNetworkController>,

    /// Peer handles, in spawn order
    pub peers: Vec<PeerHandle>,

    /// Central router sender (receives all outgoing packets)
    router_tx: mpsc::Sender<NetworkMessage>,

    /// Central router receiver
    router_rx: mpsc::Receiver<NetworkMessage>,

    /// Packets held back by link latency
    in_flight: Vec<InFlight>,

    jitter: Option<Normal<f64>>,

    stats: RouterStats,

    /// Current tick count
    tick_count: u64,
}

impl SimWorld {
    /// Creates a new SimWorld with the given configuration.
    pub fn new(config: SimConfig) -> Self {
        let context = SimContext::shared(config.seed);
        let network_controller = Arc::new(SimNetworkController::new());

        // Create central router channel
        let (router_tx, router_rx) = mpsc::channel::<NetworkMessage>(10000);

        let jitter = if config.latency_jitter_ms > 0.0 {
            Normal::new(0.0, config.latency_jitter_ms).ok()
        } else {
            None
        };

        Self {
            config,
            context,
            network_controller,
            peers: Vec::new(),
            router_tx,
            router_rx,
            in_flight: Vec::new(),
            jitter,
            stats: RouterStats::default(),
            tick_count: 0,
        }
    }

    /// Spawns peers and returns their IDs.
    ///
    /// Every peer gets its own world with a communicating local robot. Peers
    /// form a ring: each one's configured peer is the next one.
    pub fn spawn_peers(&mut self) -> Vec<NodeId> {
        let count = self.config.num_peers;
        let ids: Vec<NodeId> = (0..count).map(|i| NodeId::from_seed(i as u64)).collect();

        for (i, &node_id) in ids.iter().enumerate() {
            let (inbox_tx, inbox_rx) = mpsc::channel(1000);
            let network = Arc::new(SimNetwork::new(node_id, self.router_tx.clone(), inbox_rx));

            let world = RobotWorld::shared();
            let robot = world.get_local_robot();

            let mut config = EndpointConfig::default()
                .with_name(format!("peer-{}", i))
                .with_tick_rate(self.config.tick_rate_hz)
                .with_response_timeout(self.config.response_timeout_ms);
            if count > 1 {
                config = config.with_peer(ids[(i + 1) % count]);
            }

            let endpoint = Arc::new(RobotEndpoint::new(
                Arc::clone(&self.context),
                network,
                Arc::clone(&world),
                robot.id,
                config,
            ));
            endpoint.start_communicating();

            self.peers.push(PeerHandle {
                id: node_id,
                world,
                endpoint,
                inbox_tx,
            });
        }

        ids
    }

    /// Returns the peer with the given ID.
    pub fn peer(&self, id: NodeId) -> Option<&PeerHandle> {
        self.peers.iter().find(|p| p.id == id)
    }

    /// Advances simulation by one tick.
    ///
    /// Virtual time moves forward, due packets are delivered, every endpoint
    /// handles its inbox and expires overdue requests, and every acting robot
    /// takes one step.
    pub async fn tick(&mut self) -> Vec<StepOutcome> {
        self.context.advance_time(self.config.tick_duration());
        self.process_network().await;

        for peer in &self.peers {
            peer.endpoint.pump().await;
        }
        let outcomes = self.peers.iter().map(|p| p.endpoint.tick()).collect();

        self.tick_count += 1;
        outcomes
    }

    /// Runs `ticks` ticks.
    pub async fn run_ticks(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.tick().await;
        }
    }

    /// Ticks until `done` holds or `max_ticks` have run. Returns whether
    /// `done` held.
    pub async fn run_until<F>(&mut self, max_ticks: u64, mut done: F) -> bool
    where
        F: FnMut(&SimWorld) -> bool,
    {
        for _ in 0..max_ticks {
            if done(self) {
                return true;
            }
            self.tick().await;
        }
        done(self)
    }

    /// Processes pending network messages (routes packets).
    pub async fn process_network(&mut self) {
        let now = self.context.now();

        // Drain all pending messages
        while let Ok(msg) = self.router_rx.try_recv() {
            self.stats.routed += 1;

            // Check partition
            if !self.network_controller.can_communicate(msg.from, msg.to) {
                self.stats.dropped_partition += 1;
                debug!("Partition dropped packet {} -> {}", msg.from, msg.to);
                continue;
            }

            let loss = self.network_controller.get_loss(msg.from, msg.to);
            if loss > 0.0 && self.context.random_f64() < loss {
                self.stats.dropped_loss += 1;
                debug!("Lost packet {} -> {}", msg.from, msg.to);
                continue;
            }

            let mut latency_ms = self.network_controller.get_latency(msg.from, msg.to) as f64;
            if let Some(jitter) = &self.jitter {
                latency_ms += self.context.with_rng(|rng| jitter.sample(rng)).abs();
            }
            let latency_ms = latency_ms.round() as u64;
            self.stats.max_latency_ms = self.stats.max_latency_ms.max(latency_ms);

            self.in_flight.push(InFlight {
                deliver_at: now + Duration::from_millis(latency_ms),
                message: msg,
            });
        }

        // Deliver everything due, in send order
        let (due, held): (Vec<_>, Vec<_>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(|f| f.deliver_at <= now);
        self.in_flight = held;

        for InFlight { message, .. } in due {
            match self.peers.iter().find(|p| p.id == message.to) {
                Some(peer) => {
                    if let Err(e) = peer.inbox_tx.try_send((message.from, message.packet)) {
                        warn!("Inbox of {} rejected packet: {}", message.to, e);
                        self.stats.dropped_unknown += 1;
                    } else {
                        self.stats.delivered += 1;
                    }
                }
                None => {
                    self.stats.dropped_unknown += 1;
                    debug!("No peer {} to deliver to", message.to);
                }
            }
        }
    }

    /// Number of packets waiting out their link latency.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn router_stats(&self) -> RouterStats {
        self.stats
    }

    /// Returns the current simulation time in seconds.
    pub fn time(&self) -> f64 {
        self.context.now().as_secs_f64()
    }

    /// Returns the current tick count.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Returns the number of peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Total entities across every peer's world.
    pub fn entity_count(&self) -> usize {
        self.peers.iter().map(|p| p.world.entity_count()).sum()
    }
}
