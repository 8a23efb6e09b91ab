//! Network transport abstraction for RobotWorld peers.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::{NodeId, PacketEnvelope};

/// Abstraction for network I/O between RobotWorld peers.
///
/// # Implementations
///
/// - **Production**: `TcpTransport`, length-prefixed frames over TCP
/// - **Simulation**: Channel-based with configurable latency/loss/partitions
///
/// # Packet Flow
///
/// ```text
/// Peer A                     Network                     Peer B
///   |                           |                          |
///   |-- send(B, request) ------>|                          |
///   |                           |-- [latency/loss] ------->|
///   |                           |                          |-- recv() -> request
///   |                           |<------ send(A, response)-|
///   |<-- recv() -> response ----|                          |
/// ```
#[async_trait]
pub trait NetworkTransport: Send + Sync + 'static {
    /// Sends a packet to a target node.
    ///
    /// # Returns
    /// * `Ok(())` - Packet queued for delivery
    /// * `Err(EnvError::NodeUnreachable)` - No route to the target
    /// * `Err(EnvError::NetworkError)` - Immediate send failure
    ///
    /// # Note
    /// Success does not guarantee delivery.
    async fn send(&self, target: NodeId, packet: PacketEnvelope) -> Result<(), EnvError>;

    /// Receives the next packet addressed to this node.
    ///
    /// # Returns
    /// * `Some((sender, packet))` - A packet was received
    /// * `None` - The transport was closed (shutdown)
    async fn recv(&self) -> Option<(NodeId, PacketEnvelope)>;

    /// Returns the next packet if one is already waiting, without blocking.
    fn try_recv(&self) -> Option<(NodeId, PacketEnvelope)>;

    /// Returns this node's ID.
    fn local_id(&self) -> NodeId;
}

/// Fault injection for simulated networks.
pub trait NetworkController: Send + Sync {
    /// Creates a network partition between two node sets.
    fn partition(&self, group_a: &[NodeId], group_b: &[NodeId]);

    /// Heals all partitions.
    fn heal_all(&self);

    /// Sets latency for a specific link.
    fn set_link_latency(&self, from: NodeId, to: NodeId, latency_ms: u64);

    /// Sets packet loss probability for a link (0.0 - 1.0).
    fn set_link_loss(&self, from: NodeId, to: NodeId, loss_rate: f64);
}
