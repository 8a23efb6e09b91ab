//! Real peer over TCP.
//!
//! Wires a [`RobotWorld`] and [`RobotEndpoint`] to the production
//! environment (`TokioContext` + `TcpTransport`) so two processes can talk.

use crate::error::SimError;

use robotworld_core::{ChannelHandler, EndpointConfig, Message, RobotEndpoint, RobotWorld};
use robotworld_env::{NodeId, TcpTransport, TokioContext};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// Endpoint type used by TCP peers.
pub type TcpEndpoint = RobotEndpoint<TokioContext, TcpTransport>;

/// Converts a `--duration` value in seconds into how long a peer serves.
pub fn serve_duration(secs: f64) -> Result<Duration, SimError> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| SimError::Config(format!("invalid duration {}: {}", secs, e)))
}

/// One robot process reachable over TCP.
pub struct PeerNode {
    pub world: Arc<RobotWorld>,
    pub transport: Arc<TcpTransport>,
    pub endpoint: Arc<TcpEndpoint>,
}

impl PeerNode {
    /// Creates a peer with a fresh world and a communicating local robot.
    pub fn new(config: EndpointConfig) -> Self {
        let world = RobotWorld::shared();
        let robot = world.get_local_robot();
        let transport = Arc::new(TcpTransport::new(NodeId::new()));
        let endpoint = Arc::new(RobotEndpoint::new(
            TokioContext::shared(),
            Arc::clone(&transport),
            Arc::clone(&world),
            robot.id,
            config,
        ));
        endpoint.start_communicating();

        Self {
            world,
            transport,
            endpoint,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.endpoint.node_id
    }

    /// Accepts connections on `addr`. Returns the bound address.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, SimError> {
        Ok(self.transport.listen(addr).await?)
    }

    /// Dials `addr` and makes the remote node this endpoint's peer.
    pub async fn connect(&self, addr: SocketAddr) -> Result<NodeId, SimError> {
        let remote = self.transport.connect(addr).await?;
        self.endpoint.set_peer(remote);
        info!("[{}] Connected to {} at {}", self.endpoint.config.name, remote, addr);
        Ok(remote)
    }

    /// Sends `message` and waits for its answer.
    ///
    /// The answer arrives through the running endpoint loop, so
    /// [`spawn`](Self::spawn) must have been called. Timeouts come back as
    /// a `CommunicationReadError` message, not as an error.
    pub async fn request(&self, message: Message) -> Result<Message, SimError> {
        let (handler, rx) = ChannelHandler::new();
        self.endpoint.send_message(message, Box::new(handler)).await;
        rx.await
            .map_err(|_| SimError::Peer("response handler dropped without an answer".to_string()))
    }

    /// Runs the endpoint loop on the tokio runtime.
    pub fn spawn(&self) -> JoinHandle<()> {
        let endpoint = Arc::clone(&self.endpoint);
        tokio::spawn(async move { endpoint.run().await })
    }

    /// Stops the endpoint loop and closes every connection.
    pub fn shutdown(&self) {
        self.endpoint.request_stop();
        self.transport.shutdown();
        self.world.shutdown();
    }
}
