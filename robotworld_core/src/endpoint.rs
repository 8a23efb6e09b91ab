//! Robot communication endpoint - binds one robot to a network transport.
//!
//! The endpoint is the integration layer between the world store and the
//! environment abstraction (`RobotContext` + `NetworkTransport`). It plays
//! both protocol roles at once: it answers requests from its peer against
//! its own world, and it sends requests whose answers are routed back to the
//! caller's [`ResponseHandler`] by session id.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      RobotEndpoint                          │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │              Context: RobotContext                   │   │
//! │  │  • now() → response deadlines, packet timestamps     │   │
//! │  │  • sleep() → tick rate control                       │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │                              │                               │
//! │  ┌───────────────┐ ┌──────────────────┐ ┌───────────────┐   │
//! │  │  Request      │ │ Pending handlers │ │  Acting loop  │   │
//! │  │  dispatch     │ │ (session → once) │ │  step_robot   │   │
//! │  └───────────────┘ └──────────────────┘ └───────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use robotworld_core::endpoint::{RobotEndpoint, EndpointConfig};
//! use robotworld_env::{TcpTransport, TokioContext};
//!
//! let endpoint = RobotEndpoint::new(ctx, network, world, robot.id, EndpointConfig::default());
//! endpoint.start_communicating();
//! endpoint.send(Message::with_payload(MessageType::EchoRequest, "Hello world!")).await;
//! endpoint.run().await;
//! ```

use crate::geometry::ObjectId;
use crate::messaging::{LoggingHandler, Message, MessageType, ResponseHandler};
use crate::sync::{lock, read, write};
use crate::world::{RobotWorld, StepOutcome};

use robotworld_env::{NetworkTransport, NodeId, PacketEnvelope, RobotContext};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Configuration for a robot endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Endpoint's logical name (for logging)
    pub name: String,

    /// Where outgoing requests go. Learned from the first inbound packet
    /// when unset.
    pub peer: Option<NodeId>,

    /// Tick rate in Hz (default: 30)
    pub tick_rate_hz: u32,

    /// How long a sent request waits for its answer (default: 2000)
    pub response_timeout_ms: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: "robot".to_string(),
            peer: None,
            tick_rate_hz: 30,
            response_timeout_ms: 2000,
        }
    }
}

impl EndpointConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_peer(mut self, peer: NodeId) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn with_tick_rate(mut self, tick_rate_hz: u32) -> Self {
        self.tick_rate_hz = tick_rate_hz;
        self
    }

    pub fn with_response_timeout(mut self, response_timeout_ms: u64) -> Self {
        self.response_timeout_ms = response_timeout_ms;
        self
    }
}

/// Counters kept by an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStats {
    pub requests_sent: u64,
    pub requests_answered: u64,
    pub requests_ignored: u64,
    pub responses_delivered: u64,
    pub responses_dropped: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    pub timeouts: u64,
}

#[derive(Default)]
struct StatCounters {
    requests_sent: AtomicU64,
    requests_answered: AtomicU64,
    requests_ignored: AtomicU64,
    responses_delivered: AtomicU64,
    responses_dropped: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
    timeouts: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct PendingResponse {
    request: MessageType,
    deadline: Duration,
    handler: Box<dyn ResponseHandler>,
}

/// A robot's protocol endpoint.
///
/// Generic over the context and network implementations, allowing the same
/// endpoint code to run live (tokio + TCP) or in the simulation harness.
pub struct RobotEndpoint<Ctx, Net>
where
    Ctx: RobotContext,
    Net: NetworkTransport,
{
    /// Node identifier
    pub node_id: NodeId,

    /// Environment context
    pub context: Arc<Ctx>,

    /// Network interface
    pub network: Arc<Net>,

    /// Configuration
    pub config: EndpointConfig,

    world: Arc<RobotWorld>,
    robot_id: ObjectId,
    peer: RwLock<Option<NodeId>>,
    pending: Mutex<HashMap<u64, PendingResponse>>,
    next_session: AtomicU64,
    tick_count: AtomicU64,
    stats: StatCounters,
    stop_tx: watch::Sender<bool>,
}

impl<Ctx, Net> RobotEndpoint<Ctx, Net>
where
    Ctx: RobotContext,
    Net: NetworkTransport,
{
    /// Creates an endpoint for the robot `robot_id` in `world`.
    pub fn new(
        context: Arc<Ctx>,
        network: Arc<Net>,
        world: Arc<RobotWorld>,
        robot_id: ObjectId,
        config: EndpointConfig,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            node_id: network.local_id(),
            context,
            network,
            peer: RwLock::new(config.peer),
            config,
            world,
            robot_id,
            pending: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(PacketEnvelope::HELLO_SESSION + 1),
            tick_count: AtomicU64::new(0),
            stats: StatCounters::default(),
            stop_tx,
        }
    }

    pub fn world(&self) -> &Arc<RobotWorld> {
        &self.world
    }

    pub fn robot_id(&self) -> ObjectId {
        self.robot_id
    }

    pub fn peer(&self) -> Option<NodeId> {
        *read(&self.peer)
    }

    pub fn set_peer(&self, peer: NodeId) {
        *write(&self.peer) = Some(peer);
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count.load(Ordering::Relaxed)
    }

    /// Number of sent requests still waiting for an answer.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn stats(&self) -> EndpointStats {
        let s = &self.stats;
        EndpointStats {
            requests_sent: s.requests_sent.load(Ordering::Relaxed),
            requests_answered: s.requests_answered.load(Ordering::Relaxed),
            requests_ignored: s.requests_ignored.load(Ordering::Relaxed),
            responses_delivered: s.responses_delivered.load(Ordering::Relaxed),
            responses_dropped: s.responses_dropped.load(Ordering::Relaxed),
            read_errors: s.read_errors.load(Ordering::Relaxed),
            write_errors: s.write_errors.load(Ordering::Relaxed),
            timeouts: s.timeouts.load(Ordering::Relaxed),
        }
    }

    // ── Robot flags ────────────────────────────────────────────────

    pub fn is_communicating(&self) -> bool {
        self.world
            .get_robot(self.robot_id)
            .map(|r| r.communicating)
            .unwrap_or(false)
    }

    /// Starts accepting inbound requests.
    pub fn start_communicating(&self) {
        if self.world.set_robot_communicating(self.robot_id, true, true) {
            info!("[{}] Communicating on {}", self.config.name, self.node_id);
        } else {
            warn!("[{}] Robot {} is not in the world", self.config.name, self.robot_id);
        }
    }

    /// Stops accepting inbound requests. Requests already sent keep
    /// waiting for their answers.
    pub fn stop_communicating(&self) {
        if self.world.set_robot_communicating(self.robot_id, false, true) {
            info!("[{}] Stopped communicating", self.config.name);
        }
    }

    pub fn start_acting(&self) {
        self.world.set_robot_acting(self.robot_id, true, true);
    }

    pub fn stop_acting(&self) {
        self.world.set_robot_acting(self.robot_id, false, true);
    }

    // ── Sending ────────────────────────────────────────────────────

    /// Sends `message` to the peer; the answer goes to `handler`.
    ///
    /// Failures are reported to the handler as `CommunicationWriteError`.
    /// Returns the session id used.
    pub async fn send_message(&self, message: Message, handler: Box<dyn ResponseHandler>) -> u64 {
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        bump(&self.stats.requests_sent);

        let peer = match self.peer() {
            Some(peer) => peer,
            None => {
                bump(&self.stats.write_errors);
                warn!("[{}] No peer to send {} to", self.config.name, message.kind());
                handler.handle_response(Message::with_payload(
                    MessageType::CommunicationWriteError,
                    "No peer configured",
                ));
                return session;
            }
        };

        // Registered before sending so an immediate answer finds it
        let deadline = self.context.now() + Duration::from_millis(self.config.response_timeout_ms);
        lock(&self.pending).insert(
            session,
            PendingResponse {
                request: message.kind(),
                deadline,
                handler,
            },
        );

        debug!("[{}] -> {} session {}: {}", self.config.name, peer, session, message);
        let envelope = PacketEnvelope::new(session, message.encode(), self.context.now_ms());
        if let Err(e) = self.network.send(peer, envelope).await {
            bump(&self.stats.write_errors);
            warn!("[{}] Send to {} failed: {}", self.config.name, peer, e);
            let pending = lock(&self.pending).remove(&session);
            if let Some(pending) = pending {
                pending.handler.handle_response(Message::with_payload(
                    MessageType::CommunicationWriteError,
                    e.to_string(),
                ));
            }
        }
        session
    }

    /// Sends `message` and logs whatever answer comes back.
    pub async fn send(&self, message: Message) -> u64 {
        self.send_message(message, Box::new(LoggingHandler::new())).await
    }

    async fn reply(&self, target: NodeId, session: u64, message: Message) {
        debug!("[{}] <- {} session {}: {}", self.config.name, target, session, message);
        let envelope = PacketEnvelope::new(session, message.encode(), self.context.now_ms());
        if let Err(e) = self.network.send(target, envelope).await {
            bump(&self.stats.write_errors);
            warn!("[{}] Reply to {} session {} dropped: {}", self.config.name, target, session, e);
        }
    }

    // ── Receiving ──────────────────────────────────────────────────

    /// Processes one inbound packet.
    pub async fn handle_packet(&self, sender: NodeId, envelope: PacketEnvelope) {
        if envelope.is_hello() {
            debug!("[{}] Hello from {}", self.config.name, sender);
            return;
        }
        if self.peer().is_none() {
            info!("[{}] Peer is {}", self.config.name, sender);
            self.set_peer(sender);
        }

        let message = match Message::decode(&envelope.payload) {
            Ok(message) => message,
            Err(e) => {
                bump(&self.stats.read_errors);
                warn!("[{}] Undecodable packet from {}: {}", self.config.name, sender, e);
                let reply = Message::with_payload(MessageType::CommunicationReadError, e.to_string());
                self.reply(sender, envelope.session, reply).await;
                return;
            }
        };

        if message.kind().is_request() {
            self.handle_request(sender, envelope.session, message).await;
        } else {
            self.deliver_response(envelope.session, message);
        }
    }

    async fn handle_request(&self, sender: NodeId, session: u64, message: Message) {
        if !self.is_communicating() {
            bump(&self.stats.requests_ignored);
            debug!("[{}] Not communicating, ignoring {}", self.config.name, message.kind());
            return;
        }

        let reply = self.answer(&message);
        bump(&self.stats.requests_answered);
        self.reply(sender, session, reply).await;
    }

    /// Computes the answer to a request, applying its effect on the world.
    fn answer(&self, request: &Message) -> Message {
        let payload = request.payload();
        match request.kind() {
            MessageType::EchoRequest => Message::with_payload(MessageType::EchoResponse, payload),
            MessageType::GenericRequest => Message::with_payload(MessageType::GenericResponse, payload),
            MessageType::PopulateRequest => match payload.trim().parse::<i64>() {
                Ok(world_number) => {
                    self.world.populate(world_number, true);
                    Message::with_payload(MessageType::PopulateResponse, payload)
                }
                Err(_) => {
                    warn!("[{}] Populate request with bad world number '{}'", self.config.name, payload);
                    Message::with_payload(
                        MessageType::ApplicationExceptionResponse,
                        format!("Invalid world number: '{}'", payload),
                    )
                }
            },
            MessageType::StartRequest => {
                self.world.set_robot_acting(self.robot_id, true, true);
                Message::new(MessageType::StartResponse)
            }
            MessageType::StopRequest => {
                self.world.set_robot_acting(self.robot_id, false, true);
                Message::new(MessageType::StopResponse)
            }
            MessageType::ServerSideExceptionRequest => {
                warn!("[{}] Peer reported server side exception: {}", self.config.name, payload);
                Message::with_payload(MessageType::ServerSideExceptionResponse, payload)
            }
            MessageType::ApplicationExceptionRequest => {
                warn!("[{}] Peer reported application exception: {}", self.config.name, payload);
                Message::with_payload(MessageType::ApplicationExceptionResponse, payload)
            }
            other => Message::with_payload(
                MessageType::ServerSideExceptionResponse,
                format!("Unexpected request kind {}", other),
            ),
        }
    }

    fn deliver_response(&self, session: u64, message: Message) {
        let pending = lock(&self.pending).remove(&session);
        match pending {
            Some(pending) => {
                if message.kind().is_error() {
                    bump(&self.stats.read_errors);
                }
                bump(&self.stats.responses_delivered);
                debug!(
                    "[{}] {} answered with {}",
                    self.config.name, pending.request, message.kind()
                );
                pending.handler.handle_response(message);
            }
            None => {
                bump(&self.stats.responses_dropped);
                debug!(
                    "[{}] Dropping {} for unknown session {}",
                    self.config.name,
                    message.kind(),
                    session
                );
            }
        }
    }

    /// Fails every request whose deadline has passed with
    /// `CommunicationReadError`. Returns how many expired.
    pub fn expire_pending(&self) -> usize {
        let now = self.context.now();
        let expired: Vec<(u64, PendingResponse)> = {
            let mut pending = lock(&self.pending);
            let sessions: Vec<u64> = pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(session, _)| *session)
                .collect();
            sessions
                .into_iter()
                .filter_map(|s| pending.remove(&s).map(|p| (s, p)))
                .collect()
        };

        let count = expired.len();
        for (session, pending) in expired {
            bump(&self.stats.timeouts);
            bump(&self.stats.read_errors);
            warn!(
                "[{}] {} session {} timed out",
                self.config.name, pending.request, session
            );
            pending.handler.handle_response(Message::with_payload(
                MessageType::CommunicationReadError,
                format!(
                    "response timed out after {}ms",
                    self.config.response_timeout_ms
                ),
            ));
        }
        count
    }

    /// Handles every packet already waiting, then expires overdue requests.
    /// Returns the number of packets handled.
    pub async fn pump(&self) -> usize {
        let mut handled = 0;
        while let Some((sender, envelope)) = self.network.try_recv() {
            self.handle_packet(sender, envelope).await;
            handled += 1;
        }
        self.expire_pending();
        handled
    }

    /// One acting-loop step for this endpoint's robot.
    pub fn tick(&self) -> StepOutcome {
        self.tick_count.fetch_add(1, Ordering::Relaxed);
        self.world.step_robot(self.robot_id)
    }

    /// Asks a running [`run`](Self::run) loop to return.
    pub fn request_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Serves packets and ticks at `tick_rate_hz` until the transport
    /// closes or [`request_stop`](Self::request_stop) is called.
    pub async fn run(&self) {
        let period = Duration::from_secs_f64(1.0 / f64::from(self.config.tick_rate_hz.max(1)));
        let mut stop_rx = self.stop_tx.subscribe();
        let mut next_tick = self.context.now() + period;
        info!(
            "[{}] Endpoint running at {} Hz (seed {})",
            self.config.name,
            self.config.tick_rate_hz,
            self.context.seed()
        );

        while !*stop_rx.borrow() {
            let wait = next_tick.saturating_sub(self.context.now());
            tokio::select! {
                packet = self.network.recv() => match packet {
                    Some((sender, envelope)) => self.handle_packet(sender, envelope).await,
                    None => {
                        info!("[{}] Transport closed", self.config.name);
                        break;
                    }
                },
                _ = self.context.sleep(wait) => {
                    self.tick();
                    self.expire_pending();
                    next_tick += period;
                    if next_tick < self.context.now() {
                        next_tick = self.context.now() + period;
                    }
                }
                _ = stop_rx.changed() => {}
            }
        }
        info!("[{}] Endpoint stopped after {} ticks", self.config.name, self.tick_count());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Point;
    use crate::messaging::{handler, ChannelHandler};
    use async_trait::async_trait;
    use robotworld_env::{EnvError, TokioContext};
    use tokio::sync::mpsc;

    /// In-memory transport wired to exactly one other transport.
    struct PairNetwork {
        id: NodeId,
        tx: Mutex<Option<mpsc::UnboundedSender<(NodeId, PacketEnvelope)>>>,
        rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(NodeId, PacketEnvelope)>>,
    }

    fn pair() -> (Arc<PairNetwork>, Arc<PairNetwork>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = PairNetwork {
            id: NodeId::from_seed(1),
            tx: Mutex::new(Some(b_tx)),
            rx: tokio::sync::Mutex::new(a_rx),
        };
        let b = PairNetwork {
            id: NodeId::from_seed(2),
            tx: Mutex::new(Some(a_tx)),
            rx: tokio::sync::Mutex::new(b_rx),
        };
        (Arc::new(a), Arc::new(b))
    }

    impl PairNetwork {
        fn cut(&self) {
            lock(&self.tx).take();
        }
    }

    #[async_trait]
    impl NetworkTransport for PairNetwork {
        async fn send(&self, target: NodeId, packet: PacketEnvelope) -> Result<(), EnvError> {
            match lock(&self.tx).as_ref() {
                Some(tx) => tx
                    .send((self.id, packet))
                    .map_err(|_| EnvError::network("closed")),
                None => Err(EnvError::unreachable(target)),
            }
        }

        async fn recv(&self) -> Option<(NodeId, PacketEnvelope)> {
            self.rx.lock().await.recv().await
        }

        fn try_recv(&self) -> Option<(NodeId, PacketEnvelope)> {
            self.rx.try_lock().ok()?.try_recv().ok()
        }

        fn local_id(&self) -> NodeId {
            self.id
        }
    }

    type TestEndpoint = RobotEndpoint<TokioContext, PairNetwork>;

    fn endpoints(timeout_ms: u64) -> (TestEndpoint, TestEndpoint) {
        let (net_a, net_b) = pair();
        let ctx = TokioContext::shared();

        let world_a = RobotWorld::shared();
        let robot_a = world_a.get_local_robot();
        let config_a = EndpointConfig::default()
            .with_name("a")
            .with_peer(net_b.local_id())
            .with_response_timeout(timeout_ms);

        let world_b = RobotWorld::shared();
        let robot_b = world_b.get_local_robot();
        let config_b = EndpointConfig::default()
            .with_name("b")
            .with_peer(net_a.local_id())
            .with_response_timeout(timeout_ms);

        let a = RobotEndpoint::new(Arc::clone(&ctx), net_a, world_a, robot_a.id, config_a);
        let b = RobotEndpoint::new(ctx, net_b, world_b, robot_b.id, config_b);
        a.start_communicating();
        b.start_communicating();
        (a, b)
    }

    #[test]
    fn test_endpoint_config_default() {
        let config = EndpointConfig::default();
        assert_eq!(config.tick_rate_hz, 30);
        assert_eq!(config.response_timeout_ms, 2000);
        assert!(config.peer.is_none());
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let (a, b) = endpoints(2000);
        let (h, rx) = ChannelHandler::new();

        a.send_message(Message::with_payload(MessageType::EchoRequest, "Hello world!"), Box::new(h))
            .await;
        assert_eq!(b.pump().await, 1);
        assert_eq!(a.pump().await, 1);

        let response = rx.await.unwrap();
        assert_eq!(response.kind(), MessageType::EchoResponse);
        assert_eq!(response.payload(), "Hello world!");
        assert_eq!(a.pending_count(), 0);
        assert_eq!(b.stats().requests_answered, 1);
    }

    #[tokio::test]
    async fn test_populate_request_mirrors_on_peer() {
        let (a, b) = endpoints(2000);
        let (h, rx) = ChannelHandler::new();

        a.send_message(Message::with_payload(MessageType::PopulateRequest, "2"), Box::new(h))
            .await;
        b.pump().await;
        a.pump().await;

        let response = rx.await.unwrap();
        assert_eq!(response.kind(), MessageType::PopulateResponse);
        assert_eq!(response.payload(), "2");

        let peer = b.world().get_robot_by_name("Peer").unwrap();
        assert_eq!(peer.position, Point::new(40, 40));
        assert_eq!(b.world().get_goal_by_name("PeerGoal").unwrap().position, Point::new(480, 480));
        assert!(a.world().get_robot_by_name("Peer").is_none());
    }

    #[tokio::test]
    async fn test_bad_populate_payload_is_application_exception() {
        let (a, b) = endpoints(2000);
        let (h, rx) = ChannelHandler::new();

        a.send_message(Message::with_payload(MessageType::PopulateRequest, "two"), Box::new(h))
            .await;
        b.pump().await;
        a.pump().await;

        assert_eq!(rx.await.unwrap().kind(), MessageType::ApplicationExceptionResponse);
        assert_eq!(b.world().robots().len(), 1);
    }

    #[tokio::test]
    async fn test_start_and_stop_toggle_peer_robot() {
        let (a, b) = endpoints(2000);

        a.send(Message::new(MessageType::StartRequest)).await;
        b.pump().await;
        assert!(b.world().get_robot(b.robot_id()).unwrap().acting);

        a.send(Message::new(MessageType::StopRequest)).await;
        b.pump().await;
        assert!(!b.world().get_robot(b.robot_id()).unwrap().acting);

        a.pump().await;
        assert_eq!(a.stats().responses_delivered, 2);
    }

    #[tokio::test]
    async fn test_exception_requests_are_answered_with_pair() {
        let (a, b) = endpoints(2000);
        let (h, rx) = ChannelHandler::new();

        a.send_message(
            Message::with_payload(MessageType::ServerSideExceptionRequest, "boom"),
            Box::new(h),
        )
        .await;
        b.pump().await;
        a.pump().await;

        let response = rx.await.unwrap();
        assert_eq!(response.kind(), MessageType::ServerSideExceptionResponse);
        assert_eq!(response.payload(), "boom");
    }

    #[tokio::test]
    async fn test_not_communicating_ignores_requests() {
        let (a, b) = endpoints(2000);
        b.stop_communicating();

        a.send(Message::with_payload(MessageType::EchoRequest, "anyone?")).await;
        b.pump().await;

        assert_eq!(b.stats().requests_ignored, 1);
        assert_eq!(a.pump().await, 0);
        assert_eq!(a.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_responses_still_delivered_when_not_communicating() {
        let (a, b) = endpoints(2000);
        let (h, rx) = ChannelHandler::new();

        a.send_message(Message::with_payload(MessageType::EchoRequest, "x"), Box::new(h))
            .await;
        a.stop_communicating();
        b.pump().await;
        a.pump().await;

        assert_eq!(rx.await.unwrap().kind(), MessageType::EchoResponse);
    }

    #[tokio::test]
    async fn test_no_peer_is_write_error() {
        let (net, _) = pair();
        let world = RobotWorld::shared();
        let robot = world.get_local_robot();
        let endpoint = RobotEndpoint::new(
            TokioContext::shared(),
            net,
            world,
            robot.id,
            EndpointConfig::default(),
        );

        let (tx, rx) = std::sync::mpsc::channel();
        endpoint
            .send_message(
                Message::new(MessageType::EchoRequest),
                handler(move |m| {
                    tx.send(m).unwrap();
                }),
            )
            .await;

        let message = rx.try_recv().unwrap();
        assert_eq!(message.kind(), MessageType::CommunicationWriteError);
        assert!(rx.try_recv().is_err());
        assert_eq!(endpoint.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_transport_failure_is_write_error() {
        let (a, _b) = endpoints(2000);
        a.network.cut();
        let (h, rx) = ChannelHandler::new();

        a.send_message(Message::new(MessageType::GenericRequest), Box::new(h)).await;

        assert_eq!(rx.await.unwrap().kind(), MessageType::CommunicationWriteError);
        assert_eq!(a.stats().write_errors, 1);
    }

    #[tokio::test]
    async fn test_timeout_then_late_response_dropped() {
        let (a, b) = endpoints(10);
        let (h, rx) = ChannelHandler::new();

        a.send_message(Message::with_payload(MessageType::EchoRequest, "slow"), Box::new(h))
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(a.expire_pending(), 1);

        let response = rx.await.unwrap();
        assert_eq!(response.kind(), MessageType::CommunicationReadError);
        assert!(response.payload().contains("timed out"));

        b.pump().await;
        a.pump().await;
        assert_eq!(a.stats().responses_dropped, 1);
    }

    #[tokio::test]
    async fn test_undecodable_packet_gets_read_error() {
        let (a, b) = endpoints(2000);
        a.network
            .send(b.node_id, PacketEnvelope::new(7, vec![200], 0))
            .await
            .unwrap();
        b.pump().await;

        let (_, envelope) = a.network.try_recv().unwrap();
        assert_eq!(envelope.session, 7);
        let message = Message::decode(&envelope.payload).unwrap();
        assert_eq!(message.kind(), MessageType::CommunicationReadError);
    }

    #[tokio::test]
    async fn test_peer_learned_from_first_packet() {
        let (net_a, net_b) = pair();
        let ctx = TokioContext::shared();
        let world = RobotWorld::shared();
        let robot = world.get_local_robot();
        let b = RobotEndpoint::new(ctx, net_b, world, robot.id, EndpointConfig::default());
        b.start_communicating();
        assert!(b.peer().is_none());

        net_a
            .send(b.node_id, PacketEnvelope::hello(0))
            .await
            .unwrap();
        b.pump().await;
        assert!(b.peer().is_none());

        let request = Message::new(MessageType::GenericRequest);
        net_a
            .send(b.node_id, PacketEnvelope::new(1, request.encode(), 0))
            .await
            .unwrap();
        b.pump().await;
        assert_eq!(b.peer(), Some(net_a.local_id()));
    }

    #[tokio::test]
    async fn test_tick_steps_robot() {
        let (a, _b) = endpoints(2000);
        a.world().populate(0, false);
        a.start_acting();

        assert!(matches!(a.tick(), StepOutcome::Moved(_)));
        assert_eq!(a.tick_count(), 1);

        a.stop_acting();
        assert_eq!(a.tick(), StepOutcome::Idle);
    }

    #[tokio::test]
    async fn test_run_serves_until_stopped() {
        let (a, b) = endpoints(2000);
        let b = Arc::new(b);
        let runner = {
            let b = Arc::clone(&b);
            tokio::spawn(async move { b.run().await })
        };

        let (h, rx) = ChannelHandler::new();
        a.send_message(Message::with_payload(MessageType::EchoRequest, "live"), Box::new(h))
            .await;
        let (sender, envelope) = tokio::time::timeout(Duration::from_secs(2), a.network.recv())
            .await
            .unwrap()
            .unwrap();
        a.handle_packet(sender, envelope).await;
        assert_eq!(rx.await.unwrap().payload(), "live");

        b.request_stop();
        tokio::time::timeout(Duration::from_secs(2), runner)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(b.stats().requests_answered, 1);
    }
}
