//! Production network transport over TCP.
//!
//! Each connection carries length-prefixed frames (see [`crate::framing`]) in
//! both directions. A writer task drains an unbounded channel into the socket
//! and a reader task pushes decoded packets into one inbox shared by all
//! connections. The first frame on every connection is a hello, which tells
//! each side the other's [`NodeId`]; replies are then routed over whatever
//! connection the target node is known on.

use crate::error::EnvError;
use crate::framing::{read_frame, write_frame};
use crate::network::NetworkTransport;
use crate::types::{NodeId, PacketEnvelope};

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long a freshly opened connection may take to deliver its hello.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A live connection to one remote node.
struct Connection {
    /// Serial number distinguishing this connection from a later reconnect
    serial: u64,
    addr: SocketAddr,
    tx: mpsc::UnboundedSender<PacketEnvelope>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// State shared with the connection tasks.
struct Shared {
    local_id: NodeId,
    started: Instant,
    /// Taken on shutdown, which lets `recv` drain and then return `None`
    inbox_tx: Mutex<Option<mpsc::UnboundedSender<(NodeId, PacketEnvelope)>>>,
    connections: Mutex<HashMap<NodeId, Connection>>,
    next_serial: AtomicU64,
}

impl Shared {
    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Pushes a packet into the inbox. Returns false once the transport is shut down.
    fn deliver(&self, sender: NodeId, packet: PacketEnvelope) -> bool {
        match lock(&self.inbox_tx).as_ref() {
            Some(tx) => tx.send((sender, packet)).is_ok(),
            None => false,
        }
    }

    /// Starts the reader/writer tasks for a connection and registers it.
    ///
    /// Any earlier connection to the same node is replaced. Fails once the
    /// transport is shut down.
    fn register(
        self: &Arc<Self>,
        remote: NodeId,
        addr: SocketAddr,
        read_half: OwnedReadHalf,
        write_half: OwnedWriteHalf,
    ) -> Result<(), EnvError> {
        // Held until the connection is in the map so shutdown cannot miss it
        let inbox = lock(&self.inbox_tx);
        if inbox.is_none() {
            return Err(EnvError::network("transport is shut down"));
        }

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel::<PacketEnvelope>();

        let writer = tokio::spawn(write_loop(self.local_id, remote, write_half, rx));
        let reader = tokio::spawn(read_loop(Arc::clone(self), remote, serial, read_half));

        let connection = Connection {
            serial,
            addr,
            tx,
            reader,
            writer,
        };

        if let Some(previous) = lock(&self.connections).insert(remote, connection) {
            debug!("Replaced connection to {} ({})", remote, previous.addr);
        }
        drop(inbox);
        info!("Connected to {} at {}", remote, addr);
        Ok(())
    }

    fn unregister(&self, remote: NodeId, serial: u64) {
        let mut connections = lock(&self.connections);
        if connections.get(&remote).map(|c| c.serial) == Some(serial) {
            connections.remove(&remote);
        }
    }
}

async fn write_loop(
    local_id: NodeId,
    remote: NodeId,
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<PacketEnvelope>,
) {
    while let Some(packet) = rx.recv().await {
        if let Err(e) = write_frame(&mut write_half, local_id, &packet).await {
            warn!("Failed to write to {}: {}", remote, e);
            break;
        }
    }
}

async fn read_loop(shared: Arc<Shared>, remote: NodeId, serial: u64, mut read_half: OwnedReadHalf) {
    loop {
        match read_frame(&mut read_half).await {
            Ok(Some((sender, packet))) => {
                if packet.is_hello() {
                    continue;
                }
                if !shared.deliver(sender, packet) {
                    break;
                }
            }
            Ok(None) => {
                info!("Peer {} disconnected", remote);
                break;
            }
            Err(e) => {
                error!("Failed to read from {}: {}", remote, e);
                break;
            }
        }
    }
    shared.unregister(remote, serial);
}

/// Reads the first frame of a new connection, which must arrive in time.
async fn read_hello(read_half: &mut OwnedReadHalf) -> Result<(NodeId, PacketEnvelope), EnvError> {
    match tokio::time::timeout(HELLO_TIMEOUT, read_frame(read_half)).await {
        Ok(Ok(Some(frame))) => Ok(frame),
        Ok(Ok(None)) => Err(EnvError::network("connection closed before hello")),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(EnvError::Timeout(HELLO_TIMEOUT.as_millis() as u64)),
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(e) = accept_connection(shared, stream, addr).await {
                        warn!("Rejected connection from {}: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn accept_connection(shared: Arc<Shared>, stream: TcpStream, addr: SocketAddr) -> Result<(), EnvError> {
    let (mut read_half, mut write_half) = stream.into_split();
    let (remote, first) = read_hello(&mut read_half).await?;
    write_frame(&mut write_half, shared.local_id, &PacketEnvelope::hello(shared.now_ms())).await?;

    // A peer may skip the hello and open with a real packet
    if !first.is_hello() {
        shared.deliver(remote, first);
    }

    shared.register(remote, addr, read_half, write_half)
}

/// TCP implementation of [`NetworkTransport`].
pub struct TcpTransport {
    shared: Arc<Shared>,
    inbox_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(NodeId, PacketEnvelope)>>,
    listener: Mutex<Option<(SocketAddr, JoinHandle<()>)>>,
}

impl TcpTransport {
    /// Creates a transport that can dial out but does not accept connections yet.
    pub fn new(local_id: NodeId) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                local_id,
                started: Instant::now(),
                inbox_tx: Mutex::new(Some(inbox_tx)),
                connections: Mutex::new(HashMap::new()),
                next_serial: AtomicU64::new(1),
            }),
            inbox_rx: tokio::sync::Mutex::new(inbox_rx),
            listener: Mutex::new(None),
        }
    }

    /// Creates a transport that accepts connections on `addr`.
    pub async fn bind(local_id: NodeId, addr: SocketAddr) -> Result<Self, EnvError> {
        let transport = Self::new(local_id);
        transport.listen(addr).await?;
        Ok(transport)
    }

    /// Starts accepting connections on `addr` and returns the bound address.
    ///
    /// Calling this while already listening returns the current address.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, EnvError> {
        if let Some(bound) = self.local_addr() {
            return Ok(bound);
        }

        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        let task = tokio::spawn(accept_loop(Arc::clone(&self.shared), listener));
        *lock(&self.listener) = Some((bound, task));

        info!("Node {} listening on {}", self.shared.local_id, bound);
        Ok(bound)
    }

    /// Stops accepting new connections. Existing connections stay open.
    pub fn stop_listening(&self) {
        if let Some((addr, task)) = lock(&self.listener).take() {
            task.abort();
            info!("Node {} stopped listening on {}", self.shared.local_id, addr);
        }
    }

    /// Returns the address this transport accepts connections on, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.listener).as_ref().map(|(addr, _)| *addr)
    }

    /// Dials a peer and returns its node id once the hello exchange completes.
    pub async fn connect(&self, addr: SocketAddr) -> Result<NodeId, EnvError> {
        let stream = TcpStream::connect(addr).await?;
        let (mut read_half, mut write_half) = stream.into_split();

        write_frame(&mut write_half, self.shared.local_id, &PacketEnvelope::hello(self.shared.now_ms())).await?;
        let (remote, first) = read_hello(&mut read_half).await?;
        if !first.is_hello() {
            self.shared.deliver(remote, first);
        }

        self.shared.register(remote, addr, read_half, write_half)?;
        Ok(remote)
    }

    /// Returns the nodes that currently have an open connection.
    pub fn connected_peers(&self) -> Vec<NodeId> {
        lock(&self.shared.connections).keys().copied().collect()
    }

    /// Stops listening and closes every connection.
    ///
    /// Packets already in the inbox can still be received; after that
    /// `recv` returns `None`. The transport cannot be reopened.
    pub fn shutdown(&self) {
        self.stop_listening();
        if lock(&self.shared.inbox_tx).take().is_some() {
            debug!("Node {} closed its inbox", self.shared.local_id);
        }
        lock(&self.shared.connections).clear();
    }
}

#[async_trait]
impl NetworkTransport for TcpTransport {
    async fn send(&self, target: NodeId, packet: PacketEnvelope) -> Result<(), EnvError> {
        let connections = lock(&self.shared.connections);
        let connection = connections
            .get(&target)
            .ok_or_else(|| EnvError::unreachable(target))?;

        connection
            .tx
            .send(packet)
            .map_err(|_| EnvError::network(format!("connection to {} closed", target)))
    }

    async fn recv(&self) -> Option<(NodeId, PacketEnvelope)> {
        let mut rx = self.inbox_rx.lock().await;
        rx.recv().await
    }

    fn try_recv(&self) -> Option<(NodeId, PacketEnvelope)> {
        self.inbox_rx.try_lock().ok()?.try_recv().ok()
    }

    fn local_id(&self) -> NodeId {
        self.shared.local_id
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
