//! Common types for the RobotWorld environment abstraction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a RobotWorld peer process.
///
/// Uses UUID v4 for global uniqueness without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Creates a new random NodeId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a NodeId from a UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Creates a deterministic NodeId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }

    /// Creates a NodeId from its 16 wire bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the 16 wire bytes of this id.
    pub fn to_bytes(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Envelope for packets transmitted between peers.
///
/// This is a transport-layer wrapper. The payload is opaque bytes that the
/// receiving endpoint decodes into a protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketEnvelope {
    /// Session the packet belongs to; a response carries its request's session.
    pub session: u64,

    /// The encoded message bytes
    pub payload: Vec<u8>,

    /// Timestamp when the packet was created (sender's clock)
    pub timestamp_ms: u64,
}

impl PacketEnvelope {
    /// Session number reserved for connection hellos.
    pub const HELLO_SESSION: u64 = 0;

    /// Creates a new envelope from payload bytes.
    pub fn new(session: u64, payload: Vec<u8>, timestamp_ms: u64) -> Self {
        Self {
            session,
            payload,
            timestamp_ms,
        }
    }

    /// Creates the hello envelope exchanged when a connection is opened.
    pub fn hello(timestamp_ms: u64) -> Self {
        Self::new(Self::HELLO_SESSION, Vec::new(), timestamp_ms)
    }

    /// Returns true if this is a connection hello rather than a message.
    pub fn is_hello(&self) -> bool {
        self.session == Self::HELLO_SESSION && self.payload.is_empty()
    }

    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}
