//! RobotWorld Environment Abstraction Layer
//!
//! This crate provides the abstraction allowing robot endpoints to run both
//! **Live** (tokio, TCP between processes) and inside the **Simulation**
//! harness (virtual clock, in-process channels).
//!
//! Intercepted I/O:
//! - Time (`now()`, `sleep()`)
//! - Task spawning (`spawn()`)
//! - Network (`send()`, `recv()`, `try_recv()`)
//!
//! # Example
//!
//! ```ignore
//! use robotworld_env::{RobotContext, NetworkTransport};
//!
//! async fn endpoint_loop<Ctx: RobotContext, Net: NetworkTransport>(
//!     ctx: &Ctx,
//!     net: &Net,
//! ) {
//!     loop {
//!         tokio::select! {
//!             packet = net.recv() => handle_packet(packet),
//!             _ = ctx.sleep(Duration::from_millis(33)) => tick(),
//!         }
//!     }
//! }
//! ```

mod context;
mod network;
mod types;
mod error;
mod tokio_impl;
mod tcp;
pub mod framing;

pub use context::RobotContext;
pub use network::{NetworkTransport, NetworkController};
pub use types::{NodeId, PacketEnvelope};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
pub use tcp::TcpTransport;
