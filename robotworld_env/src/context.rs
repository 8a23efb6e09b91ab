//! Core environment context trait for RobotWorld endpoints.

use async_trait::async_trait;
use std::time::Duration;

/// The central interface for Environment Interaction.
///
/// This trait abstracts the "real world" so that robot endpoints can run
/// both live (tokio) and inside the deterministic simulation harness.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`
/// - **Simulation**: `SimContext` - virtual clock advanced by the harness
#[async_trait]
pub trait RobotContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Used for response deadlines and tick pacing.
    /// In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances virtual clock
    async fn sleep(&self, duration: Duration);

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;

    /// Current time in milliseconds, used to stamp outgoing packets.
    fn now_ms(&self) -> u64 {
        self.now().as_millis() as u64
    }
}
