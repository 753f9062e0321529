//! Core environment context trait for DriveSafe engines.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;

/// The central interface for Environment Interaction.
///
/// This trait abstracts the "real world" so that the safety engines can run
/// against the wall clock in production and against a virtual clock in
/// tests and scenario replays.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time` and `Instant`
/// - **Simulation**: `ManualContext` - virtual clock advanced by the caller
///
/// # Determinism
///
/// Every timestamp the watchdog, alert board and fail-safe log record comes
/// from `now()`, so a scenario driven through `ManualContext` replays
/// bit-for-bit.
#[async_trait]
pub trait SafetyContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Used for heartbeat ages, alert display windows and event timestamps.
    /// In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time for exported diagnostics.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances the virtual clock and yields
    async fn sleep(&self, duration: Duration);

    /// Spawns a named background task and returns its join handle.
    ///
    /// The handle lets owners implement join-on-shutdown semantics.
    fn spawn<F>(&self, name: &str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    /// In simulation, returns the master seed.
    fn seed(&self) -> u64;
}
