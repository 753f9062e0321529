//! Deterministic context with a caller-driven virtual clock.

use crate::SafetyContext;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

/// Simulation context backed by a virtual clock.
///
/// Time only moves when the owner calls `advance_time` / `set_time`, or when
/// a task sleeps on it. Clones share the same clock, so a watchdog and the
/// test driving it always agree on "now".
pub struct ManualContext {
    /// Master seed for this run
    seed: u64,

    /// Current virtual time (nanoseconds since context creation)
    virtual_time_ns: Arc<AtomicU64>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,
}

impl ManualContext {
    /// Creates a new ManualContext with the given seed.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            virtual_time_ns: Arc::new(AtomicU64::new(0)),
            epoch: UNIX_EPOCH + Duration::from_secs(1704067200), // 2024-01-01 00:00:00 UTC
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Advances virtual time by the given duration.
    pub fn advance_time(&self, duration: Duration) {
        self.virtual_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Sets the virtual time to a specific value.
    pub fn set_time(&self, time: Duration) {
        self.virtual_time_ns
            .store(time.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn time_ns(&self) -> u64 {
        self.virtual_time_ns.load(Ordering::SeqCst)
    }
}

impl Clone for ManualContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            virtual_time_ns: Arc::clone(&self.virtual_time_ns),
            epoch: self.epoch,
        }
    }
}

#[async_trait]
impl SafetyContext for ManualContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        // Sleeping advances virtual time; yield so other tasks observe it
        self.advance_time(duration);
        tokio::task::yield_now().await;
    }

    fn spawn<F>(&self, name: &str, future: F) -> JoinHandle<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tracing::debug!(task = name, seed = self.seed, "spawning simulated task");
        tokio::spawn(future)
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_context_time() {
        let ctx = ManualContext::new(42);
        assert_eq!(ctx.now(), Duration::ZERO);

        ctx.advance_time(Duration::from_secs(1));
        assert_eq!(ctx.now(), Duration::from_secs(1));

        ctx.advance_time(Duration::from_millis(500));
        assert_eq!(ctx.now(), Duration::from_millis(1500));

        ctx.set_time(Duration::from_millis(250));
        assert_eq!(ctx.now(), Duration::from_millis(250));
    }

    #[test]
    fn test_manual_context_seed() {
        let ctx = ManualContext::new(12345);
        assert_eq!(ctx.seed(), 12345);
    }

    #[test]
    fn test_manual_context_clone_shares_time() {
        let ctx1 = ManualContext::new(42);
        let ctx2 = ctx1.clone();

        ctx1.advance_time(Duration::from_secs(5));

        // Both should see the same time
        assert_eq!(ctx1.now(), ctx2.now());
    }

    #[test]
    fn test_system_time_tracks_virtual_clock() {
        let ctx = ManualContext::new(1);
        let t0 = ctx.system_time();
        ctx.advance_time(Duration::from_secs(3));
        assert_eq!(ctx.system_time().duration_since(t0).unwrap(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_sleep_advances_virtual_clock() {
        let ctx = ManualContext::new(7);
        ctx.sleep(Duration::from_millis(100)).await;
        assert_eq!(ctx.now(), Duration::from_millis(100));
    }
}
