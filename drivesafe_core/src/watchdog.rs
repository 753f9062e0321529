//! Component liveness and health monitoring.
//!
//! External components call [`ComponentWatchdog::heartbeat`] at their own
//! cadence. A periodic scan (see [`ComponentWatchdog::start`]) marks silent
//! components as [`ComponentStatus::Timeout`] and fires the critical-failure
//! callback when a critical component goes quiet.
//!
//! The component table sits behind one mutex which is never held while the
//! callback runs, so the callback may query the watchdog freely. Inside a
//! tokio runtime the callback is handed to a blocking task and the scan
//! returns at once.
//!
//! Every change to the table bumps a generation counter that snapshots carry,
//! so consumers can tell an older snapshot from a newer one even when both
//! share a timestamp.

use crate::config::ConfigError;
use drivesafe_env::SafetyContext;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Maximum penalty subtracted from a component score for accumulated errors.
const MAX_ERROR_PENALTY: f64 = 0.5;
const ERROR_PENALTY_STEP: f64 = 0.1;
const CRITICAL_WEIGHT: f64 = 2.0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WatchdogError {
    #[error("Component '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("Unknown component '{0}'")]
    UnknownComponent(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Period of the background scan (default: 100ms)
    pub scan_interval_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self { scan_interval_ms: 100 }
    }
}

impl WatchdogConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan_interval_ms == 0 {
            return Err(ConfigError::Invalid("watchdog.scan_interval_ms must be at least 1".into()));
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComponentStatus {
    Healthy,
    Degraded,
    Failed,
    Timeout,
    Unknown,
}

impl ComponentStatus {
    pub fn base_score(self) -> f64 {
        match self {
            ComponentStatus::Healthy => 1.0,
            ComponentStatus::Degraded => 0.6,
            ComponentStatus::Unknown => 0.5,
            ComponentStatus::Failed | ComponentStatus::Timeout => 0.0,
        }
    }
}

/// One row of the component table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: ComponentStatus,
    /// Context time of the last heartbeat (registration time until the first one)
    pub last_heartbeat: Duration,
    pub timeout: Duration,
    pub error_count: u32,
    pub health_score: f64,
    pub critical: bool,
    pub metadata: Option<serde_json::Value>,
}

impl ComponentHealth {
    fn new(name: String, timeout: Duration, critical: bool, now: Duration) -> Self {
        let mut health = Self {
            name,
            status: ComponentStatus::Unknown,
            last_heartbeat: now,
            timeout,
            error_count: 0,
            health_score: 0.0,
            critical,
            metadata: None,
        };
        health.recompute_score();
        health
    }

    fn recompute_score(&mut self) {
        let penalty = (self.error_count as f64 * ERROR_PENALTY_STEP).min(MAX_ERROR_PENALTY);
        self.health_score = (self.status.base_score() - penalty).max(0.0);
    }

    fn weight(&self) -> f64 {
        if self.critical {
            CRITICAL_WEIGHT
        } else {
            1.0
        }
    }
}

/// Snapshot of the whole table, handed to the failure callback and to the
/// fail-safe manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemDiagnostics {
    pub timestamp: Duration,
    /// Table generation the snapshot was taken at
    #[serde(default)]
    pub generation: u64,
    pub system_health: f64,
    pub total_failures: u64,
    pub components: Vec<ComponentHealth>,
}

impl SystemDiagnostics {
    pub fn critical_components(&self) -> impl Iterator<Item = &ComponentHealth> {
        self.components.iter().filter(|c| c.critical)
    }

    /// True when at least one critical component is listed and none of them
    /// is Healthy.
    pub fn no_critical_healthy(&self) -> bool {
        let mut critical = self.critical_components().peekable();
        critical.peek().is_some() && critical.all(|c| c.status != ComponentStatus::Healthy)
    }
}

/// Result of one scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    /// Components newly marked Timeout by this scan
    pub timed_out: Vec<String>,
    /// Critical components currently in Timeout
    pub critical_timeouts: Vec<String>,
    pub system_health: f64,
    pub callback_invoked: bool,
}

pub type FailureCallback = Arc<dyn Fn(SystemDiagnostics) + Send + Sync>;

fn weighted_health(table: &BTreeMap<String, ComponentHealth>) -> f64 {
    let (sum, weights) = table.values().fold((0.0, 0.0), |(sum, weights), c| {
        (sum + c.health_score * c.weight(), weights + c.weight())
    });
    if weights > 0.0 {
        sum / weights
    } else {
        1.0
    }
}

pub struct ComponentWatchdog<Ctx: SafetyContext> {
    ctx: Arc<Ctx>,
    config: WatchdogConfig,
    components: Mutex<BTreeMap<String, ComponentHealth>>,
    total_failures: AtomicU64,
    generation: AtomicU64,
    callback: Mutex<Option<FailureCallback>>,
    stop: watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<Ctx: SafetyContext> ComponentWatchdog<Ctx> {
    pub fn new(ctx: Arc<Ctx>, config: WatchdogConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(ctx, config))
    }

    pub fn with_defaults(ctx: Arc<Ctx>) -> Self {
        Self::build(ctx, WatchdogConfig::default())
    }

    fn build(ctx: Arc<Ctx>, config: WatchdogConfig) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            ctx,
            config,
            components: Mutex::new(BTreeMap::new()),
            total_failures: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            callback: Mutex::new(None),
            stop,
            task: tokio::sync::Mutex::new(None),
        }
    }

    fn table(&self) -> MutexGuard<'_, BTreeMap<String, ComponentHealth>> {
        self.components.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    /// Called with the table lock held.
    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Add a component to the table in the Unknown state.
    pub fn register(&self, name: &str, timeout: Duration, critical: bool) -> Result<(), WatchdogError> {
        let now = self.ctx.now();
        let mut table = self.table();
        if table.contains_key(name) {
            return Err(WatchdogError::AlreadyRegistered(name.to_string()));
        }
        table.insert(name.to_string(), ComponentHealth::new(name.to_string(), timeout, critical, now));
        self.bump_generation();
        info!(component = name, ?timeout, critical, "component registered");
        Ok(())
    }

    /// Record a liveness signal. A `Failed` heartbeat counts as an error.
    pub fn heartbeat(
        &self,
        name: &str,
        status: ComponentStatus,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), WatchdogError> {
        let now = self.ctx.now();
        let mut table = self.table();
        let component = table
            .get_mut(name)
            .ok_or_else(|| WatchdogError::UnknownComponent(name.to_string()))?;

        if component.status != status {
            debug!(component = name, from = ?component.status, to = ?status, "status change");
        }
        component.last_heartbeat = now;
        component.status = status;
        if status == ComponentStatus::Failed {
            component.error_count += 1;
        }
        if metadata.is_some() {
            component.metadata = metadata;
        }
        component.recompute_score();
        self.bump_generation();
        Ok(())
    }

    pub fn set_failure_callback<F>(&self, callback: F)
    where
        F: Fn(SystemDiagnostics) + Send + Sync + 'static,
    {
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Run one scan over the table.
    ///
    /// Silent components are marked Timeout once. If any critical component is
    /// in Timeout the failure callback receives a snapshot, after the table
    /// lock has been released. The callback is fire-and-forget: inside a
    /// runtime it runs on a blocking task, outside one it runs inline.
    pub fn check_components(&self) -> ScanReport {
        let now = self.ctx.now();
        let (mut report, snapshot) = {
            let mut table = self.table();
            let mut timed_out = Vec::new();

            for component in table.values_mut() {
                if component.status == ComponentStatus::Timeout {
                    continue;
                }
                if now.saturating_sub(component.last_heartbeat) >= component.timeout {
                    component.status = ComponentStatus::Timeout;
                    component.error_count += 1;
                    component.recompute_score();
                    self.total_failures.fetch_add(1, Ordering::SeqCst);
                    warn!(
                        component = %component.name,
                        critical = component.critical,
                        errors = component.error_count,
                        "component timed out"
                    );
                    timed_out.push(component.name.clone());
                }
            }

            if !timed_out.is_empty() {
                self.bump_generation();
            }

            let critical_timeouts: Vec<String> = table
                .values()
                .filter(|c| c.critical && c.status == ComponentStatus::Timeout)
                .map(|c| c.name.clone())
                .collect();
            let system_health = weighted_health(&table);
            let snapshot = (!critical_timeouts.is_empty()).then(|| self.snapshot_locked(&table, now));

            (
                ScanReport {
                    timed_out,
                    critical_timeouts,
                    system_health,
                    callback_invoked: false,
                },
                snapshot,
            )
        };

        if let Some(diagnostics) = snapshot {
            report.callback_invoked = self.fire_callback(diagnostics);
        }
        report
    }

    fn fire_callback(&self, diagnostics: SystemDiagnostics) -> bool {
        let callback = self.callback.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let Some(callback) = callback else {
            warn!("critical component timed out but no failure callback is registered");
            return false;
        };

        error!(health = diagnostics.system_health, "critical component failure");
        let deliver = move || {
            if catch_unwind(AssertUnwindSafe(|| callback(diagnostics))).is_err() {
                error!("failure callback panicked");
            }
        };

        if tokio::runtime::Handle::try_current().is_ok() {
            self.ctx.spawn("watchdog-callback", async move {
                if let Err(e) = tokio::task::spawn_blocking(deliver).await {
                    error!(error = %e, "failure callback task failed");
                }
            });
        } else {
            debug!("no runtime, delivering failure callback on the scanning thread");
            deliver();
        }
        true
    }

    fn snapshot_locked(&self, table: &BTreeMap<String, ComponentHealth>, now: Duration) -> SystemDiagnostics {
        SystemDiagnostics {
            timestamp: now,
            generation: self.generation.load(Ordering::SeqCst),
            system_health: weighted_health(table),
            total_failures: self.total_failures.load(Ordering::SeqCst),
            components: table.values().cloned().collect(),
        }
    }

    /// Weighted average of component scores, critical components counting
    /// double. An empty table is fully healthy.
    pub fn get_system_health(&self) -> f64 {
        weighted_health(&self.table())
    }

    /// Health and component table read under one lock acquisition.
    pub fn diagnostics(&self) -> SystemDiagnostics {
        let now = self.ctx.now();
        let table = self.table();
        self.snapshot_locked(&table, now)
    }

    pub fn component(&self, name: &str) -> Option<ComponentHealth> {
        self.table().get(name).cloned()
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::SeqCst)
    }

    /// Spawn the periodic scan. Returns false if it is already running or the
    /// watchdog has been shut down.
    pub async fn start(self: &Arc<Self>) -> bool {
        let mut slot = self.task.lock().await;
        if slot.is_some() || *self.stop.borrow() {
            return false;
        }

        let this = Arc::clone(self);
        let mut stop = self.stop.subscribe();
        let interval = self.config.scan_interval();
        let handle = self.ctx.spawn("watchdog-scan", async move {
            info!(?interval, "watchdog scan started");
            loop {
                tokio::select! {
                    _ = this.ctx.sleep(interval) => {
                        if *stop.borrow() {
                            break;
                        }
                        this.check_components();
                    }
                    _ = stop.changed() => break,
                }
            }
            info!("watchdog scan stopped");
        });
        *slot = Some(handle);
        true
    }

    /// Stop the scan and wait for it to finish. Concurrent and repeated
    /// calls are fine; every caller returns once the task has exited.
    pub async fn shutdown(&self) {
        self.stop.send_replace(true);
        let mut slot = self.task.lock().await;
        if let Some(handle) = slot.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "watchdog scan task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use drivesafe_env::ManualContext;
    use std::sync::atomic::AtomicUsize;

    fn watchdog() -> (Arc<ManualContext>, ComponentWatchdog<ManualContext>) {
        let ctx = ManualContext::shared(7);
        let wd = ComponentWatchdog::with_defaults(Arc::clone(&ctx));
        (ctx, wd)
    }

    #[test]
    fn test_register_starts_unknown() {
        let (_, wd) = watchdog();
        wd.register("camera", Duration::from_millis(500), true).unwrap();

        let c = wd.component("camera").unwrap();
        assert_eq!(c.status, ComponentStatus::Unknown);
        assert_relative_eq!(c.health_score, 0.5);
        assert_eq!(
            wd.register("camera", Duration::from_millis(500), true),
            Err(WatchdogError::AlreadyRegistered("camera".into()))
        );
    }

    #[test]
    fn test_heartbeat_unknown_component_rejected() {
        let (_, wd) = watchdog();
        assert_eq!(
            wd.heartbeat("ghost", ComponentStatus::Healthy, None),
            Err(WatchdogError::UnknownComponent("ghost".into()))
        );
    }

    #[test]
    fn test_empty_table_is_healthy() {
        let (_, wd) = watchdog();
        assert_relative_eq!(wd.get_system_health(), 1.0);
    }

    #[test]
    fn test_weighted_health_counts_critical_double() {
        let (_, wd) = watchdog();
        wd.register("camera", Duration::from_secs(1), true).unwrap();
        wd.register("radio", Duration::from_secs(1), false).unwrap();
        wd.heartbeat("camera", ComponentStatus::Healthy, None).unwrap();
        wd.heartbeat("radio", ComponentStatus::Degraded, None).unwrap();

        assert_relative_eq!(wd.get_system_health(), (1.0 * 2.0 + 0.6) / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_failed_heartbeat_penalizes_score() {
        let (_, wd) = watchdog();
        wd.register("gps", Duration::from_secs(1), false).unwrap();
        wd.heartbeat("gps", ComponentStatus::Failed, None).unwrap();
        wd.heartbeat("gps", ComponentStatus::Healthy, Some(serde_json::json!({ "fix": "3d" })))
            .unwrap();

        let c = wd.component("gps").unwrap();
        assert_eq!(c.error_count, 1);
        assert_relative_eq!(c.health_score, 0.9, epsilon = 1e-12);
        assert_eq!(c.metadata, Some(serde_json::json!({ "fix": "3d" })));
    }

    #[test]
    fn test_error_penalty_is_capped() {
        let (_, wd) = watchdog();
        wd.register("imu", Duration::from_secs(1), false).unwrap();
        for _ in 0..9 {
            wd.heartbeat("imu", ComponentStatus::Failed, None).unwrap();
        }
        wd.heartbeat("imu", ComponentStatus::Healthy, None).unwrap();
        assert_relative_eq!(wd.component("imu").unwrap().health_score, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_silent_component_times_out_once() {
        let (ctx, wd) = watchdog();
        wd.register("lidar", Duration::from_millis(200), false).unwrap();
        wd.heartbeat("lidar", ComponentStatus::Healthy, None).unwrap();

        ctx.advance_time(Duration::from_millis(199));
        assert!(wd.check_components().timed_out.is_empty());

        ctx.advance_time(Duration::from_millis(1));
        let report = wd.check_components();
        assert_eq!(report.timed_out, vec!["lidar".to_string()]);
        assert!(!report.callback_invoked);

        let c = wd.component("lidar").unwrap();
        assert_eq!(c.status, ComponentStatus::Timeout);
        assert_eq!(c.error_count, 1);
        assert_relative_eq!(c.health_score, 0.0);
        assert_relative_eq!(wd.get_system_health(), 0.0);

        // Already Timeout: no double counting
        ctx.advance_time(Duration::from_secs(1));
        assert!(wd.check_components().timed_out.is_empty());
        assert_eq!(wd.component("lidar").unwrap().error_count, 1);
        assert_eq!(wd.total_failures(), 1);
    }

    #[test]
    fn test_heartbeat_recovers_from_timeout() {
        let (ctx, wd) = watchdog();
        wd.register("lidar", Duration::from_millis(100), false).unwrap();
        ctx.advance_time(Duration::from_millis(150));
        wd.check_components();

        wd.heartbeat("lidar", ComponentStatus::Healthy, None).unwrap();
        let c = wd.component("lidar").unwrap();
        assert_eq!(c.status, ComponentStatus::Healthy);
        assert_relative_eq!(c.health_score, 0.9, epsilon = 1e-12);
    }

    #[test]
    fn test_critical_timeout_fires_callback_with_snapshot() {
        let (ctx, wd) = watchdog();
        let wd = Arc::new(wd);
        wd.register("camera", Duration::from_millis(100), true).unwrap();
        wd.register("radio", Duration::from_secs(10), false).unwrap();

        let seen: Arc<Mutex<Vec<SystemDiagnostics>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let inner = Arc::clone(&wd);
        wd.set_failure_callback(move |diag| {
            // Querying the watchdog from the callback must not deadlock
            let _ = inner.get_system_health();
            sink.lock().unwrap().push(diag);
        });

        ctx.advance_time(Duration::from_millis(100));
        let report = wd.check_components();

        assert_eq!(report.critical_timeouts, vec!["camera".to_string()]);
        assert!(report.callback_invoked);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].components.len(), 2);
        assert_eq!(seen[0].total_failures, 1);
        assert!(seen[0].no_critical_healthy());
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let (ctx, wd) = watchdog();
        wd.register("camera", Duration::from_millis(10), true).unwrap();
        wd.set_failure_callback(|_| panic!("boom"));

        ctx.advance_time(Duration::from_millis(20));
        let report = wd.check_components();
        assert!(report.callback_invoked);
        assert_eq!(wd.component("camera").unwrap().status, ComponentStatus::Timeout);
    }

    #[test]
    fn test_no_critical_healthy_needs_a_critical_component() {
        let (_, wd) = watchdog();
        wd.register("radio", Duration::from_secs(1), false).unwrap();
        assert!(!wd.diagnostics().no_critical_healthy());

        wd.register("camera", Duration::from_secs(1), true).unwrap();
        assert!(wd.diagnostics().no_critical_healthy());
        wd.heartbeat("camera", ComponentStatus::Healthy, None).unwrap();
        assert!(!wd.diagnostics().no_critical_healthy());
    }

    #[test]
    fn test_every_table_change_advances_generation() {
        let (ctx, wd) = watchdog();
        let g0 = wd.diagnostics().generation;

        wd.register("camera", Duration::from_millis(100), true).unwrap();
        let g1 = wd.diagnostics().generation;
        wd.heartbeat("camera", ComponentStatus::Healthy, None).unwrap();
        let g2 = wd.diagnostics().generation;
        assert!(g0 < g1 && g1 < g2);

        // A scan that changes nothing leaves the generation alone
        wd.check_components();
        assert_eq!(wd.diagnostics().generation, g2);

        ctx.advance_time(Duration::from_millis(100));
        wd.check_components();
        assert!(wd.diagnostics().generation > g2);
    }

    #[tokio::test]
    async fn test_slow_callback_does_not_block_scan() {
        let (ctx, wd) = watchdog();
        wd.register("camera", Duration::from_millis(100), true).unwrap();
        wd.register("lidar", Duration::from_millis(100), false).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        wd.set_failure_callback(move |diag| {
            std::thread::sleep(Duration::from_millis(500));
            let _ = tx.send(diag);
        });

        ctx.advance_time(Duration::from_millis(100));
        let started = std::time::Instant::now();
        let report = wd.check_components();
        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(report.callback_invoked);
        assert_eq!(report.timed_out.len(), 2);

        let delivered = rx.recv().await.unwrap();
        assert!(delivered.no_critical_healthy());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let ctx = ManualContext::shared(0);
        assert!(ComponentWatchdog::new(ctx, WatchdogConfig { scan_interval_ms: 0 }).is_err());
    }

    #[tokio::test]
    async fn test_scan_loop_detects_timeout_and_shuts_down() {
        let ctx = ManualContext::shared(1);
        let wd = Arc::new(
            ComponentWatchdog::new(Arc::clone(&ctx), WatchdogConfig { scan_interval_ms: 50 }).unwrap(),
        );
        wd.register("camera", Duration::from_millis(120), true).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        wd.set_failure_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(wd.start().await);
        assert!(!wd.start().await);

        // The manual clock advances on every sleep inside the scan loop
        while fired.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(wd.component("camera").unwrap().status, ComponentStatus::Timeout);

        tokio::join!(wd.shutdown(), wd.shutdown());
        wd.shutdown().await;
        assert!(!wd.start().await);
    }
}
