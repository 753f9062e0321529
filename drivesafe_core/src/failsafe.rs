//! Safe-state machine driven by system health.
//!
//! States are totally ordered by severity:
//! `Normal < Degraded < MinimalRisk < EmergencyStop`.
//!
//! Every applied transition appends an immutable [`FailSafeEvent`] to an
//! append-only log and then dispatches the target state's action list. The
//! log lock is released before any handler runs, and handler failures never
//! undo the transition.
//!
//! Evaluations may race (frame loop against the watchdog callback). Two rules
//! keep the result sound:
//! - a diagnostics snapshot older than the newest one already seen may
//!   escalate but never de-escalate;
//! - action lists run in transition order, one list at a time.

use crate::config::{check_unit, ConfigError};
use crate::watchdog::SystemDiagnostics;
use drivesafe_env::SafetyContext;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafeState {
    Normal,
    Degraded,
    MinimalRisk,
    EmergencyStop,
}

impl fmt::Display for SafeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SafeState::Normal => "NORMAL",
            SafeState::Degraded => "DEGRADED",
            SafeState::MinimalRisk => "MINIMAL_RISK",
            SafeState::EmergencyStop => "EMERGENCY_STOP",
        };
        f.write_str(s)
    }
}

impl SafeState {
    /// Fixed, ordered action list executed on entering this state.
    pub fn actions(self) -> &'static [ActionKind] {
        use ActionKind::*;
        match self {
            SafeState::Normal => &[RestoreNormalOperation],
            SafeState::Degraded => &[ReduceSpeedLimit, WarnDriver],
            SafeState::MinimalRisk => &[ReduceToMinimumSpeed, DisableAssistance, CriticalWarning, HazardLights],
            SafeState::EmergencyStop => &[EmergencyBrake, EmergencyWarning, BlackBoxLog],
        }
    }
}

/// What caused an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    HealthEvaluation,
    CriticalFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    RestoreNormalOperation,
    ReduceSpeedLimit,
    WarnDriver,
    ReduceToMinimumSpeed,
    DisableAssistance,
    CriticalWarning,
    HazardLights,
    EmergencyBrake,
    EmergencyWarning,
    BlackBoxLog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    AdaptiveCruiseControl,
    LaneKeepingAssist,
    AutomaticEmergencyBraking,
    ForwardCollisionWarning,
    LaneDepartureWarning,
    TrafficSignRecognition,
    DriverMonitoring,
}

impl Feature {
    pub const ALL: [Feature; 7] = [
        Feature::AdaptiveCruiseControl,
        Feature::LaneKeepingAssist,
        Feature::AutomaticEmergencyBraking,
        Feature::ForwardCollisionWarning,
        Feature::LaneDepartureWarning,
        Feature::TrafficSignRecognition,
        Feature::DriverMonitoring,
    ];

    /// Feature gating table.
    pub fn allowed_in(self, state: SafeState) -> bool {
        use SafeState::*;
        match self {
            Feature::AdaptiveCruiseControl | Feature::LaneKeepingAssist => state == Normal,
            Feature::AutomaticEmergencyBraking => true,
            Feature::ForwardCollisionWarning | Feature::DriverMonitoring => state != EmergencyStop,
            Feature::LaneDepartureWarning | Feature::TrafficSignRecognition => {
                matches!(state, Normal | Degraded)
            }
        }
    }
}

/// Immutable record of one applied transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailSafeEvent {
    pub id: Uuid,
    pub timestamp: Duration,
    pub trigger: Trigger,
    pub from: SafeState,
    pub to: SafeState,
    pub health: f64,
    pub actions: Vec<ActionKind>,
    pub diagnostics: Option<SystemDiagnostics>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryOutcome {
    Granted,
    Denied { current: SafeState },
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("Actuator unavailable: {0}")]
    Unavailable(String),

    #[error("Action failed: {0}")]
    Failed(String),
}

/// Executes one action kind (brake request, HMI warning, hazard lights...).
///
/// Handlers may query the manager but must not trigger transitions: a
/// transition started from a handler would wait for the handler's own list.
pub trait ActionHandler: Send + Sync {
    fn execute(&self, action: ActionKind, event: &FailSafeEvent) -> Result<(), ActionError>;
}

impl<F> ActionHandler for F
where
    F: Fn(ActionKind, &FailSafeEvent) -> Result<(), ActionError> + Send + Sync,
{
    fn execute(&self, action: ActionKind, event: &FailSafeEvent) -> Result<(), ActionError> {
        self(action, event)
    }
}

/// Health thresholds for the transition function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailSafeConfig {
    /// Health below which the target is EmergencyStop (default: 0.2)
    pub emergency_threshold: f64,
    /// Health below which the target is MinimalRisk (default: 0.4)
    pub minimal_risk_threshold: f64,
    /// Health below which the target is Degraded (default: 0.7)
    pub degraded_threshold: f64,
}

impl Default for FailSafeConfig {
    fn default() -> Self {
        Self {
            emergency_threshold: 0.2,
            minimal_risk_threshold: 0.4,
            degraded_threshold: 0.7,
        }
    }
}

impl FailSafeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_unit("failsafe.emergency_threshold", self.emergency_threshold)?;
        check_unit("failsafe.minimal_risk_threshold", self.minimal_risk_threshold)?;
        check_unit("failsafe.degraded_threshold", self.degraded_threshold)?;
        if !(self.emergency_threshold <= self.minimal_risk_threshold
            && self.minimal_risk_threshold <= self.degraded_threshold)
        {
            return Err(ConfigError::Invalid(
                "failsafe thresholds must satisfy emergency <= minimal_risk <= degraded".into(),
            ));
        }
        Ok(())
    }

    /// Target state for a health score. Non-finite health is treated as 0.
    pub fn target_state(&self, health: f64, diagnostics: Option<&SystemDiagnostics>) -> SafeState {
        let health = if health.is_finite() { health } else { 0.0 };
        let no_critical_healthy = diagnostics.is_some_and(SystemDiagnostics::no_critical_healthy);

        if health < self.emergency_threshold || no_critical_healthy {
            SafeState::EmergencyStop
        } else if health < self.minimal_risk_threshold {
            SafeState::MinimalRisk
        } else if health < self.degraded_threshold {
            SafeState::Degraded
        } else {
            SafeState::Normal
        }
    }
}

struct Machine {
    state: SafeState,
    events: Vec<FailSafeEvent>,
    /// Newest watchdog generation evaluated so far
    newest_generation: Option<u64>,
    /// Dispatch tickets handed out, one per transition
    issued: u64,
}

pub struct FailSafeManager<Ctx: SafetyContext> {
    ctx: Arc<Ctx>,
    config: FailSafeConfig,
    machine: Mutex<Machine>,
    handlers: Mutex<HashMap<ActionKind, Arc<dyn ActionHandler>>>,
    /// Last ticket whose action list finished
    dispatched: Mutex<u64>,
    dispatch_turn: Condvar,
}

impl<Ctx: SafetyContext> FailSafeManager<Ctx> {
    pub fn new(ctx: Arc<Ctx>, config: FailSafeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(ctx, config))
    }

    pub fn with_defaults(ctx: Arc<Ctx>) -> Self {
        Self::build(ctx, FailSafeConfig::default())
    }

    fn build(ctx: Arc<Ctx>, config: FailSafeConfig) -> Self {
        Self {
            ctx,
            config,
            machine: Mutex::new(Machine {
                state: SafeState::Normal,
                events: Vec::new(),
                newest_generation: None,
                issued: 0,
            }),
            handlers: Mutex::new(HashMap::new()),
            dispatched: Mutex::new(0),
            dispatch_turn: Condvar::new(),
        }
    }

    fn machine(&self) -> MutexGuard<'_, Machine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &FailSafeConfig {
        &self.config
    }

    /// Route `action` to `handler`, replacing any previous handler.
    pub fn register_handler(&self, action: ActionKind, handler: impl ActionHandler + 'static) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(action, Arc::new(handler));
    }

    pub fn get_current_state(&self) -> SafeState {
        self.machine().state
    }

    /// Evaluate the transition function. Returns the logged event when the
    /// target state differs from the current one.
    pub fn evaluate(&self, health: f64, diagnostics: Option<SystemDiagnostics>) -> Option<FailSafeEvent> {
        self.evaluate_with(Trigger::HealthEvaluation, health, diagnostics)
    }

    /// Entry point for the watchdog's critical-failure callback.
    pub fn on_critical_failure(&self, diagnostics: SystemDiagnostics) -> Option<FailSafeEvent> {
        let health = diagnostics.system_health;
        self.evaluate_with(Trigger::CriticalFailure, health, Some(diagnostics))
    }

    fn evaluate_with(
        &self,
        trigger: Trigger,
        health: f64,
        diagnostics: Option<SystemDiagnostics>,
    ) -> Option<FailSafeEvent> {
        let target = self.config.target_state(health, diagnostics.as_ref());

        let (ticket, event) = {
            let mut machine = self.machine();

            if let Some(generation) = diagnostics.as_ref().map(|d| d.generation) {
                let stale = machine.newest_generation.is_some_and(|newest| generation < newest);
                if stale && target < machine.state {
                    debug!(
                        state = %machine.state,
                        target = %target,
                        generation,
                        "stale diagnostics cannot de-escalate"
                    );
                    return None;
                }
                machine.newest_generation = machine.newest_generation.max(Some(generation));
            }

            if machine.state == target {
                debug!(state = %target, health, "no transition");
                return None;
            }

            let event = FailSafeEvent {
                id: Uuid::new_v4(),
                timestamp: self.ctx.now(),
                trigger,
                from: machine.state,
                to: target,
                health,
                actions: target.actions().to_vec(),
                diagnostics,
            };
            machine.state = target;
            machine.events.push(event.clone());
            machine.issued += 1;
            (machine.issued, event)
        };

        if event.to > event.from {
            warn!(from = %event.from, to = %event.to, health, ?trigger, "fail-safe escalation");
        } else {
            info!(from = %event.from, to = %event.to, health, ?trigger, "fail-safe de-escalation");
        }

        self.dispatch(ticket, &event);
        Some(event)
    }

    fn dispatch(&self, ticket: u64, event: &FailSafeEvent) {
        {
            let mut done = self.dispatched.lock().unwrap_or_else(PoisonError::into_inner);
            while *done + 1 < ticket {
                done = self.dispatch_turn.wait(done).unwrap_or_else(PoisonError::into_inner);
            }
        }

        self.run_actions(event);

        *self.dispatched.lock().unwrap_or_else(PoisonError::into_inner) = ticket;
        self.dispatch_turn.notify_all();
    }

    fn run_actions(&self, event: &FailSafeEvent) {
        for &action in &event.actions {
            let handler = self
                .handlers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&action)
                .cloned();

            let Some(handler) = handler else {
                info!(?action, state = %event.to, "fail-safe action");
                continue;
            };

            match catch_unwind(AssertUnwindSafe(|| handler.execute(action, event))) {
                Ok(Ok(())) => debug!(?action, "action handler completed"),
                Ok(Err(e)) => error!(?action, error = %e, "action handler failed"),
                Err(_) => error!(?action, "action handler panicked"),
            }
        }
    }

    /// Granted only when already Normal. Leaving a degraded state requires a
    /// fresh favourable evaluation.
    pub fn request_recovery(&self) -> RecoveryOutcome {
        match self.get_current_state() {
            SafeState::Normal => RecoveryOutcome::Granted,
            current => {
                info!(state = %current, "recovery denied until health re-evaluates");
                RecoveryOutcome::Denied { current }
            }
        }
    }

    pub fn get_allowed_features(&self) -> BTreeMap<Feature, bool> {
        let state = self.get_current_state();
        Feature::ALL.iter().map(|&f| (f, f.allowed_in(state))).collect()
    }

    pub fn is_feature_allowed(&self, feature: Feature) -> bool {
        feature.allowed_in(self.get_current_state())
    }

    pub fn events(&self) -> Vec<FailSafeEvent> {
        self.machine().events.clone()
    }

    pub fn event_count(&self) -> usize {
        self.machine().events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watchdog::{ComponentHealth, ComponentStatus};
    use drivesafe_env::ManualContext;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> FailSafeManager<ManualContext> {
        FailSafeManager::with_defaults(ManualContext::shared(3))
    }

    fn diagnostics(critical_status: ComponentStatus, health: f64) -> SystemDiagnostics {
        SystemDiagnostics {
            timestamp: Duration::ZERO,
            generation: 0,
            system_health: health,
            total_failures: 0,
            components: vec![ComponentHealth {
                name: "camera".into(),
                status: critical_status,
                last_heartbeat: Duration::ZERO,
                timeout: Duration::from_millis(100),
                error_count: 0,
                health_score: critical_status.base_score(),
                critical: true,
                metadata: None,
            }],
        }
    }

    #[test]
    fn test_health_sequence_transitions() {
        let fs = manager();
        let mut states = Vec::new();
        for health in [0.9, 0.5, 0.1] {
            fs.evaluate(health, None);
            states.push(fs.get_current_state());
        }
        assert_eq!(states, vec![SafeState::Normal, SafeState::Degraded, SafeState::EmergencyStop]);

        // Starting in Normal, 0.9 is a no-op; the other two each log one event
        let events = fs.events();
        assert_eq!(events.len(), 2);
        assert_eq!((events[0].from, events[0].to), (SafeState::Normal, SafeState::Degraded));
        assert_eq!((events[1].from, events[1].to), (SafeState::Degraded, SafeState::EmergencyStop));
        assert_eq!(events[1].actions, SafeState::EmergencyStop.actions());
    }

    #[test]
    fn test_repeated_evaluation_is_noop() {
        let fs = manager();
        assert!(fs.evaluate(0.3, None).is_some());
        assert!(fs.evaluate(0.3, None).is_none());
        assert!(fs.evaluate(0.35, None).is_none());
        assert_eq!(fs.event_count(), 1);
        assert_eq!(fs.get_current_state(), SafeState::MinimalRisk);
    }

    #[test]
    fn test_threshold_boundaries() {
        let c = FailSafeConfig::default();
        assert_eq!(c.target_state(0.7, None), SafeState::Normal);
        assert_eq!(c.target_state(0.69, None), SafeState::Degraded);
        assert_eq!(c.target_state(0.4, None), SafeState::Degraded);
        assert_eq!(c.target_state(0.39, None), SafeState::MinimalRisk);
        assert_eq!(c.target_state(0.2, None), SafeState::MinimalRisk);
        assert_eq!(c.target_state(0.19, None), SafeState::EmergencyStop);
        assert_eq!(c.target_state(f64::NAN, None), SafeState::EmergencyStop);
    }

    #[test]
    fn test_no_critical_healthy_forces_emergency_stop() {
        let fs = manager();
        let event = fs.evaluate(0.95, Some(diagnostics(ComponentStatus::Degraded, 0.95))).unwrap();
        assert_eq!(event.to, SafeState::EmergencyStop);
        assert!(event.diagnostics.is_some());

        let c = FailSafeConfig::default();
        assert_eq!(
            c.target_state(0.95, Some(&diagnostics(ComponentStatus::Healthy, 0.95))),
            SafeState::Normal
        );
    }

    #[test]
    fn test_critical_failure_trigger() {
        let fs = manager();
        let event = fs.on_critical_failure(diagnostics(ComponentStatus::Timeout, 0.3)).unwrap();
        assert_eq!(event.trigger, Trigger::CriticalFailure);
        assert_eq!(event.to, SafeState::EmergencyStop);
    }

    #[test]
    fn test_actions_dispatched_in_order() {
        let fs = manager();
        let seen: Arc<Mutex<Vec<ActionKind>>> = Arc::default();
        for action in SafeState::MinimalRisk.actions() {
            let sink = Arc::clone(&seen);
            fs.register_handler(*action, move |a: ActionKind, _: &FailSafeEvent| -> Result<(), ActionError> {
                sink.lock().unwrap().push(a);
                Ok(())
            });
        }

        fs.evaluate(0.3, None);
        assert_eq!(*seen.lock().unwrap(), SafeState::MinimalRisk.actions());
    }

    #[test]
    fn test_handler_failures_do_not_block_transition() {
        let fs = manager();
        let later = Arc::new(AtomicUsize::new(0));

        fs.register_handler(ActionKind::EmergencyBrake, |_: ActionKind, _: &FailSafeEvent| -> Result<(), ActionError> {
            Err(ActionError::Unavailable("brake bus offline".into()))
        });
        fs.register_handler(
            ActionKind::EmergencyWarning,
            |_: ActionKind, _: &FailSafeEvent| -> Result<(), ActionError> { panic!("hmi crashed") },
        );
        let counter = Arc::clone(&later);
        fs.register_handler(ActionKind::BlackBoxLog, move |_: ActionKind, _: &FailSafeEvent| -> Result<(), ActionError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(fs.evaluate(0.05, None).is_some());
        assert_eq!(fs.get_current_state(), SafeState::EmergencyStop);
        assert_eq!(later.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_may_query_manager() {
        let fs = Arc::new(manager());
        let inner = Arc::clone(&fs);
        let observed = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&observed);
        fs.register_handler(ActionKind::WarnDriver, move |_: ActionKind, _: &FailSafeEvent| -> Result<(), ActionError> {
            *sink.lock().unwrap() = Some(inner.get_current_state());
            Ok(())
        });

        fs.evaluate(0.5, None);
        assert_eq!(*observed.lock().unwrap(), Some(SafeState::Degraded));
    }

    #[test]
    fn test_feature_gating_table() {
        let fs = manager();
        let normal = fs.get_allowed_features();
        assert!(normal.values().all(|&allowed| allowed));

        fs.evaluate(0.5, None);
        assert!(!fs.is_feature_allowed(Feature::AdaptiveCruiseControl));
        assert!(!fs.is_feature_allowed(Feature::LaneKeepingAssist));
        assert!(fs.is_feature_allowed(Feature::LaneDepartureWarning));

        fs.evaluate(0.3, None);
        assert!(!fs.is_feature_allowed(Feature::TrafficSignRecognition));
        assert!(fs.is_feature_allowed(Feature::ForwardCollisionWarning));

        fs.evaluate(0.0, None);
        let estop = fs.get_allowed_features();
        assert!(estop[&Feature::AutomaticEmergencyBraking]);
        assert_eq!(estop.values().filter(|&&allowed| allowed).count(), 1);
    }

    #[test]
    fn test_recovery_requires_reevaluation() {
        let fs = manager();
        assert_eq!(fs.request_recovery(), RecoveryOutcome::Granted);

        fs.evaluate(0.5, None);
        assert_eq!(
            fs.request_recovery(),
            RecoveryOutcome::Denied { current: SafeState::Degraded }
        );
        assert_eq!(fs.get_current_state(), SafeState::Degraded);

        let event = fs.evaluate(0.9, None).unwrap();
        assert_eq!(event.actions, vec![ActionKind::RestoreNormalOperation]);
        assert_eq!(fs.request_recovery(), RecoveryOutcome::Granted);
    }

    #[test]
    fn test_event_ids_unique() {
        let fs = manager();
        fs.evaluate(0.5, None);
        fs.evaluate(0.9, None);
        let events = fs.events();
        assert_ne!(events[0].id, events[1].id);
    }

    #[test]
    fn test_stale_diagnostics_cannot_de_escalate() {
        let fs = manager();
        let older = diagnostics(ComponentStatus::Healthy, 0.95);
        let mut newer = diagnostics(ComponentStatus::Timeout, 0.3);
        newer.generation = 4;

        assert_eq!(fs.on_critical_failure(newer).unwrap().to, SafeState::EmergencyStop);
        assert!(fs.evaluate(0.95, Some(older.clone())).is_none());
        assert_eq!(fs.get_current_state(), SafeState::EmergencyStop);
        assert_eq!(fs.event_count(), 1);

        let mut current = diagnostics(ComponentStatus::Healthy, 0.95);
        current.generation = 4;
        assert_eq!(fs.evaluate(0.95, Some(current)).unwrap().to, SafeState::Normal);

        // an old snapshot is still allowed to make things safer
        let mut old_failure = older;
        old_failure.system_health = 0.5;
        assert_eq!(fs.evaluate(0.5, Some(old_failure)).unwrap().to, SafeState::Degraded);
    }

    #[test]
    fn test_health_only_evaluation_ignores_generation() {
        let fs = manager();
        let mut newer = diagnostics(ComponentStatus::Healthy, 0.5);
        newer.generation = 9;
        fs.evaluate(0.5, Some(newer));
        assert_eq!(fs.evaluate(0.9, None).unwrap().to, SafeState::Normal);
    }

    #[test]
    fn test_concurrent_transitions_dispatch_in_order() {
        let fs = Arc::new(manager());
        let seen: Arc<Mutex<Vec<ActionKind>>> = Arc::default();
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let started_tx = Mutex::new(started_tx);

        let sink = Arc::clone(&seen);
        fs.register_handler(ActionKind::EmergencyBrake, move |a: ActionKind, _: &FailSafeEvent| -> Result<(), ActionError> {
            let _ = started_tx.lock().unwrap().send(());
            std::thread::sleep(Duration::from_millis(100));
            sink.lock().unwrap().push(a);
            Ok(())
        });
        let sink = Arc::clone(&seen);
        fs.register_handler(
            ActionKind::RestoreNormalOperation,
            move |a: ActionKind, _: &FailSafeEvent| -> Result<(), ActionError> {
                sink.lock().unwrap().push(a);
                Ok(())
            },
        );

        let stopping = Arc::clone(&fs);
        let worker = std::thread::spawn(move || stopping.evaluate(0.05, None));
        started_rx.recv().unwrap();

        // the stop list is still running; recovery must wait for it
        assert_eq!(fs.evaluate(0.9, None).unwrap().to, SafeState::Normal);
        assert_eq!(worker.join().unwrap().unwrap().to, SafeState::EmergencyStop);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![ActionKind::EmergencyBrake, ActionKind::RestoreNormalOperation]
        );
        assert_eq!(fs.get_current_state(), SafeState::Normal);
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let config = FailSafeConfig {
            emergency_threshold: 0.5,
            minimal_risk_threshold: 0.4,
            ..Default::default()
        };
        assert!(FailSafeManager::new(ManualContext::shared(0), config).is_err());
    }
}
