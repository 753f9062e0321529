//! Scenario runner - drives the safety pipeline through scripted drives.

use crate::oracle::Oracle;
use crate::scenarios::ScenarioId;

use drivesafe_core::failsafe::{ActionError, ActionKind, FailSafeEvent, Trigger};
use drivesafe_core::perception::Frame;
use drivesafe_core::risk::RiskFactor;
use drivesafe_core::{
    CollisionLevel, ComponentStatus, Feature, FrameInputs, FrameReport, PerceptionModule, PerceptionOutput,
    ReplayModule, RiskLevel, SafeState, SafetyConfig, SafetyPipeline, TrackId,
};
use drivesafe_env::{ManualContext, SafetyContext, TokioContext};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Ego speed for every scenario (m/s).
const EGO_SPEED: f64 = 20.0;

/// Monitored components: (name, timeout, critical).
const COMPONENTS: [(&str, Duration, bool); 5] = [
    ("camera", Duration::from_millis(300), true),
    ("lidar", Duration::from_millis(300), false),
    ("gps", Duration::from_millis(1500), false),
    ("imu", Duration::from_millis(300), false),
    ("dms", Duration::from_millis(500), false),
];

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    pub frames: u64,
    pub max_collision: Option<CollisionLevel>,
    pub first_critical_secs: Option<f64>,
    pub collision_changes: u32,
    pub lane_departure_frames: u64,
    pub lane_flips: u32,
    pub drowsy_frames: u64,
    pub max_risk: Option<RiskLevel>,
    pub max_safe_state: Option<SafeState>,
    pub final_safe_state: Option<SafeState>,
    pub failsafe_events: usize,
    pub critical_failure_events: usize,
    pub watchdog_failures: u64,
    pub emergency_brake_secs: Option<f64>,
    pub distinct_tracks: usize,
    pub alerts_raised: usize,
    pub final_alerts: Vec<String>,
    pub final_features: BTreeMap<Feature, bool>,
    pub final_position_error_m: f64,
    pub confidence_before_outage: Option<f64>,
    pub min_confidence_in_outage: Option<f64>,
    pub skipped_updates: u64,
}

/// How the watchdog scan is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanMode {
    /// One scan per frame, on the frame loop (deterministic)
    Inline,
    /// The watchdog's own background task
    Background,
}

/// Runs driving scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Tick rate in Hz
    tick_rate_hz: u32,

    /// Duration in seconds (raised to the scenario's minimum)
    max_duration_secs: f64,

    config: SafetyConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            tick_rate_hz: 30,
            max_duration_secs: 5.0,
            config: SafetyConfig::default(),
        }
    }

    /// Sets the tick rate.
    pub fn with_tick_rate(mut self, hz: u32) -> Self {
        self.tick_rate_hz = hz.max(1);
        self
    }

    /// Sets the duration.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.max_duration_secs = secs;
        self
    }

    /// Uses a non-default safety configuration.
    pub fn with_config(mut self, config: SafetyConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs a scenario on a virtual clock. Same seed, same result.
    pub async fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        let ctx = ManualContext::shared(self.seed);
        self.drive(ctx, scenario, ScanMode::Inline).await
    }

    /// Runs a scenario in wall-clock time with the watchdog on its own task.
    pub async fn run_live(&self, scenario: ScenarioId) -> ScenarioResult {
        self.drive(TokioContext::shared(), scenario, ScanMode::Background).await
    }

    fn failed(&self, scenario: ScenarioId, reason: String) -> ScenarioResult {
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: false,
            total_ticks: 0,
            final_time_secs: 0.0,
            failure_reason: Some(reason),
            metrics: ScenarioMetrics::default(),
        }
    }

    async fn drive<Ctx: SafetyContext>(&self, ctx: Arc<Ctx>, scenario: ScenarioId, mode: ScanMode) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);
        debug!("  {}", scenario.description());

        let mut pipeline = match SafetyPipeline::new(Arc::clone(&ctx), self.config.clone()) {
            Ok(pipeline) => pipeline,
            Err(e) => return self.failed(scenario, format!("invalid configuration: {e}")),
        };
        pipeline.wire_watchdog();
        for (name, timeout, critical) in COMPONENTS {
            if let Err(e) = pipeline.watchdog().register(name, timeout, critical) {
                return self.failed(scenario, e.to_string());
            }
        }

        let brake_at: Arc<Mutex<Option<f64>>> = Arc::default();
        let sink = Arc::clone(&brake_at);
        pipeline.failsafe().register_handler(
            ActionKind::EmergencyBrake,
            move |_: ActionKind, event: &FailSafeEvent| -> Result<(), ActionError> {
                let mut slot = sink.lock().map_err(|e| ActionError::Failed(e.to_string()))?;
                slot.get_or_insert(event.timestamp.as_secs_f64());
                Ok(())
            },
        );

        let physics_seed = self.seed.wrapping_mul(0x9e3779b97f4a7c15);
        let mut oracle = Oracle::new(physics_seed, EGO_SPEED);
        let lead = match scenario {
            ScenarioId::Cruise => Some(oracle.spawn_object("car", 40.0, 0.0, 0.0)),
            ScenarioId::SuddenBrake => Some(oracle.spawn_object("car", 30.0, 0.0, 0.0)),
            ScenarioId::DetectorFlicker => {
                oracle.set_detection_dropout(0.35);
                Some(oracle.spawn_object("car", 18.0, 0.0, 0.0))
            }
            _ => None,
        };

        // Synthetic front-ends, fed by the oracle one frame ahead of replay
        let mut detector = ReplayModule::new("detector");
        let mut lane_model = ReplayModule::new("lane");
        let mut dms = ReplayModule::new("dms");
        for module in [&mut detector, &mut lane_model, &mut dms] {
            if let Err(e) = module.initialize() {
                return self.failed(scenario, e.to_string());
            }
        }

        if mode == ScanMode::Background {
            pipeline.watchdog().start().await;
        }

        let dt = 1.0 / self.tick_rate_hz as f64;
        let duration = self.max_duration_secs.max(scenario.min_duration_secs());
        let target_ticks = (duration * self.tick_rate_hz as f64).round() as u64;

        let mut metrics = ScenarioMetrics::default();
        let mut tracks_seen: BTreeSet<TrackId> = BTreeSet::new();
        let mut previous_alerts: BTreeSet<String> = BTreeSet::new();
        let mut previous: Option<FrameReport> = None;

        for tick in 0..target_ticks {
            ctx.sleep(Duration::from_secs_f64(dt)).await;
            let t = (tick + 1) as f64 * dt;

            // Scripted events
            match scenario {
                ScenarioId::SuddenBrake if t >= 2.0 => {
                    if let Some(id) = lead {
                        oracle.set_closing_speed(id, 15.0);
                    }
                }
                ScenarioId::LaneDrift if t >= 1.0 => oracle.set_lateral_drift(0.25),
                ScenarioId::DrowsyDriver if t >= 1.0 => oracle.set_driver_drowsy(true),
                _ => {}
            }
            oracle.step(dt);

            let camera_silent = scenario == ScenarioId::SensorDropout && t >= 2.0;
            let blackout = scenario == ScenarioId::PositionBlackout && (2.0..3.0).contains(&t);

            // Heartbeats
            let watchdog = pipeline.watchdog();
            for (name, _, _) in COMPONENTS {
                if name == "camera" && camera_silent {
                    continue;
                }
                let status = if blackout && matches!(name, "camera" | "lidar" | "gps") {
                    ComponentStatus::Degraded
                } else {
                    ComponentStatus::Healthy
                };
                if let Err(e) = watchdog.heartbeat(name, status, None) {
                    warn!(error = %e, "heartbeat rejected");
                }
            }
            if mode == ScanMode::Inline {
                watchdog.check_components();
            }

            // Sensors and perception
            let mut inputs = FrameInputs::new(dt);
            if !blackout {
                if !camera_silent {
                    inputs.camera = Some(oracle.camera_position());
                }
                inputs.lidar = Some(oracle.lidar_position());
                if tick % 3 == 0 {
                    inputs.gps = Some(oracle.gps_position());
                }
            }
            inputs.imu = Some(oracle.imu_reading());
            if !camera_silent {
                detector.record(tick, PerceptionOutput::Detections(oracle.detections()));
                lane_model.record(tick, PerceptionOutput::LaneObservation(oracle.lane_observation()));
            }
            dms.record(tick, PerceptionOutput::DriverState(oracle.driver_state()));

            let frame = Frame::new(tick, ctx.now());
            for module in [&mut detector, &mut lane_model, &mut dms] {
                match module.process(&frame) {
                    Ok(output) => inputs.absorb(output),
                    Err(e) => warn!(module = module.name(), error = %e, "perception front-end failed"),
                }
            }

            let report = pipeline.process_frame(inputs);

            // Metrics
            metrics.frames += 1;
            metrics.max_collision = metrics.max_collision.max(Some(report.collision));
            if report.collision == CollisionLevel::Critical && metrics.first_critical_secs.is_none() {
                metrics.first_critical_secs = Some(t);
            }
            metrics.max_risk = metrics.max_risk.max(Some(report.risk.overall_risk));
            metrics.max_safe_state = metrics.max_safe_state.max(Some(report.safe_state));
            if report.lane.departure {
                metrics.lane_departure_frames += 1;
            }
            if report.risk.factors.contains(&RiskFactor::DriverDrowsy) {
                metrics.drowsy_frames += 1;
            }
            if let Some(prev) = &previous {
                if prev.collision != report.collision {
                    metrics.collision_changes += 1;
                }
                if prev.lane.departure != report.lane.departure {
                    metrics.lane_flips += 1;
                }
            }
            metrics.skipped_updates += report.sensor_updates.iter().filter(|(_, o)| !o.is_applied()).count() as u64;
            tracks_seen.extend(report.tracks.iter().map(|t| t.track_id));

            let alerts: BTreeSet<String> = report
                .alerts
                .iter()
                .map(|a| format!("{}:{:?}", a.key.class, a.key.level))
                .collect();
            metrics.alerts_raised += alerts.difference(&previous_alerts).count();
            previous_alerts = alerts;

            let confidence = report.kinematics.confidence;
            if scenario == ScenarioId::PositionBlackout {
                if t < 2.0 {
                    metrics.confidence_before_outage = Some(confidence);
                } else if blackout {
                    let min = metrics.min_confidence_in_outage.get_or_insert(confidence);
                    *min = min.min(confidence);
                }
            }

            if tick % 30 == 0 {
                debug!(
                    "  t={:.1}s | tracks={} | collision={} | risk={} | state={}",
                    t,
                    report.tracks.len(),
                    report.collision,
                    report.risk.overall_risk,
                    report.safe_state
                );
            }
            previous = Some(report);
        }

        if mode == ScanMode::Background {
            pipeline.watchdog().shutdown().await;
        }
        for module in [&mut detector, &mut lane_model, &mut dms] {
            let stats = module.diagnostics();
            debug!(module = %stats.name, frames = stats.frames_processed, empty = stats.empty_frames, "front-end done");
            module.shutdown();
        }

        let events = pipeline.failsafe().events();
        metrics.failsafe_events = events.len();
        metrics.critical_failure_events = events.iter().filter(|e| e.trigger == Trigger::CriticalFailure).count();
        metrics.watchdog_failures = pipeline.watchdog().total_failures();
        metrics.emergency_brake_secs = brake_at.lock().ok().and_then(|slot| *slot);
        metrics.distinct_tracks = tracks_seen.len();
        metrics.final_alerts = previous_alerts.into_iter().collect();
        if let Some(last) = &previous {
            metrics.final_safe_state = Some(last.safe_state);
            metrics.final_features = last.allowed_features.clone();
            metrics.final_position_error_m = (last.kinematics.position() - oracle.ego().position).norm();
        }

        let verdict = judge(scenario, &metrics);
        let passed = verdict.is_ok();
        info!(
            "{} {} complete: {} frames, state={:?}, position error {:.2}m",
            if passed { "✓" } else { "✗" },
            scenario.name(),
            metrics.frames,
            metrics.final_safe_state,
            metrics.final_position_error_m
        );

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed,
            total_ticks: target_ticks,
            final_time_secs: oracle.time(),
            failure_reason: verdict.err(),
            metrics,
        }
    }
}

/// Position error accepted at the end of a drive (meters).
const MAX_POSITION_ERROR_M: f64 = 2.0;

fn judge(scenario: ScenarioId, m: &ScenarioMetrics) -> Result<(), String> {
    let check = |ok: bool, reason: String| if ok { Ok(()) } else { Err(reason) };
    let position_ok = || {
        check(
            m.final_position_error_m < MAX_POSITION_ERROR_M,
            format!("fused position error {:.2}m exceeds {MAX_POSITION_ERROR_M}m", m.final_position_error_m),
        )
    };

    match scenario {
        ScenarioId::Cruise => {
            check(m.max_safe_state == Some(SafeState::Normal), format!("left Normal: {:?}", m.max_safe_state))?;
            check(m.alerts_raised == 0, format!("{} spurious alerts", m.alerts_raised))?;
            position_ok()
        }
        ScenarioId::SuddenBrake => {
            let at = m
                .first_critical_secs
                .ok_or_else(|| format!("collision never reached CRITICAL (max {:?})", m.max_collision))?;
            // True TTC falls below 1s at t = 2s + (30m - 15m) / 15 m/s
            check(at < 3.0, format!("CRITICAL only at {at:.2}s, after TTC < 1s"))?;
            check(m.max_risk >= Some(RiskLevel::Caution), format!("risk peaked at {:?}", m.max_risk))
        }
        ScenarioId::LaneDrift => {
            check(m.lane_departure_frames > 0, "lane departure never confirmed".into())?;
            check(m.lane_flips <= 2, format!("lane departure flickered {} times", m.lane_flips))
        }
        ScenarioId::DrowsyDriver => {
            check(m.drowsy_frames > 0, "drowsiness never reached risk".into())?;
            check(
                m.final_alerts.iter().any(|a| a.starts_with("driver:")),
                format!("no driver alert at end: {:?}", m.final_alerts),
            )?;
            check(m.max_safe_state == Some(SafeState::Normal), format!("left Normal: {:?}", m.max_safe_state))
        }
        ScenarioId::SensorDropout => {
            // the frame loop and the callback race for the stop, either may log it
            check(m.watchdog_failures > 0, "watchdog never timed out the camera".into())?;
            check(
                m.final_safe_state == Some(SafeState::EmergencyStop),
                format!("final state {:?}", m.final_safe_state),
            )?;
            let brake = m.emergency_brake_secs.ok_or("emergency brake never requested")?;
            check(brake <= 2.5, format!("emergency brake requested late at {brake:.2}s"))?;
            check(
                m.final_features.get(&Feature::AutomaticEmergencyBraking) == Some(&true)
                    && m.final_features.get(&Feature::AdaptiveCruiseControl) == Some(&false),
                format!("unexpected feature gating {:?}", m.final_features),
            )
        }
        ScenarioId::DetectorFlicker => {
            check(m.distinct_tracks <= 2, format!("lead car fragmented into {} tracks", m.distinct_tracks))?;
            check(m.alerts_raised == 0, format!("{} spurious alerts", m.alerts_raised))?;
            check(m.max_collision == Some(CollisionLevel::Safe), format!("collision {:?}", m.max_collision))
        }
        ScenarioId::PositionBlackout => {
            let (before, during) = m
                .confidence_before_outage
                .zip(m.min_confidence_in_outage)
                .ok_or("outage window not observed")?;
            check(during < before, format!("confidence did not drop ({before:.3} -> {during:.3})"))?;
            check(
                m.final_safe_state == Some(SafeState::Normal),
                format!("did not recover, final state {:?}", m.final_safe_state),
            )?;
            position_ok()
        }
    }
}
