//! Safety Runtime - Orchestrates the engines for one vehicle.
//!
//! This module is the integration layer between the per-frame engines
//! (fusion, tracking, stabilization, risk) and the shared monitoring engines
//! (watchdog, fail-safe) that live on their own schedule.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        SafetyPipeline                         │
//! │                                                               │
//! │  FrameInputs ──► FUSION ──► TRACKING ──► STABILITY ──► RISK   │
//! │                  (EKF)      (IoU)        (vote/EMA)    (sum)  │
//! │                                                   │           │
//! │  ┌────────────────────┐  health+diagnostics  ┌────▼────────┐  │
//! │  │ Arc<Watchdog>      │ ───────────────────► │ Arc<Fail-   │  │
//! │  │  (own scan task)   │ ── critical cb ────► │  Safe>      │  │
//! │  └────────────────────┘                      └─────────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use drivesafe_core::{SafetyConfig, SafetyPipeline};
//! use drivesafe_env::TokioContext;
//!
//! let ctx = TokioContext::shared();
//! let mut pipeline = SafetyPipeline::new(ctx, SafetyConfig::default())?;
//! pipeline.wire_watchdog();
//! pipeline.watchdog().start().await;
//!
//! let report = pipeline.process_frame(inputs);
//! ```

use crate::alert_stabilizer::{ActiveAlert, AlertLevel, AlertPayload, AlertStabilizer, CollisionLevel, LaneSide};
use crate::config::{ConfigError, SafetyConfig};
use crate::failsafe::{FailSafeEvent, FailSafeManager, Feature, SafeState};
use crate::object_tracker::{Detection, ObjectTracker, Track, TrackId};
use crate::perception::{DriverState, LaneObservation, PerceptionOutput};
use crate::risk::{RiskAssessment, RiskAssessor, RiskInputs, RiskLevel};
use crate::state_estimator::{KinematicState, SensorKind, StateEstimator, UpdateOutcome};
use crate::watchdog::ComponentWatchdog;
use drivesafe_env::SafetyContext;
use nalgebra::{Vector3, Vector6};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Detector classes treated as critical traffic signs.
pub const CRITICAL_SIGN_CLASSES: [&str; 3] = ["stop_sign", "yield_sign", "red_light"];

/// Everything observed during one frame. Absent sensors are `None`.
#[derive(Debug, Clone, Default)]
pub struct FrameInputs {
    /// Seconds since the previous frame
    pub dt: f64,
    pub camera: Option<Vector3<f64>>,
    pub lidar: Option<Vector3<f64>>,
    pub gps: Option<Vector3<f64>>,
    pub imu: Option<Vector6<f64>>,
    pub detections: Vec<Detection>,
    pub lane: Option<LaneObservation>,
    pub driver: Option<DriverState>,
}

impl FrameInputs {
    pub fn new(dt: f64) -> Self {
        Self {
            dt,
            ..Default::default()
        }
    }

    /// Fold a perception front-end's output into this frame.
    pub fn absorb(&mut self, output: PerceptionOutput) {
        match output {
            PerceptionOutput::Detections(detections) => self.detections.extend(detections),
            PerceptionOutput::LaneObservation(lane) => self.lane = Some(lane),
            PerceptionOutput::DriverState(driver) => self.driver = Some(driver),
            PerceptionOutput::Empty => {}
        }
    }
}

/// Smoothed lane polynomials for this frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LaneReport {
    pub departure: bool,
    pub message: String,
    pub left: Option<Vec<f64>>,
    pub right: Option<Vec<f64>>,
}

/// Everything the pipeline decided during one frame.
#[derive(Debug, Clone, Serialize)]
pub struct FrameReport {
    pub frame: u64,
    pub timestamp: Duration,
    pub kinematics: KinematicState,
    pub sensor_updates: Vec<(SensorKind, UpdateOutcome)>,
    pub tracks: Vec<Track>,
    pub smoothed_distances: BTreeMap<TrackId, f64>,
    pub lane: LaneReport,
    pub collision: CollisionLevel,
    pub collision_message: String,
    pub alerts: Vec<ActiveAlert>,
    pub risk: RiskAssessment,
    pub health: f64,
    pub safe_state: SafeState,
    pub transition: Option<FailSafeEvent>,
    pub allowed_features: BTreeMap<Feature, bool>,
}

/// Per-vehicle frame pipeline.
///
/// Generic over the context so the same code runs against wall-clock time
/// (`TokioContext`) or a deterministic virtual clock (`ManualContext`).
pub struct SafetyPipeline<Ctx: SafetyContext> {
    ctx: Arc<Ctx>,
    estimator: StateEstimator,
    tracker: ObjectTracker,
    stabilizer: AlertStabilizer,
    risk: RiskAssessor,
    watchdog: Arc<ComponentWatchdog<Ctx>>,
    failsafe: Arc<FailSafeManager<Ctx>>,
    frame: u64,
}

impl<Ctx: SafetyContext> SafetyPipeline<Ctx> {
    /// Build every engine from one validated config.
    pub fn new(ctx: Arc<Ctx>, config: SafetyConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let watchdog = Arc::new(ComponentWatchdog::new(Arc::clone(&ctx), config.watchdog)?);
        let failsafe = Arc::new(FailSafeManager::new(Arc::clone(&ctx), config.failsafe)?);

        Ok(Self {
            estimator: StateEstimator::new(config.estimator)?,
            tracker: ObjectTracker::new(config.tracker)?,
            stabilizer: AlertStabilizer::new(config.stabilizer)?,
            risk: RiskAssessor::new(config.risk)?,
            ctx,
            watchdog,
            failsafe,
            frame: 0,
        })
    }

    /// Route the watchdog's critical-failure callback into the fail-safe
    /// manager.
    pub fn wire_watchdog(&self) {
        let failsafe = Arc::clone(&self.failsafe);
        self.watchdog.set_failure_callback(move |diagnostics| {
            failsafe.on_critical_failure(diagnostics);
        });
    }

    pub fn watchdog(&self) -> &Arc<ComponentWatchdog<Ctx>> {
        &self.watchdog
    }

    pub fn failsafe(&self) -> &Arc<FailSafeManager<Ctx>> {
        &self.failsafe
    }

    pub fn estimator(&self) -> &StateEstimator {
        &self.estimator
    }

    pub fn tracker(&self) -> &ObjectTracker {
        &self.tracker
    }

    pub fn stabilizer(&self) -> &AlertStabilizer {
        &self.stabilizer
    }

    pub fn frame_count(&self) -> u64 {
        self.frame
    }

    /// Run one frame through every engine.
    pub fn process_frame(&mut self, inputs: FrameInputs) -> FrameReport {
        self.frame += 1;
        let now = self.ctx.now();

        // FUSION
        self.estimator.predict(inputs.dt);
        let sensor_updates = self.apply_sensors(&inputs);

        // TRACKING
        let tracks = self.tracker.update(&inputs.detections);
        self.stabilizer.retain_tracks(&self.tracker.active_ids());

        // STABILITY: distances, collision, lane
        let smoothed_distances: BTreeMap<TrackId, f64> = tracks
            .iter()
            .filter_map(|t| t.distance.map(|d| (t.track_id, self.stabilizer.smooth_distance(t.track_id, d))))
            .collect();

        let (collision, collision_message) = self.stabilize_collision(&tracks, &smoothed_distances, now);
        let lane = self.stabilize_lane(inputs.lane.as_ref(), now);

        let driver_drowsy = inputs.driver.is_some_and(|d| d.drowsy);
        if driver_drowsy {
            self.stabilizer.alerts_mut().raise(
                "driver",
                AlertLevel::Warning,
                AlertPayload::message("Driver drowsiness detected"),
                now,
            );
        }

        let critical_sign = tracks
            .iter()
            .find(|t| CRITICAL_SIGN_CLASSES.contains(&t.class.as_str()))
            .cloned();
        if let Some(sign) = &critical_sign {
            self.stabilizer.alerts_mut().raise(
                sign.class.clone(),
                AlertLevel::Info,
                AlertPayload {
                    message: format!("{} ahead", sign.class.replace('_', " ")),
                    track_id: Some(sign.track_id),
                    distance: smoothed_distances.get(&sign.track_id).copied(),
                },
                now,
            );
        }

        self.stabilizer.alerts_mut().prune(now);
        let alerts: Vec<ActiveAlert> = self.stabilizer.alerts().active().cloned().collect();

        // RISK
        let risk = self.risk.assess(&RiskInputs {
            collision_risk: RiskLevel::from(collision),
            lane_departure: lane.departure,
            driver_drowsy,
            critical_sign: critical_sign.is_some(),
        });

        // FAIL-SAFE: health and table from one snapshot
        let diagnostics = self.watchdog.diagnostics();
        let health = diagnostics.system_health;
        let transition = self.failsafe.evaluate(health, Some(diagnostics));
        let safe_state = self.failsafe.get_current_state();

        if risk.overall_risk == RiskLevel::Danger {
            warn!(frame = self.frame, score = risk.risk_score, factors = ?risk.factors, "danger");
        }
        debug!(
            frame = self.frame,
            tracks = tracks.len(),
            collision = %collision,
            risk = %risk.overall_risk,
            state = %safe_state,
            "frame processed"
        );

        FrameReport {
            frame: self.frame,
            timestamp: now,
            kinematics: self.estimator.get_state(),
            sensor_updates,
            tracks,
            smoothed_distances,
            lane,
            collision,
            collision_message,
            alerts,
            risk,
            health,
            safe_state,
            transition,
            allowed_features: self.failsafe.get_allowed_features(),
        }
    }

    fn apply_sensors(&mut self, inputs: &FrameInputs) -> Vec<(SensorKind, UpdateOutcome)> {
        let mut outcomes = Vec::new();
        if let Some(p) = &inputs.camera {
            outcomes.push((SensorKind::Camera, self.estimator.update_camera(p)));
        }
        if let Some(p) = &inputs.lidar {
            outcomes.push((SensorKind::Lidar, self.estimator.update_lidar(p)));
        }
        if let Some(p) = &inputs.gps {
            outcomes.push((SensorKind::Gps, self.estimator.update_gps(p)));
        }
        if let Some(o) = &inputs.imu {
            outcomes.push((SensorKind::Imu, self.estimator.update_imu(o)));
        }
        outcomes
    }

    /// Vote on the most urgent track this frame (smallest positive TTC).
    fn stabilize_collision(
        &mut self,
        tracks: &[Track],
        distances: &BTreeMap<TrackId, f64>,
        now: Duration,
    ) -> (CollisionLevel, String) {
        let urgent = tracks
            .iter()
            .filter(|t| t.ttc.is_some_and(|ttc| ttc.is_finite() && ttc > 0.0))
            .min_by(|a, b| a.ttc.partial_cmp(&b.ttc).unwrap_or(std::cmp::Ordering::Equal));

        let Some(track) = urgent else {
            return self.stabilizer.stabilize_collision_warning(None, 0.0, "none");
        };

        let distance = distances
            .get(&track.track_id)
            .copied()
            .or(track.distance)
            .unwrap_or(f64::NAN);
        let (level, message) = self
            .stabilizer
            .stabilize_collision_warning(track.ttc, distance, &track.class);

        if level > CollisionLevel::Safe {
            self.stabilizer.alerts_mut().raise(
                track.class.clone(),
                AlertLevel::from(level),
                AlertPayload {
                    message: message.clone(),
                    track_id: Some(track.track_id),
                    distance: distance.is_finite().then_some(distance),
                },
                now,
            );
        }
        (level, message)
    }

    fn stabilize_lane(&mut self, observation: Option<&LaneObservation>, now: Duration) -> LaneReport {
        let Some(obs) = observation else {
            return LaneReport {
                departure: self.stabilizer.lane_departure_active(),
                message: "No lane observation, holding previous decision".to_string(),
                left: None,
                right: None,
            };
        };

        let left = obs
            .left
            .as_deref()
            .map(|c| self.stabilizer.smooth_lane_coefficients(LaneSide::Left, c));
        let right = obs
            .right
            .as_deref()
            .map(|c| self.stabilizer.smooth_lane_coefficients(LaneSide::Right, c));
        let (departure, message) =
            self.stabilizer
                .stabilize_lane_departure(obs.departure, obs.confidence, obs.lane_position);

        if departure {
            self.stabilizer.alerts_mut().raise(
                "lane",
                AlertLevel::Warning,
                AlertPayload::message(message.clone()),
                now,
            );
        }

        LaneReport {
            departure,
            message,
            left,
            right,
        }
    }

    /// Reset per-frame engines. Shared watchdog and fail-safe state is kept.
    pub fn reset(&mut self) {
        info!(frames = self.frame, "pipeline reset");
        self.tracker.reset();
        self.stabilizer.reset();
        self.frame = 0;
    }
}
