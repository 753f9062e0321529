//! The "FUSION" Engine - Multi-sensor Extended Kalman Filter
//!
//! Fuses position fixes (camera, lidar, GPS) and attitude/rate readings (IMU)
//! into a single 12-dimensional kinematic state:
//!
//! ```text
//! [x, y, z, vx, vy, vz, roll, pitch, yaw, wx, wy, wz]
//! ```
//!
//! The motion model is constant velocity / constant angular velocity, so the
//! filter is linear in practice; the "extended" machinery (per-sensor `H`,
//! innovation covariance, Joseph-form update) is what keeps it well-behaved
//! under heterogeneous, intermittent sensors.

use crate::config::{check_positive, ConfigError};
use nalgebra::{SMatrix, SVector, Vector3, Vector6};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Dimensionality of the kinematic state.
pub const STATE_DIM: usize = 12;

pub type StateVector = SVector<f64, STATE_DIM>;
pub type StateCovariance = SMatrix<f64, STATE_DIM, STATE_DIM>;

const POSITION: usize = 0;
const VELOCITY: usize = 3;
const ORIENTATION: usize = 6;
const ANGULAR_VELOCITY: usize = 9;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Noise tuning for the estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Process noise on the position block (default: 0.01)
    pub position_process_noise: f64,

    /// Process noise on the velocity block (default: 0.1)
    pub velocity_process_noise: f64,

    /// Process noise on the orientation block (default: 0.01)
    pub orientation_process_noise: f64,

    /// Process noise on the angular velocity block (default: 0.1)
    pub angular_velocity_process_noise: f64,

    /// Camera position measurement variance (default: 0.1)
    pub camera_noise: f64,

    /// Lidar position measurement variance (default: 0.01, tightest)
    pub lidar_noise: f64,

    /// GPS position measurement variance (default: 1.0, loosest)
    pub gps_noise: f64,

    /// IMU orientation + angular velocity variance (default: 0.05)
    pub imu_noise: f64,

    /// Diagonal of the initial covariance (default: 1.0)
    pub initial_covariance: f64,

    /// Chi-squared gate on the innovation. `None` disables outlier rejection.
    pub outlier_gate: Option<f64>,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            position_process_noise: 0.01,
            velocity_process_noise: 0.1,
            orientation_process_noise: 0.01,
            angular_velocity_process_noise: 0.1,
            camera_noise: 0.1,
            lidar_noise: 0.01,
            gps_noise: 1.0,
            imu_noise: 0.05,
            initial_covariance: 1.0,
            outlier_gate: None,
        }
    }
}

impl EstimatorConfig {
    /// Every noise term must be strictly positive so `S = HPHᵀ + R` stays
    /// positive definite.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_positive("estimator.position_process_noise", self.position_process_noise)?;
        check_positive("estimator.velocity_process_noise", self.velocity_process_noise)?;
        check_positive("estimator.orientation_process_noise", self.orientation_process_noise)?;
        check_positive(
            "estimator.angular_velocity_process_noise",
            self.angular_velocity_process_noise,
        )?;
        check_positive("estimator.camera_noise", self.camera_noise)?;
        check_positive("estimator.lidar_noise", self.lidar_noise)?;
        check_positive("estimator.gps_noise", self.gps_noise)?;
        check_positive("estimator.imu_noise", self.imu_noise)?;
        check_positive("estimator.initial_covariance", self.initial_covariance)?;
        if let Some(gate) = self.outlier_gate {
            check_positive("estimator.outlier_gate", gate)?;
        }
        Ok(())
    }

    fn measurement_noise(&self, sensor: SensorKind) -> f64 {
        match sensor {
            SensorKind::Camera => self.camera_noise,
            SensorKind::Lidar => self.lidar_noise,
            SensorKind::Gps => self.gps_noise,
            SensorKind::Imu => self.imu_noise,
        }
    }
}

// ============================================================================
// SENSORS & OUTCOMES
// ============================================================================

/// Sensor families the estimator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Camera,
    Lidar,
    Gps,
    Imu,
}

impl SensorKind {
    /// Length of the observation vector this sensor produces.
    pub fn observation_dim(self) -> usize {
        match self {
            SensorKind::Camera | SensorKind::Lidar | SensorKind::Gps => 3,
            SensorKind::Imu => 6,
        }
    }

    /// First state index observed by this sensor.
    fn state_offset(self) -> usize {
        match self {
            SensorKind::Camera | SensorKind::Lidar | SensorKind::Gps => POSITION,
            SensorKind::Imu => ORIENTATION,
        }
    }
}

/// Why an update was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SkipReason {
    DimensionMismatch { expected: usize, got: usize },
    NonFinite,
    SingularInnovation,
    Outlier { distance_squared: f64 },
}

/// Result of a sensor update. Skipping is a normal outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum UpdateOutcome {
    Applied,
    Skipped(SkipReason),
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied)
    }
}

/// Per-sensor update counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorStats {
    pub applied: u64,
    pub skipped: u64,
    pub outliers: u64,
}

/// Estimator counters for telemetry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EstimatorDiagnostics {
    pub predictions: u64,
    pub sensors: BTreeMap<SensorKind, SensorStats>,
}

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Immutable snapshot of the fused state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KinematicState {
    pub state: StateVector,
    pub covariance: StateCovariance,
    /// `1 / (1 + trace(P) / 100)`, clamped to `[0, 1]`
    pub confidence: f64,
}

impl KinematicState {
    #[inline]
    pub fn position(&self) -> Vector3<f64> {
        self.state.fixed_rows::<3>(POSITION).clone_owned()
    }

    #[inline]
    pub fn velocity(&self) -> Vector3<f64> {
        self.state.fixed_rows::<3>(VELOCITY).clone_owned()
    }

    /// `[roll, pitch, yaw]` in radians.
    #[inline]
    pub fn orientation(&self) -> Vector3<f64> {
        self.state.fixed_rows::<3>(ORIENTATION).clone_owned()
    }

    #[inline]
    pub fn angular_velocity(&self) -> Vector3<f64> {
        self.state.fixed_rows::<3>(ANGULAR_VELOCITY).clone_owned()
    }

    /// Ground speed in m/s.
    pub fn speed(&self) -> f64 {
        self.velocity().norm()
    }
}

// ============================================================================
// STATE ESTIMATOR
// ============================================================================

/// Multi-sensor Extended Kalman Filter over the 12-state kinematic model.
#[derive(Debug, Clone)]
pub struct StateEstimator {
    state: StateVector,
    covariance: StateCovariance,
    process_noise: StateCovariance,
    config: EstimatorConfig,
    diagnostics: EstimatorDiagnostics,
}

impl StateEstimator {
    /// Create an estimator at the origin with the configured initial uncertainty.
    pub fn new(config: EstimatorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    /// Create an estimator with default tuning.
    pub fn with_defaults() -> Self {
        Self::build(EstimatorConfig::default())
    }

    fn build(config: EstimatorConfig) -> Self {
        let mut q = StateVector::zeros();
        q.fixed_rows_mut::<3>(POSITION).fill(config.position_process_noise);
        q.fixed_rows_mut::<3>(VELOCITY).fill(config.velocity_process_noise);
        q.fixed_rows_mut::<3>(ORIENTATION).fill(config.orientation_process_noise);
        q.fixed_rows_mut::<3>(ANGULAR_VELOCITY).fill(config.angular_velocity_process_noise);

        Self {
            state: StateVector::zeros(),
            covariance: StateCovariance::identity() * config.initial_covariance,
            process_noise: StateCovariance::from_diagonal(&q),
            config,
            diagnostics: EstimatorDiagnostics::default(),
        }
    }

    /// Overwrite the state (e.g. from a map-matched fix at startup).
    pub fn reset(&mut self, state: StateVector) {
        self.state = state;
        self.covariance = StateCovariance::identity() * self.config.initial_covariance;
    }

    /// Prediction Step: advance the state by `dt` seconds.
    ///
    /// `x' = F·x`, `P' = F·P·Fᵀ + Q`. Non-positive or non-finite `dt` is ignored.
    pub fn predict(&mut self, dt: f64) {
        if !dt.is_finite() || dt <= 0.0 {
            debug!(dt, "ignoring non-positive prediction interval");
            return;
        }

        let f = Self::transition_matrix(dt);
        self.state = f * self.state;
        self.covariance = f * self.covariance * f.transpose() + self.process_noise;
        symmetrize(&mut self.covariance);
        self.diagnostics.predictions += 1;
    }

    pub fn update_camera(&mut self, position: &Vector3<f64>) -> UpdateOutcome {
        self.apply_update(SensorKind::Camera, position)
    }

    pub fn update_lidar(&mut self, position: &Vector3<f64>) -> UpdateOutcome {
        self.apply_update(SensorKind::Lidar, position)
    }

    pub fn update_gps(&mut self, position: &Vector3<f64>) -> UpdateOutcome {
        self.apply_update(SensorKind::Gps, position)
    }

    /// `observation = [roll, pitch, yaw, wx, wy, wz]`
    pub fn update_imu(&mut self, observation: &Vector6<f64>) -> UpdateOutcome {
        self.apply_update(SensorKind::Imu, observation)
    }

    /// Dynamically sized entry point for observations arriving as slices.
    pub fn update(&mut self, sensor: SensorKind, observation: &[f64]) -> UpdateOutcome {
        let expected = sensor.observation_dim();
        if observation.len() != expected {
            return self.skip(
                sensor,
                SkipReason::DimensionMismatch {
                    expected,
                    got: observation.len(),
                },
            );
        }

        match sensor {
            SensorKind::Imu => self.apply_update(sensor, &Vector6::from_column_slice(observation)),
            _ => self.apply_update(sensor, &Vector3::from_column_slice(observation)),
        }
    }

    /// Snapshot of the current estimate.
    pub fn get_state(&self) -> KinematicState {
        KinematicState {
            state: self.state,
            covariance: self.covariance,
            confidence: confidence_from_trace(self.covariance.trace()),
        }
    }

    pub fn diagnostics(&self) -> &EstimatorDiagnostics {
        &self.diagnostics
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    // ========== Private Helper Methods ==========

    /// Update Step shared by every sensor.
    ///
    /// Works on temporaries and commits only finite results, so a degenerate
    /// update can never poison the state.
    fn apply_update<const M: usize>(
        &mut self,
        sensor: SensorKind,
        z: &SVector<f64, M>,
    ) -> UpdateOutcome {
        if z.iter().any(|v| !v.is_finite()) {
            return self.skip(sensor, SkipReason::NonFinite);
        }

        let offset = sensor.state_offset();
        let mut h = SMatrix::<f64, M, STATE_DIM>::zeros();
        for i in 0..M {
            h[(i, offset + i)] = 1.0;
        }
        let r = SMatrix::<f64, M, M>::identity() * self.config.measurement_noise(sensor);

        // y = z - H x, with orientation residuals wrapped onto the circle
        let mut innovation = z - h * self.state;
        if sensor == SensorKind::Imu {
            for i in 0..3 {
                innovation[i] = wrap_angle(innovation[i]);
            }
        }

        // S = H P Hᵀ + R
        let s = h * self.covariance * h.transpose() + r;
        let s_inv = match s.cholesky() {
            Some(chol) => chol.inverse(),
            None => return self.skip(sensor, SkipReason::SingularInnovation),
        };

        if let Some(gate) = self.config.outlier_gate {
            let distance_squared = (innovation.transpose() * s_inv * innovation)[(0, 0)];
            if distance_squared > gate {
                self.diagnostics.sensors.entry(sensor).or_default().outliers += 1;
                return self.skip(sensor, SkipReason::Outlier { distance_squared });
            }
        }

        // K = P Hᵀ S⁻¹
        let k = self.covariance * h.transpose() * s_inv;
        let state = self.state + k * innovation;

        // Joseph form: P = (I - KH) P (I - KH)ᵀ + K R Kᵀ
        let ikh = StateCovariance::identity() - k * h;
        let mut covariance = ikh * self.covariance * ikh.transpose() + k * r * k.transpose();
        symmetrize(&mut covariance);

        if state.iter().chain(covariance.iter()).any(|v| !v.is_finite()) {
            return self.skip(sensor, SkipReason::NonFinite);
        }

        self.state = state;
        self.covariance = covariance;
        self.diagnostics.sensors.entry(sensor).or_default().applied += 1;
        UpdateOutcome::Applied
    }

    fn skip(&mut self, sensor: SensorKind, reason: SkipReason) -> UpdateOutcome {
        warn!(?sensor, ?reason, "skipping sensor update");
        self.diagnostics.sensors.entry(sensor).or_default().skipped += 1;
        UpdateOutcome::Skipped(reason)
    }

    /// Constant velocity / constant angular velocity transition.
    fn transition_matrix(dt: f64) -> StateCovariance {
        let mut f = StateCovariance::identity();
        for i in 0..3 {
            f[(POSITION + i, VELOCITY + i)] = dt; // p += v * dt
            f[(ORIENTATION + i, ANGULAR_VELOCITY + i)] = dt; // θ += ω * dt
        }
        f
    }
}

fn symmetrize(p: &mut StateCovariance) {
    *p = (*p + p.transpose()) * 0.5;
}

fn confidence_from_trace(trace: f64) -> f64 {
    (1.0 / (1.0 + trace / 100.0)).clamp(0.0, 1.0)
}

/// Map an angle onto (-π, π].
fn wrap_angle(angle: f64) -> f64 {
    angle.sin().atan2(angle.cos())
}
