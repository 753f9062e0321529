//! Scalar and lane-coefficient Kalman smoothers.
//!
//! These are the leaf filters of the stabilizer: one `KalmanFilter1D` per
//! tracked object's distance, and one `LaneKalmanFilter` per lane line.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Random-walk scalar Kalman filter.
///
/// Model: `x_k = x_{k-1} + w`, `z_k = x_k + v` with `w ~ N(0, q)` and
/// `v ~ N(0, r)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KalmanFilter1D {
    estimate: f64,
    error_variance: f64,
    process_variance: f64,
    measurement_variance: f64,
}

impl KalmanFilter1D {
    /// Create a filter seeded with `initial`.
    ///
    /// The initial error variance equals the measurement variance: the seed
    /// is exactly as trustworthy as the measurement it came from.
    pub fn new(initial: f64, process_variance: f64, measurement_variance: f64) -> Self {
        Self {
            estimate: initial,
            error_variance: measurement_variance,
            process_variance,
            measurement_variance,
        }
    }

    /// Propagate uncertainty one step forward.
    pub fn predict(&mut self) {
        self.error_variance += self.process_variance;
    }

    /// Fold in a measurement and return the new estimate.
    ///
    /// Non-finite measurements leave the filter untouched.
    pub fn update(&mut self, measurement: f64) -> f64 {
        if !measurement.is_finite() {
            return self.estimate;
        }

        let gain = self.error_variance / (self.error_variance + self.measurement_variance);
        self.estimate += gain * (measurement - self.estimate);
        self.error_variance *= 1.0 - gain;
        self.estimate
    }

    /// Predict then update.
    pub fn step(&mut self, measurement: f64) -> f64 {
        self.predict();
        self.update(measurement)
    }

    #[inline]
    pub fn estimate(&self) -> f64 {
        self.estimate
    }

    #[inline]
    pub fn error_variance(&self) -> f64 {
        self.error_variance
    }
}

/// Smooths the `[a, b, c]` coefficients of a lane polynomial `x = a·y² + b·y + c`.
///
/// Each coefficient gets an independent scalar filter; the first valid
/// observation seeds all three.
#[derive(Debug, Clone)]
pub struct LaneKalmanFilter {
    filters: Option<[KalmanFilter1D; 3]>,
    process_variance: f64,
    measurement_variance: f64,
}

impl LaneKalmanFilter {
    pub fn new(process_variance: f64, measurement_variance: f64) -> Self {
        Self {
            filters: None,
            process_variance,
            measurement_variance,
        }
    }

    /// Smooth a coefficient slice.
    ///
    /// Malformed input (wrong length or non-finite values) is returned as-is
    /// and does not touch the filter state.
    pub fn smooth(&mut self, coefficients: &[f64]) -> Vec<f64> {
        if coefficients.len() != 3 || coefficients.iter().any(|c| !c.is_finite()) {
            return coefficients.to_vec();
        }

        let observed = Vector3::new(coefficients[0], coefficients[1], coefficients[2]);
        self.update(&observed).as_slice().to_vec()
    }

    /// Typed variant of [`Self::smooth`].
    pub fn update(&mut self, observed: &Vector3<f64>) -> Vector3<f64> {
        if observed.iter().any(|c| !c.is_finite()) {
            return *observed;
        }

        let (q, r) = (self.process_variance, self.measurement_variance);
        match self.filters.as_mut() {
            Some(filters) => Vector3::new(
                filters[0].step(observed[0]),
                filters[1].step(observed[1]),
                filters[2].step(observed[2]),
            ),
            None => {
                self.filters = Some([
                    KalmanFilter1D::new(observed[0], q, r),
                    KalmanFilter1D::new(observed[1], q, r),
                    KalmanFilter1D::new(observed[2], q, r),
                ]);
                *observed
            }
        }
    }

    /// Current smoothed coefficients, if any observation has been seen.
    pub fn coefficients(&self) -> Option<Vector3<f64>> {
        self.filters.as_ref().map(|f| {
            Vector3::new(f[0].estimate(), f[1].estimate(), f[2].estimate())
        })
    }

    pub fn reset(&mut self) {
        self.filters = None;
    }
}
