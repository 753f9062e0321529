//! DriveSafe Core - Real-time safety core for driver assistance
//!
//! This library turns noisy per-frame perception into decisions a driver can
//! trust:
//! 1. **Fusion**: 12-state Extended Kalman Filter over camera, lidar, GPS and IMU
//! 2. **Stability**: IoU tracking plus vote/EMA/Kalman debouncing of every alert
//! 3. **Safety**: component watchdog, weighted risk fusion and a safe-state machine

pub mod alert_stabilizer;
pub mod config;
pub mod failsafe;
pub mod kalman;
pub mod object_tracker;
pub mod perception;
pub mod risk;
pub mod safety_runtime;
pub mod state_estimator;
pub mod watchdog;

// Re-export key types for convenience
pub use alert_stabilizer::{AlertStabilizer, CollisionLevel, StabilizerConfig};
pub use config::{ConfigError, SafetyConfig};
pub use failsafe::{ActionHandler, ActionKind, FailSafeEvent, FailSafeManager, Feature, SafeState};
pub use object_tracker::{BoundingBox, Detection, ObjectTracker, Track, TrackId};
pub use perception::{PerceptionModule, PerceptionOutput, ReplayModule};
pub use risk::{RiskAssessment, RiskAssessor, RiskInputs, RiskLevel};
pub use safety_runtime::{FrameInputs, FrameReport, SafetyPipeline};
pub use state_estimator::{KinematicState, SensorKind, StateEstimator};
pub use watchdog::{ComponentStatus, ComponentWatchdog, SystemDiagnostics};
