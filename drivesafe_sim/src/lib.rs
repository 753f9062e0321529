//! DriveSafe Deterministic Scenario Harness
//!
//! This crate drives the safety pipeline through scripted drives where every
//! source of non-determinism is controlled:
//! - **Time**: `ManualContext` virtual clock, advanced one frame at a time
//! - **Sensors**: ground-truth ego motion plus seeded Gaussian noise
//! - **Perception**: synthetic detections, lane and driver observations
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     ScenarioRunner                       │
//! │  ┌──────────────┐   FrameInputs   ┌───────────────────┐  │
//! │  │    Oracle    │────────────────►│  SafetyPipeline   │  │
//! │  │ (ego + road) │                 │  EKF → tracker →  │  │
//! │  └──────┬───────┘                 │  stabilizer → risk│  │
//! │         │ heartbeats              └─────────┬─────────┘  │
//! │         ▼                                   ▼            │
//! │  ┌──────────────┐   critical failure  ┌───────────────┐  │
//! │  │   Watchdog   │────────────────────►│   FailSafe    │  │
//! │  └──────────────┘                     └───────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use drivesafe_sim::ScenarioRunner;
//! use drivesafe_sim::scenarios::ScenarioId;
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::SensorDropout).await;
//! assert!(result.passed);
//! ```

mod oracle;
mod runner;
pub mod scenarios;

pub use oracle::{EgoVehicle, NoiseProfile, Oracle, RoadObject};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
