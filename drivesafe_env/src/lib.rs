//! DriveSafe Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the DriveSafe
//! engines to run in both **Production** (tokio) and **Simulation** (virtual
//! clock) environments.
//!
//! # Core Concept
//!
//! Everything time-dependent in the safety core goes through the context:
//! - Time (`now()`, `sleep()`)
//! - Background work (`spawn()`)
//! - Seeding (`seed()`)
//!
//! A heartbeat timeout or an alert display window therefore behaves the same
//! way in a unit test as on the vehicle.
//!
//! # Example
//!
//! ```ignore
//! use drivesafe_env::SafetyContext;
//!
//! async fn scan_loop<Ctx: SafetyContext>(ctx: &Ctx) {
//!     loop {
//!         ctx.sleep(Duration::from_millis(100)).await;
//!         scan();
//!     }
//! }
//! ```

mod context;
mod manual;
mod tokio_impl;

pub use context::SafetyContext;
pub use manual::ManualContext;
pub use tokio_impl::TokioContext;
