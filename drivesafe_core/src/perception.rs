//! Perception capability interface.
//!
//! Detector, lane and driver-monitoring front-ends live outside the core.
//! They plug in through [`PerceptionModule`] and hand the pipeline plain
//! data: detections, lane observations and driver state.
//!
//! [`ReplayModule`] replays recorded outputs by frame index and backs the
//! simulator and tests.

use crate::object_tracker::Detection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum PerceptionError {
    #[error("Module '{0}' used before initialize()")]
    NotInitialized(String),

    #[error("Module '{0}' has been shut down")]
    ShutDown(String),

    #[error("Inference failed: {0}")]
    Inference(String),
}

/// One camera frame as seen by the front-ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub index: u64,
    pub timestamp: Duration,
    pub width: u32,
    pub height: u32,
    /// Raw pixels; empty for replayed frames
    #[serde(default)]
    pub pixels: Vec<u8>,
}

impl Frame {
    pub fn new(index: u64, timestamp: Duration) -> Self {
        Self {
            index,
            timestamp,
            width: 0,
            height: 0,
            pixels: Vec::new(),
        }
    }
}

/// Output of a driver-monitoring front-end.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriverState {
    /// Fraction of recent frames with eyes closed
    pub perclos: f64,
    pub drowsy: bool,
    pub confidence: f64,
}

/// Output of a lane front-end. Coefficients are `[a, b, c]` of `x = a·y² + b·y + c`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneObservation {
    pub left: Option<Vec<f64>>,
    pub right: Option<Vec<f64>>,
    pub departure: bool,
    pub confidence: f64,
    /// Signed lateral offset from lane center, normalized
    pub lane_position: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PerceptionOutput {
    Detections(Vec<Detection>),
    DriverState(DriverState),
    LaneObservation(LaneObservation),
    /// Nothing produced for this frame
    Empty,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleDiagnostics {
    pub name: String,
    pub initialized: bool,
    pub frames_processed: u64,
    pub empty_frames: u64,
}

/// A perception front-end.
pub trait PerceptionModule: Send {
    fn name(&self) -> &str;

    fn initialize(&mut self) -> Result<(), PerceptionError>;

    /// Process one frame. Producing nothing is `Ok(PerceptionOutput::Empty)`.
    fn process(&mut self, frame: &Frame) -> Result<PerceptionOutput, PerceptionError>;

    fn diagnostics(&self) -> ModuleDiagnostics;

    fn shutdown(&mut self);
}

/// Replays recorded outputs keyed by frame index.
#[derive(Debug, Clone)]
pub struct ReplayModule {
    name: String,
    recording: BTreeMap<u64, PerceptionOutput>,
    stats: ModuleDiagnostics,
    shut_down: bool,
}

impl ReplayModule {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            stats: ModuleDiagnostics {
                name: name.clone(),
                ..Default::default()
            },
            name,
            recording: BTreeMap::new(),
            shut_down: false,
        }
    }

    /// Record `output` for `frame_index`, replacing any earlier entry.
    pub fn record(&mut self, frame_index: u64, output: PerceptionOutput) {
        self.recording.insert(frame_index, output);
    }

    pub fn with_recording(mut self, recording: impl IntoIterator<Item = (u64, PerceptionOutput)>) -> Self {
        self.recording.extend(recording);
        self
    }

    pub fn len(&self) -> usize {
        self.recording.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recording.is_empty()
    }
}

impl PerceptionModule for ReplayModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self) -> Result<(), PerceptionError> {
        if self.shut_down {
            return Err(PerceptionError::ShutDown(self.name.clone()));
        }
        self.stats.initialized = true;
        info!(module = %self.name, frames = self.recording.len(), "replay module initialized");
        Ok(())
    }

    fn process(&mut self, frame: &Frame) -> Result<PerceptionOutput, PerceptionError> {
        if self.shut_down {
            return Err(PerceptionError::ShutDown(self.name.clone()));
        }
        if !self.stats.initialized {
            return Err(PerceptionError::NotInitialized(self.name.clone()));
        }

        self.stats.frames_processed += 1;
        let output = self.recording.get(&frame.index).cloned().unwrap_or(PerceptionOutput::Empty);
        if output == PerceptionOutput::Empty {
            self.stats.empty_frames += 1;
            debug!(module = %self.name, frame = frame.index, "no recorded output");
        }
        Ok(output)
    }

    fn diagnostics(&self) -> ModuleDiagnostics {
        self.stats.clone()
    }

    fn shutdown(&mut self) {
        self.shut_down = true;
        self.stats.initialized = false;
        info!(module = %self.name, "replay module shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_tracker::BoundingBox;

    #[test]
    fn test_replay_requires_initialize() {
        let mut module = ReplayModule::new("detector");
        let err = module.process(&Frame::new(0, Duration::ZERO)).unwrap_err();
        assert!(matches!(err, PerceptionError::NotInitialized(_)));
    }

    #[test]
    fn test_replay_returns_recorded_outputs() {
        let detections = vec![Detection::new("car", 0.9, BoundingBox::new(0.0, 0.0, 10.0, 10.0))];
        let mut module = ReplayModule::new("detector")
            .with_recording([(2, PerceptionOutput::Detections(detections.clone()))]);
        module.initialize().unwrap();

        assert_eq!(
            module.process(&Frame::new(1, Duration::ZERO)).unwrap(),
            PerceptionOutput::Empty
        );
        assert_eq!(
            module.process(&Frame::new(2, Duration::from_millis(33))).unwrap(),
            PerceptionOutput::Detections(detections)
        );

        let diag = module.diagnostics();
        assert_eq!(diag.frames_processed, 2);
        assert_eq!(diag.empty_frames, 1);
    }

    #[test]
    fn test_shutdown_rejects_further_frames() {
        let mut module = ReplayModule::new("dms");
        module.initialize().unwrap();
        module.shutdown();

        assert!(matches!(
            module.process(&Frame::new(0, Duration::ZERO)),
            Err(PerceptionError::ShutDown(_))
        ));
        assert!(module.initialize().is_err());
    }
}
