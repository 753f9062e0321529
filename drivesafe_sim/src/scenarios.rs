//! Driving scenarios for the deterministic harness.

use serde::Serialize;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ScenarioId {
    /// DS-001: steady following, everything nominal
    Cruise,

    /// DS-002: lead vehicle brakes hard
    SuddenBrake,

    /// DS-003: ego drifts out of its lane
    LaneDrift,

    /// DS-004: driver becomes drowsy
    DrowsyDriver,

    /// DS-005: critical camera stops sending heartbeats
    SensorDropout,

    /// DS-006: detector misses the lead vehicle in many frames
    DetectorFlicker,

    /// DS-007: every position sensor goes dark for a while
    PositionBlackout,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Cruise,
            ScenarioId::SuddenBrake,
            ScenarioId::LaneDrift,
            ScenarioId::DrowsyDriver,
            ScenarioId::SensorDropout,
            ScenarioId::DetectorFlicker,
            ScenarioId::PositionBlackout,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Cruise => "cruise",
            ScenarioId::SuddenBrake => "sudden_brake",
            ScenarioId::LaneDrift => "lane_drift",
            ScenarioId::DrowsyDriver => "drowsy_driver",
            ScenarioId::SensorDropout => "sensor_dropout",
            ScenarioId::DetectorFlicker => "detector_flicker",
            ScenarioId::PositionBlackout => "position_blackout",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Cruise => "Follow a car at 40m; expect Normal state and an accurate fused position",
            ScenarioId::SuddenBrake => "Lead car closes at 15 m/s after 2s; expect CRITICAL before TTC drops below 1s",
            ScenarioId::LaneDrift => "Drift across the lane line; expect one debounced departure alert",
            ScenarioId::DrowsyDriver => "PERCLOS rises after 1s; expect a drowsiness alert and risk factor",
            ScenarioId::SensorDropout => "Critical camera goes silent at 2s; expect EMERGENCY_STOP via the watchdog",
            ScenarioId::DetectorFlicker => "35% detector misses on a steady lead car; expect one track and no alert",
            ScenarioId::PositionBlackout => "No camera, lidar or GPS for 1s; expect confidence to drop then recover",
        }
    }

    /// Minimum duration that lets the scenario's events play out.
    pub fn min_duration_secs(&self) -> f64 {
        match self {
            ScenarioId::Cruise => 3.0,
            ScenarioId::SuddenBrake => 4.0,
            ScenarioId::LaneDrift => 5.0,
            ScenarioId::DrowsyDriver => 3.0,
            ScenarioId::SensorDropout => 4.0,
            ScenarioId::DetectorFlicker => 5.0,
            ScenarioId::PositionBlackout => 6.0,
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cruise" | "ds-001" => Ok(ScenarioId::Cruise),
            "sudden_brake" | "suddenbrake" | "ds-002" => Ok(ScenarioId::SuddenBrake),
            "lane_drift" | "lanedrift" | "ds-003" => Ok(ScenarioId::LaneDrift),
            "drowsy_driver" | "drowsydriver" | "ds-004" => Ok(ScenarioId::DrowsyDriver),
            "sensor_dropout" | "sensordropout" | "ds-005" => Ok(ScenarioId::SensorDropout),
            "detector_flicker" | "detectorflicker" | "ds-006" => Ok(ScenarioId::DetectorFlicker),
            "position_blackout" | "positionblackout" | "ds-007" => Ok(ScenarioId::PositionBlackout),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
