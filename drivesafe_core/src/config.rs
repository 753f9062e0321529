//! Typed, validated configuration for the whole safety core.
//!
//! Every engine owns a config struct next to its implementation
//! (`TrackerConfig` lives in `object_tracker`, and so on). This module
//! aggregates them into [`SafetyConfig`], loads it from JSON and validates
//! every value up front. Invalid values are rejected, never clamped.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::alert_stabilizer::StabilizerConfig;
use crate::failsafe::FailSafeConfig;
use crate::object_tracker::TrackerConfig;
use crate::risk::RiskConfig;
use crate::state_estimator::EstimatorConfig;
use crate::watchdog::WatchdogConfig;

/// Configuration errors raised at construction time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("{field} must be positive, got {value}")]
    NotPositive { field: &'static str, value: f64 },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Reject values outside `[min, max]` (and NaN).
pub(crate) fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange { field, value, min, max })
    }
}

/// Reject values outside `[0, 1]`.
pub(crate) fn check_unit(field: &'static str, value: f64) -> Result<(), ConfigError> {
    check_range(field, value, 0.0, 1.0)
}

/// Reject zero, negative and non-finite values.
pub(crate) fn check_positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NotPositive { field, value })
    }
}

/// Top-level configuration handed to [`crate::SafetyPipeline`].
///
/// Missing sections or fields fall back to their defaults, so a config file
/// only needs to list what it overrides:
///
/// ```ignore
/// { "tracker": { "iou_threshold": 0.3 }, "watchdog": { "scan_interval_ms": 50 } }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub estimator: EstimatorConfig,
    pub tracker: TrackerConfig,
    pub stabilizer: StabilizerConfig,
    pub watchdog: WatchdogConfig,
    pub failsafe: FailSafeConfig,
    pub risk: RiskConfig,
}

impl SafetyConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.estimator.validate()?;
        self.tracker.validate()?;
        self.stabilizer.validate()?;
        self.watchdog.validate()?;
        self.failsafe.validate()?;
        self.risk.validate()?;
        Ok(())
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: SafetyConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SafetyConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SafetyConfig::from_json_str(
            r#"{ "tracker": { "iou_threshold": 0.3 }, "watchdog": { "scan_interval_ms": 50 } }"#,
        )
        .unwrap();

        assert_eq!(config.tracker.iou_threshold, 0.3);
        assert_eq!(config.tracker.max_disappeared, TrackerConfig::default().max_disappeared);
        assert_eq!(config.watchdog.scan_interval_ms, 50);
        assert_eq!(config.risk, RiskConfig::default());
    }

    #[test]
    fn test_out_of_range_threshold_fails_fast() {
        let err = SafetyConfig::from_json_str(r#"{ "tracker": { "iou_threshold": 1.5 } }"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { field: "tracker.iou_threshold", .. }));
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let err = SafetyConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = SafetyConfig::from_path("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_check_helpers() {
        assert!(check_unit("x", 0.0).is_ok());
        assert!(check_unit("x", 1.0).is_ok());
        assert!(check_unit("x", f64::NAN).is_err());
        assert!(check_positive("y", 0.0).is_err());
        assert!(check_positive("y", 1e-9).is_ok());
    }
}
