//! Stateless risk fusion.
//!
//! Combines the debounced collision level, lane departure, driver
//! drowsiness and critical traffic signs into one score in `[0, 1]`.

use crate::alert_stabilizer::CollisionLevel;
use crate::config::{check_unit, ConfigError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Safe,
    Caution,
    Danger,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Safe => write!(f, "SAFE"),
            RiskLevel::Caution => write!(f, "CAUTION"),
            RiskLevel::Danger => write!(f, "DANGER"),
        }
    }
}

impl From<CollisionLevel> for RiskLevel {
    fn from(level: CollisionLevel) -> Self {
        match level {
            CollisionLevel::Safe => RiskLevel::Safe,
            CollisionLevel::Warning => RiskLevel::Caution,
            CollisionLevel::Critical => RiskLevel::Danger,
        }
    }
}

/// Contributing factor reported with an assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFactor {
    CollisionDanger,
    CollisionCaution,
    LaneDeparture,
    DriverDrowsy,
    CriticalSign,
}

/// Fusion weights and level thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub collision_weight: f64,
    pub lane_weight: f64,
    pub drowsiness_weight: f64,
    pub sign_weight: f64,
    /// Score at or above which the level is Danger (default: 0.7)
    pub danger_threshold: f64,
    /// Score at or above which the level is Caution (default: 0.3)
    pub caution_threshold: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            collision_weight: 0.4,
            lane_weight: 0.25,
            drowsiness_weight: 0.25,
            sign_weight: 0.1,
            danger_threshold: 0.7,
            caution_threshold: 0.3,
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_unit("risk.collision_weight", self.collision_weight)?;
        check_unit("risk.lane_weight", self.lane_weight)?;
        check_unit("risk.drowsiness_weight", self.drowsiness_weight)?;
        check_unit("risk.sign_weight", self.sign_weight)?;
        check_unit("risk.danger_threshold", self.danger_threshold)?;
        check_unit("risk.caution_threshold", self.caution_threshold)?;

        let total = self.collision_weight + self.lane_weight + self.drowsiness_weight + self.sign_weight;
        if total > 1.0 + 1e-9 {
            return Err(ConfigError::Invalid(format!("risk weights sum to {total}, must be <= 1")));
        }
        if self.caution_threshold > self.danger_threshold {
            return Err(ConfigError::Invalid(
                "risk.caution_threshold must not exceed danger_threshold".into(),
            ));
        }
        Ok(())
    }
}

/// Signals for one assessment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskInputs {
    pub collision_risk: RiskLevel,
    pub lane_departure: bool,
    pub driver_drowsy: bool,
    pub critical_sign: bool,
}

impl Default for RiskInputs {
    fn default() -> Self {
        Self {
            collision_risk: RiskLevel::Safe,
            lane_departure: false,
            driver_drowsy: false,
            critical_sign: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub overall_risk: RiskLevel,
    pub risk_score: f64,
    pub factors: BTreeSet<RiskFactor>,
}

/// Pure weighted-sum risk fusion. Holds only its weights.
#[derive(Debug, Clone)]
pub struct RiskAssessor {
    config: RiskConfig,
}

impl RiskAssessor {
    pub fn new(config: RiskConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn with_defaults() -> Self {
        Self {
            config: RiskConfig::default(),
        }
    }

    pub fn assess(&self, inputs: &RiskInputs) -> RiskAssessment {
        let c = &self.config;
        let mut factors = BTreeSet::new();
        let mut score = 0.0;

        match inputs.collision_risk {
            RiskLevel::Danger => {
                score += c.collision_weight;
                factors.insert(RiskFactor::CollisionDanger);
            }
            RiskLevel::Caution => {
                score += c.collision_weight * 0.5;
                factors.insert(RiskFactor::CollisionCaution);
            }
            RiskLevel::Safe => {}
        }
        if inputs.lane_departure {
            score += c.lane_weight;
            factors.insert(RiskFactor::LaneDeparture);
        }
        if inputs.driver_drowsy {
            score += c.drowsiness_weight;
            factors.insert(RiskFactor::DriverDrowsy);
        }
        if inputs.critical_sign {
            score += c.sign_weight;
            factors.insert(RiskFactor::CriticalSign);
        }

        let risk_score = score.clamp(0.0, 1.0);
        let overall_risk = if risk_score >= c.danger_threshold {
            RiskLevel::Danger
        } else if risk_score >= c.caution_threshold {
            RiskLevel::Caution
        } else {
            RiskLevel::Safe
        };

        RiskAssessment {
            overall_risk,
            risk_score,
            factors,
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn level_for(score: f64, c: &RiskConfig) -> RiskLevel {
        if score >= c.danger_threshold {
            RiskLevel::Danger
        } else if score >= c.caution_threshold {
            RiskLevel::Caution
        } else {
            RiskLevel::Safe
        }
    }

    #[test]
    fn test_nothing_is_safe() {
        let a = RiskAssessor::with_defaults().assess(&RiskInputs::default());
        assert_eq!(a.risk_score, 0.0);
        assert_eq!(a.overall_risk, RiskLevel::Safe);
        assert!(a.factors.is_empty());
    }

    #[test]
    fn test_danger_plus_lane_departure_matches_formula() {
        let assessor = RiskAssessor::with_defaults();
        let c = assessor.config().clone();
        let a = assessor.assess(&RiskInputs {
            collision_risk: RiskLevel::Danger,
            lane_departure: true,
            ..Default::default()
        });

        let expected = c.collision_weight + c.lane_weight;
        assert_relative_eq!(a.risk_score, expected, epsilon = 1e-12);
        assert_eq!(a.overall_risk, level_for(expected, &c));
        assert_eq!(
            a.factors,
            BTreeSet::from([RiskFactor::CollisionDanger, RiskFactor::LaneDeparture])
        );
    }

    #[test]
    fn test_caution_gets_half_weight() {
        let assessor = RiskAssessor::with_defaults();
        let a = assessor.assess(&RiskInputs {
            collision_risk: RiskLevel::Caution,
            ..Default::default()
        });
        assert_relative_eq!(a.risk_score, assessor.config().collision_weight * 0.5);
    }

    #[test]
    fn test_everything_is_danger() {
        let a = RiskAssessor::with_defaults().assess(&RiskInputs {
            collision_risk: RiskLevel::Danger,
            lane_departure: true,
            driver_drowsy: true,
            critical_sign: true,
        });
        assert_relative_eq!(a.risk_score, 1.0, epsilon = 1e-12);
        assert_eq!(a.overall_risk, RiskLevel::Danger);
        assert_eq!(a.factors.len(), 4);
    }

    #[test]
    fn test_assessment_is_pure() {
        let assessor = RiskAssessor::with_defaults();
        let inputs = RiskInputs {
            driver_drowsy: true,
            critical_sign: true,
            ..Default::default()
        };
        assert_eq!(assessor.assess(&inputs), assessor.assess(&inputs));
    }

    #[test]
    fn test_collision_level_conversion() {
        assert_eq!(RiskLevel::from(CollisionLevel::Critical), RiskLevel::Danger);
        assert_eq!(RiskLevel::from(CollisionLevel::Warning), RiskLevel::Caution);
        assert_eq!(RiskLevel::from(CollisionLevel::Safe), RiskLevel::Safe);
    }

    #[test]
    fn test_invalid_weights_rejected() {
        let config = RiskConfig {
            collision_weight: 0.9,
            ..Default::default()
        };
        assert!(RiskAssessor::new(config).is_err());
    }
}
