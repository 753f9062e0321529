//! The "STABILITY" Engine - Debouncing human-facing alerts
//!
//! Every signal that reaches the driver is computed from noisy per-frame
//! inputs and must not flicker. Four independent mechanisms live here:
//!
//! - [`LaneDepartureDebouncer`]: confidence-weighted vote + EMA + post-flip cooldown
//! - [`CollisionVoter`]: majority voting over a sliding window of TTC-derived votes
//! - [`DistanceSmoother`]: one scalar Kalman filter per tracked object
//! - [`AlertBoard`]: minimum display time and refresh cooldown per alert key
//!
//! [`AlertStabilizer`] bundles them (plus one lane-polynomial filter per side)
//! behind the interface the pipeline calls every frame.

use crate::config::{check_positive, check_unit, ConfigError};
use crate::kalman::{KalmanFilter1D, LaneKalmanFilter};
use crate::object_tracker::TrackId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneDepartureConfig {
    /// Samples kept for the confidence-weighted vote (default: 15)
    pub history_len: usize,

    /// Samples below this confidence are discarded (default: 0.3)
    pub min_confidence: f64,

    /// EMA smoothing factor (default: 0.3)
    pub ema_alpha: f64,

    /// Weighted departure fraction required to raise (default: 0.6)
    pub vote_threshold: f64,

    /// EMA level required to raise (default: 0.5)
    pub ema_threshold: f64,

    /// Frames the decision is frozen after every flip, discarded
    /// low-confidence frames included (default: 5)
    pub cooldown_frames: u32,
}

impl Default for LaneDepartureConfig {
    fn default() -> Self {
        Self {
            history_len: 15,
            min_confidence: 0.3,
            ema_alpha: 0.3,
            vote_threshold: 0.6,
            ema_threshold: 0.5,
            cooldown_frames: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollisionConfig {
    /// Sliding vote window length in frames (default: 10)
    pub window: usize,

    /// TTC below which a frame votes "danger" (default: 1.5s)
    pub danger_ttc: f64,

    /// TTC below which a frame votes "warning" (default: 3.0s)
    pub warning_ttc: f64,

    /// Danger votes needed for Critical (default: 6)
    pub critical_votes: usize,

    /// Warning-or-danger votes needed for Warning (default: 3)
    pub warning_votes: usize,
}

impl Default for CollisionConfig {
    fn default() -> Self {
        Self {
            window: 10,
            danger_ttc: 1.5,
            warning_ttc: 3.0,
            critical_votes: 6,
            warning_votes: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistanceSmoothingConfig {
    pub process_variance: f64,
    pub measurement_variance: f64,
}

impl Default for DistanceSmoothingConfig {
    fn default() -> Self {
        Self {
            process_variance: 0.1,
            measurement_variance: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertLifecycleConfig {
    /// Minimum time an alert stays on screen (default: 3000ms)
    pub display_duration_ms: u64,

    /// Time without refresh before an alert may leave (default: 1000ms)
    pub cooldown_ms: u64,

    /// Hard cap on simultaneously active alerts (default: 32)
    pub max_active: usize,
}

impl Default for AlertLifecycleConfig {
    fn default() -> Self {
        Self {
            display_duration_ms: 3000,
            cooldown_ms: 1000,
            max_active: 32,
        }
    }
}

impl AlertLifecycleConfig {
    pub fn display_duration(&self) -> Duration {
        Duration::from_millis(self.display_duration_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Configuration for the AlertStabilizer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizerConfig {
    pub lane: LaneDepartureConfig,
    pub collision: CollisionConfig,
    pub distance: DistanceSmoothingConfig,
    pub alerts: AlertLifecycleConfig,
    pub lane_filter: DistanceSmoothingConfig,
}

impl StabilizerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let lane = &self.lane;
        if lane.history_len == 0 {
            return Err(ConfigError::Invalid("stabilizer.lane.history_len must be at least 1".into()));
        }
        check_unit("stabilizer.lane.min_confidence", lane.min_confidence)?;
        check_unit("stabilizer.lane.ema_alpha", lane.ema_alpha)?;
        check_unit("stabilizer.lane.vote_threshold", lane.vote_threshold)?;
        check_unit("stabilizer.lane.ema_threshold", lane.ema_threshold)?;

        let c = &self.collision;
        if c.window == 0 || c.critical_votes > c.window || c.warning_votes > c.window {
            return Err(ConfigError::Invalid(format!(
                "stabilizer.collision vote counts ({}, {}) must fit a non-empty window of {}",
                c.critical_votes, c.warning_votes, c.window
            )));
        }
        check_positive("stabilizer.collision.danger_ttc", c.danger_ttc)?;
        check_positive("stabilizer.collision.warning_ttc", c.warning_ttc)?;
        if c.danger_ttc > c.warning_ttc {
            return Err(ConfigError::Invalid(
                "stabilizer.collision.danger_ttc must not exceed warning_ttc".into(),
            ));
        }

        check_positive("stabilizer.distance.process_variance", self.distance.process_variance)?;
        check_positive("stabilizer.distance.measurement_variance", self.distance.measurement_variance)?;
        check_positive("stabilizer.lane_filter.process_variance", self.lane_filter.process_variance)?;
        check_positive(
            "stabilizer.lane_filter.measurement_variance",
            self.lane_filter.measurement_variance,
        )?;

        if self.alerts.max_active == 0 {
            return Err(ConfigError::Invalid("stabilizer.alerts.max_active must be at least 1".into()));
        }
        Ok(())
    }
}

// ============================================================================
// LANE DEPARTURE
// ============================================================================

/// Confidence-weighted vote + EMA debouncer for the lane-departure flag.
#[derive(Debug, Clone)]
pub struct LaneDepartureDebouncer {
    config: LaneDepartureConfig,
    history: VecDeque<(bool, f64)>,
    ema: f64,
    active: bool,
    cooldown_remaining: u32,
}

impl LaneDepartureDebouncer {
    pub fn new(config: LaneDepartureConfig) -> Self {
        Self {
            history: VecDeque::with_capacity(config.history_len),
            config,
            ema: 0.0,
            active: false,
            cooldown_remaining: 0,
        }
    }

    /// Feed one frame and return the debounced decision with a reason.
    pub fn update(
        &mut self,
        is_departure: bool,
        confidence: f64,
        lane_position: Option<f64>,
    ) -> (bool, String) {
        let offset = lane_position
            .filter(|p| p.is_finite())
            .map(|p| format!(", offset {p:+.2}"))
            .unwrap_or_default();

        if !confidence.is_finite() || confidence < self.config.min_confidence {
            self.cooldown_remaining = self.cooldown_remaining.saturating_sub(1);
            return (
                self.active,
                format!("low confidence ({confidence:.2}), holding previous decision{offset}"),
            );
        }

        if self.history.len() == self.config.history_len {
            self.history.pop_front();
        }
        self.history.push_back((is_departure, confidence));

        let sample = if is_departure { 1.0 } else { 0.0 };
        self.ema = self.config.ema_alpha * sample + (1.0 - self.config.ema_alpha) * self.ema;

        if self.cooldown_remaining > 0 {
            self.cooldown_remaining -= 1;
            return (
                self.active,
                format!("cooldown ({} frames left){offset}", self.cooldown_remaining),
            );
        }

        let vote = self.weighted_fraction();
        let decision = vote > self.config.vote_threshold && self.ema > self.config.ema_threshold;

        if decision != self.active {
            self.active = decision;
            self.cooldown_remaining = self.config.cooldown_frames;
            debug!(active = decision, vote, ema = self.ema, "lane departure state flipped");
        }

        let verdict = if self.active { "departure confirmed" } else { "in lane" };
        (
            self.active,
            format!("{verdict}: vote {vote:.2}, ema {:.2}{offset}", self.ema),
        )
    }

    /// Σ confidence of departure samples / Σ confidence of all samples.
    fn weighted_fraction(&self) -> f64 {
        let total: f64 = self.history.iter().map(|(_, c)| c).sum();
        if total <= 0.0 {
            return 0.0;
        }
        let departing: f64 = self
            .history
            .iter()
            .filter(|(d, _)| *d)
            .map(|(_, c)| c)
            .sum();
        departing / total
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn ema(&self) -> f64 {
        self.ema
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.ema = 0.0;
        self.active = false;
        self.cooldown_remaining = 0;
    }
}

// ============================================================================
// COLLISION VOTING
// ============================================================================

/// Debounced forward-collision level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CollisionLevel {
    Safe,
    Warning,
    Critical,
}

impl fmt::Display for CollisionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollisionLevel::Safe => write!(f, "SAFE"),
            CollisionLevel::Warning => write!(f, "WARNING"),
            CollisionLevel::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Majority voter over a sliding window of per-frame TTC votes.
#[derive(Debug, Clone)]
pub struct CollisionVoter {
    config: CollisionConfig,
    /// 0 = safe, 1 = warning, 2 = danger
    votes: VecDeque<u8>,
}

impl CollisionVoter {
    pub fn new(config: CollisionConfig) -> Self {
        Self {
            votes: VecDeque::with_capacity(config.window),
            config,
        }
    }

    /// Vote for a single frame. Only a positive (approaching) TTC can vote for risk.
    pub fn vote_for(&self, ttc: Option<f64>) -> u8 {
        match ttc {
            Some(t) if t.is_finite() && t > 0.0 && t < self.config.danger_ttc => 2,
            Some(t) if t.is_finite() && t > 0.0 && t < self.config.warning_ttc => 1,
            _ => 0,
        }
    }

    pub fn update(&mut self, ttc: Option<f64>, distance: f64, class: &str) -> (CollisionLevel, String) {
        let vote = self.vote_for(ttc);
        if self.votes.len() == self.config.window {
            self.votes.pop_front();
        }
        self.votes.push_back(vote);

        let level = self.level();
        let message = match level {
            CollisionLevel::Critical => {
                format!("COLLISION RISK: {class} at {distance:.1}m ({} TTC)", fmt_ttc(ttc))
            }
            CollisionLevel::Warning => {
                format!("Caution: {class} ahead at {distance:.1}m ({} TTC)", fmt_ttc(ttc))
            }
            CollisionLevel::Safe => "Clear".to_string(),
        };
        (level, message)
    }

    /// Current level from the window contents.
    pub fn level(&self) -> CollisionLevel {
        let danger = self.votes.iter().filter(|v| **v == 2).count();
        let risky = self.votes.iter().filter(|v| **v >= 1).count();

        if danger >= self.config.critical_votes {
            CollisionLevel::Critical
        } else if risky >= self.config.warning_votes {
            CollisionLevel::Warning
        } else {
            CollisionLevel::Safe
        }
    }

    pub fn reset(&mut self) {
        self.votes.clear();
    }
}

fn fmt_ttc(ttc: Option<f64>) -> String {
    match ttc {
        Some(t) if t.is_finite() => format!("{t:.1}s"),
        _ => "n/a".to_string(),
    }
}

// ============================================================================
// DISTANCE SMOOTHING
// ============================================================================

/// One lazily created scalar Kalman filter per track id.
#[derive(Debug, Clone)]
pub struct DistanceSmoother {
    config: DistanceSmoothingConfig,
    filters: HashMap<TrackId, KalmanFilter1D>,
}

impl DistanceSmoother {
    pub fn new(config: DistanceSmoothingConfig) -> Self {
        Self {
            config,
            filters: HashMap::new(),
        }
    }

    /// Smooth a raw range for `track_id`; the first observation seeds the filter.
    pub fn smooth(&mut self, track_id: TrackId, raw_distance: f64) -> f64 {
        if !raw_distance.is_finite() {
            return self
                .filters
                .get(&track_id)
                .map_or(raw_distance, |f| f.estimate());
        }

        match self.filters.get_mut(&track_id) {
            Some(filter) => filter.step(raw_distance),
            None => {
                let filter = KalmanFilter1D::new(
                    raw_distance,
                    self.config.process_variance,
                    self.config.measurement_variance,
                );
                self.filters.insert(track_id, filter);
                raw_distance
            }
        }
    }

    /// Destroy filters whose track is no longer active.
    pub fn retain_tracks(&mut self, active: &BTreeSet<TrackId>) {
        self.filters.retain(|id, _| active.contains(id));
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

// ============================================================================
// ALERT LIFECYCLE
// ============================================================================

/// Severity half of an alert key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl From<CollisionLevel> for AlertLevel {
    fn from(level: CollisionLevel) -> Self {
        match level {
            CollisionLevel::Safe => AlertLevel::Info,
            CollisionLevel::Warning => AlertLevel::Warning,
            CollisionLevel::Critical => AlertLevel::Critical,
        }
    }
}

/// What the operator is shown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub message: String,
    pub track_id: Option<TrackId>,
    pub distance: Option<f64>,
}

impl AlertPayload {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            track_id: None,
            distance: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AlertKey {
    pub class: String,
    pub level: AlertLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveAlert {
    pub key: AlertKey,
    pub payload: AlertPayload,
    pub start_time: Duration,
    pub last_update: Duration,
}

/// Table of alerts currently shown to the operator.
#[derive(Debug, Clone)]
pub struct AlertBoard {
    config: AlertLifecycleConfig,
    alerts: BTreeMap<AlertKey, ActiveAlert>,
}

impl AlertBoard {
    pub fn new(config: AlertLifecycleConfig) -> Self {
        Self {
            config,
            alerts: BTreeMap::new(),
        }
    }

    /// Raise or refresh an alert. Returns `true` if it is newly shown.
    ///
    /// A refresh replaces the payload but keeps the original start time.
    ///
    /// On a full board only an alert that already satisfies the display and
    /// cooldown rule is evicted. Failing that, the stalest alert of strictly
    /// lower severity gives way. Otherwise the new alert is refused.
    pub fn raise(
        &mut self,
        class: impl Into<String>,
        level: AlertLevel,
        payload: AlertPayload,
        now: Duration,
    ) -> bool {
        let key = AlertKey {
            class: class.into(),
            level,
        };

        if let Some(alert) = self.alerts.get_mut(&key) {
            alert.payload = payload;
            alert.last_update = now;
            return false;
        }

        if self.alerts.len() >= self.config.max_active && !self.make_room(level, now) {
            warn!(
                class = %key.class,
                level = ?key.level,
                active = self.alerts.len(),
                "alert board full, alert refused"
            );
            return false;
        }

        info!(class = %key.class, level = ?key.level, text = %payload.message, "alert raised");
        self.alerts.insert(
            key.clone(),
            ActiveAlert {
                key,
                payload,
                start_time: now,
                last_update: now,
            },
        );
        true
    }

    /// Evict alerts that were displayed long enough and are no longer refreshed.
    pub fn prune(&mut self, now: Duration) -> Vec<ActiveAlert> {
        let expired: Vec<AlertKey> = self
            .alerts
            .values()
            .filter(|a| self.expired(a, now))
            .map(|a| a.key.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| self.alerts.remove(&key))
            .inspect(|a| debug!(class = %a.key.class, level = ?a.key.level, "alert cleared"))
            .collect()
    }

    fn expired(&self, alert: &ActiveAlert, now: Duration) -> bool {
        now.saturating_sub(alert.start_time) >= self.config.display_duration()
            && now.saturating_sub(alert.last_update) >= self.config.cooldown()
    }

    fn make_room(&mut self, incoming: AlertLevel, now: Duration) -> bool {
        let eligible = self
            .alerts
            .values()
            .filter(|a| self.expired(a, now))
            .min_by_key(|a| a.last_update)
            .or_else(|| {
                self.alerts
                    .values()
                    .filter(|a| a.key.level < incoming)
                    .min_by_key(|a| (a.key.level, a.last_update))
            })
            .map(|a| a.key.clone());

        match eligible {
            Some(key) => {
                debug!(class = %key.class, level = ?key.level, "alert evicted to make room");
                self.alerts.remove(&key);
                true
            }
            None => false,
        }
    }

    pub fn active(&self) -> impl Iterator<Item = &ActiveAlert> {
        self.alerts.values()
    }

    pub fn get(&self, class: &str, level: AlertLevel) -> Option<&ActiveAlert> {
        self.alerts.get(&AlertKey {
            class: class.to_string(),
            level,
        })
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }

    pub fn clear(&mut self) {
        self.alerts.clear();
    }
}

// ============================================================================
// ALERT STABILIZER (The Engine)
// ============================================================================

/// Which lane line a polynomial belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LaneSide {
    Left,
    Right,
}

/// All per-frame debouncing state for one vehicle.
pub struct AlertStabilizer {
    lane: LaneDepartureDebouncer,
    collision: CollisionVoter,
    distances: DistanceSmoother,
    board: AlertBoard,
    left_lane: LaneKalmanFilter,
    right_lane: LaneKalmanFilter,
}

impl AlertStabilizer {
    pub fn new(config: StabilizerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    pub fn with_defaults() -> Self {
        Self::build(StabilizerConfig::default())
    }

    fn build(config: StabilizerConfig) -> Self {
        let lane_filter = || {
            LaneKalmanFilter::new(
                config.lane_filter.process_variance,
                config.lane_filter.measurement_variance,
            )
        };
        Self {
            left_lane: lane_filter(),
            right_lane: lane_filter(),
            lane: LaneDepartureDebouncer::new(config.lane),
            collision: CollisionVoter::new(config.collision),
            distances: DistanceSmoother::new(config.distance),
            board: AlertBoard::new(config.alerts),
        }
    }

    pub fn stabilize_lane_departure(
        &mut self,
        is_departure: bool,
        confidence: f64,
        lane_position: Option<f64>,
    ) -> (bool, String) {
        self.lane.update(is_departure, confidence, lane_position)
    }

    pub fn stabilize_collision_warning(
        &mut self,
        ttc: Option<f64>,
        distance: f64,
        class: &str,
    ) -> (CollisionLevel, String) {
        self.collision.update(ttc, distance, class)
    }

    /// Last debounced lane-departure decision.
    pub fn lane_departure_active(&self) -> bool {
        self.lane.is_active()
    }

    pub fn smooth_distance(&mut self, track_id: TrackId, raw_distance: f64) -> f64 {
        self.distances.smooth(track_id, raw_distance)
    }

    /// Drop per-track state for ids that left the track table.
    pub fn retain_tracks(&mut self, active: &BTreeSet<TrackId>) {
        self.distances.retain_tracks(active);
    }

    /// Smooth `[a, b, c]` lane coefficients; malformed input comes back unchanged.
    pub fn smooth_lane_coefficients(&mut self, side: LaneSide, coefficients: &[f64]) -> Vec<f64> {
        match side {
            LaneSide::Left => self.left_lane.smooth(coefficients),
            LaneSide::Right => self.right_lane.smooth(coefficients),
        }
    }

    pub fn alerts(&self) -> &AlertBoard {
        &self.board
    }

    pub fn alerts_mut(&mut self) -> &mut AlertBoard {
        &mut self.board
    }

    pub fn tracked_distances(&self) -> usize {
        self.distances.len()
    }

    pub fn reset(&mut self) {
        self.lane.reset();
        self.collision.reset();
        self.distances.filters.clear();
        self.board.clear();
        self.left_lane.reset();
        self.right_lane.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // ---- lane departure ----

    #[test]
    fn test_lane_departure_needs_sustained_signal() {
        let mut lane = LaneDepartureDebouncer::new(LaneDepartureConfig::default());

        // A single departure frame does not raise
        let (active, _) = lane.update(true, 0.9, Some(0.8));
        assert!(!active);

        // Sustained departure eventually raises
        let mut raised_at = None;
        for frame in 1..15 {
            if lane.update(true, 0.9, Some(0.8)).0 {
                raised_at = Some(frame);
                break;
            }
        }
        // EMA crosses 0.5 on the second departure frame (0.3, 0.51)
        assert_eq!(raised_at, Some(1));
    }

    #[test]
    fn test_lane_departure_cooldown_holds_decision() {
        let config = LaneDepartureConfig::default();
        let mut lane = LaneDepartureDebouncer::new(config.clone());
        lane.update(true, 0.9, None);
        assert!(lane.update(true, 0.9, None).0);

        // Immediately contradictory input is held for the cooldown window
        for _ in 0..config.cooldown_frames {
            let (active, reason) = lane.update(false, 0.9, None);
            assert!(active);
            assert!(reason.starts_with("cooldown"));
        }
    }

    #[test]
    fn test_lane_departure_cooldown_counts_discarded_frames() {
        let config = LaneDepartureConfig::default();
        let mut lane = LaneDepartureDebouncer::new(config.clone());
        lane.update(true, 0.9, None);
        assert!(lane.update(true, 0.9, None).0);

        for _ in 0..config.cooldown_frames {
            assert!(lane.update(false, 0.1, None).0);
        }

        // Cooldown elapsed during the low-confidence frames
        let (_, reason) = lane.update(false, 0.9, None);
        assert!(!reason.starts_with("cooldown"), "{reason}");
    }

    #[test]
    fn test_lane_departure_low_confidence_discarded() {
        let mut lane = LaneDepartureDebouncer::new(LaneDepartureConfig::default());
        for _ in 0..20 {
            let (active, reason) = lane.update(true, 0.1, None);
            assert!(!active);
            assert!(reason.contains("low confidence"));
        }
        assert_eq!(lane.ema(), 0.0);
    }

    #[test]
    fn test_lane_departure_clears_after_return() {
        let mut lane = LaneDepartureDebouncer::new(LaneDepartureConfig::default());
        for _ in 0..10 {
            lane.update(true, 0.9, None);
        }
        assert!(lane.is_active());

        for _ in 0..40 {
            lane.update(false, 0.9, None);
        }
        assert!(!lane.is_active());
    }

    #[test]
    fn test_lane_departure_reason_includes_offset() {
        let mut lane = LaneDepartureDebouncer::new(LaneDepartureConfig::default());
        let (_, reason) = lane.update(false, 0.9, Some(-0.25));
        assert!(reason.contains("offset -0.25"), "{reason}");
    }

    #[test]
    fn test_confidence_weighting() {
        let mut lane = LaneDepartureDebouncer::new(LaneDepartureConfig::default());
        lane.history.push_back((true, 0.9));
        lane.history.push_back((false, 0.3));
        assert_relative_eq!(lane.weighted_fraction(), 0.75);
    }

    // ---- collision voting ----

    #[test]
    fn test_collision_six_danger_frames_is_critical() {
        let mut voter = CollisionVoter::new(CollisionConfig::default());
        let mut level = CollisionLevel::Safe;
        for _ in 0..6 {
            level = voter.update(Some(1.0), 12.0, "car").0;
        }
        assert_eq!(level, CollisionLevel::Critical);
    }

    #[test]
    fn test_collision_two_danger_frames_never_critical() {
        let mut voter = CollisionVoter::new(CollisionConfig::default());
        let ttcs = [None, Some(1.0), None, None, Some(1.0), None, None, None, None, None];
        for ttc in ttcs {
            let (level, _) = voter.update(ttc, 20.0, "car");
            assert_ne!(level, CollisionLevel::Critical);
        }
        assert_eq!(voter.level(), CollisionLevel::Safe);
    }

    #[test]
    fn test_collision_warning_threshold() {
        let mut voter = CollisionVoter::new(CollisionConfig::default());
        voter.update(Some(2.5), 30.0, "truck");
        voter.update(Some(2.5), 30.0, "truck");
        assert_eq!(voter.level(), CollisionLevel::Safe);

        let (level, message) = voter.update(Some(1.0), 25.0, "truck");
        assert_eq!(level, CollisionLevel::Warning);
        assert!(message.contains("truck"));
    }

    #[test]
    fn test_collision_receding_ttc_votes_safe() {
        let voter = CollisionVoter::new(CollisionConfig::default());
        assert_eq!(voter.vote_for(Some(-1.0)), 0);
        assert_eq!(voter.vote_for(Some(0.0)), 0);
        assert_eq!(voter.vote_for(None), 0);
        assert_eq!(voter.vote_for(Some(f64::NAN)), 0);
        assert_eq!(voter.vote_for(Some(1.49)), 2);
        assert_eq!(voter.vote_for(Some(1.5)), 1);
        assert_eq!(voter.vote_for(Some(3.0)), 0);
    }

    #[test]
    fn test_collision_window_slides() {
        let mut voter = CollisionVoter::new(CollisionConfig::default());
        for _ in 0..10 {
            voter.update(Some(1.0), 10.0, "car");
        }
        assert_eq!(voter.level(), CollisionLevel::Critical);

        // Five safe frames leave five danger votes in the window
        for _ in 0..5 {
            voter.update(None, 50.0, "car");
        }
        assert_eq!(voter.level(), CollisionLevel::Warning);
    }

    // ---- distance smoothing ----

    #[test]
    fn test_distance_filter_seeded_with_first_observation() {
        let mut smoother = DistanceSmoother::new(DistanceSmoothingConfig::default());
        assert_relative_eq!(smoother.smooth(7, 42.0), 42.0);

        let next = smoother.smooth(7, 40.0);
        assert!(next < 42.0 && next > 40.0);
    }

    #[test]
    fn test_distance_filters_independent_and_pruned() {
        let mut smoother = DistanceSmoother::new(DistanceSmoothingConfig::default());
        smoother.smooth(1, 10.0);
        smoother.smooth(2, 80.0);
        assert_eq!(smoother.len(), 2);

        smoother.retain_tracks(&BTreeSet::from([2]));
        assert_eq!(smoother.len(), 1);

        // Recreated lazily, seeded again
        assert_relative_eq!(smoother.smooth(1, 55.0), 55.0);
    }

    #[test]
    fn test_distance_non_finite_holds_estimate() {
        let mut smoother = DistanceSmoother::new(DistanceSmoothingConfig::default());
        smoother.smooth(1, 10.0);
        assert_relative_eq!(smoother.smooth(1, f64::NAN), 10.0);
        assert!(smoother.smooth(2, f64::NAN).is_nan());
        assert_eq!(smoother.len(), 1);
    }

    // ---- alert lifecycle ----

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_alert_refreshed_every_frame_never_disappears() {
        let mut board = AlertBoard::new(AlertLifecycleConfig::default());
        for t in (0..10_000).step_by(100) {
            board.raise("collision", AlertLevel::Critical, AlertPayload::message("brake"), ms(t));
            board.prune(ms(t));
            assert_eq!(board.len(), 1);
        }
        assert_eq!(board.get("collision", AlertLevel::Critical).unwrap().start_time, ms(0));
    }

    #[test]
    fn test_alert_minimum_display_duration() {
        let mut board = AlertBoard::new(AlertLifecycleConfig::default());
        board.raise("lane_departure", AlertLevel::Warning, AlertPayload::message("drift"), ms(0));

        assert!(board.prune(ms(2_999)).is_empty());
        assert_eq!(board.len(), 1);

        let evicted = board.prune(ms(3_001));
        assert_eq!(evicted.len(), 1);
        assert!(board.is_empty());
    }

    #[test]
    fn test_alert_cooldown_after_last_refresh() {
        let mut board = AlertBoard::new(AlertLifecycleConfig::default());
        board.raise("collision", AlertLevel::Warning, AlertPayload::message("a"), ms(0));
        board.raise("collision", AlertLevel::Warning, AlertPayload::message("b"), ms(2_800));

        // Display duration met, cooldown not yet
        assert!(board.prune(ms(3_500)).is_empty());
        assert_eq!(board.get("collision", AlertLevel::Warning).unwrap().payload.message, "b");

        // Persisted display + cooldown past the last refresh, gone strictly after
        assert!(board.prune(ms(3_799)).is_empty());
        assert_eq!(board.prune(ms(3_801)).len(), 1);
    }

    #[test]
    fn test_alert_keys_by_class_and_level() {
        let mut board = AlertBoard::new(AlertLifecycleConfig::default());
        assert!(board.raise("collision", AlertLevel::Warning, AlertPayload::message("w"), ms(0)));
        assert!(board.raise("collision", AlertLevel::Critical, AlertPayload::message("c"), ms(0)));
        assert!(!board.raise("collision", AlertLevel::Warning, AlertPayload::message("w"), ms(10)));
        assert_eq!(board.len(), 2);
    }

    #[test]
    fn test_full_board_keeps_alerts_inside_display_window() {
        let mut board = AlertBoard::new(AlertLifecycleConfig::default());
        for i in 0..32u64 {
            assert!(board.raise(format!("c{i}"), AlertLevel::Info, AlertPayload::message("seen"), ms(i)));
        }

        // Nothing has been shown for 3s yet: the newcomer is refused
        assert!(!board.raise("c32", AlertLevel::Info, AlertPayload::message("late"), ms(100)));
        assert_eq!(board.len(), 32);
        assert!(board.get("c0", AlertLevel::Info).is_some());
        assert!(board.get("c32", AlertLevel::Info).is_none());
    }

    #[test]
    fn test_full_board_evicts_expired_alert_first() {
        let config = AlertLifecycleConfig {
            max_active: 2,
            ..Default::default()
        };
        let mut board = AlertBoard::new(config);
        board.raise("a", AlertLevel::Critical, AlertPayload::message("a"), ms(0));
        board.raise("b", AlertLevel::Info, AlertPayload::message("b"), ms(0));
        board.raise("b", AlertLevel::Info, AlertPayload::message("b"), ms(3_500));

        // "a" is past display and cooldown, "b" was refreshed recently
        assert!(board.raise("c", AlertLevel::Info, AlertPayload::message("c"), ms(4_000)));
        assert!(board.get("a", AlertLevel::Critical).is_none());
        assert!(board.get("b", AlertLevel::Info).is_some());
    }

    #[test]
    fn test_full_board_higher_severity_replaces_lower() {
        let config = AlertLifecycleConfig {
            max_active: 2,
            ..Default::default()
        };
        let mut board = AlertBoard::new(config);
        board.raise("sign", AlertLevel::Info, AlertPayload::message("stop sign"), ms(0));
        board.raise("driver", AlertLevel::Warning, AlertPayload::message("drowsy"), ms(5));

        assert!(board.raise("car", AlertLevel::Critical, AlertPayload::message("brake"), ms(10)));
        assert!(board.get("sign", AlertLevel::Info).is_none());
        assert!(board.get("driver", AlertLevel::Warning).is_some());

        // Nothing below Info to replace: refused
        assert!(!board.raise("person", AlertLevel::Info, AlertPayload::message("p"), ms(20)));
        assert_eq!(board.len(), 2);
    }

    // ---- stabilizer ----

    #[test]
    fn test_stabilizer_lane_coefficients() {
        let mut stab = AlertStabilizer::with_defaults();
        stab.smooth_lane_coefficients(LaneSide::Left, &[0.0, 0.1, 300.0]);
        let smoothed = stab.smooth_lane_coefficients(LaneSide::Left, &[0.0, 0.1, 310.0]);
        assert!(smoothed[2] > 300.0 && smoothed[2] < 310.0);

        // The other side is independent
        let right = stab.smooth_lane_coefficients(LaneSide::Right, &[0.0, -0.1, 900.0]);
        assert_eq!(right, vec![0.0, -0.1, 900.0]);

        assert_eq!(stab.smooth_lane_coefficients(LaneSide::Left, &[1.0]), vec![1.0]);
    }

    #[test]
    fn test_stabilizer_invalid_config() {
        let mut config = StabilizerConfig::default();
        config.collision.critical_votes = 11;
        assert!(AlertStabilizer::new(config).is_err());

        let mut config = StabilizerConfig::default();
        config.lane.ema_alpha = 2.0;
        assert!(AlertStabilizer::new(config).is_err());
    }

    #[test]
    fn test_stabilizer_reset() {
        let mut stab = AlertStabilizer::with_defaults();
        stab.smooth_distance(1, 10.0);
        for _ in 0..6 {
            stab.stabilize_collision_warning(Some(1.0), 10.0, "car");
        }
        stab.reset();
        assert_eq!(stab.tracked_distances(), 0);
        assert_eq!(
            stab.stabilize_collision_warning(None, 10.0, "car").0,
            CollisionLevel::Safe
        );
    }
}
