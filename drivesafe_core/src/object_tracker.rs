//! The "TRACKING" Engine - Frame-to-frame object association
//!
//! Turns raw per-frame detections into persistent tracks:
//! 1. Class gating (a pedestrian never associates with a car)
//! 2. IoU association against the previous track table
//! 3. Box smoothing (exponential blend toward the new detection)
//! 4. Aging and deletion of tracks that stop being observed
//!
//! Association sits behind the [`Associator`] trait. The default
//! [`GreedyIouAssociator`] is latency-bounded and deliberately not globally
//! optimal; a Hungarian assignment can be dropped in without touching callers.

use crate::config::{check_unit, ConfigError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

pub type TrackId = u64;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the ObjectTracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Minimum IoU (exclusive) for a detection to match a track (default: 0.2)
    pub iou_threshold: f64,

    /// Weight of the new detection in the box blend (default: 0.8)
    pub smoothing_alpha: f64,

    /// Consecutive missed frames tolerated before deletion (default: 10 ≈ 1s at 10fps)
    pub max_disappeared: u32,

    /// Frames a track must be seen before it is reported (default: 1 = immediately)
    pub min_stable_frames: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.2,
            smoothing_alpha: 0.8,
            max_disappeared: 10,
            min_stable_frames: 1,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_unit("tracker.iou_threshold", self.iou_threshold)?;
        check_unit("tracker.smoothing_alpha", self.smoothing_alpha)?;
        if self.min_stable_frames == 0 {
            return Err(ConfigError::Invalid(
                "tracker.min_stable_frames must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// GEOMETRY
// ============================================================================

/// Axis-aligned box in image pixels, `(x1, y1)` top-left, `(x2, y2)` bottom-right.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    #[inline]
    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    #[inline]
    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }

    /// Signed area; non-positive for degenerate or inverted boxes.
    #[inline]
    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.x1 + self.x2) * 0.5, (self.y1 + self.y2) * 0.5)
    }

    pub fn is_finite(&self) -> bool {
        self.x1.is_finite() && self.y1.is_finite() && self.x2.is_finite() && self.y2.is_finite()
    }

    /// Intersection over union.
    ///
    /// Returns 0.0 when the boxes do not overlap or either has non-positive area.
    pub fn iou(&self, other: &BoundingBox) -> f64 {
        if self.area() <= 0.0 || other.area() <= 0.0 {
            return 0.0;
        }

        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);

        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        if inter <= 0.0 {
            return 0.0;
        }

        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// `alpha · other + (1 − alpha) · self`, coordinate-wise.
    pub fn blend(&self, other: &BoundingBox, alpha: f64) -> BoundingBox {
        let mix = |prev: f64, new: f64| alpha * new + (1.0 - alpha) * prev;
        BoundingBox {
            x1: mix(self.x1, other.x1),
            y1: mix(self.y1, other.y1),
            x2: mix(self.x2, other.x2),
            y2: mix(self.y2, other.y2),
        }
    }
}

// ============================================================================
// DETECTIONS & TRACKS
// ============================================================================

/// A single detector output for one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Detector label, e.g. "car", "person", "stop_sign"
    pub class: String,

    /// Detector score [0.0 - 1.0]
    pub confidence: f64,

    pub bbox: BoundingBox,

    /// Estimated range in meters, when the front-end provides one
    pub distance: Option<f64>,

    /// Time to collision in seconds (positive = approaching)
    pub ttc: Option<f64>,
}

impl Detection {
    pub fn new(class: impl Into<String>, confidence: f64, bbox: BoundingBox) -> Self {
        Self {
            class: class.into(),
            confidence,
            bbox,
            distance: None,
            ttc: None,
        }
    }

    pub fn with_range(mut self, distance: f64, ttc: Option<f64>) -> Self {
        self.distance = Some(distance);
        self.ttc = ttc;
        self
    }

    fn is_valid(&self) -> bool {
        self.bbox.is_finite() && self.confidence.is_finite()
    }
}

/// A persistent identity for one physical object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub track_id: TrackId,
    pub class: String,

    /// Smoothed box
    pub bbox: BoundingBox,

    pub confidence: f64,

    /// Consecutive frames without a matching detection
    pub last_seen_frames: u32,

    /// Frames this track has been matched (including creation)
    pub stable_frames: u32,

    pub distance: Option<f64>,
    pub ttc: Option<f64>,
}

impl Track {
    fn from_detection(track_id: TrackId, detection: &Detection) -> Self {
        Self {
            track_id,
            class: detection.class.clone(),
            bbox: detection.bbox,
            confidence: detection.confidence,
            last_seen_frames: 0,
            stable_frames: 1,
            distance: detection.distance,
            ttc: detection.ttc,
        }
    }

    fn absorb(&mut self, detection: &Detection, alpha: f64) {
        self.bbox = self.bbox.blend(&detection.bbox, alpha);
        self.confidence = detection.confidence;
        self.distance = detection.distance;
        self.ttc = detection.ttc;
        self.last_seen_frames = 0;
        self.stable_frames = self.stable_frames.saturating_add(1);
    }
}

// ============================================================================
// ASSOCIATION
// ============================================================================

/// Strategy that pairs this frame's detections with existing tracks.
pub trait Associator: Send {
    /// Returns, for every detection, the index into `tracks` it matched.
    ///
    /// `tracks` is ordered by track id (oldest first). A track index must
    /// appear at most once in the result.
    fn associate(
        &self,
        detections: &[Detection],
        tracks: &[&Track],
        iou_threshold: f64,
    ) -> Vec<Option<usize>>;
}

/// Greedy per-detection association.
///
/// Detections are visited in input order; each takes the same-class,
/// not-yet-claimed track with the highest IoU strictly above the threshold.
/// Equal IoUs keep the first-seen track.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedyIouAssociator;

impl Associator for GreedyIouAssociator {
    fn associate(
        &self,
        detections: &[Detection],
        tracks: &[&Track],
        iou_threshold: f64,
    ) -> Vec<Option<usize>> {
        let mut claimed = vec![false; tracks.len()];

        detections
            .iter()
            .map(|detection| {
                let mut best: Option<(usize, f64)> = None;
                for (idx, track) in tracks.iter().enumerate() {
                    if claimed[idx] || track.class != detection.class {
                        continue;
                    }
                    let iou = track.bbox.iou(&detection.bbox);
                    if iou <= iou_threshold {
                        continue;
                    }
                    if best.map_or(true, |(_, best_iou)| iou > best_iou) {
                        best = Some((idx, iou));
                    }
                }

                best.map(|(idx, _)| {
                    claimed[idx] = true;
                    idx
                })
            })
            .collect()
    }
}

// ============================================================================
// OBJECT TRACKER (The Engine)
// ============================================================================

/// Maintains the track table across frames.
pub struct ObjectTracker<A: Associator = GreedyIouAssociator> {
    /// Active tracks, keyed (and therefore ordered) by id
    tracks: BTreeMap<TrackId, Track>,

    next_id: TrackId,

    config: TrackerConfig,

    associator: A,
}

impl ObjectTracker<GreedyIouAssociator> {
    /// Create a tracker using greedy IoU association.
    pub fn new(config: TrackerConfig) -> Result<Self, ConfigError> {
        Self::with_associator(config, GreedyIouAssociator)
    }

    /// Create a tracker with default configuration.
    pub fn with_defaults() -> Self {
        Self {
            tracks: BTreeMap::new(),
            next_id: 1,
            config: TrackerConfig::default(),
            associator: GreedyIouAssociator,
        }
    }
}

impl<A: Associator> ObjectTracker<A> {
    /// Create a tracker with a custom association strategy.
    pub fn with_associator(config: TrackerConfig, associator: A) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            tracks: BTreeMap::new(),
            next_id: 1,
            config,
            associator,
        })
    }

    /// Process one frame of detections and return this frame's stable tracks.
    ///
    /// The result holds every track matched or created this frame whose
    /// `stable_frames` reached `min_stable_frames`, ordered by id. Tracks
    /// that were only coasting are not reported.
    pub fn update(&mut self, detections: &[Detection]) -> Vec<Track> {
        let owned: Vec<Detection> = detections
            .iter()
            .filter(|d| {
                let ok = d.is_valid();
                if !ok {
                    debug!(class = %d.class, "dropping detection with non-finite geometry");
                }
                ok
            })
            .cloned()
            .collect();

        // Stage 1 & 2: class gating + association
        let assignments: Vec<Option<TrackId>> = {
            let ordered: Vec<&Track> = self.tracks.values().collect();
            self.associator
                .associate(&owned, &ordered, self.config.iou_threshold)
                .into_iter()
                .map(|slot| slot.and_then(|idx| ordered.get(idx).map(|t| t.track_id)))
                .collect()
        };

        // Stage 3: update matched tracks, create new ones
        let mut touched = BTreeSet::new();
        for (detection, assignment) in owned.iter().zip(assignments) {
            let id = match assignment.and_then(|id| self.tracks.get_mut(&id).map(|t| (id, t))) {
                Some((id, track)) => {
                    track.absorb(detection, self.config.smoothing_alpha);
                    id
                }
                None => self.create_track(detection),
            };
            touched.insert(id);
        }

        // Stage 4: age everything that was not observed
        self.age_unmatched(&touched);

        touched
            .iter()
            .filter_map(|id| self.tracks.get(id))
            .filter(|t| t.stable_frames >= self.config.min_stable_frames)
            .cloned()
            .collect()
    }

    fn create_track(&mut self, detection: &Detection) -> TrackId {
        let id = self.next_id;
        self.next_id += 1;
        debug!(track_id = id, class = %detection.class, "new track");
        self.tracks.insert(id, Track::from_detection(id, detection));
        id
    }

    fn age_unmatched(&mut self, touched: &BTreeSet<TrackId>) {
        let max_disappeared = self.config.max_disappeared;
        self.tracks.retain(|id, track| {
            if touched.contains(id) {
                return true;
            }
            track.last_seen_frames = track.last_seen_frames.saturating_add(1);
            let keep = track.last_seen_frames <= max_disappeared;
            if !keep {
                debug!(track_id = id, "track expired");
            }
            keep
        });
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn get_track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(&id)
    }

    /// All tracks in the table, including ones currently coasting.
    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn active_ids(&self) -> BTreeSet<TrackId> {
        self.tracks.keys().copied().collect()
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Drop every track. Ids keep increasing across resets.
    pub fn reset(&mut self) {
        self.tracks.clear();
    }
}

// ============================================================================
// TESTS
// ============================================================================
