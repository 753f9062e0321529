//! Ground truth oracle for simulation.
//!
//! The Oracle maintains the "God's eye view" of one drive:
//! - True ego kinematics and lane offset
//! - Road objects ahead of the ego vehicle (range, bearing, closing speed)
//! - Driver condition
//! - Noisy sensor and perception outputs generated from all of the above

use drivesafe_core::perception::{DriverState, LaneObservation};
use drivesafe_core::{BoundingBox, Detection};
use nalgebra::{Vector3, Vector6};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Camera model used to project objects into the image.
const FOCAL_PX: f64 = 800.0;
const IMAGE_CX: f64 = 640.0;
const IMAGE_CY: f64 = 360.0;

/// Lane offset (normalized, 1.0 = on the line) past which the lane front-end
/// reports a departure.
const DEPARTURE_OFFSET: f64 = 0.7;

/// Objects closer than this are considered passed or hit and leave the scene.
const MIN_RANGE_M: f64 = 0.5;

/// True ego state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgoVehicle {
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    /// `[roll, pitch, yaw]`
    pub orientation: Vector3<f64>,
    pub angular_velocity: Vector3<f64>,
    /// Normalized lateral offset from lane center, `[-1, 1]`
    pub lane_offset: f64,
    /// Normalized lane offset change per second
    pub lateral_drift: f64,
}

/// Something in front of the ego vehicle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoadObject {
    pub id: u64,
    pub class: String,
    /// Longitudinal range in meters
    pub range: f64,
    /// Lateral offset in meters (positive = right)
    pub lateral: f64,
    /// m/s, positive when approaching
    pub closing_speed: f64,
    /// Physical height in meters, for projection
    pub height: f64,
    pub active: bool,
}

impl RoadObject {
    /// True time to collision, if approaching.
    pub fn ttc(&self) -> Option<f64> {
        (self.closing_speed > 0.1).then(|| self.range / self.closing_speed)
    }
}

/// Per-sensor Gaussian noise, one standard deviation each.
#[derive(Debug, Clone)]
pub struct NoiseProfile {
    pub camera_m: f64,
    pub lidar_m: f64,
    pub gps_m: f64,
    pub imu: f64,
    pub bbox_px: f64,
    /// Range noise as a fraction of range
    pub range_fraction: f64,
    pub lane_offset: f64,
}

impl Default for NoiseProfile {
    fn default() -> Self {
        Self {
            camera_m: 0.3,
            lidar_m: 0.1,
            gps_m: 1.0,
            imu: 0.05,
            bbox_px: 2.0,
            range_fraction: 0.03,
            lane_offset: 0.05,
        }
    }
}

/// The Oracle - maintains ground truth and generates perception outputs.
pub struct Oracle {
    rng: ChaCha8Rng,
    ego: EgoVehicle,
    objects: BTreeMap<u64, RoadObject>,
    next_id: u64,
    current_time: f64,
    noise: NoiseProfile,
    /// Probability that the detector misses an object in a given frame
    detection_dropout: f64,
    driver_drowsy: bool,
}

impl Oracle {
    /// Creates an Oracle with the ego vehicle at the origin moving at `speed` m/s along x.
    pub fn new(physics_seed: u64, speed: f64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(physics_seed),
            ego: EgoVehicle {
                position: Vector3::zeros(),
                velocity: Vector3::new(speed, 0.0, 0.0),
                orientation: Vector3::zeros(),
                angular_velocity: Vector3::zeros(),
                lane_offset: 0.0,
                lateral_drift: 0.0,
            },
            objects: BTreeMap::new(),
            next_id: 0,
            current_time: 0.0,
            noise: NoiseProfile::default(),
            detection_dropout: 0.0,
            driver_drowsy: false,
        }
    }

    pub fn set_noise(&mut self, noise: NoiseProfile) {
        self.noise = noise;
    }

    pub fn set_detection_dropout(&mut self, probability: f64) {
        self.detection_dropout = probability.clamp(0.0, 1.0);
    }

    pub fn set_lateral_drift(&mut self, drift: f64) {
        self.ego.lateral_drift = drift;
    }

    pub fn set_driver_drowsy(&mut self, drowsy: bool) {
        self.driver_drowsy = drowsy;
    }

    /// Spawns an object ahead and returns its ID.
    pub fn spawn_object(&mut self, class: &str, range: f64, lateral: f64, closing_speed: f64) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let height = match class {
            "person" => 1.7,
            "truck" => 3.5,
            "stop_sign" | "yield_sign" => 0.8,
            _ => 1.5,
        };
        self.objects.insert(
            id,
            RoadObject {
                id,
                class: class.to_string(),
                range,
                lateral,
                closing_speed,
                height,
                active: true,
            },
        );
        id
    }

    pub fn set_closing_speed(&mut self, id: u64, closing_speed: f64) {
        if let Some(object) = self.objects.get_mut(&id) {
            object.closing_speed = closing_speed;
        }
    }

    /// Advances physics by dt seconds.
    pub fn step(&mut self, dt: f64) {
        self.current_time += dt;

        let ego = &mut self.ego;
        ego.position += ego.velocity * dt;
        ego.orientation += ego.angular_velocity * dt;
        ego.lane_offset = (ego.lane_offset + ego.lateral_drift * dt).clamp(-1.0, 1.0);

        for object in self.objects.values_mut().filter(|o| o.active) {
            object.range -= object.closing_speed * dt;
            if object.range < MIN_RANGE_M {
                object.active = false;
            }
        }
    }

    pub fn time(&self) -> f64 {
        self.current_time
    }

    pub fn ego(&self) -> &EgoVehicle {
        &self.ego
    }

    pub fn object(&self, id: u64) -> Option<&RoadObject> {
        self.objects.get(&id)
    }

    pub fn active_objects(&self) -> impl Iterator<Item = &RoadObject> {
        self.objects.values().filter(|o| o.active)
    }

    fn gaussian(&mut self, std_dev: f64) -> f64 {
        match Normal::new(0.0, std_dev) {
            Ok(normal) => normal.sample(&mut self.rng),
            Err(_) => 0.0,
        }
    }

    fn noisy_vector3(&mut self, truth: Vector3<f64>, std_dev: f64) -> Vector3<f64> {
        truth + Vector3::new(self.gaussian(std_dev), self.gaussian(std_dev), self.gaussian(std_dev))
    }

    pub fn camera_position(&mut self) -> Vector3<f64> {
        let std_dev = self.noise.camera_m;
        self.noisy_vector3(self.ego.position, std_dev)
    }

    pub fn lidar_position(&mut self) -> Vector3<f64> {
        let std_dev = self.noise.lidar_m;
        self.noisy_vector3(self.ego.position, std_dev)
    }

    pub fn gps_position(&mut self) -> Vector3<f64> {
        let std_dev = self.noise.gps_m;
        self.noisy_vector3(self.ego.position, std_dev)
    }

    /// `[roll, pitch, yaw, wx, wy, wz]`
    pub fn imu_reading(&mut self) -> Vector6<f64> {
        let std_dev = self.noise.imu;
        let o = self.noisy_vector3(self.ego.orientation, std_dev);
        let w = self.noisy_vector3(self.ego.angular_velocity, std_dev);
        Vector6::new(o.x, o.y, o.z, w.x, w.y, w.z)
    }

    /// Detector output for this frame: projected, jittered boxes with noisy
    /// range and the TTC derived from it.
    pub fn detections(&mut self) -> Vec<Detection> {
        let visible: Vec<RoadObject> = self.active_objects().cloned().collect();
        let mut detections = Vec::with_capacity(visible.len());

        for object in visible {
            if self.rng.gen::<f64>() < self.detection_dropout {
                continue;
            }

            let range = (object.range + self.gaussian(object.range * self.noise.range_fraction)).max(MIN_RANGE_M);
            let half_h = FOCAL_PX * object.height / object.range / 2.0;
            let half_w = half_h * if object.class == "person" { 0.4 } else { 1.2 };
            let cx = IMAGE_CX + FOCAL_PX * object.lateral / object.range + self.gaussian(self.noise.bbox_px);
            let cy = IMAGE_CY + self.gaussian(self.noise.bbox_px);
            let bbox = BoundingBox::new(cx - half_w, cy - half_h, cx + half_w, cy + half_h);

            let ttc = (object.closing_speed > 0.1).then(|| range / object.closing_speed);
            let confidence = 0.75 + 0.2 * self.rng.gen::<f64>();
            detections.push(Detection::new(object.class.clone(), confidence, bbox).with_range(range, ttc));
        }
        detections
    }

    /// Lane front-end output: noisy offset, departure flag and coefficients.
    pub fn lane_observation(&mut self) -> LaneObservation {
        let measured = self.ego.lane_offset + self.gaussian(self.noise.lane_offset);
        let shift = measured * 200.0;
        let curvature = 1e-4 + self.gaussian(1e-5);
        LaneObservation {
            left: Some(vec![curvature, 0.05 + self.gaussian(0.005), 340.0 - shift + self.gaussian(2.0)]),
            right: Some(vec![curvature, -0.05 + self.gaussian(0.005), 940.0 - shift + self.gaussian(2.0)]),
            departure: measured.abs() > DEPARTURE_OFFSET,
            confidence: 0.6 + 0.4 * self.rng.gen::<f64>(),
            lane_position: Some(measured),
        }
    }

    /// Driver-monitoring output: PERCLOS with noise.
    pub fn driver_state(&mut self) -> DriverState {
        let base = if self.driver_drowsy { 0.35 } else { 0.05 };
        let perclos = (base + self.gaussian(0.03)).clamp(0.0, 1.0);
        DriverState {
            perclos,
            drowsy: perclos > 0.2,
            confidence: 0.9,
        }
    }
}
