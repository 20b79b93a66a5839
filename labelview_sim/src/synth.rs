//! Synthetic LiDAR scenes with known ground truth.
//!
//! The synthesizer plays the part of the world:
//! - Cuboid objects moving at constant velocity and yaw rate, one per lane
//! - A noisy ground plane below every object
//! - Points sampled strictly inside each object box, every frame
//! - One forward-looking pinhole camera

use labelview_core::geometry::{euler_xyz_to_quaternion, Psr};
use labelview_core::pointcloud::{Frame, PointCloud};
use labelview_core::projection::{CameraModel, Distortion, Intrinsics};
use nalgebra::{Matrix4, Point3, Vector3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal, Uniform};
use std::collections::BTreeMap;

/// Height of the ground plane in the LiDAR frame
const GROUND_Z: f64 = -1.7;

/// Gap between the ground and the bottom of every object
const CLEARANCE: f64 = 0.1;

/// Lateral distance between object lanes
const LANE_WIDTH: f64 = 10.0;

/// Camera name used by every synthetic scene
pub const FRONT_CAMERA: &str = "front";

/// A ground truth object.
#[derive(Debug, Clone, PartialEq)]
pub struct TruthObject {
    pub class: String,

    /// Box center on frame 0
    pub start: Vector3<f64>,

    /// Displacement per frame
    pub velocity: Vector3<f64>,

    /// Full box extents
    pub scale: Vector3<f64>,

    /// Heading on frame 0 (radians)
    pub yaw: f64,

    /// Heading change per frame
    pub yaw_rate: f64,
}

impl TruthObject {
    /// True pose on `frame`.
    pub fn psr_at(&self, frame: u32) -> Psr {
        let f = frame as f64;
        Psr::new(
            self.start + self.velocity * f,
            self.scale,
            Vector3::new(0.0, 0.0, self.yaw + self.yaw_rate * f),
        )
    }
}

/// Scene size.
#[derive(Debug, Clone)]
pub struct SynthConfig {
    pub frame_count: u32,
    pub object_count: usize,
    pub ground_points: usize,

    /// Points placed inside each object box per frame
    pub points_per_object: usize,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            frame_count: 12,
            object_count: 3,
            ground_points: 400,
            points_per_object: 60,
        }
    }
}

/// A generated scene.
#[derive(Debug, Clone)]
pub struct SynthScene {
    pub frames: Vec<Frame>,
    pub objects: Vec<TruthObject>,
    pub cameras: BTreeMap<String, CameraModel>,

    /// Index of the first point of object `i` on every frame
    pub object_offsets: Vec<usize>,
    pub points_per_object: usize,
}

impl SynthScene {
    pub fn frame_count(&self) -> u32 {
        self.frames.len() as u32
    }

    /// Point indices generated inside object `object`.
    pub fn object_points(&self, object: usize) -> std::ops::Range<usize> {
        let start = self.object_offsets.get(object).copied().unwrap_or(0);
        start..start + self.points_per_object
    }
}

/// Seeded scene generator.
pub struct SceneSynth {
    rng: ChaCha8Rng,
    config: SynthConfig,
}

impl SceneSynth {
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, SynthConfig::default())
    }

    pub fn with_config(seed: u64, config: SynthConfig) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            config,
        }
    }

    pub fn generate(&mut self) -> SynthScene {
        let objects: Vec<TruthObject> = (0..self.config.object_count).map(|i| self.spawn_object(i)).collect();

        let ground = self.config.ground_points;
        let per_object = self.config.points_per_object;
        let object_offsets = (0..objects.len()).map(|i| ground + i * per_object).collect();

        let frames = (0..self.config.frame_count)
            .map(|index| {
                let mut cloud = PointCloud::default();
                self.sample_ground(&mut cloud);
                for object in &objects {
                    self.sample_object(&mut cloud, &object.psr_at(index));
                }
                Frame {
                    index,
                    file_name: format!("{:06}.bin", index),
                    cloud,
                }
            })
            .collect();

        SynthScene {
            frames,
            objects,
            cameras: BTreeMap::from([(FRONT_CAMERA.to_string(), front_camera())]),
            object_offsets,
            points_per_object: per_object,
        }
    }

    fn spawn_object(&mut self, lane: usize) -> TruthObject {
        let n = self.config.object_count as f64;
        let scale = Vector3::new(
            self.rng.gen_range(3.5..4.8),
            self.rng.gen_range(1.6..2.1),
            self.rng.gen_range(1.4..1.9),
        );
        let start = Vector3::new(
            self.rng.gen_range(8.0..30.0),
            (lane as f64 - (n - 1.0) / 2.0) * LANE_WIDTH,
            GROUND_Z + CLEARANCE + scale.z / 2.0,
        );
        let velocity = Vector3::new(self.rng.gen_range(-1.5..1.5), self.rng.gen_range(-0.05..0.05), 0.0);

        TruthObject {
            class: if lane % 2 == 0 { "Car" } else { "Van" }.to_string(),
            start,
            velocity,
            scale,
            yaw: self.rng.gen_range(-0.4..0.4),
            yaw_rate: self.rng.gen_range(-0.03..0.03),
        }
    }

    fn sample_ground(&mut self, cloud: &mut PointCloud) {
        let xs = Uniform::new(-40.0, 60.0);
        let ys = Uniform::new(-30.0, 30.0);
        for _ in 0..self.config.ground_points {
            // Clamped below CLEARANCE so the ground never reaches a box
            let dz: f64 = self.rng.sample::<f64, _>(StandardNormal) * 0.01;
            let z = GROUND_Z + dz.clamp(-0.03, 0.03);
            cloud.positions.push(Point3::new(xs.sample(&mut self.rng), ys.sample(&mut self.rng), z));
            cloud.intensity.push(self.rng.gen_range(0.0..0.3));
        }
    }

    fn sample_object(&mut self, cloud: &mut PointCloud, psr: &Psr) {
        let rotation = euler_xyz_to_quaternion(&psr.rotation);
        let inner = Uniform::new_inclusive(-0.45, 0.45);
        for _ in 0..self.config.points_per_object {
            let local = Vector3::new(
                inner.sample(&mut self.rng) * psr.scale.x,
                inner.sample(&mut self.rng) * psr.scale.y,
                inner.sample(&mut self.rng) * psr.scale.z,
            );
            cloud.positions.push(Point3::from(psr.position + rotation * local));
            cloud.intensity.push(self.rng.gen_range(0.3..1.0));
        }
    }
}

/// 1280x720 pinhole looking down +x of the LiDAR frame, no distortion.
pub fn front_camera() -> CameraModel {
    #[rustfmt::skip]
    let extrinsic = Matrix4::new(
        0.0, -1.0,  0.0, 0.0,
        0.0,  0.0, -1.0, 0.0,
        1.0,  0.0,  0.0, 0.0,
        0.0,  0.0,  0.0, 1.0,
    );
    CameraModel {
        name: FRONT_CAMERA.to_string(),
        intrinsics: Intrinsics {
            fx: 700.0,
            fy: 700.0,
            cx: 640.0,
            cy: 360.0,
        },
        extrinsic,
        distortion: Distortion::default(),
        width: 1280,
        height: 720,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labelview_core::classifier::classify_obb;

    #[test]
    fn test_generation_is_deterministic() {
        let a = SceneSynth::new(42).generate();
        let b = SceneSynth::new(42).generate();
        assert_eq!(a.objects, b.objects);
        assert_eq!(a.frames[3].cloud.positions, b.frames[3].cloud.positions);

        let c = SceneSynth::new(43).generate();
        assert_ne!(a.objects, c.objects);
    }

    #[test]
    fn test_object_points_lie_inside_their_box_only() {
        let scene = SceneSynth::new(7).generate();
        for frame in [0u32, 5, 11] {
            let points = &scene.frames[frame as usize].cloud.positions;
            assert_eq!(points.len(), 400 + 3 * 60);
            for (i, object) in scene.objects.iter().enumerate() {
                let inside = classify_obb(points, &object.psr_at(frame).to_obb(), true);
                assert_eq!(inside, scene.object_points(i).collect::<Vec<_>>());
            }
        }
    }

    #[test]
    fn test_truth_is_linear() {
        let scene = SceneSynth::new(3).generate();
        let object = &scene.objects[0];
        let mid = object.psr_at(6);
        let ends = (object.psr_at(0), object.psr_at(12));
        approx::assert_relative_eq!(mid.position, (ends.0.position + ends.1.position) / 2.0, epsilon = 1e-12);
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(32))]

        #[test]
        fn prop_membership_matches_truth_for_any_seed(seed in proptest::prelude::any::<u64>()) {
            let config = SynthConfig { frame_count: 4, object_count: 4, ground_points: 100, points_per_object: 20 };
            let scene = SceneSynth::with_config(seed, config).generate();
            let last = scene.frame_count() - 1;
            let points = &scene.frames[last as usize].cloud.positions;
            for (i, object) in scene.objects.iter().enumerate() {
                let inside = classify_obb(points, &object.psr_at(last).to_obb(), true);
                proptest::prop_assert_eq!(inside, scene.object_points(i).collect::<Vec<_>>());
            }
        }
    }
}
