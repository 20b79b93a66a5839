//! Camera projection for cross-modal highlighting.
//!
//! Points are mapped LiDAR → camera by the calibration extrinsic, then
//! through the radial+tangential (k1, k2, p1, p2, k3) distortion model and
//! the pinhole intrinsics. The result is cached per (camera, frame) together
//! with a bucketed reverse index for hover lookups.

use crate::geometry::Obb;
use nalgebra::{Matrix3, Matrix4, Point3, Vector2};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

/// Calibration loading errors
#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("Calibration parse error: {0}")]
    Parse(String),

    #[error("Invalid calibration matrix: {0}")]
    InvalidMatrix(String),

    #[error("Calibration I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pinhole intrinsics in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    /// From a row-major 3x3 camera matrix `[fx, s, cx, 0, fy, cy, 0, 0, 1]`.
    ///
    /// Skew is ignored.
    pub fn from_row_major(k: &[f64]) -> Result<Self, CalibrationError> {
        if k.len() != 9 {
            return Err(CalibrationError::InvalidMatrix(format!(
                "intrinsic needs 9 values, got {}",
                k.len()
            )));
        }
        let m = Matrix3::from_row_slice(k);
        if m[(0, 0)] <= 0.0 || m[(1, 1)] <= 0.0 {
            return Err(CalibrationError::InvalidMatrix("focal length must be positive".into()));
        }
        Ok(Self {
            fx: m[(0, 0)],
            fy: m[(1, 1)],
            cx: m[(0, 2)],
            cy: m[(1, 2)],
        })
    }
}

/// Brown–Conrady distortion coefficients. Missing values are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl Distortion {
    /// From coefficients in OpenCV order `(k1, k2, p1, p2, k3)`.
    ///
    /// Shorter slices leave the remaining terms at zero; extra terms are
    /// ignored.
    pub fn from_coefficients(c: &[f64]) -> Self {
        let at = |i: usize| c.get(i).copied().unwrap_or(0.0);
        Self {
            k1: at(0),
            k2: at(1),
            p1: at(2),
            p2: at(3),
            k3: at(4),
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    /// Distort normalized image coordinates.
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));
        let xd = x * radial + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        (xd, yd)
    }
}

/// Calibration file as stored next to a scene (one per camera).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationFile {
    /// Row-major 3x3 camera matrix
    pub intrinsic: Vec<f64>,

    /// Row-major 4x4 LiDAR → camera transform
    pub extrinsic: Vec<f64>,

    /// Distortion coefficients `(k1, k2, p1, p2, k3)`
    #[serde(default, alias = "dist_coeffs", skip_serializing_if = "Option::is_none")]
    pub distortion: Option<Vec<f64>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl CalibrationFile {
    pub fn from_json(json: &str) -> Result<Self, CalibrationError> {
        serde_json::from_str(json).map_err(|e| CalibrationError::Parse(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CalibrationError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Build a camera model. `default_size` is used when the file does not
    /// carry the image size.
    pub fn into_camera(self, name: impl Into<String>, default_size: (u32, u32)) -> Result<CameraModel, CalibrationError> {
        if self.extrinsic.len() != 16 {
            return Err(CalibrationError::InvalidMatrix(format!(
                "extrinsic needs 16 values, got {}",
                self.extrinsic.len()
            )));
        }
        Ok(CameraModel {
            name: name.into(),
            intrinsics: Intrinsics::from_row_major(&self.intrinsic)?,
            extrinsic: Matrix4::from_row_slice(&self.extrinsic),
            distortion: self
                .distortion
                .as_deref()
                .map(Distortion::from_coefficients)
                .unwrap_or_default(),
            width: self.width.unwrap_or(default_size.0),
            height: self.height.unwrap_or(default_size.1),
        })
    }
}

/// A calibrated camera.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraModel {
    pub name: String,
    pub intrinsics: Intrinsics,

    /// LiDAR → camera transform
    pub extrinsic: Matrix4<f64>,

    pub distortion: Distortion,
    pub width: u32,
    pub height: u32,
}

impl CameraModel {
    /// Project one LiDAR-frame point.
    ///
    /// Returns the pixel and the camera-space depth, or `None` when the
    /// point lies on or behind the camera plane or outside the image.
    pub fn project_point(&self, p: &Point3<f64>) -> Option<(Vector2<f64>, f64)> {
        let pc = self.extrinsic.transform_point(p);
        if pc.z <= 0.0 {
            return None;
        }

        let (xd, yd) = self.distortion.apply(pc.x / pc.z, pc.y / pc.z);
        let u = self.intrinsics.fx * xd + self.intrinsics.cx;
        let v = self.intrinsics.fy * yd + self.intrinsics.cy;

        let inside = u >= 0.0 && v >= 0.0 && u < self.width as f64 && v < self.height as f64;
        inside.then(|| (Vector2::new(u, v), pc.z))
    }

    /// Pixels of the 8 box corners; corners that do not project are `None`.
    pub fn project_obb(&self, obb: &Obb) -> [Option<Vector2<f64>>; 8] {
        obb.corners().map(|c| self.project_point(&c).map(|(px, _)| px))
    }
}

/// One point that landed in the image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectedPoint {
    pub index: usize,
    pub pixel: Vector2<f64>,
    pub depth: f64,
}

/// Projection of one frame into one camera.
///
/// Entries are sorted by point index. The reverse index buckets pixels into
/// square cells of `bucket_px` for radius queries.
#[derive(Debug, Clone)]
pub struct ProjectedPointSet {
    pub camera: String,
    pub frame: u32,
    points: Vec<ProjectedPoint>,
    bucket_px: f64,
    buckets: HashMap<(i64, i64), Vec<usize>>,

    /// Lowest and highest occupied cell on each axis
    cell_bounds: Option<((i64, i64), (i64, i64))>,
}

/// Project a point set. Free-function form of the projection contract.
pub fn project(points: &[Point3<f64>], camera: &CameraModel, frame: u32, bucket_px: f64) -> ProjectedPointSet {
    let projected: Vec<ProjectedPoint> = points
        .iter()
        .enumerate()
        .filter_map(|(index, p)| {
            camera
                .project_point(p)
                .map(|(pixel, depth)| ProjectedPoint { index, pixel, depth })
        })
        .collect();

    ProjectedPointSet::new(camera.name.clone(), frame, projected, bucket_px)
}

impl ProjectedPointSet {
    fn new(camera: String, frame: u32, points: Vec<ProjectedPoint>, bucket_px: f64) -> Self {
        let bucket_px = if bucket_px > 0.0 { bucket_px } else { 16.0 };
        let mut buckets: HashMap<(i64, i64), Vec<usize>> = HashMap::new();
        let mut cell_bounds: Option<((i64, i64), (i64, i64))> = None;
        for (slot, p) in points.iter().enumerate() {
            let cell = cell_of(&p.pixel, bucket_px);
            buckets.entry(cell).or_default().push(slot);
            cell_bounds = Some(match cell_bounds {
                None => (cell, cell),
                Some((lo, hi)) => ((lo.0.min(cell.0), lo.1.min(cell.1)), (hi.0.max(cell.0), hi.1.max(cell.1))),
            });
        }
        Self {
            camera,
            frame,
            points,
            bucket_px,
            buckets,
            cell_bounds,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProjectedPoint> {
        self.points.iter()
    }

    /// Pixel of point `index`, if it projected into the image.
    pub fn pixel_of(&self, index: usize) -> Option<Vector2<f64>> {
        self.points
            .binary_search_by_key(&index, |p| p.index)
            .ok()
            .map(|slot| self.points[slot].pixel)
    }

    /// Closest projected point to `(x, y)` within `radius` pixels.
    ///
    /// Ties on distance go to the nearer point in depth, then to the lower
    /// index. Non-finite queries find nothing.
    pub fn nearest_point_to_pixel(&self, x: f64, y: f64, radius: f64) -> Option<usize> {
        if !(radius >= 0.0 && radius.is_finite() && x.is_finite() && y.is_finite()) {
            return None;
        }
        let (min, max) = self.cell_bounds?;
        let target = Vector2::new(x, y);
        let r2 = radius * radius;

        let (lo_x, lo_y) = cell_of(&Vector2::new(x - radius, y - radius), self.bucket_px);
        let (hi_x, hi_y) = cell_of(&Vector2::new(x + radius, y + radius), self.bucket_px);
        let (lo_x, lo_y) = (lo_x.max(min.0), lo_y.max(min.1));
        let (hi_x, hi_y) = (hi_x.min(max.0), hi_y.min(max.1));
        if lo_x > hi_x || lo_y > hi_y {
            return None;
        }

        let mut best: Option<(f64, f64, usize)> = None;
        let mut consider = |p: &ProjectedPoint| {
            let d2 = (p.pixel - target).norm_squared();
            if d2 > r2 {
                return;
            }
            let candidate = (d2, p.depth, p.index);
            if best.map_or(true, |b| candidate.partial_cmp(&b) == Some(Ordering::Less)) {
                best = Some(candidate);
            }
        };

        let cells = (hi_x - lo_x + 1) as u128 * (hi_y - lo_y + 1) as u128;
        if cells > self.points.len() as u128 {
            self.points.iter().for_each(&mut consider);
        } else {
            for cx in lo_x..=hi_x {
                for cy in lo_y..=hi_y {
                    if let Some(slots) = self.buckets.get(&(cx, cy)) {
                        slots.iter().for_each(|&slot| consider(&self.points[slot]));
                    }
                }
            }
        }
        best.map(|(_, _, index)| index)
    }

    /// Indices of points whose pixel lies in the rectangle `[min, max]`,
    /// ascending. Used by the image-space rectangle selection tool.
    pub fn points_in_rect(&self, min: Vector2<f64>, max: Vector2<f64>) -> Vec<usize> {
        self.points
            .iter()
            .filter(|p| p.pixel.x >= min.x && p.pixel.y >= min.y && p.pixel.x <= max.x && p.pixel.y <= max.y)
            .map(|p| p.index)
            .collect()
    }
}

#[inline]
fn cell_of(pixel: &Vector2<f64>, bucket_px: f64) -> (i64, i64) {
    ((pixel.x / bucket_px).floor() as i64, (pixel.y / bucket_px).floor() as i64)
}

/// Projected point sets keyed by (camera, frame).
///
/// Invalidation is explicit: callers drop entries when the active frame,
/// the selected camera or a calibration changes.
#[derive(Debug, Default)]
pub struct ProjectionCache {
    entries: BTreeMap<(String, u32), ProjectedPointSet>,
    bucket_px: f64,
}

impl ProjectionCache {
    pub fn new(bucket_px: f64) -> Self {
        Self {
            entries: BTreeMap::new(),
            bucket_px,
        }
    }

    pub fn get(&self, camera: &str, frame: u32) -> Option<&ProjectedPointSet> {
        self.entries.get(&(camera.to_string(), frame))
    }

    pub fn contains(&self, camera: &str, frame: u32) -> bool {
        self.entries.contains_key(&(camera.to_string(), frame))
    }

    /// Cached projection, computing it when absent.
    pub fn get_or_project(&mut self, camera: &CameraModel, frame: u32, points: &[Point3<f64>]) -> &ProjectedPointSet {
        let bucket_px = self.bucket_px;
        self.entries
            .entry((camera.name.clone(), frame))
            .or_insert_with(|| {
                let set = project(points, camera, frame, bucket_px);
                debug!(camera = %camera.name, frame, projected = set.len(), "projection computed");
                set
            })
    }

    /// Replace the entry of (camera, frame) unconditionally.
    pub fn refresh(&mut self, camera: &CameraModel, frame: u32, points: &[Point3<f64>]) -> &ProjectedPointSet {
        self.invalidate(&camera.name, frame);
        self.get_or_project(camera, frame, points)
    }

    pub fn invalidate(&mut self, camera: &str, frame: u32) {
        self.entries.remove(&(camera.to_string(), frame));
    }

    /// Calibration of `camera` changed.
    pub fn invalidate_camera(&mut self, camera: &str) {
        self.entries.retain(|(c, _), _| c != camera);
    }

    /// Point cloud of `frame` changed.
    pub fn invalidate_frame(&mut self, frame: u32) {
        self.entries.retain(|(_, f), _| *f != frame);
    }

    /// Keep only entries of `frame` (active frame changed).
    pub fn retain_frame(&mut self, frame: u32) {
        self.entries.retain(|(_, f), _| *f == frame);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Load every `*.json` calibration in `dir`, keyed by file stem.
///
/// A file that fails to parse is skipped with a warning: the camera simply
/// has no overlay.
pub fn load_calibrations(dir: impl AsRef<Path>, default_size: (u32, u32)) -> BTreeMap<String, CameraModel> {
    let mut cameras = BTreeMap::new();
    let entries = match std::fs::read_dir(dir.as_ref()) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.as_ref().display(), "no calibration directory: {}", e);
            return cameras;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        match CalibrationFile::load(&path).and_then(|c| c.into_camera(name.clone(), default_size)) {
            Ok(camera) => {
                cameras.insert(name, camera);
            }
            Err(e) => warn!(camera = %name, "calibration skipped: {}", e),
        }
    }
    cameras
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Camera looking down +x of the LiDAR frame: cam z = lidar x,
    /// cam x = -lidar y, cam y = -lidar z.
    fn forward_camera() -> CameraModel {
        CalibrationFile {
            intrinsic: vec![500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0],
            extrinsic: vec![
                0.0, -1.0, 0.0, 0.0, //
                0.0, 0.0, -1.0, 0.0, //
                1.0, 0.0, 0.0, 0.0, //
                0.0, 0.0, 0.0, 1.0,
            ],
            distortion: None,
            width: Some(640),
            height: Some(480),
        }
        .into_camera("front", (1920, 1080))
        .unwrap()
    }

    #[test]
    fn test_point_on_axis_hits_principal_point() {
        let cam = forward_camera();
        let (px, depth) = cam.project_point(&Point3::new(10.0, 0.0, 0.0)).unwrap();
        assert_relative_eq!(px, Vector2::new(320.0, 240.0), epsilon = 1e-9);
        assert_relative_eq!(depth, 10.0, epsilon = 1e-12);
    }

    #[test]
    fn test_point_behind_camera_is_discarded() {
        let cam = forward_camera();
        assert!(cam.project_point(&Point3::new(-5.0, 0.0, 0.0)).is_none());

        let set = project(&[Point3::new(-5.0, 0.0, 0.0), Point3::new(5.0, 0.0, 0.0)], &cam, 0, 16.0);
        assert_eq!(set.len(), 1);
        assert!(set.pixel_of(0).is_none());
        assert!(set.pixel_of(1).is_some());
    }

    #[test]
    fn test_point_outside_image_is_discarded() {
        let cam = forward_camera();
        // Far to the left: u = 320 + 500 * 10 / 1
        assert!(cam.project_point(&Point3::new(1.0, -10.0, 0.0)).is_none());
    }

    #[test]
    fn test_distortion_moves_off_axis_points() {
        let mut cam = forward_camera();
        let p = Point3::new(10.0, -2.0, -1.0);
        let (plain, _) = cam.project_point(&p).unwrap();

        cam.distortion = Distortion::from_coefficients(&[0.1]);
        let (distorted, _) = cam.project_point(&p).unwrap();

        // Positive k1 pushes points away from the center
        assert!(distorted.x > plain.x);
        assert!(distorted.y > plain.y);

        // On-axis points are unaffected
        let (center, _) = cam.project_point(&Point3::new(10.0, 0.0, 0.0)).unwrap();
        assert_relative_eq!(center, Vector2::new(320.0, 240.0), epsilon = 1e-9);
    }

    #[test]
    fn test_distortion_defaults_to_zero() {
        let d = Distortion::from_coefficients(&[]);
        assert!(d.is_zero());
        assert_eq!(d.apply(0.3, -0.2), (0.3, -0.2));

        let partial = Distortion::from_coefficients(&[0.1, 0.01]);
        assert_eq!(partial.p1, 0.0);
        assert_eq!(partial.k3, 0.0);
    }

    #[test]
    fn test_calibration_json_parsing() {
        let json = r#"{
            "intrinsic": [1000, 0, 960, 0, 1000, 540, 0, 0, 1],
            "extrinsic": [1,0,0,0, 0,1,0,0, 0,0,1,0, 0,0,0,1],
            "dist_coeffs": [-0.1, 0.02, 0.001, 0.0005]
        }"#;
        let cam = CalibrationFile::from_json(json).unwrap().into_camera("left", (1920, 1080)).unwrap();
        assert_eq!(cam.width, 1920);
        assert_eq!(cam.intrinsics.cx, 960.0);
        assert_eq!(cam.distortion.p2, 0.0005);
        assert_eq!(cam.distortion.k3, 0.0);
    }

    #[test]
    fn test_bad_extrinsic_rejected() {
        let file = CalibrationFile {
            intrinsic: vec![500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0],
            extrinsic: vec![1.0; 12],
            distortion: None,
            width: None,
            height: None,
        };
        assert!(matches!(file.into_camera("bad", (640, 480)), Err(CalibrationError::InvalidMatrix(_))));
    }

    #[test]
    fn test_nearest_point_lookup() {
        let cam = forward_camera();
        let points = vec![
            Point3::new(10.0, 0.0, 0.0),   // (320, 240)
            Point3::new(10.0, -0.1, 0.0),  // (325, 240)
            Point3::new(10.0, -1.0, 0.0),  // (370, 240)
        ];
        let set = project(&points, &cam, 3, 8.0);

        assert_eq!(set.nearest_point_to_pixel(321.0, 240.0, 6.0), Some(0));
        assert_eq!(set.nearest_point_to_pixel(324.0, 241.0, 6.0), Some(1));
        assert_eq!(set.nearest_point_to_pixel(350.0, 240.0, 6.0), None);
        assert_eq!(set.nearest_point_to_pixel(350.0, 240.0, 30.0), Some(2));
    }

    #[test]
    fn test_nearest_with_huge_radius_stays_bounded() {
        let cam = forward_camera();
        let set = project(&[Point3::new(10.0, 0.0, 0.0)], &cam, 0, 16.0);

        // Scans at most the occupied cells, so these return immediately
        let start = std::time::Instant::now();
        assert_eq!(set.nearest_point_to_pixel(320.0, 240.0, 1.0e6), Some(0));
        assert_eq!(set.nearest_point_to_pixel(-5.0e5, 9.0e5, 2.0e6), Some(0));
        assert!(start.elapsed() < std::time::Duration::from_secs(1));

        assert_eq!(set.nearest_point_to_pixel(320.0, 240.0, f64::INFINITY), None);
        assert_eq!(set.nearest_point_to_pixel(f64::NAN, 240.0, 6.0), None);
        assert_eq!(set.nearest_point_to_pixel(320.0, 240.0, -1.0), None);

        let empty = project(&[], &cam, 0, 16.0);
        assert_eq!(empty.nearest_point_to_pixel(320.0, 240.0, 1.0e6), None);
    }

    #[test]
    fn test_nearest_prefers_closer_depth_on_tie() {
        let cam = forward_camera();
        // Same ray, different depth: identical pixel
        let points = vec![Point3::new(20.0, 0.0, 0.0), Point3::new(10.0, 0.0, 0.0)];
        let set = project(&points, &cam, 0, 16.0);
        assert_eq!(set.nearest_point_to_pixel(320.0, 240.0, 2.0), Some(1));
    }

    #[test]
    fn test_rect_selection() {
        let cam = forward_camera();
        let points = vec![
            Point3::new(10.0, 0.0, 0.0),
            Point3::new(10.0, -1.0, 0.0),
            Point3::new(10.0, 1.0, 0.0),
        ];
        let set = project(&points, &cam, 0, 16.0);
        let picked = set.points_in_rect(Vector2::new(300.0, 200.0), Vector2::new(400.0, 280.0));
        assert_eq!(picked, vec![0, 1]);
    }

    #[test]
    fn test_cache_keying_and_invalidation() {
        let cam = forward_camera();
        let points = vec![Point3::new(10.0, 0.0, 0.0)];
        let mut cache = ProjectionCache::new(16.0);

        cache.get_or_project(&cam, 0, &points);
        cache.get_or_project(&cam, 1, &points);
        assert_eq!(cache.len(), 2);

        cache.retain_frame(1);
        assert!(!cache.contains("front", 0));
        assert!(cache.contains("front", 1));

        cache.invalidate_camera("front");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_project_box_corners() {
        let cam = forward_camera();
        let obb = crate::geometry::Psr::axis_aligned(
            nalgebra::Vector3::new(10.0, 0.0, 0.0),
            nalgebra::Vector3::new(2.0, 2.0, 2.0),
        )
        .to_obb();
        let corners = cam.project_obb(&obb);
        assert!(corners.iter().all(Option::is_some));
    }
}
