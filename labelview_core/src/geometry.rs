//! Geometry primitives for cuboid annotation.
//!
//! Everything here is pure and deterministic: Euler/quaternion conversion in
//! a fixed intrinsic XYZ order, 4x4 transform composition, oriented boxes and
//! ray picking.

use nalgebra::{Matrix4, Point3, Rotation3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Rotation built from intrinsic XYZ Euler angles: `R = Rx(x) * Ry(y) * Rz(z)`.
pub fn euler_xyz_to_quaternion(euler: &Vector3<f64>) -> UnitQuaternion<f64> {
    let qx = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), euler.x);
    let qy = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), euler.y);
    let qz = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), euler.z);
    qx * qy * qz
}

/// Inverse of [`euler_xyz_to_quaternion`].
///
/// Near gimbal lock (|pitch| = 90°) the z angle is folded into x and
/// reported as zero.
pub fn quaternion_to_euler_xyz(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    let m = q.to_rotation_matrix();
    let m = m.matrix();
    let m13 = m[(0, 2)].clamp(-1.0, 1.0);
    let y = m13.asin();

    if m13.abs() < 1.0 - 1.0e-12 {
        let x = (-m[(1, 2)]).atan2(m[(2, 2)]);
        let z = (-m[(0, 1)]).atan2(m[(0, 0)]);
        Vector3::new(x, y, z)
    } else {
        let x = m[(2, 1)].atan2(m[(1, 1)]);
        Vector3::new(x, y, 0.0)
    }
}

/// Rotate a vector by a quaternion.
#[inline]
pub fn rotate(q: &UnitQuaternion<f64>, v: &Vector3<f64>) -> Vector3<f64> {
    q.transform_vector(v)
}

/// Rigid transform (no scale) as a homogeneous matrix.
pub fn rigid_transform(translation: &Vector3<f64>, rotation: &UnitQuaternion<f64>) -> Matrix4<f64> {
    Translation3::from(*translation).to_homogeneous() * rotation.to_homogeneous()
}

/// Composition `a ∘ b`: apply `b` first, then `a`.
#[inline]
pub fn compose(a: &Matrix4<f64>, b: &Matrix4<f64>) -> Matrix4<f64> {
    a * b
}

/// Apply a homogeneous transform to a point.
#[inline]
pub fn transform_point(m: &Matrix4<f64>, p: &Point3<f64>) -> Point3<f64> {
    m.transform_point(p)
}

/// Position / Scale / Rotation pose of a cuboid.
///
/// `scale` holds full box extents in meters. `rotation` holds Euler angles
/// in radians, applied in intrinsic XYZ order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Psr {
    pub position: Vector3<f64>,
    pub scale: Vector3<f64>,
    pub rotation: Vector3<f64>,
}

impl Psr {
    pub fn new(position: Vector3<f64>, scale: Vector3<f64>, rotation: Vector3<f64>) -> Self {
        Self {
            position,
            scale,
            rotation,
        }
    }

    /// Axis-aligned pose (zero rotation).
    pub fn axis_aligned(position: Vector3<f64>, scale: Vector3<f64>) -> Self {
        Self::new(position, scale, Vector3::zeros())
    }

    /// True when every scale component is strictly positive and finite.
    pub fn has_valid_scale(&self) -> bool {
        self.scale.iter().all(|s| s.is_finite() && *s > 0.0)
    }

    #[inline]
    pub fn quaternion(&self) -> UnitQuaternion<f64> {
        euler_xyz_to_quaternion(&self.rotation)
    }

    #[inline]
    pub fn half_extents(&self) -> Vector3<f64> {
        self.scale * 0.5
    }

    /// Box-to-world transform including scale (unit cube → cuboid).
    pub fn to_matrix(&self) -> Matrix4<f64> {
        rigid_transform(&self.position, &self.quaternion()) * Matrix4::new_nonuniform_scaling(&self.scale)
    }

    pub fn to_obb(&self) -> Obb {
        Obb::new(Point3::from(self.position), self.quaternion(), self.half_extents())
    }
}

/// Oriented bounding box: center, orientation and half extents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Obb {
    pub center: Point3<f64>,
    pub rotation: UnitQuaternion<f64>,
    pub half_extents: Vector3<f64>,
}

impl Obb {
    pub fn new(center: Point3<f64>, rotation: UnitQuaternion<f64>, half_extents: Vector3<f64>) -> Self {
        Self {
            center,
            rotation,
            half_extents,
        }
    }

    /// Express a world point in the box's local frame.
    #[inline]
    pub fn to_local(&self, p: &Point3<f64>) -> Vector3<f64> {
        self.rotation.inverse_transform_vector(&(p - self.center))
    }

    /// Closed-box containment: points exactly on a face are inside.
    #[inline]
    pub fn contains(&self, p: &Point3<f64>) -> bool {
        let local = self.to_local(p);
        local.x.abs() <= self.half_extents.x
            && local.y.abs() <= self.half_extents.y
            && local.z.abs() <= self.half_extents.z
    }

    /// The 8 corners in world space.
    ///
    /// Order: bottom face (z-) counter-clockwise from (-x,-y), then top face
    /// (z+) in the same order.
    pub fn corners(&self) -> [Point3<f64>; 8] {
        let h = self.half_extents;
        let signs: [(f64, f64, f64); 8] = [
            (-1.0, -1.0, -1.0),
            (1.0, -1.0, -1.0),
            (1.0, 1.0, -1.0),
            (-1.0, 1.0, -1.0),
            (-1.0, -1.0, 1.0),
            (1.0, -1.0, 1.0),
            (1.0, 1.0, 1.0),
            (-1.0, 1.0, 1.0),
        ];
        signs.map(|(sx, sy, sz)| {
            self.center + self.rotation.transform_vector(&Vector3::new(sx * h.x, sy * h.y, sz * h.z))
        })
    }
}

/// A half-line used for picking cuboids under the cursor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub origin: Point3<f64>,
    pub direction: Vector3<f64>,
}

impl Ray {
    pub fn new(origin: Point3<f64>, direction: Vector3<f64>) -> Self {
        Self { origin, direction }
    }

    pub fn at(&self, t: f64) -> Point3<f64> {
        self.origin + self.direction * t
    }

    /// Entry distance (in units of `direction`) into an oriented box.
    ///
    /// Slab test in the box's local frame. A ray starting inside the box
    /// returns `Some(0.0)`.
    pub fn intersect_obb(&self, obb: &Obb) -> Option<f64> {
        let origin = obb.to_local(&self.origin);
        let dir = obb.rotation.inverse_transform_vector(&self.direction);

        let mut t_min = 0.0_f64;
        let mut t_max = f64::INFINITY;

        for axis in 0..3 {
            let h = obb.half_extents[axis];
            if dir[axis].abs() < f64::EPSILON {
                if origin[axis].abs() > h {
                    return None;
                }
                continue;
            }
            let inv = 1.0 / dir[axis];
            let mut t0 = (-h - origin[axis]) * inv;
            let mut t1 = (h - origin[axis]) * inv;
            if t0 > t1 {
                std::mem::swap(&mut t0, &mut t1);
            }
            t_min = t_min.max(t0);
            t_max = t_max.min(t1);
            if t_min > t_max {
                return None;
            }
        }

        Some(t_min)
    }
}

/// Rotation matrix of the inverse quaternion, for batch transforms.
#[inline]
pub fn inverse_rotation_matrix(q: &UnitQuaternion<f64>) -> Rotation3<f64> {
    q.inverse().to_rotation_matrix()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_euler_round_trip() {
        let euler = Vector3::new(0.3, -0.7, 1.2);
        let q = euler_xyz_to_quaternion(&euler);
        let back = quaternion_to_euler_xyz(&q);
        assert_relative_eq!(back, euler, epsilon = 1e-12);
    }

    #[test]
    fn test_euler_order_is_intrinsic_xyz() {
        // Pure yaw of 90° maps +x onto +y
        let q = euler_xyz_to_quaternion(&Vector3::new(0.0, 0.0, FRAC_PI_2));
        let v = rotate(&q, &Vector3::x());
        assert_relative_eq!(v, Vector3::y(), epsilon = 1e-12);

        // x then y: Rx(90°) * Ry(90°) applied to +x
        let q = euler_xyz_to_quaternion(&Vector3::new(FRAC_PI_2, FRAC_PI_2, 0.0));
        let v = rotate(&q, &Vector3::x());
        // Ry sends +x to -z, then Rx sends -z to +y
        assert_relative_eq!(v, Vector3::y(), epsilon = 1e-12);
    }

    #[test]
    fn test_gimbal_lock_conversion_is_stable() {
        let q = euler_xyz_to_quaternion(&Vector3::new(0.4, FRAC_PI_2, 0.0));
        let back = quaternion_to_euler_xyz(&q);
        let q2 = euler_xyz_to_quaternion(&back);
        assert!(q.angle_to(&q2) < 1e-6);
    }

    #[test]
    fn test_obb_closed_boundary() {
        let obb = Obb::new(Point3::origin(), UnitQuaternion::identity(), Vector3::new(1.0, 1.0, 1.0));
        assert!(obb.contains(&Point3::new(0.999, 0.0, 0.0)));
        assert!(obb.contains(&Point3::new(1.0, 0.0, 0.0)));
        assert!(!obb.contains(&Point3::new(1.001, 0.0, 0.0)));
    }

    #[test]
    fn test_rotated_obb_containment() {
        // 4 x 1 x 1 box rotated 90° about z: long axis now along y
        let psr = Psr::new(Vector3::zeros(), Vector3::new(4.0, 1.0, 1.0), Vector3::new(0.0, 0.0, FRAC_PI_2));
        let obb = psr.to_obb();
        assert!(obb.contains(&Point3::new(0.0, 1.9, 0.0)));
        assert!(!obb.contains(&Point3::new(1.9, 0.0, 0.0)));
    }

    #[test]
    fn test_corners_span_box() {
        let psr = Psr::axis_aligned(Vector3::new(1.0, 2.0, 3.0), Vector3::new(2.0, 4.0, 6.0));
        let corners = psr.to_obb().corners();
        assert_relative_eq!(corners[0], Point3::new(0.0, 0.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(corners[6], Point3::new(2.0, 4.0, 6.0), epsilon = 1e-12);
    }

    #[test]
    fn test_psr_matrix_maps_unit_cube_corner() {
        let psr = Psr::new(Vector3::new(5.0, 0.0, 0.0), Vector3::new(2.0, 2.0, 2.0), Vector3::new(0.0, 0.0, FRAC_PI_2));
        let m = psr.to_matrix();
        let corner = transform_point(&m, &Point3::new(0.5, 0.0, 0.0));
        assert_relative_eq!(corner, Point3::new(5.0, 1.0, 0.0), epsilon = 1e-12);

        let shifted = compose(&Translation3::new(0.0, 0.0, 1.0).to_homogeneous(), &m);
        let corner = transform_point(&shifted, &Point3::new(0.5, 0.0, 0.0));
        assert_relative_eq!(corner, Point3::new(5.0, 1.0, 1.0), epsilon = 1e-12);
    }

    #[test]
    fn test_ray_hits_box() {
        let obb = Psr::axis_aligned(Vector3::new(10.0, 0.0, 0.0), Vector3::new(2.0, 2.0, 2.0)).to_obb();
        let ray = Ray::new(Point3::origin(), Vector3::x());
        let t = ray.intersect_obb(&obb).unwrap();
        assert_relative_eq!(t, 9.0, epsilon = 1e-12);

        let miss = Ray::new(Point3::origin(), Vector3::y());
        assert!(miss.intersect_obb(&obb).is_none());

        let inside = Ray::new(Point3::new(10.0, 0.0, 0.0), Vector3::z());
        assert_eq!(inside.intersect_obb(&obb), Some(0.0));
    }

    #[test]
    fn test_scale_validation() {
        let ok = Psr::axis_aligned(Vector3::zeros(), Vector3::new(1.0, 1.0, 1.0));
        let zero = Psr::axis_aligned(Vector3::zeros(), Vector3::new(1.0, 0.0, 1.0));
        let negative = Psr::axis_aligned(Vector3::zeros(), Vector3::new(1.0, 1.0, -1.0));
        assert!(ok.has_valid_scale());
        assert!(!zero.has_valid_scale());
        assert!(!negative.has_valid_scale());
    }
}
