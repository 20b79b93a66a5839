//! Point-in-cuboid classification and the per-frame membership cache.

use crate::geometry::{inverse_rotation_matrix, Obb};
use crate::keyframes::{TrackId, TrackSet};
use nalgebra::{Point3, UnitQuaternion, Vector3};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// Indices of `points` inside the closed oriented box.
///
/// Each point is moved into the box frame (subtract center, apply the
/// inverse rotation) and compared per axis against the half extents, with
/// no tolerance. A hidden box (`visible == false`) contains nothing.
pub fn classify(
    points: &[Point3<f64>],
    center: &Point3<f64>,
    rotation: &UnitQuaternion<f64>,
    half_extents: &Vector3<f64>,
    visible: bool,
) -> Vec<usize> {
    if !visible {
        return Vec::new();
    }

    let inverse = inverse_rotation_matrix(rotation);
    let h = half_extents;

    points
        .iter()
        .enumerate()
        .filter_map(|(i, p)| {
            let local = inverse * (p - center);
            (local.x.abs() <= h.x && local.y.abs() <= h.y && local.z.abs() <= h.z).then_some(i)
        })
        .collect()
}

/// Convenience wrapper over [`classify`] for an [`Obb`].
pub fn classify_obb(points: &[Point3<f64>], obb: &Obb, visible: bool) -> Vec<usize> {
    classify(points, &obb.center, &obb.rotation, &obb.half_extents, visible)
}

/// Cached membership sets keyed by (frame, track).
///
/// The cache never tracks dependencies on its own. Every mutation that
/// moves a cuboid or reloads a point cloud must call one of the
/// `invalidate_*` methods; [`MembershipCache::refresh`] then recomputes the
/// dirty entries of one frame.
#[derive(Debug, Default)]
pub struct MembershipCache {
    sets: HashMap<(u32, TrackId), Vec<usize>>,

    /// Entries known to be stale
    dirty: BTreeSet<(u32, TrackId)>,

    /// Frames whose every entry is stale (point cloud reloaded)
    dirty_frames: BTreeSet<u32>,

    /// Tracks whose entries are stale on every frame
    dirty_tracks: BTreeSet<TrackId>,
}

impl MembershipCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Membership of `track` at `frame`, if computed and fresh.
    pub fn get(&self, frame: u32, track: &TrackId) -> Option<&[usize]> {
        if self.is_stale(frame, track) {
            return None;
        }
        self.sets.get(&(frame, track.clone())).map(Vec::as_slice)
    }

    pub fn invalidate(&mut self, frame: u32, track: &TrackId) {
        self.dirty.insert((frame, track.clone()));
    }

    /// The point cloud of `frame` changed.
    pub fn invalidate_frame(&mut self, frame: u32) {
        self.dirty_frames.insert(frame);
    }

    /// A keyframe of `track` changed, so every derived frame may move.
    pub fn invalidate_track(&mut self, track: &TrackId) {
        self.dirty_tracks.insert(track.clone());
    }

    /// Drop everything (scene change).
    pub fn clear(&mut self) {
        self.sets.clear();
        self.dirty.clear();
        self.dirty_frames.clear();
        self.dirty_tracks.clear();
    }

    fn is_stale(&self, frame: u32, track: &TrackId) -> bool {
        self.dirty_frames.contains(&frame)
            || self.dirty_tracks.contains(track)
            || self.dirty.contains(&(frame, track.clone()))
    }

    /// True when `frame` has a stale or missing entry for any track.
    pub fn needs_update(&self, frame: u32, tracks: &TrackSet) -> bool {
        tracks
            .ids()
            .any(|id| self.is_stale(frame, id) || !self.sets.contains_key(&(frame, id.clone())))
    }

    /// Recompute stale or missing entries of `frame`.
    ///
    /// Pose-less tracks get an empty set. Returns the number of entries
    /// recomputed.
    pub fn refresh(&mut self, frame: u32, points: &[Point3<f64>], tracks: &TrackSet) -> usize {
        let mut recomputed = 0;

        for track in tracks.iter() {
            let key = (frame, track.id.clone());
            if !self.is_stale(frame, &track.id) && self.sets.contains_key(&key) {
                continue;
            }

            let members = match track.interpolate(frame) {
                Ok(pose) => classify(
                    points,
                    &Point3::from(pose.psr.position),
                    &pose.rotation,
                    &pose.psr.half_extents(),
                    pose.visible,
                ),
                Err(_) => Vec::new(),
            };

            self.dirty.remove(&key);
            self.sets.insert(key, members);
            recomputed += 1;
        }

        // Removed tracks leave orphans behind
        self.sets
            .retain(|(f, id), _| *f != frame || tracks.get(id).is_some());
        self.dirty_frames.remove(&frame);

        // Entries of invalidated tracks on other frames were computed from
        // old keyframes; drop them so they count as missing.
        for id in std::mem::take(&mut self.dirty_tracks) {
            self.sets.retain(|(f, track_id), _| *track_id != id || *f == frame);
        }

        if recomputed > 0 {
            debug!(frame, recomputed, "membership refreshed");
        }
        recomputed
    }

    /// Per-track point counts of `frame`, in id order.
    pub fn point_counts(&self, frame: u32) -> BTreeMap<TrackId, usize> {
        self.sets
            .iter()
            .filter(|((f, id), _)| *f == frame && !self.is_stale(frame, id))
            .map(|((_, id), members)| (id.clone(), members.len()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Psr;
    use crate::keyframes::Track;
    use proptest::prelude::*;
    use std::f64::consts::PI;

    fn unit_box() -> (Point3<f64>, UnitQuaternion<f64>, Vector3<f64>) {
        (Point3::origin(), UnitQuaternion::identity(), Vector3::new(1.0, 1.0, 1.0))
    }

    #[test]
    fn test_boundary_scenario() {
        let (c, q, h) = unit_box();
        let points = vec![Point3::new(0.999, 0.0, 0.0), Point3::new(1.001, 0.0, 0.0)];
        assert_eq!(classify(&points, &c, &q, &h, true), vec![0]);
    }

    #[test]
    fn test_points_on_faces_are_inside() {
        let (c, q, h) = unit_box();
        let points = vec![
            Point3::new(1.0, 1.0, 1.0),
            Point3::new(-1.0, 0.0, 0.0),
            Point3::new(0.0, -1.0, 1.0),
        ];
        assert_eq!(classify(&points, &c, &q, &h, true), vec![0, 1, 2]);
    }

    #[test]
    fn test_hidden_box_contains_nothing() {
        let (c, q, h) = unit_box();
        let points = vec![Point3::origin()];
        assert!(classify(&points, &c, &q, &h, false).is_empty());
    }

    #[test]
    fn test_classify_obb_matches_contains() {
        let obb = Psr::new(Vector3::new(3.0, 1.0, 0.0), Vector3::new(4.0, 2.0, 1.0), Vector3::new(0.0, 0.0, 0.6)).to_obb();
        let points: Vec<Point3<f64>> = (0..400)
            .map(|i| {
                let f = i as f64;
                Point3::new((f * 0.37).sin() * 6.0 + 3.0, (f * 0.73).cos() * 4.0 + 1.0, (f * 0.11).sin())
            })
            .collect();

        let expected: Vec<usize> = points
            .iter()
            .enumerate()
            .filter(|(_, p)| obb.contains(p))
            .map(|(i, _)| i)
            .collect();
        assert!(!expected.is_empty());
        assert_eq!(classify_obb(&points, &obb, true), expected);
    }

    fn scene_tracks() -> TrackSet {
        let mut tracks = TrackSet::new(10);
        tracks.insert(
            Track::from_keyframes(
                TrackId::Int(1),
                "Car",
                10,
                vec![
                    (0, Psr::axis_aligned(Vector3::zeros(), Vector3::new(2.0, 2.0, 2.0))),
                    (9, Psr::axis_aligned(Vector3::new(9.0, 0.0, 0.0), Vector3::new(2.0, 2.0, 2.0))),
                ],
            )
            .unwrap(),
        );
        tracks
    }

    #[test]
    fn test_cache_refresh_and_invalidation() {
        let mut tracks = scene_tracks();
        let points = vec![Point3::new(0.5, 0.0, 0.0), Point3::new(5.0, 0.0, 0.0)];
        let mut cache = MembershipCache::new();
        let id = TrackId::Int(1);

        assert!(cache.needs_update(0, &tracks));
        assert_eq!(cache.refresh(0, &points, &tracks), 1);
        assert_eq!(cache.get(0, &id), Some(&[0usize][..]));
        assert!(!cache.needs_update(0, &tracks));
        assert_eq!(cache.refresh(0, &points, &tracks), 0);

        // Move the box over the second point
        tracks
            .get_mut(&id)
            .unwrap()
            .insert_keyframe(0, Psr::axis_aligned(Vector3::new(5.0, 0.0, 0.0), Vector3::new(2.0, 2.0, 2.0)))
            .unwrap();
        cache.invalidate_track(&id);
        assert!(cache.get(0, &id).is_none());
        assert_eq!(cache.refresh(0, &points, &tracks), 1);
        assert_eq!(cache.get(0, &id), Some(&[1usize][..]));
        assert_eq!(cache.point_counts(0).get(&id), Some(&1));
    }

    #[test]
    fn test_frame_invalidation_after_point_reload() {
        let tracks = scene_tracks();
        let mut cache = MembershipCache::new();
        let id = TrackId::Int(1);

        cache.refresh(0, &[Point3::origin()], &tracks);
        cache.invalidate_frame(0);
        assert!(cache.needs_update(0, &tracks));

        cache.refresh(0, &[Point3::new(50.0, 0.0, 0.0)], &tracks);
        assert_eq!(cache.get(0, &id), Some(&[][..]));
    }

    #[test]
    fn test_removed_track_entries_are_dropped() {
        let mut tracks = scene_tracks();
        let mut cache = MembershipCache::new();
        cache.refresh(0, &[Point3::origin()], &tracks);

        tracks.remove(&TrackId::Int(1));
        cache.refresh(0, &[Point3::origin()], &tracks);
        assert!(cache.point_counts(0).is_empty());
    }

    proptest! {
        #[test]
        fn prop_membership_is_rotation_invariant(
            axis in prop::array::uniform3(-1.0f64..1.0),
            angle in -PI..PI,
            box_euler in prop::array::uniform3(-PI..PI),
            point in prop::array::uniform3(-3.0f64..3.0),
        ) {
            let axis = Vector3::from(axis);
            prop_assume!(axis.norm() > 1e-3);
            let spin = UnitQuaternion::from_axis_angle(&nalgebra::Unit::new_normalize(axis), angle);

            let psr = Psr::new(Vector3::new(0.2, -0.1, 0.3), Vector3::new(2.0, 3.0, 1.5), Vector3::from(box_euler));
            let obb = psr.to_obb();
            let p = Point3::from(Vector3::from(point));

            // Keep clear of the faces so rounding cannot flip the result
            let local = obb.to_local(&p);
            let margin = (obb.half_extents - local.abs()).abs().min();
            prop_assume!(margin > 1e-9);

            let before = classify(&[p], &obb.center, &obb.rotation, &obb.half_extents, true);

            let center = spin * obb.center;
            let rotation = spin * obb.rotation;
            let moved = spin * p;
            let after = classify(&[moved], &center, &rotation, &obb.half_extents, true);

            prop_assert_eq!(before, after);
        }
    }
}
