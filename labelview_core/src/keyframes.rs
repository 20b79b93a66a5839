//! The "TIMELINE" Engine - keyframed cuboid tracks
//!
//! A track stores a sparse set of authored poses (keyframes) on the frame
//! axis. Poses for every other frame are derived:
//! - Position and scale blend linearly between the bracketing keyframes
//! - Rotation blends by shortest-path slerp on quaternions
//! - Outside the keyframed range the pose holds at the nearest keyframe
//!
//! Visibility is layered on top: explicit per-frame flags written by
//! [`Track::set_visibility`] win over the visibility of the nearest prior
//! keyframe.

use crate::geometry::{quaternion_to_euler_xyz, Psr};
use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;
use thiserror::Error;

/// Stable identifier of a cuboid track.
///
/// Scenes written by different tools use either integer or string ids; both
/// are accepted and round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TrackId {
    Int(i64),
    Str(String),
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackId::Int(n) => write!(f, "{}", n),
            TrackId::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for TrackId {
    fn from(n: i64) -> Self {
        TrackId::Int(n)
    }
}

impl From<&str> for TrackId {
    fn from(s: &str) -> Self {
        TrackId::Str(s.to_string())
    }
}

/// Pose errors surfaced to callers of the timeline engine.
#[derive(Debug, Error, PartialEq)]
pub enum PoseError {
    #[error("Invalid pose at frame {frame}: scale must be positive, got {scale:?}")]
    InvalidPose { frame: u32, scale: [f64; 3] },

    #[error("Track {0} has no keyframes")]
    NoPoseDefined(TrackId),

    #[error("Track not found: {0}")]
    TrackNotFound(TrackId),
}

/// An explicitly authored pose.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keyframe {
    pub psr: Psr,
    pub visible: bool,
}

/// Derived pose of a track at one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterpolatedPose {
    /// Pose with rotation expressed as intrinsic XYZ Euler angles
    pub psr: Psr,

    /// Rotation as a unit quaternion (the interpolated quantity)
    pub rotation: UnitQuaternion<f64>,

    pub visible: bool,

    /// True when the frame carries an authored keyframe
    pub is_keyframe: bool,
}

/// Timeline markers for the frame scrubber.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Markers {
    /// Frames carrying a keyframe, ascending
    pub keyframes: Vec<u32>,

    /// Frames whose visibility differs from the previous frame, ascending
    pub visibility_boundaries: Vec<u32>,
}

/// One cuboid object tracked across the scene.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub id: TrackId,

    /// Semantic class (e.g. "Car", "Pedestrian")
    pub class: String,

    /// Display color as RGB
    pub color: Option<[u8; 3]>,

    /// Free-form attribute tags carried through the solution file
    pub attributes: Vec<String>,

    /// Number of frames in the scene (visibility spans clamp to it)
    frame_count: u32,

    keyframes: BTreeMap<u32, Keyframe>,

    /// Explicit per-frame visibility written by `set_visibility`
    visibility: BTreeMap<u32, bool>,
}

impl Track {
    /// Create a pose-less track.
    pub fn new(id: TrackId, class: impl Into<String>, frame_count: u32) -> Self {
        Self {
            id,
            class: class.into(),
            color: None,
            attributes: Vec::new(),
            frame_count,
            keyframes: BTreeMap::new(),
            visibility: BTreeMap::new(),
        }
    }

    /// Build a track from keyframes given in any order.
    ///
    /// Later duplicates of a frame overwrite earlier ones.
    pub fn from_keyframes(
        id: TrackId,
        class: impl Into<String>,
        frame_count: u32,
        keyframes: impl IntoIterator<Item = (u32, Psr)>,
    ) -> Result<Self, PoseError> {
        let mut track = Self::new(id, class, frame_count);
        for (frame, psr) in keyframes {
            track.insert_keyframe(frame, psr)?;
        }
        Ok(track)
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    pub fn set_frame_count(&mut self, frame_count: u32) {
        self.frame_count = frame_count;
    }

    pub fn has_pose(&self) -> bool {
        !self.keyframes.is_empty()
    }

    pub fn is_keyframe(&self, frame: u32) -> bool {
        self.keyframes.contains_key(&frame)
    }

    pub fn keyframe(&self, frame: u32) -> Option<&Keyframe> {
        self.keyframes.get(&frame)
    }

    /// Keyframes in ascending frame order.
    pub fn keyframes(&self) -> impl Iterator<Item = (u32, &Keyframe)> {
        self.keyframes.iter().map(|(f, k)| (*f, k))
    }

    pub fn keyframe_count(&self) -> usize {
        self.keyframes.len()
    }

    /// Inclusive range of keyframed frames.
    pub fn keyframe_range(&self) -> Option<RangeInclusive<u32>> {
        let first = *self.keyframes.keys().next()?;
        let last = *self.keyframes.keys().next_back()?;
        Some(first..=last)
    }

    /// Insert or overwrite the keyframe at `frame`.
    ///
    /// A new keyframe inherits the visibility the track currently has at
    /// that frame; the first keyframe of a track is visible.
    pub fn insert_keyframe(&mut self, frame: u32, psr: Psr) -> Result<(), PoseError> {
        let visible = if self.has_pose() { self.visibility_at(frame) } else { true };
        self.insert_keyframe_with_visibility(frame, psr, visible)
    }

    pub fn insert_keyframe_with_visibility(&mut self, frame: u32, psr: Psr, visible: bool) -> Result<(), PoseError> {
        if !psr.has_valid_scale() {
            return Err(PoseError::InvalidPose {
                frame,
                scale: [psr.scale.x, psr.scale.y, psr.scale.z],
            });
        }
        self.keyframes.insert(frame, Keyframe { psr, visible });
        Ok(())
    }

    /// Remove the keyframe at `frame`. Returns whether one was removed.
    ///
    /// Removing the last keyframe leaves the track pose-less.
    pub fn remove_keyframe(&mut self, frame: u32) -> bool {
        self.keyframes.remove(&frame).is_some()
    }

    /// Derived pose at `frame`.
    pub fn interpolate(&self, frame: u32) -> Result<InterpolatedPose, PoseError> {
        if let Some(key) = self.keyframes.get(&frame) {
            return Ok(InterpolatedPose {
                psr: key.psr,
                rotation: key.psr.quaternion(),
                visible: self.visibility_at(frame),
                is_keyframe: true,
            });
        }

        let before = self.keyframes.range(..frame).next_back();
        let after = self.keyframes.range(frame..).next();

        match (before, after) {
            (Some((&f0, k0)), Some((&f1, k1))) => {
                let t = (frame - f0) as f64 / (f1 - f0) as f64;
                let rotation = slerp(&k0.psr.quaternion(), &k1.psr.quaternion(), t);
                Ok(InterpolatedPose {
                    psr: Psr::new(
                        lerp(&k0.psr.position, &k1.psr.position, t),
                        lerp(&k0.psr.scale, &k1.psr.scale, t),
                        quaternion_to_euler_xyz(&rotation),
                    ),
                    rotation,
                    visible: self.visibility_at(frame),
                    is_keyframe: false,
                })
            }
            // Hold outside the keyframed range
            (Some((_, k)), None) | (None, Some((_, k))) => Ok(InterpolatedPose {
                psr: k.psr,
                rotation: k.psr.quaternion(),
                visible: self.visibility_at(frame),
                is_keyframe: false,
            }),
            (None, None) => Err(PoseError::NoPoseDefined(self.id.clone())),
        }
    }

    /// Visibility at `frame`: explicit flag, else nearest prior keyframe,
    /// else the first keyframe. Pose-less tracks are never visible.
    pub fn visibility_at(&self, frame: u32) -> bool {
        if let Some(v) = self.visibility.get(&frame) {
            return *v;
        }
        self.keyframes
            .range(..=frame)
            .next_back()
            .or_else(|| self.keyframes.iter().next())
            .map(|(_, k)| k.visible)
            .unwrap_or(false)
    }

    /// Write `visible` over the segment around `frame`.
    ///
    /// The segment runs from the nearest keyframe strictly before `frame` to
    /// the nearest keyframe strictly after it, both inclusive. Before the
    /// first keyframe it starts at frame 0; after the last it runs to the
    /// final frame of the scene. Returns the span written.
    pub fn set_visibility(&mut self, frame: u32, visible: bool) -> Result<RangeInclusive<u32>, PoseError> {
        if !self.has_pose() {
            return Err(PoseError::NoPoseDefined(self.id.clone()));
        }

        let start = self.keyframes.range(..frame).next_back().map(|(f, _)| *f).unwrap_or(0);
        let end = match self.keyframes.range(frame.saturating_add(1)..).next() {
            Some((f, _)) => *f,
            None => self.frame_count.saturating_sub(1).max(frame),
        };

        for f in start..=end {
            self.visibility.insert(f, visible);
        }
        Ok(start..=end)
    }

    /// Keep only the keyframes listed in `frames`.
    ///
    /// Used after loading a per-frame solution, where every frame arrives
    /// as a keyframe and the authored ones are known from edit markers.
    /// Visibility of dropped frames is preserved as explicit flags. When
    /// none of `frames` is a keyframe, the track is left unchanged.
    pub fn retain_keyframes(&mut self, frames: &BTreeSet<u32>) -> usize {
        if !self.keyframes.keys().any(|f| frames.contains(f)) {
            return 0;
        }
        let dropped: Vec<u32> = self
            .keyframes
            .keys()
            .copied()
            .filter(|f| !frames.contains(f))
            .collect();
        for frame in &dropped {
            if let Some(key) = self.keyframes.remove(frame) {
                self.visibility.entry(*frame).or_insert(key.visible);
            }
        }
        dropped.len()
    }

    /// Timeline markers.
    pub fn find_markers(&self) -> Markers {
        let keyframes: Vec<u32> = self.keyframes.keys().copied().collect();

        let last_known = self
            .keyframes
            .keys()
            .chain(self.visibility.keys())
            .copied()
            .max()
            .map(|f| f.saturating_add(1))
            .unwrap_or(0);
        let frame_count = self.frame_count.max(last_known);

        let mut visibility_boundaries = Vec::new();
        if self.has_pose() && frame_count > 1 {
            let mut previous = self.visibility_at(0);
            for frame in 1..frame_count {
                let current = self.visibility_at(frame);
                if current != previous {
                    visibility_boundaries.push(frame);
                }
                previous = current;
            }
        }

        Markers {
            keyframes,
            visibility_boundaries,
        }
    }
}

#[inline]
fn lerp(a: &Vector3<f64>, b: &Vector3<f64>, t: f64) -> Vector3<f64> {
    a + (b - a) * t
}

/// Shortest-path slerp; falls back to nlerp when the inputs nearly coincide.
fn slerp(q0: &UnitQuaternion<f64>, q1: &UnitQuaternion<f64>, t: f64) -> UnitQuaternion<f64> {
    let q1 = if q0.coords.dot(&q1.coords) < 0.0 {
        UnitQuaternion::new_unchecked(-q1.into_inner())
    } else {
        *q1
    };
    q0.try_slerp(&q1, t, 1.0e-9).unwrap_or_else(|| q0.nlerp(&q1, t))
}

/// All tracks of one scene.
#[derive(Debug, Clone, Default)]
pub struct TrackSet {
    frame_count: u32,
    tracks: BTreeMap<TrackId, Track>,
}

impl TrackSet {
    pub fn new(frame_count: u32) -> Self {
        Self {
            frame_count,
            tracks: BTreeMap::new(),
        }
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    /// Resize the scene; every track's visibility spans follow.
    pub fn set_frame_count(&mut self, frame_count: u32) {
        self.frame_count = frame_count;
        for track in self.tracks.values_mut() {
            track.set_frame_count(frame_count);
        }
    }

    /// Insert a track, replacing one with the same id.
    pub fn insert(&mut self, mut track: Track) -> Option<Track> {
        track.set_frame_count(self.frame_count);
        self.tracks.insert(track.id.clone(), track)
    }

    pub fn remove(&mut self, id: &TrackId) -> Option<Track> {
        self.tracks.remove(id)
    }

    pub fn get(&self, id: &TrackId) -> Option<&Track> {
        self.tracks.get(id)
    }

    pub fn get_mut(&mut self, id: &TrackId) -> Option<&mut Track> {
        self.tracks.get_mut(id)
    }

    /// Tracks in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &TrackId> {
        self.tracks.keys()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Next free integer id (one past the largest integer id in use).
    pub fn next_int_id(&self) -> TrackId {
        let max = self
            .tracks
            .keys()
            .filter_map(|id| match id {
                TrackId::Int(n) => Some(*n),
                TrackId::Str(_) => None,
            })
            .max();
        TrackId::Int(max.map(|n| n + 1).unwrap_or(1))
    }

    /// Derived poses of every track at `frame`, in id order.
    pub fn poses_at(&self, frame: u32) -> Vec<(&Track, Result<InterpolatedPose, PoseError>)> {
        self.tracks.values().map(|t| (t, t.interpolate(frame))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::euler_xyz_to_quaternion;
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use std::f64::consts::{FRAC_PI_2, PI};

    fn cube(x: f64) -> Psr {
        Psr::axis_aligned(Vector3::new(x, 0.0, 0.0), Vector3::new(2.0, 2.0, 2.0))
    }

    fn two_key_track() -> Track {
        Track::from_keyframes(TrackId::Int(1), "Car", 20, vec![(0, cube(0.0)), (10, cube(10.0))]).unwrap()
    }

    #[test]
    fn test_midpoint_interpolation() {
        let track = two_key_track();
        let pose = track.interpolate(5).unwrap();
        assert_relative_eq!(pose.psr.position, Vector3::new(5.0, 0.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(pose.psr.scale, Vector3::new(2.0, 2.0, 2.0), epsilon = 1e-12);
        assert!(!pose.is_keyframe);
    }

    #[test]
    fn test_keyframe_boundaries_are_exact() {
        let p0 = Psr::new(Vector3::new(0.1, 0.2, 0.3), Vector3::new(1.5, 2.5, 3.5), Vector3::new(0.1, 0.2, 0.3));
        let p1 = Psr::new(Vector3::new(7.7, -3.1, 0.9), Vector3::new(4.0, 1.0, 2.0), Vector3::new(-0.4, 0.0, 2.9));
        let track = Track::from_keyframes(TrackId::Int(3), "Truck", 30, vec![(4, p0), (17, p1)]).unwrap();

        assert_eq!(track.interpolate(4).unwrap().psr, p0);
        assert_eq!(track.interpolate(17).unwrap().psr, p1);
    }

    #[test]
    fn test_hold_outside_keyframe_range() {
        let track = Track::from_keyframes(TrackId::Int(1), "Car", 50, vec![(10, cube(1.0)), (20, cube(2.0))]).unwrap();
        assert_eq!(track.interpolate(0).unwrap().psr, cube(1.0));
        assert_eq!(track.interpolate(45).unwrap().psr, cube(2.0));
    }

    #[test]
    fn test_unsorted_input_interpolates_in_frame_order() {
        let track = Track::from_keyframes(
            TrackId::Int(1),
            "Car",
            30,
            vec![(20, cube(20.0)), (0, cube(0.0)), (10, cube(10.0))],
        )
        .unwrap();
        let pose = track.interpolate(15).unwrap();
        assert_relative_eq!(pose.psr.position.x, 15.0, epsilon = 1e-12);
        assert_eq!(track.find_markers().keyframes, vec![0, 10, 20]);
    }

    #[test]
    fn test_insert_overwrites_same_frame() {
        let mut track = two_key_track();
        track.insert_keyframe(10, cube(4.0)).unwrap();
        assert_eq!(track.keyframe_count(), 2);
        assert_eq!(track.interpolate(10).unwrap().psr, cube(4.0));
    }

    #[test]
    fn test_invalid_scale_rejected() {
        let mut track = two_key_track();
        let bad = Psr::axis_aligned(Vector3::zeros(), Vector3::new(1.0, 0.0, 1.0));
        let err = track.insert_keyframe(5, bad).unwrap_err();
        assert!(matches!(err, PoseError::InvalidPose { frame: 5, .. }));
        assert!(!track.is_keyframe(5));
    }

    #[test]
    fn test_remove_last_keyframe_leaves_track_poseless() {
        let mut track = Track::from_keyframes(TrackId::Int(9), "Car", 10, vec![(3, cube(0.0))]).unwrap();
        assert!(!track.remove_keyframe(4));
        assert!(track.remove_keyframe(3));
        assert_eq!(track.interpolate(3), Err(PoseError::NoPoseDefined(TrackId::Int(9))));
        assert!(!track.visibility_at(3));

        track.insert_keyframe(6, cube(1.0)).unwrap();
        assert!(track.interpolate(3).is_ok());
    }

    #[test]
    fn test_rotation_uses_shortest_path() {
        // 170° and -170° yaw are 20° apart through 180°
        let a = Psr::new(Vector3::zeros(), Vector3::new(1.0, 1.0, 1.0), Vector3::new(0.0, 0.0, 170f64.to_radians()));
        let b = Psr::new(Vector3::zeros(), Vector3::new(1.0, 1.0, 1.0), Vector3::new(0.0, 0.0, -170f64.to_radians()));
        let track = Track::from_keyframes(TrackId::Int(1), "Car", 3, vec![(0, a), (2, b)]).unwrap();

        let mid = track.interpolate(1).unwrap();
        assert_relative_eq!(mid.psr.rotation.z.abs(), PI, epsilon = 1e-9);
    }

    #[test]
    fn test_quarter_turn_slerp() {
        let a = Psr::new(Vector3::zeros(), Vector3::new(1.0, 1.0, 1.0), Vector3::zeros());
        let b = Psr::new(Vector3::zeros(), Vector3::new(1.0, 1.0, 1.0), Vector3::new(0.0, 0.0, FRAC_PI_2));
        let track = Track::from_keyframes(TrackId::Int(1), "Car", 5, vec![(0, a), (4, b)]).unwrap();

        let pose = track.interpolate(2).unwrap();
        assert_relative_eq!(pose.psr.rotation.z, FRAC_PI_2 / 2.0, epsilon = 1e-12);
        assert_relative_eq!(pose.rotation.angle(), FRAC_PI_2 / 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_set_visibility_spans_whole_segment() {
        let mut track = two_key_track();
        let span = track.set_visibility(5, false).unwrap();
        assert_eq!(span, 0..=10);
        for frame in 0..=10 {
            assert!(!track.visibility_at(frame), "frame {} should be hidden", frame);
        }
        // Beyond the last keyframe visibility falls back to the keyframe flag
        assert!(track.visibility_at(11));
        assert!(!track.interpolate(5).unwrap().visible);
    }

    #[test]
    fn test_set_visibility_after_last_keyframe_runs_to_scene_end() {
        let mut track = two_key_track();
        let span = track.set_visibility(15, false).unwrap();
        assert_eq!(span, 10..=19);
        assert!(!track.visibility_at(10) && !track.visibility_at(19));
        assert!(track.visibility_at(9));
    }

    #[test]
    fn test_set_visibility_on_poseless_track_fails() {
        let mut track = Track::new(TrackId::from("ped-1"), "Pedestrian", 10);
        assert!(matches!(track.set_visibility(2, false), Err(PoseError::NoPoseDefined(_))));
    }

    #[test]
    fn test_markers_report_visibility_boundaries() {
        let mut track = Track::from_keyframes(
            TrackId::Int(1),
            "Car",
            30,
            vec![(0, cube(0.0)), (10, cube(1.0)), (20, cube(2.0))],
        )
        .unwrap();
        track.set_visibility(15, false).unwrap();

        let markers = track.find_markers();
        assert_eq!(markers.keyframes, vec![0, 10, 20]);
        // Hidden 10..=20, visible again from 21 via keyframe 20's flag
        assert_eq!(markers.visibility_boundaries, vec![10, 21]);
    }

    #[test]
    fn test_retain_keyframes_preserves_visibility() {
        let mut track = Track::new(TrackId::Int(1), "Car", 5);
        for frame in 0..5 {
            track
                .insert_keyframe_with_visibility(frame, cube(frame as f64), frame != 2)
                .unwrap();
        }
        let markers: BTreeSet<u32> = [0, 4].into_iter().collect();
        assert_eq!(track.retain_keyframes(&markers), 3);

        assert_eq!(track.find_markers().keyframes, vec![0, 4]);
        assert!(!track.visibility_at(2));
        assert!(track.visibility_at(3));
        assert_relative_eq!(track.interpolate(2).unwrap().psr.position.x, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_track_set_next_int_id() {
        let mut set = TrackSet::new(10);
        assert_eq!(set.next_int_id(), TrackId::Int(1));
        set.insert(Track::new(TrackId::Int(4), "Car", 0));
        set.insert(Track::new(TrackId::from("x"), "Car", 0));
        assert_eq!(set.next_int_id(), TrackId::Int(5));
        assert_eq!(set.get(&TrackId::Int(4)).unwrap().frame_count(), 10);
    }

    proptest! {
        #[test]
        fn prop_interpolated_rotation_is_unit(
            r0 in prop::array::uniform3(-PI..PI),
            r1 in prop::array::uniform3(-PI..PI),
            frame in 1u32..10,
        ) {
            let a = Psr::new(Vector3::zeros(), Vector3::new(1.0, 1.0, 1.0), Vector3::from(r0));
            let b = Psr::new(Vector3::new(3.0, 0.0, 0.0), Vector3::new(2.0, 1.0, 1.0), Vector3::from(r1));
            let track = Track::from_keyframes(TrackId::Int(1), "Car", 11, vec![(0, a), (10, b)]).unwrap();

            let pose = track.interpolate(frame).unwrap();
            prop_assert!((pose.rotation.quaternion().norm() - 1.0).abs() < 1e-6);

            let t = frame as f64 / 10.0;
            prop_assert!((pose.psr.position.x - 3.0 * t).abs() < 1e-12);
            prop_assert!((pose.psr.scale.x - (1.0 + t)).abs() < 1e-12);

            // Euler output agrees with the quaternion
            let q = euler_xyz_to_quaternion(&pose.psr.rotation);
            prop_assert!(q.angle_to(&pose.rotation) < 1e-6);
        }
    }
}
