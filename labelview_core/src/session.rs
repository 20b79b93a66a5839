//! The "SESSION" - one scene folder under annotation
//!
//! A [`SceneSession`] owns everything derived from one folder selection:
//! frames, tracks, the label ledger, calibrations, both caches and both
//! save streams. Interactive operations mutate state synchronously and mark
//! the caches and streams dirty; [`SceneSession::tick`] is the single
//! scheduler step that refreshes caches for the active frame/camera, drains
//! finished saves and starts the saves whose debounce expired.
//!
//! Saves run as background tasks on the context. Their results come back
//! over a channel tagged with the session id, so a result that lands after
//! a folder change is dropped.

use crate::autosave::{Debounce, SaveOutcome, SaveStream};
use crate::classifier::{classify, MembershipCache};
use crate::config::AnnotatorConfig;
use crate::geometry::{Psr, Ray};
use crate::keyframes::{InterpolatedPose, Markers, PoseError, Track, TrackId, TrackSet};
use crate::ledger::{HistoryOutcome, LabelLedger, LedgerError, PaintMode, SaveRequest};
use crate::pointcloud::{Frame, PointCloud};
use crate::projection::{CameraModel, ProjectedPointSet, ProjectionCache};
use crate::solution::{self, LabelSolution, ObjectSolution};
use labelview_env::{LabelViewContext, SaveEnvelope, SessionId, SolutionStore, StreamKind};
use nalgebra::{Point3, Vector2};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Error, PartialEq)]
pub enum SessionError {
    #[error(transparent)]
    Pose(#[from] PoseError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// What one scheduler step did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub saves_started: Vec<StreamKind>,
    pub saves_completed: Vec<(StreamKind, SaveOutcome)>,
    pub membership_recomputed: usize,
    pub projection_refreshed: bool,
}

/// A background save reporting back.
#[derive(Debug)]
struct Completion {
    session: SessionId,
    stream: StreamKind,
    outcome: SaveOutcome,

    /// Object stream: edit generation the payload was built from
    generation: u64,

    /// Label stream: frames whose arrays were in the payload
    labels: Vec<(u32, Vec<u8>)>,
}

pub struct SceneSession<C: LabelViewContext, S: SolutionStore> {
    ctx: Arc<C>,
    config: AnnotatorConfig,
    id: SessionId,
    folder: String,

    frames: Vec<Frame>,
    tracks: TrackSet,
    ledger: LabelLedger,
    cameras: BTreeMap<String, CameraModel>,

    membership: MembershipCache,
    projections: ProjectionCache,

    active_frame: u32,
    active_camera: Option<String>,

    objects: Arc<SaveStream<S>>,
    labels: Arc<SaveStream<S>>,
    objects_debounce: Debounce,
    labels_debounce: Debounce,

    /// Bumped on every track edit
    object_generation: u64,

    /// Highest generation confirmed persisted
    object_persisted: u64,

    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    in_flight: usize,
}

fn positions(frames: &[Frame], frame: u32) -> &[Point3<f64>] {
    frames
        .get(frame as usize)
        .map(|f| f.cloud.positions.as_slice())
        .unwrap_or(&[])
}

impl<C: LabelViewContext, S: SolutionStore> SceneSession<C, S> {
    /// An empty session; call [`SceneSession::load_scene`] next.
    pub fn new(ctx: Arc<C>, store: Arc<S>, config: AnnotatorConfig) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let timeout = config.save_timeout();
        Self {
            objects: Arc::new(SaveStream::new(StreamKind::Objects, Arc::clone(&store), timeout)),
            labels: Arc::new(SaveStream::new(StreamKind::Labels, store, timeout)),
            objects_debounce: Debounce::new(config.autosave_delay()),
            labels_debounce: Debounce::new(config.autosave_delay()),
            ledger: LabelLedger::new(config.undo_depth),
            projections: ProjectionCache::new(config.pixel_bucket_px),
            ctx,
            config,
            id: SessionId::new(),
            folder: String::new(),
            frames: Vec::new(),
            tracks: TrackSet::new(0),
            cameras: BTreeMap::new(),
            membership: MembershipCache::new(),
            active_frame: 0,
            active_camera: None,
            object_generation: 0,
            object_persisted: 0,
            completions_tx,
            completions_rx,
            in_flight: 0,
        }
    }

    /// Create a session and load `folder` into it.
    pub async fn open(
        ctx: Arc<C>,
        store: Arc<S>,
        config: AnnotatorConfig,
        folder: impl Into<String>,
        frames: Vec<Frame>,
        cameras: BTreeMap<String, CameraModel>,
    ) -> Self {
        let mut session = Self::new(ctx, store, config);
        session.load_scene(folder, frames, cameras).await;
        session
    }

    /// Switch to another scene folder.
    ///
    /// Pending edits of the current scene are flushed first. Missing or
    /// malformed solutions start the scene empty.
    pub async fn load_scene(
        &mut self,
        folder: impl Into<String>,
        frames: Vec<Frame>,
        cameras: BTreeMap<String, CameraModel>,
    ) {
        if !self.folder.is_empty() {
            self.flush_all().await;
        }
        self.reset();

        self.folder = folder.into();
        let frame_count = u32::try_from(frames.len()).unwrap_or(u32::MAX);

        let store = Arc::clone(self.objects.store());
        let objects = solution::load_objects(store.as_ref(), &self.folder).await;
        let labels = solution::load_labels(store.as_ref(), &self.folder).await;

        if objects.frame_count() != 0 && objects.frame_count() != frames.len() {
            warn!(
                folder = %self.folder,
                solution_frames = objects.frame_count(),
                frames = frames.len(),
                "object solution does not match the frame list"
            );
        }
        self.tracks = objects.to_tracks();
        self.tracks.set_frame_count(frame_count);

        for (index, frame) in (0u32..).zip(&frames) {
            let stored = labels.labels_for(&frame.file_name).map(<[u8]>::to_vec);
            self.ledger.load_frame(index, frame.cloud.len(), stored);
        }

        self.frames = frames;
        self.cameras = cameras;
        self.active_camera = self.cameras.keys().next().cloned();

        info!(
            session = %self.id,
            folder = %self.folder,
            frames = self.frames.len(),
            tracks = self.tracks.len(),
            cameras = self.cameras.len(),
            "scene loaded"
        );
    }

    /// Tear the scene down. In-flight saves finish in the background; their
    /// results are ignored.
    pub fn reset(&mut self) {
        if !self.folder.is_empty() {
            debug!(session = %self.id, folder = %self.folder, "scene reset");
        }
        self.id = SessionId::new();
        self.folder.clear();
        self.frames.clear();
        self.tracks = TrackSet::new(0);
        self.ledger.clear();
        self.cameras.clear();
        self.membership.clear();
        self.projections.clear();
        self.active_frame = 0;
        self.active_camera = None;
        self.objects_debounce.cancel();
        self.labels_debounce.cancel();
        self.object_generation = 0;
        self.object_persisted = 0;
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    pub fn config(&self) -> &AnnotatorConfig {
        &self.config
    }

    pub fn frame_count(&self) -> u32 {
        self.tracks.frame_count()
    }

    pub fn frame(&self, index: u32) -> Option<&Frame> {
        self.frames.get(index as usize)
    }

    pub fn tracks(&self) -> &TrackSet {
        &self.tracks
    }

    pub fn ledger(&self) -> &LabelLedger {
        &self.ledger
    }

    pub fn cameras(&self) -> impl Iterator<Item = &CameraModel> {
        self.cameras.values()
    }

    pub fn active_frame(&self) -> u32 {
        self.active_frame
    }

    pub fn active_camera(&self) -> Option<&str> {
        self.active_camera.as_deref()
    }

    /// True while track edits are not confirmed persisted.
    pub fn objects_dirty(&self) -> bool {
        self.object_generation > self.object_persisted
    }

    pub fn labels_dirty(&self) -> bool {
        !self.ledger.dirty_frames().is_empty()
    }

    pub fn saves_in_flight(&self) -> usize {
        self.in_flight
    }

    // ========================================================================
    // TRACKS
    // ========================================================================

    fn track_edited(&mut self, id: &TrackId) {
        self.membership.invalidate_track(id);
        self.object_generation += 1;
        self.objects_debounce.touch(self.ctx.now());
    }

    /// New track with a keyframe on the active frame.
    pub fn create_track(&mut self, class: impl Into<String>, psr: Psr) -> Result<TrackId, PoseError> {
        let id = self.tracks.next_int_id();
        let mut track = Track::new(id.clone(), class, self.tracks.frame_count());
        track.insert_keyframe(self.active_frame, psr)?;
        self.tracks.insert(track);
        self.track_edited(&id);
        Ok(id)
    }

    pub fn set_keyframe(&mut self, id: &TrackId, frame: u32, psr: Psr) -> Result<(), PoseError> {
        let track = self
            .tracks
            .get_mut(id)
            .ok_or_else(|| PoseError::TrackNotFound(id.clone()))?;
        track.insert_keyframe(frame, psr)?;
        self.track_edited(id);
        Ok(())
    }

    pub fn remove_keyframe(&mut self, id: &TrackId, frame: u32) -> Result<bool, PoseError> {
        let track = self
            .tracks
            .get_mut(id)
            .ok_or_else(|| PoseError::TrackNotFound(id.clone()))?;
        let removed = track.remove_keyframe(frame);
        if removed {
            self.track_edited(id);
        }
        Ok(removed)
    }

    pub fn remove_track(&mut self, id: &TrackId) -> Option<Track> {
        let track = self.tracks.remove(id)?;
        self.track_edited(id);
        Some(track)
    }

    pub fn set_visibility(&mut self, id: &TrackId, frame: u32, visible: bool) -> Result<RangeInclusive<u32>, PoseError> {
        let track = self
            .tracks
            .get_mut(id)
            .ok_or_else(|| PoseError::TrackNotFound(id.clone()))?;
        let span = track.set_visibility(frame, visible)?;
        self.track_edited(id);
        Ok(span)
    }

    pub fn pose(&self, id: &TrackId, frame: u32) -> Result<InterpolatedPose, PoseError> {
        self.tracks
            .get(id)
            .ok_or_else(|| PoseError::TrackNotFound(id.clone()))?
            .interpolate(frame)
    }

    pub fn markers(&self, id: &TrackId) -> Result<Markers, PoseError> {
        self.tracks
            .get(id)
            .map(Track::find_markers)
            .ok_or_else(|| PoseError::TrackNotFound(id.clone()))
    }

    /// Reduce loaded tracks to their authored keyframes.
    pub fn restrict_keyframes(&mut self, authored: &BTreeMap<TrackId, BTreeSet<u32>>) {
        for (id, frames) in authored {
            if let Some(track) = self.tracks.get_mut(id) {
                track.retain_keyframes(frames);
                self.membership.invalidate_track(id);
            }
        }
    }

    /// Closest visible cuboid hit by `ray` on the active frame.
    pub fn pick_cuboid(&self, ray: &Ray) -> Option<TrackId> {
        let mut best: Option<(f64, &TrackId)> = None;
        for (track, pose) in self.tracks.poses_at(self.active_frame) {
            let Ok(pose) = pose else { continue };
            if !pose.visible {
                continue;
            }
            if let Some(t) = ray.intersect_obb(&pose.psr.to_obb()) {
                if best.map_or(true, |(b, _)| t < b) {
                    best = Some((t, &track.id));
                }
            }
        }
        best.map(|(_, id)| id.clone())
    }

    // ========================================================================
    // LABELS
    // ========================================================================

    pub fn paint(&mut self, indices: &[usize], class: u8, mode: PaintMode) -> Result<usize, LedgerError> {
        self.ledger.paint(self.active_frame, indices.iter().copied(), class, mode)
    }

    pub fn fill_indices(&mut self, indices: &[usize], class: u8) -> Result<usize, LedgerError> {
        self.ledger.fill_indices(self.active_frame, indices, class)
    }

    pub fn relabel_where<F>(&mut self, class: u8, predicate: F) -> Result<usize, LedgerError>
    where
        F: Fn(usize, u8, &Point3<f64>) -> bool,
    {
        let points = positions(&self.frames, self.active_frame);
        self.ledger.relabel_where(self.active_frame, points, class, predicate)
    }

    /// Label every point inside the track's cuboid on the active frame. A
    /// hidden cuboid labels nothing.
    pub fn relabel_inside_track(&mut self, id: &TrackId, class: u8) -> Result<usize, SessionError> {
        let pose = self.pose(id, self.active_frame)?;
        let points = positions(&self.frames, self.active_frame);
        let members = classify(
            points,
            &Point3::from(pose.psr.position),
            &pose.rotation,
            &pose.psr.half_extents(),
            pose.visible,
        );
        Ok(self.ledger.fill_indices(self.active_frame, &members, class)?)
    }

    /// Commit the active frame's edits and arm the label autosave when
    /// they need writing.
    pub fn request_label_save(&mut self, update_stack: bool) -> Result<SaveRequest, LedgerError> {
        let request = self.ledger.request_save(self.active_frame, update_stack)?;
        if matches!(request, SaveRequest::Write(_)) {
            self.labels_debounce.touch(self.ctx.now());
        }
        Ok(request)
    }

    pub fn undo(&mut self) -> Result<HistoryOutcome, LedgerError> {
        let outcome = self.ledger.undo(self.active_frame)?;
        if outcome == HistoryOutcome::Applied {
            self.request_label_save(false)?;
        }
        Ok(outcome)
    }

    pub fn redo(&mut self) -> Result<HistoryOutcome, LedgerError> {
        let outcome = self.ledger.redo(self.active_frame)?;
        if outcome == HistoryOutcome::Applied {
            self.request_label_save(false)?;
        }
        Ok(outcome)
    }

    // ========================================================================
    // NAVIGATION
    // ========================================================================

    /// Move to `frame`, saving pending edits of the frame being left.
    pub fn navigate(&mut self, frame: u32) -> bool {
        if frame as usize >= self.frames.len() {
            return false;
        }
        if frame == self.active_frame {
            return true;
        }

        if let Ok(SaveRequest::Write(_)) = self.ledger.request_save(self.active_frame, false) {
            self.labels_debounce.cancel();
            self.start_label_save();
        }
        if self.objects_debounce.is_pending() && self.objects_dirty() {
            self.objects_debounce.cancel();
            self.start_object_save();
        }

        debug!(from = self.active_frame, to = frame, "navigate");
        self.active_frame = frame;
        self.projections.retain_frame(frame);
        true
    }

    /// Select the overlay camera. Unknown names are rejected.
    pub fn set_active_camera(&mut self, name: Option<&str>) -> bool {
        if let Some(name) = name {
            if !self.cameras.contains_key(name) {
                return false;
            }
        }
        if self.active_camera.as_deref() != name {
            self.active_camera = name.map(str::to_string);
            self.projections.clear();
        }
        true
    }

    /// Install or replace a calibration.
    pub fn set_calibration(&mut self, camera: CameraModel) {
        self.projections.invalidate_camera(&camera.name);
        self.cameras.insert(camera.name.clone(), camera);
    }

    /// Swap the point cloud of a frame. Labels survive when the point count
    /// is unchanged.
    pub fn replace_cloud(&mut self, frame: u32, cloud: PointCloud) -> bool {
        let Some(slot) = self.frames.get_mut(frame as usize) else {
            return false;
        };
        if slot.cloud.len() != cloud.len() {
            warn!(frame, old = slot.cloud.len(), new = cloud.len(), "point count changed, labels reset");
            self.ledger.load_frame(frame, cloud.len(), None);
        }
        slot.cloud = cloud;
        self.membership.invalidate_frame(frame);
        self.projections.invalidate_frame(frame);
        true
    }

    // ========================================================================
    // DERIVED VIEWS
    // ========================================================================

    fn refresh_membership(&mut self) -> usize {
        let points = positions(&self.frames, self.active_frame);
        self.membership.refresh(self.active_frame, points, &self.tracks)
    }

    /// Points inside a track's cuboid on the active frame.
    pub fn members(&mut self, id: &TrackId) -> Option<&[usize]> {
        self.refresh_membership();
        self.membership.get(self.active_frame, id)
    }

    /// Per-track point counts on the active frame.
    pub fn point_counts(&mut self) -> BTreeMap<TrackId, usize> {
        self.refresh_membership();
        self.membership.point_counts(self.active_frame)
    }

    /// Projection of the active frame into the active camera.
    pub fn projection(&mut self) -> Option<&ProjectedPointSet> {
        let name = self.active_camera.as_ref()?;
        let camera = self.cameras.get(name)?;
        let points = positions(&self.frames, self.active_frame);
        Some(self.projections.get_or_project(camera, self.active_frame, points))
    }

    /// Point under the cursor in the active camera image.
    pub fn hover(&mut self, x: f64, y: f64) -> Option<usize> {
        let radius = self.config.hover_radius_px;
        self.projection()?.nearest_point_to_pixel(x, y, radius)
    }

    /// Box corners of every visible track in the active camera image.
    pub fn projected_boxes(&self) -> Vec<(TrackId, [Option<Vector2<f64>>; 8])> {
        let Some(camera) = self.active_camera.as_ref().and_then(|n| self.cameras.get(n)) else {
            return Vec::new();
        };
        self.tracks
            .poses_at(self.active_frame)
            .into_iter()
            .filter_map(|(track, pose)| {
                let pose = pose.ok().filter(|p| p.visible)?;
                Some((track.id.clone(), camera.project_obb(&pose.psr.to_obb())))
            })
            .collect()
    }

    // ========================================================================
    // SCHEDULER
    // ========================================================================

    /// The per-frame scheduler step.
    pub fn tick(&mut self) -> TickReport {
        let now = self.ctx.now();
        let mut report = TickReport::default();

        while let Ok(completion) = self.completions_rx.try_recv() {
            if let Some(done) = self.apply_completion(completion) {
                report.saves_completed.push(done);
            }
        }

        if self.objects_debounce.take_due(now) && self.objects_dirty() {
            self.start_object_save();
            report.saves_started.push(StreamKind::Objects);
        }
        if self.labels_debounce.take_due(now) && self.labels_dirty() {
            self.start_label_save();
            report.saves_started.push(StreamKind::Labels);
        }

        if self.membership.needs_update(self.active_frame, &self.tracks) {
            report.membership_recomputed = self.refresh_membership();
        }

        let projection_missing = self
            .active_camera
            .as_deref()
            .is_some_and(|c| !self.projections.contains(c, self.active_frame));
        if projection_missing {
            report.projection_refreshed = self.projection().is_some();
        }

        report
    }

    /// Write both streams now (if dirty) and wait for every save in flight.
    pub async fn flush_all(&mut self) -> Vec<(StreamKind, SaveOutcome)> {
        if self.ledger.is_loaded(self.active_frame) {
            if let Err(e) = self.ledger.request_save(self.active_frame, false) {
                warn!(frame = self.active_frame, "label save request before flush failed: {}", e);
            }
        }
        self.objects_debounce.cancel();
        self.labels_debounce.cancel();

        if self.objects_dirty() {
            self.start_object_save();
        }
        if self.labels_dirty() {
            self.start_label_save();
        }
        self.wait_for_saves().await
    }

    /// Wait for every save in flight and apply the results.
    pub async fn wait_for_saves(&mut self) -> Vec<(StreamKind, SaveOutcome)> {
        let mut done = Vec::new();
        while self.in_flight > 0 {
            let Some(completion) = self.completions_rx.recv().await else {
                break;
            };
            if let Some(result) = self.apply_completion(completion) {
                done.push(result);
            }
        }
        done
    }

    fn start_object_save(&mut self) {
        let solution = ObjectSolution::from_tracks(&self.tracks);
        let generation = self.object_generation;
        self.spawn_save(StreamKind::Objects, solution, generation, Vec::new());
    }

    fn start_label_save(&mut self) {
        let file_names: Vec<String> = self.frames.iter().map(|f| f.file_name.clone()).collect();
        let solution = LabelSolution::from_ledger(&self.ledger, &self.folder, &file_names);
        let written: Vec<(u32, Vec<u8>)> = self
            .ledger
            .dirty_frames()
            .into_iter()
            .filter_map(|f| self.ledger.labels(f).map(|l| (f, l.to_vec())))
            .collect();
        self.spawn_save(StreamKind::Labels, solution, 0, written);
    }

    fn spawn_save<T>(&mut self, kind: StreamKind, value: T, generation: u64, labels: Vec<(u32, Vec<u8>)>)
    where
        T: Serialize + Send + 'static,
    {
        let stream = match kind {
            StreamKind::Objects => Arc::clone(&self.objects),
            StreamKind::Labels => Arc::clone(&self.labels),
        };
        let sequence = stream.issue();
        let tx = self.completions_tx.clone();
        let session = self.id;
        let folder = self.folder.clone();
        self.in_flight += 1;

        debug!(stream = %kind, sequence, "save started");
        self.ctx.spawn(&format!("save-{}", kind), async move {
            let outcome = match solution::encode_in_background(value).await {
                Ok(payload) => stream.write(SaveEnvelope::new(kind, folder, sequence, payload)).await,
                Err(e) => {
                    warn!(stream = %kind, sequence, "encode failed: {}", e);
                    SaveOutcome::Failed {
                        sequence,
                        error: e.to_string(),
                    }
                }
            };
            // The receiver lives as long as the session
            let _ = tx.send(Completion {
                session,
                stream: kind,
                outcome,
                generation,
                labels,
            });
        });
    }

    fn apply_completion(&mut self, completion: Completion) -> Option<(StreamKind, SaveOutcome)> {
        self.in_flight = self.in_flight.saturating_sub(1);
        if completion.session != self.id {
            debug!(stream = %completion.stream, "save result from a previous scene dropped");
            return None;
        }

        match (&completion.outcome, completion.stream) {
            (SaveOutcome::Persisted { .. }, StreamKind::Objects) => {
                self.object_persisted = self.object_persisted.max(completion.generation);
            }
            (SaveOutcome::Persisted { .. }, StreamKind::Labels) => {
                for (frame, bytes) in &completion.labels {
                    self.ledger.mark_persisted(*frame, bytes);
                }
            }
            (SaveOutcome::Failed { .. }, StreamKind::Labels) => {
                for (frame, _) in &completion.labels {
                    self.ledger.mark_failed(*frame);
                }
            }
            // Objects stay dirty by generation; superseded results are ignored
            (SaveOutcome::Failed { .. }, StreamKind::Objects) | (SaveOutcome::Superseded { .. }, _) => {}
        }
        Some((completion.stream, completion.outcome))
    }
}
