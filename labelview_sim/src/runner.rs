//! Scenario runner - drives annotation sessions against synthetic scenes.

use crate::context::SimContext;
use crate::scenarios::ScenarioId;
use crate::store::SimStore;
use crate::synth::{SceneSynth, SynthConfig, SynthScene};

use anyhow::{bail, ensure, Context, Result};
use labelview_core::geometry::Ray;
use labelview_core::ledger::{HistoryOutcome, PaintMode, SaveRequest};
use labelview_core::session::{SceneSession, TickReport};
use labelview_core::solution::{self, LabelSolution, ObjectSolution};
use labelview_core::{AnnotatorConfig, SaveOutcome, TrackId};
use labelview_env::{LabelViewContext, StreamKind};
use nalgebra::{Point3, Vector2, Vector3};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

type SimSession = SceneSession<SimContext, SimStore>;

/// Scheduler yields after every tick, giving save tasks room to progress
const YIELDS_PER_TICK: usize = 4;

/// Commits in the undo marathon
const UNDO_OPS: usize = 25;

/// Pose tolerance of the track sweep
const POSE_TOLERANCE: f64 = 1e-9;

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

impl ScenarioResult {
    fn failed(scenario: ScenarioId, seed: u64, reason: String) -> Self {
        Self {
            scenario,
            seed,
            passed: false,
            total_ticks: 0,
            final_time_secs: 0.0,
            failure_reason: Some(reason),
            metrics: ScenarioMetrics::default(),
        }
    }
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScenarioMetrics {
    /// Store writes that landed
    pub writes: u64,

    /// Store writes that failed
    pub failed_writes: u64,

    /// Saves started by the scheduler or a flush
    pub saves_started: u64,

    /// Save results overtaken by a newer save
    pub superseded: u64,

    /// Membership sets recomputed across all ticks
    pub membership_recomputes: u64,

    /// Points that landed inside an image
    pub projected_points: u64,
}

/// Shared state of one scenario run.
struct Harness {
    ctx: Arc<SimContext>,
    store: Arc<SimStore>,
    dt: Duration,
    ticks: u64,
    metrics: ScenarioMetrics,
}

impl Harness {
    fn new(seed: u64, tick_rate_hz: u32) -> Self {
        Self {
            ctx: SimContext::shared(seed),
            store: Arc::new(SimStore::new()),
            dt: Duration::from_secs_f64(1.0 / tick_rate_hz.max(1) as f64),
            ticks: 0,
            metrics: ScenarioMetrics::default(),
        }
    }

    async fn open(&self, folder: &str, scene: &SynthScene) -> SimSession {
        SceneSession::open(
            Arc::clone(&self.ctx),
            Arc::clone(&self.store),
            AnnotatorConfig::default(),
            folder,
            scene.frames.clone(),
            scene.cameras.clone(),
        )
        .await
    }

    /// One UI frame: advance the clock, run the scheduler, let tasks run.
    async fn step(&mut self, session: &mut SimSession) -> TickReport {
        self.ctx.advance_time(self.dt);
        self.ticks += 1;
        let report = session.tick();
        for _ in 0..YIELDS_PER_TICK {
            tokio::task::yield_now().await;
        }

        self.metrics.saves_started += report.saves_started.len() as u64;
        self.metrics.membership_recomputes += report.membership_recomputed as u64;
        self.record(&report.saves_completed);
        report
    }

    /// Step until `count` saves have started.
    async fn step_until_saves(&mut self, session: &mut SimSession, count: usize, max_ticks: u64) -> Result<()> {
        let mut started = 0;
        for _ in 0..max_ticks {
            started += self.step(session).await.saves_started.len();
            if started >= count {
                return Ok(());
            }
        }
        bail!("only {} of {} saves started", started, count)
    }

    async fn settle(&mut self, session: &mut SimSession) {
        let done = session.wait_for_saves().await;
        self.record(&done);
    }

    async fn flush(&mut self, session: &mut SimSession) {
        let before = session.saves_in_flight();
        let done = session.flush_all().await;
        self.metrics.saves_started += done.len().saturating_sub(before) as u64;
        self.record(&done);
    }

    fn record(&mut self, done: &[(StreamKind, SaveOutcome)]) {
        for (stream, outcome) in done {
            debug!(%stream, ?outcome, "save finished");
            if matches!(outcome, SaveOutcome::Superseded { .. }) {
                self.metrics.superseded += 1;
            }
        }
    }

    /// The stored object solution equals the session's tracks.
    fn objects_persisted(&self, folder: &str, session: &SimSession) -> Result<()> {
        let expected = solution::encode(&ObjectSolution::from_tracks(session.tracks())).context("encode objects")?;
        let stored = self
            .store
            .get(StreamKind::Objects, folder)
            .with_context(|| format!("no object solution stored for {}", folder))?;
        ensure!(stored == expected, "stored objects of {} differ from the session", folder);
        Ok(())
    }

    fn stored_labels(&self, folder: &str) -> Result<LabelSolution> {
        let bytes = self
            .store
            .get(StreamKind::Labels, folder)
            .with_context(|| format!("no label solution stored for {}", folder))?;
        solution::decode::<LabelSolution>(&bytes).context("decode labels")
    }

    /// Every frame's stored labels equal the ledger.
    fn labels_persisted(&self, folder: &str, scene: &SynthScene, session: &SimSession) -> Result<()> {
        let stored = self.stored_labels(folder)?;
        for frame in &scene.frames {
            ensure!(
                stored.labels_for(&frame.file_name) == session.ledger().labels(frame.index),
                "stored labels of frame {} differ from the ledger", frame.index
            );
        }
        Ok(())
    }

    fn finish(mut self, scenario: ScenarioId, seed: u64, outcome: Result<()>) -> ScenarioResult {
        let stats = self.store.stats();
        self.metrics.writes = stats.writes;
        self.metrics.failed_writes = stats.failed_writes;

        ScenarioResult {
            scenario,
            seed,
            passed: outcome.is_ok(),
            total_ticks: self.ticks,
            final_time_secs: self.ctx.now().as_secs_f64(),
            failure_reason: outcome.err().map(|e| format!("{:#}", e)),
            metrics: self.metrics,
        }
    }
}

/// One track per truth object, keyframed on the active frame.
fn create_tracks(session: &mut SimSession, scene: &SynthScene) -> Result<Vec<TrackId>> {
    let frame = session.active_frame();
    scene
        .objects
        .iter()
        .map(|o| session.create_track(o.class.clone(), o.psr_at(frame)).context("create_track"))
        .collect()
}

/// Runs annotation scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// UI tick rate in Hz
    tick_rate_hz: u32,

    /// Length of the editing phase in seconds
    max_duration_secs: f64,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            tick_rate_hz: 30,
            max_duration_secs: 3.0,
        }
    }

    /// Sets the tick rate.
    pub fn with_tick_rate(mut self, hz: u32) -> Self {
        self.tick_rate_hz = hz.max(1);
        self
    }

    /// Sets the length of the editing phase.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.max_duration_secs = secs;
        self
    }

    fn synth_seed(&self) -> u64 {
        self.seed.wrapping_mul(0x9e3779b97f4a7c15)
    }

    fn edit_ticks(&self) -> u64 {
        (self.max_duration_secs * self.tick_rate_hz as f64).max(1.0) as u64
    }

    /// Ticks spanning twice the autosave delay.
    fn quiet_ticks(&self) -> u64 {
        let delay = AnnotatorConfig::default().autosave_delay().as_secs_f64();
        (2.0 * delay * self.tick_rate_hz as f64).ceil() as u64 + 1
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => return ScenarioResult::failed(scenario, self.seed, format!("runtime: {}", e)),
        };
        runtime.block_on(self.run_async(scenario))
    }

    async fn run_async(&self, scenario: ScenarioId) -> ScenarioResult {
        let mut harness = Harness::new(self.seed, self.tick_rate_hz);

        let outcome = match scenario {
            ScenarioId::AutosaveStorm => self.run_autosave_storm(&mut harness).await,
            ScenarioId::FlakyStorage => self.run_flaky_storage(&mut harness).await,
            ScenarioId::TrackSweep => self.run_track_sweep(&mut harness).await,
            ScenarioId::ProjectionSweep => self.run_projection_sweep(&mut harness).await,
            ScenarioId::UndoMarathon => self.run_undo_marathon(&mut harness).await,
            ScenarioId::SceneSwitch => self.run_scene_switch(&mut harness).await,
        };

        if let Err(reason) = &outcome {
            warn!("{} failed: {:#}", scenario.name(), reason);
        }
        harness.finish(scenario, self.seed, outcome)
    }

    /// SIM-001: AutosaveStorm - continuous edits, one write per stream.
    ///
    /// Every tick moves a keyframe and paints a point, well inside the
    /// debounce window. Nothing may be written until the edits stop; then
    /// each stream writes once, and a repeated save request with unchanged
    /// labels writes nothing.
    async fn run_autosave_storm(&self, h: &mut Harness) -> Result<()> {
        info!("SIM-001: AutosaveStorm - debounced writes");

        let scene = SceneSynth::new(self.synth_seed()).generate();
        let mut session = h.open("storm", &scene).await;
        let ids = create_tracks(&mut session, &scene)?;
        let mut rng = h.ctx.rng(1);
        let point_count = scene.frames[0].cloud.len();

        for tick in 0..self.edit_ticks() {
            let k = tick as usize % ids.len();
            let frame = rng.gen_range(0..scene.frame_count());
            session
                .set_keyframe(&ids[k], frame, scene.objects[k].psr_at(frame))
                .context("set_keyframe")?;

            let point = rng.gen_range(0..point_count);
            session
                .paint(&[point], rng.gen_range(1..=8), PaintMode::Overwrite)
                .context("paint")?;
            session.request_label_save(true).context("request_label_save")?;

            let report = h.step(&mut session).await;
            ensure!(report.saves_started.is_empty(), "save started mid-storm at tick {}", tick);
        }

        h.step_until_saves(&mut session, 2, self.quiet_ticks()).await?;
        h.settle(&mut session).await;
        ensure!(h.store.stats().writes == 2, "expected one write per stream, got {}", h.store.stats().writes);
        h.objects_persisted("storm", &session)?;
        h.labels_persisted("storm", &scene, &session)?;

        let request = session.request_label_save(true).context("request_label_save")?;
        ensure!(request == SaveRequest::Skipped, "unchanged labels requested a write");
        for _ in 0..self.quiet_ticks() {
            h.step(&mut session).await;
        }
        h.settle(&mut session).await;
        ensure!(h.store.stats().writes == 2, "unchanged state was written again");
        ensure!(!session.objects_dirty() && !session.labels_dirty(), "session still dirty");
        Ok(())
    }

    /// SIM-002: FlakyStorage - half the writes fail, storage is slow.
    ///
    /// Random track edits, paints and navigation run against a store that
    /// fails every write with probability 0.5. Once storage heals, a flush
    /// must leave both streams clean and equal to the session state.
    async fn run_flaky_storage(&self, h: &mut Harness) -> Result<()> {
        info!("SIM-002: FlakyStorage - 50% write failures");

        let scene = SceneSynth::new(self.synth_seed()).generate();
        h.store.set_failure_rate(0.5, h.ctx.rng(2));
        h.store.set_latency_yields(3);

        let mut session = h.open("flaky", &scene).await;
        let ids = create_tracks(&mut session, &scene)?;
        let mut rng = h.ctx.rng(1);

        for _ in 0..self.edit_ticks() {
            if rng.gen_bool(0.2) {
                let k = rng.gen_range(0..ids.len());
                let frame = rng.gen_range(0..scene.frame_count());
                session
                    .set_keyframe(&ids[k], frame, scene.objects[k].psr_at(frame))
                    .context("set_keyframe")?;
            }
            if rng.gen_bool(0.2) {
                let count = session.frame(session.active_frame()).map_or(0, |f| f.cloud.len());
                let points: Vec<usize> = (0..4).map(|_| rng.gen_range(0..count)).collect();
                session
                    .paint(&points, rng.gen_range(1..=8), PaintMode::Overwrite)
                    .context("paint")?;
                session.request_label_save(true).context("request_label_save")?;
            }
            if rng.gen_bool(0.05) {
                let frame = rng.gen_range(0..scene.frame_count());
                ensure!(session.navigate(frame), "navigate to {} rejected", frame);
            }
            h.step(&mut session).await;
        }

        for _ in 0..self.quiet_ticks() {
            h.step(&mut session).await;
        }
        h.settle(&mut session).await;

        h.store.heal();
        h.flush(&mut session).await;

        ensure!(!session.objects_dirty(), "objects still dirty after healed flush");
        ensure!(!session.labels_dirty(), "labels still dirty after healed flush");
        h.objects_persisted("flaky", &session)?;
        h.labels_persisted("flaky", &scene, &session)
    }

    /// SIM-003: TrackSweep - interpolation against ground truth.
    ///
    /// Objects move linearly, so two keyframes per track must reproduce the
    /// true pose on every frame in between, and membership must find exactly
    /// the points sampled inside each box. Hiding a segment empties it.
    async fn run_track_sweep(&self, h: &mut Harness) -> Result<()> {
        info!("SIM-003: TrackSweep - interpolation vs truth");

        let config = SynthConfig {
            frame_count: 20,
            object_count: 4,
            ..SynthConfig::default()
        };
        let scene = SceneSynth::with_config(self.synth_seed(), config).generate();
        let mut session = h.open("sweep", &scene).await;
        let last = scene.frame_count() - 1;

        let ids = create_tracks(&mut session, &scene)?;
        for (id, object) in ids.iter().zip(&scene.objects) {
            session.set_keyframe(id, last, object.psr_at(last)).context("set_keyframe")?;
        }

        for frame in 0..=last {
            ensure!(session.navigate(frame), "navigate to {} rejected", frame);
            h.step(&mut session).await;

            for (i, (id, object)) in ids.iter().zip(&scene.objects).enumerate() {
                let pose = session.pose(id, frame).context("pose")?;
                let truth = object.psr_at(frame);
                let position_error = (pose.psr.position - truth.position).norm();
                let rotation_error = (pose.psr.rotation - truth.rotation).norm();
                ensure!(
                    position_error <= POSE_TOLERANCE && rotation_error <= POSE_TOLERANCE,
                    "track {} frame {}: position error {:e}, rotation error {:e}",
                    id,
                    frame,
                    position_error,
                    rotation_error,
                );
                ensure!(
                    pose.is_keyframe == (frame == 0 || frame == last),
                    "track {} frame {}: wrong keyframe flag", id, frame
                );

                let expected: Vec<usize> = scene.object_points(i).collect();
                let members = session.members(id).map(<[usize]>::to_vec).unwrap_or_default();
                ensure!(
                    members == expected,
                    "track {} frame {}: {} members, expected {}", id, frame, members.len(), expected.len()
                );
            }
        }

        // Hide the second half of the first track
        let mid = last / 2;
        let hidden = &ids[0];
        session
            .set_keyframe(hidden, mid, scene.objects[0].psr_at(mid))
            .context("set_keyframe")?;
        let span = session.set_visibility(hidden, mid + 1, false).context("set_visibility")?;
        ensure!(span == (mid..=last), "hidden span {:?}", span);
        let markers = session.markers(hidden).context("markers")?;
        ensure!(markers.keyframes == vec![0, mid, last], "markers {:?}", markers.keyframes);

        ensure!(session.navigate(mid + 1), "navigate rejected");
        h.step(&mut session).await;
        let counts = session.point_counts();
        ensure!(counts.get(hidden).copied().unwrap_or(0) == 0, "hidden track still holds points");

        // Picking from above hits visible boxes only
        for (k, id) in ids.iter().enumerate() {
            let center = scene.objects[k].psr_at(mid + 1).position;
            let ray = Ray::new(Point3::new(center.x, center.y, 50.0), -Vector3::z());
            let picked = session.pick_cuboid(&ray);
            let expected = if id == hidden { None } else { Some(id.clone()) };
            ensure!(picked == expected, "pick over track {} returned {:?}", id, picked);
        }
        Ok(())
    }

    /// SIM-004: ProjectionSweep - pixel index consistency.
    ///
    /// For every frame, every projected point must be found again by a hover
    /// at its own pixel (a point at distance zero), and no point behind the
    /// camera may project.
    async fn run_projection_sweep(&self, h: &mut Harness) -> Result<()> {
        info!("SIM-004: ProjectionSweep - hover lookups");

        let scene = SceneSynth::new(self.synth_seed()).generate();
        let mut session = h.open("projection", &scene).await;

        for frame in 0..scene.frame_count() {
            ensure!(session.navigate(frame), "navigate to {} rejected", frame);
            let report = h.step(&mut session).await;
            ensure!(report.projection_refreshed, "frame {} not projected", frame);

            let points = &scene.frames[frame as usize].cloud.positions;
            let projection = session.projection().context("no active camera")?;
            for (i, p) in points.iter().enumerate() {
                ensure!(
                    p.x > 0.0 || projection.pixel_of(i).is_none(),
                    "frame {}: point {} behind the camera projected", frame, i
                );
            }
            let pixels: Vec<(usize, Vector2<f64>)> = projection.iter().map(|p| (p.index, p.pixel)).collect();
            h.metrics.projected_points += pixels.len() as u64;

            for (index, pixel) in pixels {
                let hit = session
                    .hover(pixel.x, pixel.y)
                    .with_context(|| format!("frame {}: hover at point {} found nothing", frame, index))?;
                let hit_pixel = session
                    .projection()
                    .and_then(|p| p.pixel_of(hit))
                    .with_context(|| format!("frame {}: hover returned unprojected point {}", frame, hit))?;
                ensure!(
                    (hit_pixel - pixel).norm() <= 1e-9,
                    "frame {}: hover at point {} returned point {} off-pixel", frame, index, hit
                );
            }
        }
        Ok(())
    }

    /// SIM-005: UndoMarathon - bounded history.
    ///
    /// 25 committed edits on one frame; undo walks back exactly the last 10
    /// states, then reports an empty stack. Redo replays them and the final
    /// state is what gets persisted.
    async fn run_undo_marathon(&self, h: &mut Harness) -> Result<()> {
        info!("SIM-005: UndoMarathon - bounded undo");

        let scene = SceneSynth::new(self.synth_seed()).generate();
        let mut session = h.open("undo", &scene).await;
        let depth = session.config().undo_depth;
        let point_count = scene.frames[0].cloud.len();
        let mut rng = h.ctx.rng(3);

        let snapshot = |s: &SimSession| s.ledger().labels(0).map(<[u8]>::to_vec).unwrap_or_default();
        let mut history = vec![snapshot(&session)];

        for op in 0..UNDO_OPS {
            // Point `op` is untouched so far, so every commit changes the frame
            let mut indices = vec![op];
            indices.extend((0..5).map(|_| rng.gen_range(UNDO_OPS..point_count)));
            session
                .fill_indices(&indices, (op % 8) as u8 + 1)
                .context("fill_indices")?;
            let request = session.request_label_save(true).context("request_label_save")?;
            ensure!(matches!(request, SaveRequest::Write(_)), "commit {} requested no write", op);
            history.push(snapshot(&session));
            h.step(&mut session).await;
        }
        ensure!(
            session.ledger().undo_len(0) == depth,
            "undo stack holds {}, expected {}", session.ledger().undo_len(0), depth
        );

        for k in 1..=depth {
            let outcome = session.undo().context("undo")?;
            ensure!(outcome == HistoryOutcome::Applied, "undo {} was empty", k);
            ensure!(snapshot(&session) == history[UNDO_OPS - k], "undo {} restored the wrong state", k);
            h.step(&mut session).await;
        }
        ensure!(session.undo().context("undo")? == HistoryOutcome::Empty, "undo past the depth applied");

        for k in 1..=depth {
            let outcome = session.redo().context("redo")?;
            ensure!(outcome == HistoryOutcome::Applied, "redo {} was empty", k);
            ensure!(
                snapshot(&session) == history[UNDO_OPS - depth + k],
                "redo {} restored the wrong state", k
            );
            h.step(&mut session).await;
        }
        ensure!(session.redo().context("redo")? == HistoryOutcome::Empty, "redo stack not empty");

        h.flush(&mut session).await;
        let stored = h.stored_labels("undo")?;
        ensure!(
            stored.labels_for(&scene.frames[0].file_name) == Some(history[UNDO_OPS].as_slice()),
            "final labels not persisted",
        );
        Ok(())
    }

    /// SIM-006: SceneSwitch - stale saves after a folder change.
    ///
    /// Saves of scene A are started, then the session is reset and scene B
    /// loaded while they are still in flight. Their results must not touch
    /// scene B, yet the data of A must land in storage. Switching back
    /// flushes B and restores A.
    async fn run_scene_switch(&self, h: &mut Harness) -> Result<()> {
        info!("SIM-006: SceneSwitch - folder changes mid-save");

        let scene_a = SceneSynth::new(self.synth_seed()).generate();
        let scene_b = SceneSynth::new(self.synth_seed().wrapping_add(1)).generate();
        h.store.set_latency_yields(8);

        let mut session = h.open("scene-a", &scene_a).await;
        let ids = create_tracks(&mut session, &scene_a)?;
        let inside: Vec<usize> = scene_a.object_points(0).collect();
        session.fill_indices(&inside, 1).context("fill_indices")?;
        session.request_label_save(true).context("request_label_save")?;

        let expected_objects =
            solution::encode(&ObjectSolution::from_tracks(session.tracks())).context("encode objects")?;
        let expected_labels = session.ledger().labels(0).map(<[u8]>::to_vec);

        h.step_until_saves(&mut session, 2, self.quiet_ticks()).await?;

        let stale = session.id();
        session.reset();
        session
            .load_scene("scene-b", scene_b.frames.clone(), scene_b.cameras.clone())
            .await;
        ensure!(session.id() != stale, "session id survived the reset");
        ensure!(session.tracks().is_empty(), "scene B opened with tracks");

        let applied = session.wait_for_saves().await;
        ensure!(applied.is_empty(), "{} stale save results applied", applied.len());
        ensure!(!session.objects_dirty() && !session.labels_dirty(), "scene B dirty");

        let stored = h.store.get(StreamKind::Objects, "scene-a");
        ensure!(stored.as_deref() == Some(expected_objects.as_slice()), "scene A objects lost");
        let labels = h.stored_labels("scene-a")?;
        ensure!(
            labels.labels_for(&scene_a.frames[0].file_name).map(<[u8]>::to_vec) == expected_labels,
            "scene A labels lost",
        );

        // Back to A through a regular switch, which flushes B first
        session
            .create_track("Car", scene_b.objects[0].psr_at(0))
            .context("create_track")?;
        session
            .load_scene("scene-a", scene_a.frames.clone(), scene_a.cameras.clone())
            .await;
        ensure!(h.store.get(StreamKind::Objects, "scene-b").is_some(), "scene B not flushed");
        ensure!(
            session.tracks().len() == ids.len(),
            "scene A reopened with {} tracks", session.tracks().len()
        );
        ensure!(
            session.ledger().labels(0).map(<[u8]>::to_vec) == expected_labels,
            "scene A labels not restored",
        );
        Ok(())
    }
}
