//! LabelView operator CLI
//!
//! Works on a scene root laid out as:
//!
//! ```text
//! <root>/<folder>/pointclouds/*.bin | *.pcd   frames, in file name order
//! <root>/<folder>/calibration/<camera>.json
//! <root>/<folder>/label/{objects,labels}      solutions
//! <root>/<folder>/issues.json
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use labelview_core::issues::IssueList;
use labelview_core::pointcloud::load_frames;
use labelview_core::projection::load_calibrations;
use labelview_core::solution;
use labelview_core::{AnnotatorConfig, LabelLedger, SceneSession, TrackId};
use labelview_env::{FsStore, SolutionStore, TokioContext};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

type Session = SceneSession<TokioContext, FsStore>;

/// LabelView scene tool
#[derive(Parser, Debug)]
#[command(name = "labelview")]
#[command(about = "Inspect and convert LabelView scene folders", long_about = None)]
struct Args {
    /// Annotator settings (JSON); defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the scene folders under a root
    Folders { root: PathBuf },

    /// Summarize frames, tracks, labels and issues of a folder
    Inspect { root: PathBuf, folder: String },

    /// Points inside every track, per frame
    Count {
        root: PathBuf,
        folder: String,

        /// Only this frame
        #[arg(short, long)]
        frame: Option<u32>,
    },

    /// Project one frame into a camera
    Project {
        root: PathBuf,
        folder: String,

        #[arg(short, long)]
        frame: u32,

        #[arg(short = 'C', long)]
        camera: String,

        /// Projected points to print
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Write the label solution as pretty JSON
    ExportLabels {
        root: PathBuf,
        folder: String,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Mark every issue of a frame as checked
    CheckIssues { root: PathBuf, folder: String, frame: u32 },
}

fn issues_path(root: &Path, folder: &str) -> PathBuf {
    root.join(folder).join("issues.json")
}

async fn open_scene(root: &Path, folder: &str, config: AnnotatorConfig) -> Result<Session> {
    let dir = root.join(folder);
    let frames = load_frames(dir.join("pointclouds")).with_context(|| format!("loading frames of {}", folder))?;
    let cameras = load_calibrations(dir.join("calibration"), config.default_image_size());
    let store = Arc::new(FsStore::new(root));
    Ok(SceneSession::open(TokioContext::shared(), store, config, folder, frames, cameras).await)
}

/// Points per label class over every loaded frame.
fn label_histogram(ledger: &LabelLedger) -> BTreeMap<u8, usize> {
    let mut histogram = BTreeMap::new();
    for frame in ledger.frames() {
        for label in ledger.labels(frame).unwrap_or_default() {
            *histogram.entry(*label).or_insert(0) += 1;
        }
    }
    histogram
}

/// Per-track point counts of `frames`, skipping frames out of range.
fn point_counts(session: &mut Session, frames: impl IntoIterator<Item = u32>) -> Vec<(u32, BTreeMap<TrackId, usize>)> {
    let mut out = Vec::new();
    for frame in frames {
        if session.navigate(frame) {
            out.push((frame, session.point_counts()));
        }
    }
    out
}

async fn folders(root: &Path) -> Result<()> {
    let folders = FsStore::new(root).folders().await.context("listing folders")?;
    for folder in folders {
        println!("{}", folder);
    }
    Ok(())
}

async fn inspect(root: &Path, folder: &str, config: AnnotatorConfig) -> Result<()> {
    let session = open_scene(root, folder, config).await?;

    let points: usize = (0..session.frame_count())
        .filter_map(|f| session.frame(f))
        .map(|f| f.cloud.len())
        .sum();
    let cameras: Vec<&str> = session.cameras().map(|c| c.name.as_str()).collect();

    println!("folder:  {}", folder);
    println!("frames:  {} ({} points)", session.frame_count(), points);
    println!("cameras: {}", if cameras.is_empty() { "-".to_string() } else { cameras.join(", ") });

    println!("tracks:  {}", session.tracks().len());
    for track in session.tracks().iter() {
        let markers = track.find_markers();
        println!(
            "  {:>6} {:<12} keyframes={:<4} visibility_changes={:?}",
            track.id.to_string(),
            track.class,
            track.keyframe_count(),
            markers.visibility_boundaries
        );
    }

    println!("labels:");
    for (class, count) in label_histogram(session.ledger()) {
        println!("  class {:>3}: {}", class, count);
    }

    let issues = IssueList::load(issues_path(root, folder)).context("reading issues")?;
    println!("issues:  {} ({} unresolved)", issues.0.len(), issues.unresolved().count());
    Ok(())
}

async fn count(root: &Path, folder: &str, frame: Option<u32>, config: AnnotatorConfig) -> Result<()> {
    let mut session = open_scene(root, folder, config).await?;
    let frames: Vec<u32> = match frame {
        Some(f) if f >= session.frame_count() => bail!("frame {} out of range ({} frames)", f, session.frame_count()),
        Some(f) => vec![f],
        None => (0..session.frame_count()).collect(),
    };

    for (frame, counts) in point_counts(&mut session, frames) {
        let cells: Vec<String> = counts.iter().map(|(id, n)| format!("{}={}", id, n)).collect();
        println!("{:>6}  {}", frame, cells.join(" "));
    }
    Ok(())
}

async fn project(root: &Path, folder: &str, frame: u32, camera: &str, limit: usize, config: AnnotatorConfig) -> Result<()> {
    let mut session = open_scene(root, folder, config).await?;
    if !session.navigate(frame) {
        bail!("frame {} out of range ({} frames)", frame, session.frame_count());
    }
    if !session.set_active_camera(Some(camera)) {
        bail!("no calibration for camera {}", camera);
    }

    let total = session.frame(frame).map_or(0, |f| f.cloud.len());
    let projection = session.projection().context("camera has no projection")?;
    println!("{} of {} points land in {}", projection.len(), total, camera);
    for p in projection.iter().take(limit) {
        println!("  {:>8} {:>9.2} {:>9.2}  depth={:.2}", p.index, p.pixel.x, p.pixel.y, p.depth);
    }

    for (id, corners) in session.projected_boxes() {
        let inside = corners.iter().filter(|c| c.is_some()).count();
        println!("  track {}: {}/8 corners in image", id, inside);
    }
    Ok(())
}

async fn export_labels(root: &Path, folder: &str, output: Option<&Path>) -> Result<()> {
    let store = FsStore::new(root);
    let labels = solution::load_labels(&store, folder).await;
    let json = labels.to_pretty_json()?;
    match output {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
            info!(frames = labels.0.len(), path = %path.display(), "labels exported");
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn check_issues(root: &Path, folder: &str, frame: u32) -> Result<()> {
    let path = issues_path(root, folder);
    let mut issues = IssueList::load(&path).context("reading issues")?;
    let changed = issues.check_frame(frame);
    if changed > 0 {
        issues.save(&path).context("writing issues")?;
    }
    println!("{} issue(s) of frame {} checked", changed, frame);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).context("setting tracing subscriber")?;

    let config = match &args.config {
        Some(path) => AnnotatorConfig::load(path).with_context(|| format!("reading config {}", path.display()))?,
        None => AnnotatorConfig::default(),
    };
    debug!(?config, "annotator config");

    match args.command {
        Command::Folders { root } => folders(&root).await,
        Command::Inspect { root, folder } => inspect(&root, &folder, config).await,
        Command::Count { root, folder, frame } => count(&root, &folder, frame, config).await,
        Command::Project {
            root,
            folder,
            frame,
            camera,
            limit,
        } => project(&root, &folder, frame, &camera, limit, config).await,
        Command::ExportLabels { root, folder, output } => export_labels(&root, &folder, output.as_deref()).await,
        Command::CheckIssues { root, folder, frame } => check_issues(&root, &folder, frame),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labelview_core::ledger::PaintMode;
    use labelview_core::Psr;
    use nalgebra::Vector3;

    const PCD: &str = "VERSION 0.7\nFIELDS x y z intensity\nPOINTS 3\nDATA ascii\n10 0 0 0.5\n10.5 0.2 0.1 0.5\n-4 0 0 0.1\n";

    fn write_scene(root: &Path) {
        let dir = root.join("scene-a");
        std::fs::create_dir_all(dir.join("pointclouds")).unwrap();
        std::fs::create_dir_all(dir.join("calibration")).unwrap();
        for frame in 0..2 {
            std::fs::write(dir.join("pointclouds").join(format!("{:06}.pcd", frame)), PCD).unwrap();
        }
        std::fs::write(
            dir.join("calibration").join("front.json"),
            r#"{ "intrinsic": [500, 0, 320, 0, 500, 240, 0, 0, 1],
                 "extrinsic": [0, -1, 0, 0, 0, 0, -1, 0, 1, 0, 0, 0, 0, 0, 0, 1],
                 "width": 640, "height": 480 }"#,
        )
        .unwrap();
    }

    async fn annotate(root: &Path) -> TrackId {
        let mut session = open_scene(root, "scene-a", AnnotatorConfig::default()).await.unwrap();
        let psr = Psr::axis_aligned(Vector3::new(10.0, 0.0, 0.0), Vector3::new(2.0, 2.0, 2.0));
        let id = session.create_track("Car", psr).unwrap();
        session.paint(&[0], 3, PaintMode::Overwrite).unwrap();
        session.flush_all().await;
        id
    }

    #[tokio::test]
    async fn test_reopened_scene_counts_points() {
        let root = tempfile::tempdir().unwrap();
        write_scene(root.path());
        let id = annotate(root.path()).await;

        let mut session = open_scene(root.path(), "scene-a", AnnotatorConfig::default()).await.unwrap();
        assert_eq!(session.frame_count(), 2);
        assert_eq!(session.cameras().count(), 1);

        let counts = point_counts(&mut session, [0, 1, 5]);
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[1].1.get(&id), Some(&2));

        let histogram = label_histogram(session.ledger());
        assert_eq!(histogram.get(&3), Some(&1));
        assert_eq!(histogram.get(&0), Some(&5));
    }

    #[tokio::test]
    async fn test_export_labels_writes_json() {
        let root = tempfile::tempdir().unwrap();
        write_scene(root.path());
        annotate(root.path()).await;

        let out = root.path().join("labels.json");
        export_labels(root.path(), "scene-a", Some(&out)).await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(json[0]["fileName"], "000000.pcd");
        assert_eq!(json[0]["labels"], serde_json::json!([3, 0, 0]));
    }

    #[test]
    fn test_check_issues_marks_one_frame() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("scene-a")).unwrap();
        let path = issues_path(root.path(), "scene-a");
        std::fs::write(
            &path,
            r#"[
                { "type": "point", "frame": 0, "pointIndex": 2, "issue": "wrong class" },
                { "type": "object", "frame": 0, "id": 1, "issue": "box too small" },
                { "type": "object", "frame": 1, "id": 1, "issue": "missing" }
            ]"#,
        )
        .unwrap();

        check_issues(root.path(), "scene-a", 0).unwrap();
        let issues = IssueList::load(&path).unwrap();
        let checked: Vec<bool> = issues.0.iter().map(|i| i.checked).collect();
        assert_eq!(checked, vec![true, true, false]);
    }
}
