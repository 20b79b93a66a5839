//! Solution wire format.
//!
//! Both streams are MessagePack (maps with named fields) compressed with
//! DEFLATE in a zlib container:
//! - objects: one entry per frame, `{cuboids: [{id, type, psr, visible, attributes}]}`
//! - labels: one entry per frame file, `{folderName, fileName, labels}`
//!
//! Decoding treats empty input as "no solution yet". Anything malformed is
//! a [`SolutionError::Decode`] that loaders degrade to an empty solution.

use crate::geometry::Psr;
use crate::keyframes::{Track, TrackId, TrackSet};
use crate::ledger::LabelLedger;
use flate2::write::ZlibEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};
use labelview_env::{EnvError, SolutionStore, StreamKind};
use nalgebra::Vector3;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SolutionError {
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error(transparent)]
    Storage(#[from] EnvError),
}

// ============================================================================
// WIRE TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Xyz {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl From<Vector3<f64>> for Xyz {
    fn from(v: Vector3<f64>) -> Self {
        Self { x: v.x, y: v.y, z: v.z }
    }
}

impl From<Xyz> for Vector3<f64> {
    fn from(v: Xyz) -> Self {
        Vector3::new(v.x, v.y, v.z)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PsrWire {
    pub position: Xyz,
    pub scale: Xyz,
    pub rotation: Xyz,
}

impl From<Psr> for PsrWire {
    fn from(psr: Psr) -> Self {
        Self {
            position: psr.position.into(),
            scale: psr.scale.into(),
            rotation: psr.rotation.into(),
        }
    }
}

impl From<PsrWire> for Psr {
    fn from(w: PsrWire) -> Self {
        Psr::new(w.position.into(), w.scale.into(), w.rotation.into())
    }
}

fn default_visible() -> bool {
    true
}

/// One cuboid in one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CuboidEntry {
    pub id: TrackId,

    #[serde(rename = "type")]
    pub class: String,

    pub psr: PsrWire,

    #[serde(default = "default_visible")]
    pub visible: bool,

    #[serde(default)]
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameObjects {
    #[serde(default)]
    pub cuboids: Vec<CuboidEntry>,
}

/// Object-track stream: the per-frame expansion of every track.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectSolution(pub Vec<FrameObjects>);

/// Labels of one frame file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelFrameEntry {
    #[serde(rename = "folderName")]
    pub folder_name: String,

    #[serde(rename = "fileName")]
    pub file_name: String,

    #[serde(with = "serde_bytes")]
    pub labels: Vec<u8>,
}

/// Point-label stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSolution(pub Vec<LabelFrameEntry>);

// ============================================================================
// CODEC
// ============================================================================

/// MessagePack + zlib.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, SolutionError> {
    let packed = rmp_serde::to_vec_named(value).map_err(|e| SolutionError::Encode(e.to_string()))?;
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(packed.len() / 2), Compression::default());
    encoder
        .write_all(&packed)
        .map_err(|e| SolutionError::Encode(e.to_string()))?;
    encoder.finish().map_err(|e| SolutionError::Encode(e.to_string()))
}

/// Inverse of [`encode`]. Also accepts raw DEFLATE streams. Empty input
/// yields the default (empty) value.
pub fn decode<T: DeserializeOwned + Default>(bytes: &[u8]) -> Result<T, SolutionError> {
    if bytes.is_empty() {
        return Ok(T::default());
    }
    let packed = inflate(bytes)?;
    if packed.is_empty() {
        return Ok(T::default());
    }
    rmp_serde::from_slice(&packed).map_err(|e| SolutionError::Decode(e.to_string()))
}

/// [`decode`], degrading malformed input to the empty value.
pub fn decode_or_empty<T: DeserializeOwned + Default>(bytes: &[u8], what: &str) -> T {
    decode(bytes).unwrap_or_else(|e| {
        warn!(stream = what, bytes = bytes.len(), "treating malformed solution as empty: {}", e);
        T::default()
    })
}

/// Inflate a zlib stream, falling back to raw DEFLATE. The stream must
/// reach its end marker; truncated input is an error.
fn inflate(bytes: &[u8]) -> Result<Vec<u8>, SolutionError> {
    inflate_with(bytes, true).or_else(|_| inflate_with(bytes, false))
}

fn inflate_with(bytes: &[u8], zlib_header: bool) -> Result<Vec<u8>, SolutionError> {
    let mut inflater = Decompress::new(zlib_header);
    let mut out = Vec::with_capacity(bytes.len().saturating_mul(4).max(1024));

    loop {
        if out.len() == out.capacity() {
            out.reserve(out.capacity());
        }
        let consumed = inflater.total_in() as usize;
        let status = inflater
            .decompress_vec(&bytes[consumed..], &mut out, FlushDecompress::Finish)
            .map_err(|e| SolutionError::Decode(format!("inflate: {}", e)))?;

        match status {
            Status::StreamEnd => return Ok(out),
            Status::Ok | Status::BufError => {
                let input_done = inflater.total_in() as usize >= bytes.len();
                if input_done && out.len() < out.capacity() {
                    return Err(SolutionError::Decode("inflate: truncated stream".into()));
                }
            }
        }
    }
}

/// Encode on the blocking pool so frame ticks keep running.
pub async fn encode_in_background<T>(value: T) -> Result<Vec<u8>, SolutionError>
where
    T: Serialize + Send + 'static,
{
    tokio::task::spawn_blocking(move || encode(&value))
        .await
        .map_err(|e| SolutionError::Encode(format!("encode task failed: {}", e)))?
}

// ============================================================================
// OBJECT TRACKS
// ============================================================================

impl ObjectSolution {
    pub fn frame_count(&self) -> usize {
        self.0.len()
    }

    /// Expand every track over the scene's frames.
    ///
    /// Tracks hold their pose outside the keyframed range, so each posed
    /// track appears in every frame; hidden frames carry `visible: false`.
    /// Pose-less tracks are left out.
    pub fn from_tracks(tracks: &TrackSet) -> Self {
        let posed: Vec<&Track> = tracks
            .iter()
            .filter(|t| {
                if !t.has_pose() {
                    warn!(track = %t.id, "track has no keyframes, left out of the solution");
                }
                t.has_pose()
            })
            .collect();

        let frames = (0..tracks.frame_count())
            .map(|frame| FrameObjects {
                cuboids: posed
                    .iter()
                    .filter_map(|t| {
                        let pose = t.interpolate(frame).ok()?;
                        Some(CuboidEntry {
                            id: t.id.clone(),
                            class: t.class.clone(),
                            psr: pose.psr.into(),
                            visible: pose.visible,
                            attributes: t.attributes.clone(),
                        })
                    })
                    .collect(),
            })
            .collect();
        Self(frames)
    }

    /// Rebuild tracks; every persisted entry becomes a keyframe.
    ///
    /// Entries with a non-positive scale are skipped with a warning.
    pub fn to_tracks(&self) -> TrackSet {
        let frame_count = u32::try_from(self.0.len()).unwrap_or(u32::MAX);
        let mut tracks: BTreeMap<TrackId, Track> = BTreeMap::new();

        for (frame, objects) in (0u32..).zip(&self.0) {
            for entry in &objects.cuboids {
                let track = tracks.entry(entry.id.clone()).or_insert_with(|| {
                    let mut t = Track::new(entry.id.clone(), entry.class.clone(), frame_count);
                    t.attributes = entry.attributes.clone();
                    t
                });
                if let Err(e) = track.insert_keyframe_with_visibility(frame, entry.psr.into(), entry.visible) {
                    warn!(track = %entry.id, frame, "skipping persisted entry: {}", e);
                }
            }
        }

        let mut set = TrackSet::new(frame_count);
        for track in tracks.into_values() {
            set.insert(track);
        }
        set
    }

    /// [`ObjectSolution::to_tracks`], then reduce each track to its authored
    /// keyframes. Tracks without markers keep every entry.
    pub fn to_tracks_with_keyframes(&self, authored: &BTreeMap<TrackId, BTreeSet<u32>>) -> TrackSet {
        let mut set = self.to_tracks();
        for (id, frames) in authored {
            if let Some(track) = set.get_mut(id) {
                let dropped = track.retain_keyframes(frames);
                debug!(track = %id, dropped, "reduced to authored keyframes");
            }
        }
        set
    }
}

// ============================================================================
// LABELS
// ============================================================================

impl LabelSolution {
    /// Entries for every loaded frame of `ledger`. `file_names[i]` names
    /// frame `i`; frames without a name are skipped.
    pub fn from_ledger(ledger: &LabelLedger, folder: &str, file_names: &[String]) -> Self {
        let entries = ledger
            .frames()
            .filter_map(|frame| {
                let file_name = file_names.get(frame as usize)?;
                let labels = ledger.labels(frame)?;
                Some(LabelFrameEntry {
                    folder_name: folder.to_string(),
                    file_name: file_name.clone(),
                    labels: labels.to_vec(),
                })
            })
            .collect();
        Self(entries)
    }

    pub fn labels_for(&self, file_name: &str) -> Option<&[u8]> {
        self.0
            .iter()
            .find(|e| e.file_name == file_name)
            .map(|e| e.labels.as_slice())
    }

    /// The stored JSON rendition (labels as a number array).
    pub fn to_pretty_json(&self) -> Result<String, SolutionError> {
        serde_json::to_string_pretty(self).map_err(|e| SolutionError::Encode(e.to_string()))
    }
}

// ============================================================================
// LOADING
// ============================================================================

async fn load_stream<S, T>(store: &S, stream: StreamKind, folder: &str) -> T
where
    S: SolutionStore + ?Sized,
    T: DeserializeOwned + Default,
{
    match store.load(stream, folder).await {
        Ok(Some(bytes)) => decode_or_empty(&bytes, &stream.to_string()),
        Ok(None) => {
            debug!(%stream, folder, "no solution yet");
            T::default()
        }
        Err(e) => {
            warn!(%stream, folder, "solution unavailable, starting empty: {}", e);
            T::default()
        }
    }
}

/// Load the object stream of `folder`; any failure yields an empty solution.
pub async fn load_objects<S: SolutionStore + ?Sized>(store: &S, folder: &str) -> ObjectSolution {
    load_stream(store, StreamKind::Objects, folder).await
}

/// Load the label stream of `folder`; any failure yields an empty solution.
pub async fn load_labels<S: SolutionStore + ?Sized>(store: &S, folder: &str) -> LabelSolution {
    load_stream(store, StreamKind::Labels, folder).await
}
