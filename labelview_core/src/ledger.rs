//! The "LEDGER" - per-frame point labels with bounded undo/redo
//!
//! Each loaded frame owns a dense array of class indices (0 = void). Tools
//! mutate the array in place; [`LabelLedger::request_save`] is the commit
//! point that feeds the undo stack and decides whether a write is needed.

use crate::classifier::classify_obb;
use crate::geometry::Obb;
use nalgebra::Point3;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use thiserror::Error;
use tracing::{debug, warn};

/// Class index of unlabeled points
pub const VOID_LABEL: u8 = 0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Frame {0} has no labels loaded")]
    FrameNotLoaded(u32),
}

/// Result of a save request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveRequest {
    /// Labels equal the last requested content; nothing to write
    Skipped,

    /// Labels to persist
    Write(Vec<u8>),
}

/// Result of undo/redo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryOutcome {
    Applied,

    /// The stack was empty; labels are unchanged
    Empty,
}

/// How a brush treats already labeled points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaintMode {
    #[default]
    Overwrite,

    /// Only void points take the new class
    UnlabeledOnly,
}

#[derive(Debug, Clone)]
struct FrameLabels {
    labels: Vec<u8>,

    /// Labels as of the last save request (the pre-mutation state of the
    /// edits made since)
    committed: Vec<u8>,

    undo: VecDeque<Vec<u8>>,
    redo: VecDeque<Vec<u8>>,

    /// Content of the last write handed out, `None` after a failure
    last_requested: Option<Vec<u8>>,

    dirty: bool,
}

impl FrameLabels {
    fn new(labels: Vec<u8>) -> Self {
        Self {
            committed: labels.clone(),
            last_requested: Some(labels.clone()),
            labels,
            undo: VecDeque::new(),
            redo: VecDeque::new(),
            dirty: false,
        }
    }
}

/// Label arrays of every loaded frame.
#[derive(Debug, Clone)]
pub struct LabelLedger {
    frames: BTreeMap<u32, FrameLabels>,
    undo_depth: usize,
}

impl Default for LabelLedger {
    fn default() -> Self {
        Self::new(10)
    }
}

impl LabelLedger {
    pub fn new(undo_depth: usize) -> Self {
        Self {
            frames: BTreeMap::new(),
            undo_depth: undo_depth.max(1),
        }
    }

    /// Install the labels of a freshly loaded frame.
    ///
    /// `stored` is the persisted array, if any. An array whose length does
    /// not match the point count is discarded with a warning and the frame
    /// starts void. The loaded state counts as persisted.
    pub fn load_frame(&mut self, frame: u32, point_count: usize, stored: Option<Vec<u8>>) {
        let labels = match stored {
            Some(labels) if labels.len() == point_count => labels,
            Some(labels) => {
                warn!(
                    frame,
                    expected = point_count,
                    got = labels.len(),
                    "stored labels do not match point count, starting void"
                );
                vec![VOID_LABEL; point_count]
            }
            None => vec![VOID_LABEL; point_count],
        };
        self.frames.insert(frame, FrameLabels::new(labels));
    }

    /// Load a void frame unless the frame is already present.
    pub fn ensure_frame(&mut self, frame: u32, point_count: usize) {
        if !self.frames.contains_key(&frame) {
            self.load_frame(frame, point_count, None);
        }
    }

    pub fn unload_frame(&mut self, frame: u32) -> bool {
        self.frames.remove(&frame).is_some()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn is_loaded(&self, frame: u32) -> bool {
        self.frames.contains_key(&frame)
    }

    pub fn frames(&self) -> impl Iterator<Item = u32> + '_ {
        self.frames.keys().copied()
    }

    pub fn labels(&self, frame: u32) -> Option<&[u8]> {
        self.frames.get(&frame).map(|f| f.labels.as_slice())
    }

    pub fn is_dirty(&self, frame: u32) -> bool {
        self.frames.get(&frame).is_some_and(|f| f.dirty)
    }

    pub fn dirty_frames(&self) -> BTreeSet<u32> {
        self.frames
            .iter()
            .filter(|(_, f)| f.dirty)
            .map(|(frame, _)| *frame)
            .collect()
    }

    pub fn undo_len(&self, frame: u32) -> usize {
        self.frames.get(&frame).map_or(0, |f| f.undo.len())
    }

    pub fn redo_len(&self, frame: u32) -> usize {
        self.frames.get(&frame).map_or(0, |f| f.redo.len())
    }

    fn frame_mut(&mut self, frame: u32) -> Result<&mut FrameLabels, LedgerError> {
        self.frames.get_mut(&frame).ok_or(LedgerError::FrameNotLoaded(frame))
    }

    // ========================================================================
    // TOOLS
    // ========================================================================

    /// Brush `class` onto `indices`. Out-of-range indices are ignored.
    /// Returns the number of points whose label changed.
    pub fn paint(
        &mut self,
        frame: u32,
        indices: impl IntoIterator<Item = usize>,
        class: u8,
        mode: PaintMode,
    ) -> Result<usize, LedgerError> {
        let entry = self.frame_mut(frame)?;
        let mut changed = 0;
        for i in indices {
            let Some(label) = entry.labels.get_mut(i) else {
                continue;
            };
            if mode == PaintMode::UnlabeledOnly && *label != VOID_LABEL {
                continue;
            }
            if *label != class {
                *label = class;
                changed += 1;
            }
        }
        entry.dirty |= changed > 0;
        Ok(changed)
    }

    /// Fill a resolved polygon, lasso or rectangle selection.
    pub fn fill_indices(&mut self, frame: u32, indices: &[usize], class: u8) -> Result<usize, LedgerError> {
        self.paint(frame, indices.iter().copied(), class, PaintMode::Overwrite)
    }

    /// Relabel every point for which `predicate(index, label, position)`
    /// holds. `positions` are the frame's points.
    pub fn relabel_where<F>(
        &mut self,
        frame: u32,
        positions: &[Point3<f64>],
        class: u8,
        predicate: F,
    ) -> Result<usize, LedgerError>
    where
        F: Fn(usize, u8, &Point3<f64>) -> bool,
    {
        let entry = self.frame_mut(frame)?;
        let mut changed = 0;
        for (i, (label, p)) in entry.labels.iter_mut().zip(positions).enumerate() {
            if *label != class && predicate(i, *label, p) {
                *label = class;
                changed += 1;
            }
        }
        entry.dirty |= changed > 0;
        Ok(changed)
    }

    /// Assign `class` to every point inside `obb`.
    pub fn relabel_inside_cuboid(
        &mut self,
        frame: u32,
        positions: &[Point3<f64>],
        obb: &Obb,
        class: u8,
    ) -> Result<usize, LedgerError> {
        let members = classify_obb(positions, obb, true);
        self.fill_indices(frame, &members, class)
    }

    // ========================================================================
    // SAVE / HISTORY
    // ========================================================================

    /// Commit the edits of `frame`.
    ///
    /// With `update_stack`, the state before the edits is pushed onto the
    /// undo stack (oldest dropped past the depth) and the redo stack is
    /// cleared. Independently of the flag, a write is only requested when
    /// the labels differ from the last requested content.
    pub fn request_save(&mut self, frame: u32, update_stack: bool) -> Result<SaveRequest, LedgerError> {
        let depth = self.undo_depth;
        let entry = self.frame_mut(frame)?;

        if update_stack && entry.labels != entry.committed {
            let previous = std::mem::replace(&mut entry.committed, entry.labels.clone());
            entry.undo.push_back(previous);
            while entry.undo.len() > depth {
                entry.undo.pop_front();
            }
            entry.redo.clear();
        } else {
            entry.committed.clone_from(&entry.labels);
        }

        if entry.last_requested.as_deref() == Some(entry.labels.as_slice()) {
            debug!(frame, "labels unchanged, save skipped");
            entry.dirty = false;
            return Ok(SaveRequest::Skipped);
        }

        entry.last_requested = Some(entry.labels.clone());
        entry.dirty = true;
        Ok(SaveRequest::Write(entry.labels.clone()))
    }

    /// A write of `written` succeeded. Clears the dirty flag unless the
    /// labels moved on in the meantime.
    pub fn mark_persisted(&mut self, frame: u32, written: &[u8]) {
        if let Some(entry) = self.frames.get_mut(&frame) {
            if entry.labels == written {
                entry.last_requested = Some(written.to_vec());
                entry.dirty = false;
            }
        }
    }

    /// A write failed. The frame stays dirty and the next request writes
    /// again.
    pub fn mark_failed(&mut self, frame: u32) {
        if let Some(entry) = self.frames.get_mut(&frame) {
            entry.last_requested = None;
            entry.dirty = true;
        }
    }

    pub fn undo(&mut self, frame: u32) -> Result<HistoryOutcome, LedgerError> {
        let depth = self.undo_depth;
        let entry = self.frame_mut(frame)?;
        let Some(previous) = entry.undo.pop_back() else {
            return Ok(HistoryOutcome::Empty);
        };
        let current = std::mem::replace(&mut entry.labels, previous);
        entry.redo.push_back(current);
        while entry.redo.len() > depth {
            entry.redo.pop_front();
        }
        entry.committed.clone_from(&entry.labels);
        entry.dirty = true;
        Ok(HistoryOutcome::Applied)
    }

    pub fn redo(&mut self, frame: u32) -> Result<HistoryOutcome, LedgerError> {
        let depth = self.undo_depth;
        let entry = self.frame_mut(frame)?;
        let Some(next) = entry.redo.pop_back() else {
            return Ok(HistoryOutcome::Empty);
        };
        let current = std::mem::replace(&mut entry.labels, next);
        entry.undo.push_back(current);
        while entry.undo.len() > depth {
            entry.undo.pop_front();
        }
        entry.committed.clone_from(&entry.labels);
        entry.dirty = true;
        Ok(HistoryOutcome::Applied)
    }
}
