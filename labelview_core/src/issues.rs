//! Moderation issues raised against a scene.

use crate::keyframes::TrackId;
use crate::solution::Xyz;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What an issue points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueKind {
    /// A single point (semantic label problem)
    Point,

    /// A cuboid track
    Object,
}

/// One moderation remark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    #[serde(rename = "type")]
    pub kind: IssueKind,

    pub frame: u32,

    #[serde(rename = "pointIndex", default, skip_serializing_if = "Option::is_none")]
    pub point_index: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TrackId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Xyz>,

    /// Moderator remark
    pub issue: String,

    /// Suggested fix shown to the annotator
    #[serde(rename = "workerHint", default)]
    pub worker_hint: String,

    #[serde(default)]
    pub resolved: bool,

    #[serde(default)]
    pub checked: bool,
}

/// The issues file of a scene.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IssueList(pub Vec<Issue>);

impl IssueList {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// A missing file is an empty list.
    pub fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let json = match std::fs::read_to_string(path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e),
        };
        Self::from_json(&json).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = self
            .to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &Issue> {
        self.0.iter().filter(|i| !i.resolved)
    }

    pub fn for_frame(&self, frame: u32) -> impl Iterator<Item = &Issue> {
        self.0.iter().filter(move |i| i.frame == frame)
    }

    /// Mark every issue of `frame` checked by the annotator. Returns how
    /// many changed.
    pub fn check_frame(&mut self, frame: u32) -> usize {
        let mut changed = 0;
        for issue in self.0.iter_mut().filter(|i| i.frame == frame && !i.checked) {
            issue.checked = true;
            changed += 1;
        }
        changed
    }
}
