//! Common types for the LabelView environment abstraction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of one scene session (one folder selection).
///
/// A fresh id is minted on every folder change so that late save results
/// from a previous session can be recognised and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Creates a new random SessionId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// The two independent save streams of a scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    /// Per-frame cuboid tracks
    Objects,
    /// Per-frame point labels
    Labels,
}

impl StreamKind {
    /// File name used by file-backed stores.
    pub fn file_name(&self) -> &'static str {
        match self {
            StreamKind::Objects => "objects.msgpack.z",
            StreamKind::Labels => "labels.msgpack.z",
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Objects => write!(f, "objects"),
            StreamKind::Labels => write!(f, "labels"),
        }
    }
}

/// A compressed solution payload on its way to storage.
///
/// `sequence` orders saves within one stream; a store result is only
/// honoured if its sequence is still the latest one issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveEnvelope {
    /// Which stream this payload replaces
    pub stream: StreamKind,

    /// Scene folder name
    pub folder: String,

    /// Monotonic save ticket within the stream
    pub sequence: u64,

    /// DEFLATE-compressed MessagePack bytes
    pub payload: Vec<u8>,
}

impl SaveEnvelope {
    /// Creates a new envelope from payload bytes.
    pub fn new(stream: StreamKind, folder: impl Into<String>, sequence: u64, payload: Vec<u8>) -> Self {
        Self {
            stream,
            folder: folder.into(),
            sequence,
            payload,
        }
    }

    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
        assert_eq!(SessionId::new().to_string().len(), 8);
    }

    #[test]
    fn test_stream_file_names_differ() {
        assert_ne!(StreamKind::Objects.file_name(), StreamKind::Labels.file_name());
        assert_eq!(StreamKind::Labels.to_string(), "labels");
    }
}
