//! Annotator settings.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables of an annotation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotatorConfig {
    /// Undo states kept per frame
    pub undo_depth: usize,

    /// Quiet period after the last edit before a save is written (ms)
    pub autosave_delay_ms: u64,

    /// Upper bound on one store write (ms)
    pub save_timeout_ms: u64,

    /// Radius of the nearest-point hover lookup (pixels)
    pub hover_radius_px: f64,

    /// Cell size of the reverse pixel index (pixels)
    pub pixel_bucket_px: f64,

    /// Image size assumed when a calibration file omits it
    pub image_width: u32,
    pub image_height: u32,
}

impl Default for AnnotatorConfig {
    fn default() -> Self {
        Self {
            undo_depth: 10,
            autosave_delay_ms: 1000, // 1 s after the last edit
            save_timeout_ms: 10_000,
            hover_radius_px: 6.0,
            pixel_bucket_px: 16.0,
            image_width: 1920,
            image_height: 1080,
        }
    }
}

impl AnnotatorConfig {
    pub fn autosave_delay(&self) -> Duration {
        Duration::from_millis(self.autosave_delay_ms)
    }

    pub fn save_timeout(&self) -> Duration {
        Duration::from_millis(self.save_timeout_ms)
    }

    pub fn default_image_size(&self) -> (u32, u32) {
        (self.image_width, self.image_height)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Read a JSON config file. Missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = AnnotatorConfig::from_json(r#"{ "undo_depth": 3, "hover_radius_px": 10.0 }"#).unwrap();
        assert_eq!(config.undo_depth, 3);
        assert_eq!(config.hover_radius_px, 10.0);
        assert_eq!(config.autosave_delay(), Duration::from_secs(1));
        assert_eq!(config.default_image_size(), (1920, 1080));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("annotator.json");
        std::fs::write(&path, r#"{ "autosave_delay_ms": 250 }"#).unwrap();

        let config = AnnotatorConfig::load(&path).unwrap();
        assert_eq!(config.autosave_delay_ms, 250);
        assert_eq!(config.undo_depth, 10);
    }
}
