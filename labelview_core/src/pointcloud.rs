//! Point-cloud frames.
//!
//! Supported formats:
//! - KITTI `.bin`: packed records of x, y, z, intensity (little-endian f32)
//! - ASCII `.pcd`: header with `FIELDS x y z [intensity ...]` and `DATA ascii`

use byteorder::{LittleEndian, ReadBytesExt};
use nalgebra::Point3;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PointCloudError {
    #[error("Point cloud I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed point cloud: {0}")]
    Malformed(String),
}

/// Supported on-disk formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudFormat {
    KittiBin,
    PcdAscii,
}

impl CloudFormat {
    pub fn detect(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        match ext.to_ascii_lowercase().as_str() {
            "bin" => Some(CloudFormat::KittiBin),
            "pcd" => Some(CloudFormat::PcdAscii),
            _ => None,
        }
    }
}

/// Positions and intensities of one scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloud {
    pub positions: Vec<Point3<f64>>,

    /// Per-point intensity; zero when the source has none
    pub intensity: Vec<f32>,
}

impl PointCloud {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Parse KITTI velodyne records (16 bytes each).
    pub fn from_kitti_bin(bytes: &[u8]) -> Result<Self, PointCloudError> {
        if bytes.len() % 16 != 0 {
            return Err(PointCloudError::Malformed(format!(
                "{} bytes is not a whole number of 16-byte records",
                bytes.len()
            )));
        }

        let count = bytes.len() / 16;
        let mut cloud = PointCloud {
            positions: Vec::with_capacity(count),
            intensity: Vec::with_capacity(count),
        };
        let mut reader = Cursor::new(bytes);
        for _ in 0..count {
            let x = reader.read_f32::<LittleEndian>()?;
            let y = reader.read_f32::<LittleEndian>()?;
            let z = reader.read_f32::<LittleEndian>()?;
            let i = reader.read_f32::<LittleEndian>()?;
            cloud.positions.push(Point3::new(x as f64, y as f64, z as f64));
            cloud.intensity.push(i);
        }
        Ok(cloud)
    }

    /// Parse an ASCII PCD file.
    pub fn from_pcd_ascii(text: &str) -> Result<Self, PointCloudError> {
        let mut lines = text.lines();
        let mut fields: Vec<String> = Vec::new();
        let mut declared_points: Option<usize> = None;

        // Header
        loop {
            let line = lines
                .next()
                .ok_or_else(|| PointCloudError::Malformed("missing DATA line".into()))?
                .trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let key = parts.next().unwrap_or_default().to_ascii_uppercase();
            match key.as_str() {
                "FIELDS" => fields = parts.map(str::to_ascii_lowercase).collect(),
                "POINTS" => {
                    declared_points = parts.next().and_then(|n| n.parse().ok());
                }
                "DATA" => {
                    let kind = parts.next().unwrap_or_default();
                    if kind != "ascii" {
                        return Err(PointCloudError::Malformed(format!("unsupported DATA {}", kind)));
                    }
                    break;
                }
                _ => {}
            }
        }

        let column = |name: &str| fields.iter().position(|f| f == name);
        let (Some(xi), Some(yi), Some(zi)) = (column("x"), column("y"), column("z")) else {
            return Err(PointCloudError::Malformed("FIELDS must include x y z".into()));
        };
        let ii = column("intensity");

        let mut cloud = PointCloud::default();
        for (n, line) in lines.enumerate() {
            let values: Vec<&str> = line.split_whitespace().collect();
            if values.is_empty() {
                continue;
            }
            if values.len() < fields.len() {
                return Err(PointCloudError::Malformed(format!("data row {} has {} values", n, values.len())));
            }
            let parse = |i: usize| -> Result<f64, PointCloudError> {
                values[i]
                    .parse::<f64>()
                    .map_err(|e| PointCloudError::Malformed(format!("data row {}: {}", n, e)))
            };
            let (x, y, z) = (parse(xi)?, parse(yi)?, parse(zi)?);
            // PCD writes NaN for missing returns
            if !(x.is_finite() && y.is_finite() && z.is_finite()) {
                continue;
            }
            cloud.positions.push(Point3::new(x, y, z));
            cloud.intensity.push(match ii {
                Some(i) => parse(i)? as f32,
                None => 0.0,
            });
        }

        if let Some(declared) = declared_points {
            if declared != cloud.len() {
                debug!(declared, parsed = cloud.len(), "PCD point count differs from header");
            }
        }
        Ok(cloud)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PointCloudError> {
        let path = path.as_ref();
        match CloudFormat::detect(path) {
            Some(CloudFormat::KittiBin) => Self::from_kitti_bin(&std::fs::read(path)?),
            Some(CloudFormat::PcdAscii) => Self::from_pcd_ascii(&std::fs::read_to_string(path)?),
            None => Err(PointCloudError::Malformed(format!("unknown format: {}", path.display()))),
        }
    }
}

/// One frame of a scene.
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: u32,
    pub file_name: String,
    pub cloud: PointCloud,
}

/// Point-cloud files of `dir` in frame order (sorted by file name).
pub fn list_frame_files(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>, PointCloudError> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && CloudFormat::detect(p).is_some())
        .collect();
    files.sort();
    Ok(files)
}

/// Load every frame of `dir`.
pub fn load_frames(dir: impl AsRef<Path>) -> Result<Vec<Frame>, PointCloudError> {
    let files = list_frame_files(dir)?;
    let mut frames = Vec::with_capacity(files.len());
    for (index, path) in (0u32..).zip(files) {
        let cloud = PointCloud::load(&path)?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        debug!(index, file = %file_name, points = cloud.len(), "frame loaded");
        frames.push(Frame { index, file_name, cloud });
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    fn kitti_bytes(points: &[[f32; 4]]) -> Vec<u8> {
        let mut out = Vec::new();
        for p in points {
            for v in p {
                out.write_f32::<LittleEndian>(*v).unwrap();
            }
        }
        out
    }

    #[test]
    fn test_kitti_bin() {
        let bytes = kitti_bytes(&[[1.0, 2.0, 3.0, 0.5], [-1.0, 0.0, 0.25, 0.0]]);
        let cloud = PointCloud::from_kitti_bin(&bytes).unwrap();
        assert_eq!(cloud.len(), 2);
        assert_eq!(cloud.positions[1], Point3::new(-1.0, 0.0, 0.25));
        assert_eq!(cloud.intensity, vec![0.5, 0.0]);
    }

    #[test]
    fn test_kitti_bin_rejects_partial_record() {
        assert!(matches!(PointCloud::from_kitti_bin(&[0u8; 20]), Err(PointCloudError::Malformed(_))));
    }

    #[test]
    fn test_pcd_ascii() {
        let text = "# .PCD v0.7\nVERSION 0.7\nFIELDS x y z intensity\nSIZE 4 4 4 4\nTYPE F F F F\nCOUNT 1 1 1 1\n\
                    WIDTH 3\nHEIGHT 1\nPOINTS 3\nDATA ascii\n1 2 3 10\nnan nan nan 0\n4.5 5 6 20\n";
        let cloud = PointCloud::from_pcd_ascii(text).unwrap();
        assert_eq!(cloud.len(), 2);
        assert_eq!(cloud.positions[1], Point3::new(4.5, 5.0, 6.0));
        assert_eq!(cloud.intensity, vec![10.0, 20.0]);
    }

    #[test]
    fn test_pcd_without_intensity() {
        let text = "FIELDS x y z\nDATA ascii\n0 0 1\n";
        let cloud = PointCloud::from_pcd_ascii(text).unwrap();
        assert_eq!(cloud.intensity, vec![0.0]);
    }

    #[test]
    fn test_pcd_binary_unsupported() {
        let text = "FIELDS x y z\nDATA binary\n";
        assert!(PointCloud::from_pcd_ascii(text).is_err());
    }

    #[test]
    fn test_load_frames_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("000001.bin"), kitti_bytes(&[[1.0, 0.0, 0.0, 0.0]])).unwrap();
        std::fs::write(dir.path().join("000000.pcd"), "FIELDS x y z\nDATA ascii\n0 0 0\n0 0 1\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let frames = load_frames(dir.path()).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].file_name, "000000.pcd");
        assert_eq!(frames[0].cloud.len(), 2);
        assert_eq!(frames[1].index, 1);
    }
}
