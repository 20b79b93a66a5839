//! LabelView Core - 3D annotation geometry engine for LiDAR scenes
//!
//! The engine answers three questions for an annotator:
//! 1. **Where is the object?** Keyframed cuboid tracks interpolated per frame
//! 2. **Which points does it hold?** Closed oriented-box membership per frame
//! 3. **Where does a point land in the image?** Calibrated camera projection
//!
//! Around that sit the label ledger with bounded undo/redo, the compressed
//! MessagePack solution format and a debounced latest-wins autosave, wired
//! together by [`session::SceneSession`].

pub mod autosave;
pub mod classifier;
pub mod config;
pub mod geometry;
pub mod issues;
pub mod keyframes;
pub mod ledger;
pub mod pointcloud;
pub mod projection;
pub mod session;
pub mod solution;

// Re-export key types for convenience
pub use autosave::{Debounce, SaveOutcome, SaveStream};
pub use classifier::{classify, MembershipCache};
pub use config::AnnotatorConfig;
pub use geometry::{Obb, Psr, Ray};
pub use keyframes::{InterpolatedPose, Markers, PoseError, Track, TrackId, TrackSet};
pub use ledger::{HistoryOutcome, LabelLedger, LedgerError, PaintMode, SaveRequest};
pub use pointcloud::{Frame, PointCloud, PointCloudError};
pub use projection::{project, CalibrationError, CameraModel, Distortion, ProjectedPointSet, ProjectionCache};
pub use session::{SceneSession, SessionError, TickReport};
pub use solution::{LabelSolution, ObjectSolution, SolutionError};
