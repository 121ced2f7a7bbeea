//! AR Calibration Tools
//!
//! Planar-pattern camera calibration for augmented-reality rendering:
//! - Validated settings and frame acquisition (camera, video, image list)
//! - Capture loop accumulating pattern detections
//! - Joint intrinsics / distortion / pose refinement with tiny-solver
//! - OpenCV-compatible calibration records
//! - Projection frustum and model-view transform for a renderer

pub mod calibration;
pub mod camera;
pub mod capture;
pub mod geometry;
pub mod input;
pub mod optimization;
pub mod render;
pub mod settings;
pub mod store;
pub mod util;

// Re-export commonly used types
pub use calibration::{
    CalibrationFlags, CalibrationOptions, CalibrationResult, CalibrationRun, CalibrationSolver,
    DistortionPolicy, ObservationSet, PlanarCalibrator,
};
pub use camera::{CameraModel, CameraModelError, Intrinsics, RadTanModel, Resolution};
pub use capture::{CaptureOutcome, CaptureSession, LoopSignal};
pub use geometry::{BoardSize, Pattern, PatternGeometry};
pub use input::{InputDescriptor, InputSource};
pub use optimization::{CalibrationError, Optimizer};
pub use render::{build_frustum, Frustum, FrustumOptions, PoseTracker, PoseTransform};
pub use settings::{ConfigError, Settings};
