//! Rendering-side derivations from a calibrated camera: the OpenGL-style
//! projection frustum and the per-frame model-view transform of the board.

pub mod frustum;
pub mod pose;

pub use frustum::{build_frustum, Frustum, FrustumConvention, FrustumOptions};
pub use pose::{PlanarPoseSolver, PoseSolver, PoseTracker, PoseTransform};

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum RenderError {
    #[error("Camera matrix is not invertible")]
    SingularCameraMatrix,
    #[error("Invalid clip planes: near {near}, far {far}")]
    InvalidClipPlanes { near: f64, far: f64 },
    #[error("Viewport {0}x{1} spans no area")]
    DegenerateViewport(u32, u32),
}
