//! Non-linear refinement on top of `tiny_solver`.
//!
//! Two problems are solved here, each behind the [`Optimizer`] trait:
//!
//! * [`PlanarCalibrationCost`]: intrinsics, the eight distortion coefficients
//!   and one pose per view, from observations of a planar board;
//! * [`PnpOptimizationCost`]: the pose of a planar board seen by an already
//!   calibrated camera.
//!
//! Both start from a linear estimate obtained from plane homographies
//! ([`Optimizer::linear_estimation`]) and are then refined with
//! Levenberg-Marquardt ([`Optimizer::optimize`]).

use crate::camera::CameraModelError;
use crate::geometry::GeometryError;

pub mod planar;
pub mod pnp;

pub use planar::PlanarCalibrationCost;
pub use pnp::PnpOptimizationCost;

#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("No observations to calibrate from")]
    NoObservations,
    #[error("View {view} has {found} points, expected {expected}")]
    PointCountMismatch {
        view: usize,
        expected: usize,
        found: usize,
    },
    #[error("Linear initialisation failed: {0}")]
    Geometry(#[from] GeometryError),
    #[error("Optimization failed: {0}")]
    SolverFailed(String),
    #[error("Camera model error: {0}")]
    Camera(#[from] CameraModelError),
}

/// A trait for camera model optimization tasks.
///
/// Types implementing `Optimizer` refine the parameters of a camera (or of a
/// pose seen by one) by minimising the reprojection error of known 3D-2D
/// correspondences.
pub trait Optimizer {
    /// Performs non-linear optimization of the parameters.
    ///
    /// # Arguments
    ///
    /// * `verbose` - If `true`, progress is reported through the `log` facade.
    fn optimize(&mut self, verbose: bool) -> Result<(), CalibrationError>;

    /// Computes the closed-form starting point used by [`Optimizer::optimize`].
    fn linear_estimation(&mut self) -> Result<(), CalibrationError>
    where
        Self: Sized;
}
