//! Calibration facade: observation bookkeeping, calibration flags and the
//! [`CalibrationSolver`] that turns accumulated views into a
//! [`CalibrationResult`].

use crate::camera::{CameraModelError, RadTanModel, Resolution};
use crate::geometry::{rotation_matrix, PatternGeometry};
use crate::optimization::{Optimizer, PlanarCalibrationCost};
use log::{info, warn};
use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::ops::{BitOr, BitOrAssign};

pub use crate::optimization::CalibrationError;

/// Largest magnitude accepted for a calibrated parameter.
pub const MAX_PARAMETER_MAGNITUDE: f64 = 1e8;

/// Calibration option bits, numerically identical to OpenCV's `CALIB_*` flags
/// so that stored `flagValue` entries stay comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CalibrationFlags(u32);

impl CalibrationFlags {
    pub const USE_INTRINSIC_GUESS: Self = Self(1);
    pub const FIX_ASPECT_RATIO: Self = Self(2);
    pub const FIX_PRINCIPAL_POINT: Self = Self(4);
    pub const ZERO_TANGENT_DIST: Self = Self(8);
    pub const FIX_K4: Self = Self(2048);
    pub const FIX_K5: Self = Self(4096);
    pub const FIX_K6: Self = Self(8192);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Human-readable summary written next to `flagValue`, e.g.
    /// `flags: +fix_aspectRatio +zero_tangent_dist`.
    pub fn annotation(self) -> String {
        let names = [
            (Self::USE_INTRINSIC_GUESS, "+use_intrinsic_guess"),
            (Self::FIX_ASPECT_RATIO, "+fix_aspectRatio"),
            (Self::FIX_PRINCIPAL_POINT, "+fix_principal_point"),
            (Self::ZERO_TANGENT_DIST, "+zero_tangent_dist"),
            (Self::FIX_K4, "+fix_k4"),
            (Self::FIX_K5, "+fix_k5"),
            (Self::FIX_K6, "+fix_k6"),
        ];
        let mut text = String::from("flags:");
        for (flag, name) in names {
            if self.contains(flag) {
                text.push(' ');
                text.push_str(name);
            }
        }
        text
    }
}

impl BitOr for CalibrationFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CalibrationFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Which higher-order radial terms stay pinned at zero. All three are fixed
/// unless the settings say otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistortionPolicy {
    pub fix_k4: bool,
    pub fix_k5: bool,
    pub fix_k6: bool,
}

impl Default for DistortionPolicy {
    fn default() -> Self {
        DistortionPolicy {
            fix_k4: true,
            fix_k5: true,
            fix_k6: true,
        }
    }
}

impl DistortionPolicy {
    pub fn flags(&self) -> CalibrationFlags {
        let mut flags = CalibrationFlags::empty();
        if self.fix_k4 {
            flags |= CalibrationFlags::FIX_K4;
        }
        if self.fix_k5 {
            flags |= CalibrationFlags::FIX_K5;
        }
        if self.fix_k6 {
            flags |= CalibrationFlags::FIX_K6;
        }
        flags
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationOptions {
    /// Resolved flags, distortion policy included.
    pub flags: CalibrationFlags,
    /// `fx / fy` under [`CalibrationFlags::FIX_ASPECT_RATIO`]; 1.0 when unset.
    pub aspect_ratio: Option<f64>,
    pub max_iterations: usize,
    pub verbose: bool,
}

impl Default for CalibrationOptions {
    fn default() -> Self {
        CalibrationOptions {
            flags: DistortionPolicy::default().flags(),
            aspect_ratio: None,
            max_iterations: 100,
            verbose: false,
        }
    }
}

/// Ordered detections, one entry per accepted view, each holding exactly
/// `points_per_view` image points.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationSet {
    points_per_view: usize,
    views: Vec<Vec<Vector2<f64>>>,
}

impl ObservationSet {
    pub fn new(points_per_view: usize) -> Self {
        ObservationSet {
            points_per_view,
            views: Vec::new(),
        }
    }

    pub fn push(&mut self, view: Vec<Vector2<f64>>) -> Result<(), CalibrationError> {
        if view.len() != self.points_per_view {
            return Err(CalibrationError::PointCountMismatch {
                view: self.views.len(),
                expected: self.points_per_view,
                found: view.len(),
            });
        }
        self.views.push(view);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn points_per_view(&self) -> usize {
        self.points_per_view
    }

    pub fn views(&self) -> &[Vec<Vector2<f64>>] {
        &self.views
    }

    /// Drops every view; only used when the operator resets a session.
    pub fn clear(&mut self) {
        self.views.clear();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationResult {
    pub camera_matrix: Matrix3<f64>,
    /// `[k1, k2, p1, p2, k3, k4, k5, k6]`
    pub distortion: [f64; 8],
    pub rvecs: Vec<Vector3<f64>>,
    pub tvecs: Vec<Vector3<f64>>,
    pub per_view_errors: Vec<f64>,
    pub avg_error: f64,
    /// RMS of the optimizer residuals at the solution.
    pub solver_rms: f64,
    pub flags: CalibrationFlags,
    pub aspect_ratio: Option<f64>,
    pub image_size: Resolution,
    pub valid: bool,
}

impl CalibrationResult {
    pub fn camera_model(&self) -> Result<RadTanModel, CameraModelError> {
        RadTanModel::from_camera_matrix(&self.camera_matrix, &self.distortion, self.image_size)
    }
}

/// A finished capture session: the views that were used and what they produced.
#[derive(Debug, Clone)]
pub struct CalibrationRun {
    pub observations: ObservationSet,
    pub image_size: Resolution,
    pub result: CalibrationResult,
}

/// Every entry finite and within [`MAX_PARAMETER_MAGNITUDE`], focal lengths positive.
pub fn parameters_in_range(camera_matrix: &Matrix3<f64>, distortion: &[f64]) -> bool {
    let in_range = |v: &f64| v.is_finite() && v.abs() <= MAX_PARAMETER_MAGNITUDE;
    camera_matrix.iter().all(in_range)
        && distortion.iter().all(in_range)
        && camera_matrix[(0, 0)] > 0.0
        && camera_matrix[(1, 1)] > 0.0
}

/// Per-view RMS reprojection error and the RMS over all points.
///
/// A point that ends up behind the camera counts as an infinite error.
pub fn reprojection_errors(
    model: &RadTanModel,
    object_points: &[Vector3<f64>],
    views: &[Vec<Vector2<f64>>],
    rvecs: &[Vector3<f64>],
    tvecs: &[Vector3<f64>],
) -> (Vec<f64>, f64) {
    let mut per_view = Vec::with_capacity(views.len());
    let mut total_err = 0.0;
    let mut total_points = 0usize;

    for ((view, rvec), tvec) in views.iter().zip(rvecs).zip(tvecs) {
        let r = rotation_matrix(rvec);
        let err2: f64 = object_points
            .iter()
            .zip(view)
            .map(|(p, observed)| match model.project_point(&(r * p + tvec)) {
                Some(projected) => (observed - projected).norm_squared(),
                None => f64::INFINITY,
            })
            .sum();
        let n = view.len();
        per_view.push(if n > 0 { (err2 / n as f64).sqrt() } else { 0.0 });
        total_err += err2;
        total_points += n;
    }

    let avg = if total_points > 0 {
        (total_err / total_points as f64).sqrt()
    } else {
        0.0
    };
    (per_view, avg)
}

/// Computes camera parameters from accumulated observations.
pub trait CalibrationSolver {
    fn calibrate(
        &self,
        observations: &ObservationSet,
        geometry: &PatternGeometry,
        image_size: Resolution,
    ) -> Result<CalibrationResult, CalibrationError>;
}

/// Homography initialisation followed by joint Levenberg-Marquardt refinement.
#[derive(Debug, Clone, Default)]
pub struct PlanarCalibrator {
    pub options: CalibrationOptions,
}

impl PlanarCalibrator {
    pub fn new(options: CalibrationOptions) -> Self {
        PlanarCalibrator { options }
    }
}

impl CalibrationSolver for PlanarCalibrator {
    fn calibrate(
        &self,
        observations: &ObservationSet,
        geometry: &PatternGeometry,
        image_size: Resolution,
    ) -> Result<CalibrationResult, CalibrationError> {
        if observations.is_empty() {
            return Err(CalibrationError::NoObservations);
        }
        let object_points = geometry.object_points();
        let flags = self.options.flags;

        let mut cost = PlanarCalibrationCost::new(
            object_points.clone(),
            observations.views().to_vec(),
            image_size,
            flags,
            self.options.aspect_ratio,
        )?
        .with_max_iterations(self.options.max_iterations);
        cost.linear_estimation()?;
        cost.optimize(self.options.verbose)?;

        let model = cost.model().clone();
        let (rvecs, tvecs): (Vec<_>, Vec<_>) = cost.poses().iter().copied().unzip();
        let (per_view_errors, avg_error) =
            reprojection_errors(&model, &object_points, observations.views(), &rvecs, &tvecs);
        let solver_rms = cost.residual_rms();

        let camera_matrix = model.camera_matrix();
        let valid = parameters_in_range(&camera_matrix, &model.distortions);
        info!("Re-projection error reported by the solver: {:.6}", solver_rms);
        if valid {
            info!(
                "Calibration succeeded over {} views, avg re-projection error = {:.6}",
                observations.len(),
                avg_error
            );
        } else {
            warn!(
                "Calibration failed: parameters out of range, avg re-projection error = {}",
                avg_error
            );
        }

        Ok(CalibrationResult {
            camera_matrix,
            distortion: model.distortions,
            rvecs,
            tvecs,
            per_view_errors,
            avg_error,
            solver_rms,
            flags,
            aspect_ratio: flags
                .contains(CalibrationFlags::FIX_ASPECT_RATIO)
                .then(|| self.options.aspect_ratio.unwrap_or(1.0)),
            image_size,
            valid,
        })
    }
}
