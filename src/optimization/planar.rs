//! Joint calibration of intrinsics, distortion and per-view board poses.
//!
//! Parameter blocks handed to `tiny_solver`:
//!
//! | block      | size | layout                                   |
//! |------------|------|------------------------------------------|
//! | intrinsics | 4    | `fx, fy, cx, cy`                         |
//! | distortion | 8    | `k1, k2, p1, p2, k3, k4, k5, k6`         |
//! | pose_i     | 6    | rotation vector, translation (view `i`)  |
//!
//! Calibration flags become fixed entries of these blocks.

use crate::calibration::CalibrationFlags;
use crate::camera::rad_tan::{distort, DISTORTION_LEN};
use crate::camera::{Intrinsics, RadTanModel, Resolution};
use crate::geometry::{decompose_homography, find_homography, rotate_point, rotation_vector};
use crate::optimization::{CalibrationError, Optimizer};
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector, Matrix3, RealField, Vector2, Vector3};
use std::collections::HashMap;
use tiny_solver::factors::Factor;
use tiny_solver::optimizer::OptimizerOptions;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

const INTRINSICS: &str = "intrinsics";
const DISTORTION: &str = "distortion";

fn pose_key(view: usize) -> String {
    format!("pose_{}", view)
}

/// Reprojection residuals of one view of the board.
#[derive(Debug, Clone)]
struct PlanarViewCost {
    object_points: Vec<Vector3<f64>>,
    image_points: Vec<Vector2<f64>>,
    /// When set, `fx` is replaced by `ratio · fy`.
    aspect_ratio: Option<f64>,
}

impl<T: RealField> Factor<T> for PlanarViewCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let intrinsics = &params[0];
        let distortion = params[1].as_slice();
        let pose = &params[2];

        let fy = intrinsics[1].clone();
        let fx = match self.aspect_ratio {
            Some(ratio) => nalgebra::convert::<f64, T>(ratio) * fy.clone(),
            None => intrinsics[0].clone(),
        };
        let cx = intrinsics[2].clone();
        let cy = intrinsics[3].clone();

        let rvec = Vector3::new(pose[0].clone(), pose[1].clone(), pose[2].clone());
        let tvec = Vector3::new(pose[3].clone(), pose[4].clone(), pose[5].clone());

        let mut residuals = DVector::zeros(self.image_points.len() * 2);
        for (i, (p3d, p2d)) in self
            .object_points
            .iter()
            .zip(self.image_points.iter())
            .enumerate()
        {
            let p = p3d.map(nalgebra::convert::<f64, T>);
            let pc = rotate_point(&rvec, &p) + tvec.clone();
            let x = pc.x.clone() / pc.z.clone();
            let y = pc.y.clone() / pc.z.clone();
            let (xd, yd) = distort(distortion, x, y);

            let u = fx.clone() * xd + cx.clone();
            let v = fy.clone() * yd + cy.clone();
            residuals[i * 2] = u - nalgebra::convert::<f64, T>(p2d.x);
            residuals[i * 2 + 1] = v - nalgebra::convert::<f64, T>(p2d.y);
        }
        residuals
    }
}

/// Calibration problem for a planar target observed in several views.
///
/// Holds the camera model being estimated together with one `(rvec, tvec)`
/// pose per view.
#[derive(Clone)]
pub struct PlanarCalibrationCost {
    model: RadTanModel,
    object_points: Vec<Vector3<f64>>,
    views: Vec<Vec<Vector2<f64>>>,
    poses: Vec<(Vector3<f64>, Vector3<f64>)>,
    flags: CalibrationFlags,
    aspect_ratio: f64,
    max_iterations: usize,
}

impl PlanarCalibrationCost {
    /// Sets up the problem. The model starts as a pinhole camera centred in
    /// the image; call [`Optimizer::linear_estimation`] before optimizing.
    pub fn new(
        object_points: Vec<Vector3<f64>>,
        views: Vec<Vec<Vector2<f64>>>,
        resolution: Resolution,
        flags: CalibrationFlags,
        aspect_ratio: Option<f64>,
    ) -> Result<Self, CalibrationError> {
        if views.is_empty() {
            return Err(CalibrationError::NoObservations);
        }
        for (view, points) in views.iter().enumerate() {
            if points.len() != object_points.len() {
                return Err(CalibrationError::PointCountMismatch {
                    view,
                    expected: object_points.len(),
                    found: points.len(),
                });
            }
        }

        let center = resolution.center();
        let focal = resolution.width.max(resolution.height).max(1) as f64;
        let model = RadTanModel {
            intrinsics: Intrinsics {
                fx: focal,
                fy: focal,
                cx: center.x,
                cy: center.y,
            },
            resolution,
            distortions: [0.0; DISTORTION_LEN],
        };
        let poses = vec![(Vector3::zeros(), Vector3::new(0.0, 0.0, 1.0)); views.len()];

        Ok(PlanarCalibrationCost {
            model,
            object_points,
            views,
            poses,
            flags,
            aspect_ratio: aspect_ratio.unwrap_or(1.0),
            max_iterations: 100,
        })
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn model(&self) -> &RadTanModel {
        &self.model
    }

    /// Per-view `(rotation vector, translation)`.
    pub fn poses(&self) -> &[(Vector3<f64>, Vector3<f64>)] {
        &self.poses
    }

    fn fixed_aspect(&self) -> Option<f64> {
        self.flags
            .contains(CalibrationFlags::FIX_ASPECT_RATIO)
            .then_some(self.aspect_ratio)
    }

    fn plane_points(&self) -> Vec<Vector2<f64>> {
        self.object_points.iter().map(|p| p.xy()).collect()
    }

    /// Focal lengths from the vanishing-point constraints of every view, with
    /// the principal point at the image centre.
    fn estimate_focal_lengths(
        &self,
        homographies: &[Matrix3<f64>],
    ) -> Result<(f64, f64), CalibrationError> {
        let center = self.model.resolution.center();
        let mut a = DMatrix::<f64>::zeros(homographies.len() * 2, 2);
        let mut b = DVector::<f64>::zeros(homographies.len() * 2);

        for (i, h) in homographies.iter().enumerate() {
            let mut h = *h;
            for c in 0..3 {
                h[(0, c)] -= h[(2, c)] * center.x;
                h[(1, c)] -= h[(2, c)] * center.y;
            }

            let col0 = h.column(0).into_owned();
            let col1 = h.column(1).into_owned();
            let d1 = (col0 + col1) * 0.5;
            let d2 = (col0 - col1) * 0.5;
            let (col0, col1) = (col0.normalize(), col1.normalize());
            let (d1, d2) = (d1.normalize(), d2.normalize());

            a[(2 * i, 0)] = col0.x * col1.x;
            a[(2 * i, 1)] = col0.y * col1.y;
            b[2 * i] = -col0.z * col1.z;
            a[(2 * i + 1, 0)] = d1.x * d2.x;
            a[(2 * i + 1, 1)] = d1.y * d2.y;
            b[2 * i + 1] = -d1.z * d2.z;
        }

        let f = a
            .svd(true, true)
            .solve(&b, 1e-12)
            .map_err(|e| CalibrationError::SolverFailed(e.to_string()))?;
        let mut fx = (1.0 / f[0].abs()).sqrt();
        let mut fy = (1.0 / f[1].abs()).sqrt();

        if !(fx.is_finite() && fy.is_finite() && fx > 0.0 && fy > 0.0) {
            let fallback = self.model.resolution.width.max(self.model.resolution.height) as f64;
            warn!(
                "Degenerate views for focal length initialisation, falling back to {}",
                fallback
            );
            fx = fallback;
            fy = fallback;
        }
        if let Some(ratio) = self.fixed_aspect() {
            let tf = (fx + fy) / (ratio + 1.0);
            fx = ratio * tf;
            fy = tf;
        }
        Ok((fx, fy))
    }

    fn initial_values(&self) -> HashMap<String, DVector<f64>> {
        let mut values = HashMap::new();
        let k = &self.model.intrinsics;
        values.insert(
            INTRINSICS.to_string(),
            DVector::from_vec(vec![k.fx, k.fy, k.cx, k.cy]),
        );
        values.insert(
            DISTORTION.to_string(),
            DVector::from_row_slice(&self.model.distortions),
        );
        for (i, (rvec, tvec)) in self.poses.iter().enumerate() {
            values.insert(
                pose_key(i),
                DVector::from_vec(vec![rvec.x, rvec.y, rvec.z, tvec.x, tvec.y, tvec.z]),
            );
        }
        values
    }

    fn view_cost(&self, view: usize) -> PlanarViewCost {
        PlanarViewCost {
            object_points: self.object_points.clone(),
            image_points: self.views[view].clone(),
            aspect_ratio: self.fixed_aspect(),
        }
    }

    /// Root mean square of the solver residuals over every observed point.
    pub fn residual_rms(&self) -> f64 {
        let values = self.initial_values();
        let mut sum = 0.0;
        let mut count = 0usize;
        for view in 0..self.views.len() {
            let params = [
                values[INTRINSICS].clone(),
                values[DISTORTION].clone(),
                values[&pose_key(view)].clone(),
            ];
            let residuals = Factor::<f64>::residual_func(&self.view_cost(view), &params);
            sum += residuals.norm_squared();
            count += self.views[view].len();
        }
        if count == 0 {
            return 0.0;
        }
        (sum / count as f64).sqrt()
    }
}

impl Optimizer for PlanarCalibrationCost {
    /// Refines intrinsics, distortion and every view pose with Levenberg-Marquardt.
    ///
    /// Entries pinned by the calibration flags are held at their current
    /// values: `fx` under a fixed aspect ratio, `cx, cy` for a fixed principal
    /// point, `p1, p2` for zero tangential distortion and `k4..k6` as selected.
    fn optimize(&mut self, verbose: bool) -> Result<(), CalibrationError> {
        let mut problem = tiny_solver::Problem::new();
        for view in 0..self.views.len() {
            let key = pose_key(view);
            problem.add_residual_block(
                self.views[view].len() * 2,
                &[INTRINSICS, DISTORTION, key.as_str()],
                Box::new(self.view_cost(view)),
                None,
            );
        }

        if self.fixed_aspect().is_some() {
            problem.fix_variable(INTRINSICS, 0);
        }
        if self.flags.contains(CalibrationFlags::FIX_PRINCIPAL_POINT) {
            problem.fix_variable(INTRINSICS, 2);
            problem.fix_variable(INTRINSICS, 3);
        }
        if self.flags.contains(CalibrationFlags::ZERO_TANGENT_DIST) {
            self.model.distortions[2] = 0.0;
            self.model.distortions[3] = 0.0;
            problem.fix_variable(DISTORTION, 2);
            problem.fix_variable(DISTORTION, 3);
        }
        for (flag, index) in [
            (CalibrationFlags::FIX_K4, 5),
            (CalibrationFlags::FIX_K5, 6),
            (CalibrationFlags::FIX_K6, 7),
        ] {
            if self.flags.contains(flag) {
                problem.fix_variable(DISTORTION, index);
            }
        }

        let initial_values = self.initial_values();
        if verbose {
            info!(
                "Starting calibration over {} views ({} points each), initial rms {:.4}",
                self.views.len(),
                self.object_points.len(),
                self.residual_rms()
            );
        }

        let options = OptimizerOptions {
            max_iteration: self.max_iterations,
            ..OptimizerOptions::default()
        };
        let optimizer = LevenbergMarquardtOptimizer::default();
        let result = optimizer
            .optimize(&problem, &initial_values, Some(options))
            .ok_or_else(|| CalibrationError::SolverFailed("no solution returned".to_string()))?;

        let block = |name: &str| {
            result
                .get(name)
                .ok_or_else(|| CalibrationError::SolverFailed(format!("missing block {}", name)))
        };

        let intrinsics = block(INTRINSICS)?;
        self.model.intrinsics.fy = intrinsics[1];
        self.model.intrinsics.fx = match self.fixed_aspect() {
            Some(ratio) => ratio * intrinsics[1],
            None => intrinsics[0],
        };
        self.model.intrinsics.cx = intrinsics[2];
        self.model.intrinsics.cy = intrinsics[3];

        let distortion = block(DISTORTION)?;
        for (slot, value) in self.model.distortions.iter_mut().zip(distortion.iter()) {
            *slot = *value;
        }

        for view in 0..self.views.len() {
            let pose = block(&pose_key(view))?;
            self.poses[view] = (
                Vector3::new(pose[0], pose[1], pose[2]),
                Vector3::new(pose[3], pose[4], pose[5]),
            );
        }

        if verbose {
            info!(
                "Calibration finished: {:?}, rms {:.4}",
                self.model,
                self.residual_rms()
            );
        }
        Ok(())
    }

    /// Initial intrinsics from the plane homographies (principal point at the
    /// image centre, no distortion) and one pose per view by homography
    /// decomposition.
    fn linear_estimation(&mut self) -> Result<(), CalibrationError>
    where
        Self: Sized,
    {
        let plane = self.plane_points();
        let homographies = self
            .views
            .iter()
            .map(|view| find_homography(&plane, view))
            .collect::<Result<Vec<_>, _>>()?;

        let (fx, fy) = self.estimate_focal_lengths(&homographies)?;
        let center = self.model.resolution.center();
        self.model.intrinsics = Intrinsics {
            fx,
            fy,
            cx: center.x,
            cy: center.y,
        };
        self.model.distortions = [0.0; DISTORTION_LEN];
        debug!("Initial intrinsics: {:?}", self.model.intrinsics);

        let k = self.model.camera_matrix();
        for (view, h) in homographies.iter().enumerate() {
            let (rotation, translation) = decompose_homography(&k, h)?;
            self.poses[view] = (rotation_vector(&rotation), translation);
        }
        Ok(())
    }
}
