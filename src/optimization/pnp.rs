//! Pose of a planar board seen by a calibrated camera.

use crate::camera::rad_tan::distort;
use crate::camera::RadTanModel;
use crate::geometry::{decompose_homography, find_homography, rotate_point, rotation_vector};
use crate::optimization::{CalibrationError, Optimizer};
use log::info;
use nalgebra::{DVector, Matrix3, RealField, Vector2, Vector3};
use std::collections::HashMap;
use tiny_solver::factors::Factor;
use tiny_solver::optimizer::OptimizerOptions;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

const POSE: &str = "pose";

/// Reprojection residuals with the camera held constant; the single
/// parameter block is `[rvec, tvec]`.
#[derive(Debug, Clone)]
struct PnpCost {
    object_points: Vec<Vector3<f64>>,
    image_points: Vec<Vector2<f64>>,
    intrinsics: [f64; 4],
    distortion: [f64; 8],
}

impl<T: RealField> Factor<T> for PnpCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let pose = &params[0];
        let rvec = Vector3::new(pose[0].clone(), pose[1].clone(), pose[2].clone());
        let tvec = Vector3::new(pose[3].clone(), pose[4].clone(), pose[5].clone());

        let [fx, fy, cx, cy] = self.intrinsics.map(nalgebra::convert::<f64, T>);
        let distortion = self.distortion.map(nalgebra::convert::<f64, T>);

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
            let (xd, yd) = distort(&distortion, x, y);

            residuals[i * 2] = fx.clone() * xd + cx.clone() - nalgebra::convert::<f64, T>(p2d.x);
            residuals[i * 2 + 1] =
                fy.clone() * yd + cy.clone() - nalgebra::convert::<f64, T>(p2d.y);
        }
        residuals
    }
}

/// Board pose estimation for a fixed [`RadTanModel`].
///
/// The object points must lie on the `Z = 0` plane.
#[derive(Clone)]
pub struct PnpOptimizationCost {
    model: RadTanModel,
    object_points: Vec<Vector3<f64>>,
    image_points: Vec<Vector2<f64>>,
    rvec: Vector3<f64>,
    tvec: Vector3<f64>,
    max_iterations: usize,
}

impl PnpOptimizationCost {
    pub fn new(
        model: RadTanModel,
        object_points: Vec<Vector3<f64>>,
        image_points: Vec<Vector2<f64>>,
    ) -> Result<Self, CalibrationError> {
        if object_points.len() != image_points.len() {
            return Err(CalibrationError::PointCountMismatch {
                view: 0,
                expected: object_points.len(),
                found: image_points.len(),
            });
        }
        Ok(PnpOptimizationCost {
            model,
            object_points,
            image_points,
            rvec: Vector3::zeros(),
            tvec: Vector3::new(0.0, 0.0, 1.0),
            max_iterations: 50,
        })
    }

    /// Starts the refinement from a known pose instead of the linear estimate.
    pub fn with_initial_pose(mut self, rvec: Vector3<f64>, tvec: Vector3<f64>) -> Self {
        self.rvec = rvec;
        self.tvec = tvec;
        self
    }

    pub fn pose(&self) -> (Vector3<f64>, Vector3<f64>) {
        (self.rvec, self.tvec)
    }

    fn cost(&self) -> PnpCost {
        let k = &self.model.intrinsics;
        PnpCost {
            object_points: self.object_points.clone(),
            image_points: self.image_points.clone(),
            intrinsics: [k.fx, k.fy, k.cx, k.cy],
            distortion: self.model.distortions,
        }
    }
}

impl Optimizer for PnpOptimizationCost {
    fn optimize(&mut self, verbose: bool) -> Result<(), CalibrationError> {
        if self.object_points.is_empty() {
            return Err(CalibrationError::NoObservations);
        }

        let mut problem = tiny_solver::Problem::new();
        problem.add_residual_block(
            self.image_points.len() * 2,
            &[POSE],
            Box::new(self.cost()),
            None,
        );

        let mut initial_values = HashMap::new();
        initial_values.insert(
            POSE.to_string(),
            DVector::from_vec(vec![
                self.rvec.x,
                self.rvec.y,
                self.rvec.z,
                self.tvec.x,
                self.tvec.y,
                self.tvec.z,
            ]),
        );

        let options = OptimizerOptions {
            max_iteration: self.max_iterations,
            ..OptimizerOptions::default()
        };
        let result = LevenbergMarquardtOptimizer::default()
            .optimize(&problem, &initial_values, Some(options))
            .ok_or_else(|| CalibrationError::SolverFailed("no solution returned".to_string()))?;
        let pose = result
            .get(POSE)
            .ok_or_else(|| CalibrationError::SolverFailed("missing pose block".to_string()))?;

        self.rvec = Vector3::new(pose[0], pose[1], pose[2]);
        self.tvec = Vector3::new(pose[3], pose[4], pose[5]);
        if verbose {
            info!("Pose refined: rvec {:?}, tvec {:?}", self.rvec, self.tvec);
        }
        Ok(())
    }

    /// Pose from the homography between the board plane and the undistorted,
    /// normalized image points.
    fn linear_estimation(&mut self) -> Result<(), CalibrationError>
    where
        Self: Sized,
    {
        let plane: Vec<Vector2<f64>> = self.object_points.iter().map(|p| p.xy()).collect();
        let normalized = self
            .image_points
            .iter()
            .map(|p| self.model.undistort_pixel(p))
            .collect::<Result<Vec<_>, _>>()?;

        let h = find_homography(&plane, &normalized)?;
        let (rotation, translation) = decompose_homography(&Matrix3::identity(), &h)?;
        self.rvec = rotation_vector(&rotation);
        self.tvec = translation;
        Ok(())
    }
}
