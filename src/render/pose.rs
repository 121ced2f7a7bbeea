//! Model-view transform of the tracked board.

use crate::camera::RadTanModel;
use crate::geometry::{euler_angles_rq, rotation_matrix, PatternGeometry};
use crate::optimization::{Optimizer, PnpOptimizationCost};
use log::debug;
use nalgebra::{Matrix4, Vector2, Vector3};

/// Board pose expressed for the renderer.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseTransform {
    /// Upper-left block `Rᵀ`, last column `(tx, ty, -tz, 1)`.
    pub matrix: Matrix4<f64>,
    /// Rotation about x, y and z in degrees.
    pub euler_degrees: Vector3<f64>,
}

impl PoseTransform {
    pub fn from_rotation_vector(rvec: &Vector3<f64>, tvec: &Vector3<f64>) -> Self {
        let r = rotation_matrix(rvec);
        let mut matrix = Matrix4::identity();
        matrix
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&r.transpose());
        matrix[(0, 3)] = tvec.x;
        matrix[(1, 3)] = tvec.y;
        matrix[(2, 3)] = -tvec.z;

        PoseTransform {
            matrix,
            euler_degrees: euler_angles_rq(&r),
        }
    }

    pub fn to_column_major(&self) -> [f64; 16] {
        let mut out = [0.0; 16];
        out.copy_from_slice(self.matrix.as_slice());
        out
    }
}

/// Estimates the pose `(rvec, tvec)` of known 3D points from their image.
///
/// `initial` is the pose found on an earlier frame, when there is one.
pub trait PoseSolver {
    fn solve_pose(
        &mut self,
        camera: &RadTanModel,
        object_points: &[Vector3<f64>],
        image_points: &[Vector2<f64>],
        initial: Option<(Vector3<f64>, Vector3<f64>)>,
    ) -> Option<(Vector3<f64>, Vector3<f64>)>;
}

/// Levenberg-Marquardt refinement started from the previous pose, or from the
/// homography estimate when there is none.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanarPoseSolver;

impl PoseSolver for PlanarPoseSolver {
    fn solve_pose(
        &mut self,
        camera: &RadTanModel,
        object_points: &[Vector3<f64>],
        image_points: &[Vector2<f64>],
        initial: Option<(Vector3<f64>, Vector3<f64>)>,
    ) -> Option<(Vector3<f64>, Vector3<f64>)> {
        let solve = || {
            let mut cost = PnpOptimizationCost::new(
                camera.clone(),
                object_points.to_vec(),
                image_points.to_vec(),
            )?;
            match initial {
                Some((rvec, tvec)) => cost = cost.with_initial_pose(rvec, tvec),
                None => cost.linear_estimation()?,
            }
            cost.optimize(false)?;
            Ok::<_, crate::optimization::CalibrationError>(cost.pose())
        };
        match solve() {
            Ok(pose) => Some(pose),
            Err(e) => {
                debug!("Pose estimation failed: {}", e);
                None
            }
        }
    }
}

/// Keeps the last known board pose across frames.
pub struct PoseTracker<S = PlanarPoseSolver> {
    object_points: Vec<Vector3<f64>>,
    camera: RadTanModel,
    solver: S,
    last: Option<PoseTransform>,
    last_pose: Option<(Vector3<f64>, Vector3<f64>)>,
}

impl<S: PoseSolver> PoseTracker<S> {
    pub fn new(geometry: &PatternGeometry, camera: RadTanModel, solver: S) -> Self {
        PoseTracker {
            object_points: geometry.object_points(),
            camera,
            solver,
            last: None,
            last_pose: None,
        }
    }

    /// Feeds the detection of one frame. A miss or a failed solve leaves the
    /// previous pose in place.
    pub fn update(&mut self, points: Option<&[Vector2<f64>]>) -> Option<&PoseTransform> {
        if let Some(points) = points {
            if let Some((rvec, tvec)) = self.solver.solve_pose(
                &self.camera,
                &self.object_points,
                points,
                self.last_pose,
            ) {
                self.last = Some(PoseTransform::from_rotation_vector(&rvec, &tvec));
                self.last_pose = Some((rvec, tvec));
            }
        }
        self.last.as_ref()
    }

    pub fn last(&self) -> Option<&PoseTransform> {
        self.last.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Intrinsics, Resolution};
    use crate::geometry::{BoardSize, Pattern};
    use approx::assert_relative_eq;
    use nalgebra::Matrix3;

    #[test]
    fn test_translation_sign_convention() {
        let pose = PoseTransform::from_rotation_vector(&Vector3::zeros(), &Vector3::new(0.0, 0.0, 5.0));
        assert_eq!(pose.matrix.fixed_view::<3, 3>(0, 0).into_owned(), Matrix3::identity());
        assert_eq!(pose.matrix.column(3).into_owned(), nalgebra::Vector4::new(0.0, 0.0, -5.0, 1.0));
        assert_relative_eq!(pose.euler_degrees, Vector3::zeros(), epsilon = 1e-9);
        assert_eq!(pose.to_column_major()[14], -5.0);
    }

    #[test]
    fn test_rotation_is_transposed() {
        let rvec = Vector3::new(0.0, 0.0, std::f64::consts::FRAC_PI_6);
        let pose = PoseTransform::from_rotation_vector(&rvec, &Vector3::new(1.0, -2.0, 3.0));
        let r = rotation_matrix(&rvec);
        assert_relative_eq!(
            pose.matrix.fixed_view::<3, 3>(0, 0).into_owned(),
            r.transpose(),
            epsilon = 1e-12
        );
        assert_relative_eq!(pose.euler_degrees, euler_angles_rq(&r), epsilon = 1e-12);
        assert_relative_eq!(pose.euler_degrees.z, 30.0, epsilon = 1e-9);
        assert_eq!(pose.matrix[(1, 3)], -2.0);
        assert_eq!(pose.matrix[(2, 3)], -3.0);
    }

    fn tracking_camera() -> RadTanModel {
        RadTanModel {
            intrinsics: Intrinsics {
                fx: 600.0,
                fy: 600.0,
                cx: 320.0,
                cy: 240.0,
            },
            resolution: Resolution {
                width: 640,
                height: 480,
            },
            distortions: [0.0; 8],
        }
    }

    fn board_image(
        camera: &RadTanModel,
        geometry: &PatternGeometry,
        rvec: &Vector3<f64>,
        tvec: &Vector3<f64>,
    ) -> Vec<Vector2<f64>> {
        let r = rotation_matrix(rvec);
        geometry
            .object_points()
            .iter()
            .map(|p| camera.project_point(&(r * p + tvec)).unwrap())
            .collect()
    }

    /// Records the starting pose handed to each solve.
    #[derive(Default)]
    struct SeedRecorder {
        seeds: Vec<Option<(Vector3<f64>, Vector3<f64>)>>,
    }

    impl PoseSolver for SeedRecorder {
        fn solve_pose(
            &mut self,
            camera: &RadTanModel,
            object_points: &[Vector3<f64>],
            image_points: &[Vector2<f64>],
            initial: Option<(Vector3<f64>, Vector3<f64>)>,
        ) -> Option<(Vector3<f64>, Vector3<f64>)> {
            self.seeds.push(initial);
            PlanarPoseSolver.solve_pose(camera, object_points, image_points, initial)
        }
    }

    #[test]
    fn test_tracker_keeps_last_pose() {
        let camera = tracking_camera();
        let geometry = PatternGeometry::new(Pattern::Chessboard, BoardSize::new(7, 4), 3.5);
        let rvec = Vector3::new(0.15, -0.1, 0.05);
        let tvec = Vector3::new(-10.0, -5.0, 60.0);
        let image = board_image(&camera, &geometry, &rvec, &tvec);

        let mut tracker = PoseTracker::new(&geometry, camera, PlanarPoseSolver);
        assert!(tracker.update(None).is_none());

        let pose = tracker.update(Some(image.as_slice())).unwrap().clone();
        assert_relative_eq!(pose.matrix[(0, 3)], tvec.x, epsilon = 1e-4);
        assert_relative_eq!(pose.matrix[(2, 3)], -tvec.z, epsilon = 1e-4);

        assert_eq!(tracker.update(None), Some(&pose));
        // Too few points: the solve fails and the previous pose stays.
        assert_eq!(tracker.update(Some(&image[..3])), Some(&pose));
        assert_eq!(tracker.last(), Some(&pose));
    }

    #[test]
    fn test_tracker_seeds_from_previous_pose() {
        let camera = tracking_camera();
        let geometry = PatternGeometry::new(Pattern::Chessboard, BoardSize::new(7, 4), 3.5);
        let first = (Vector3::new(0.15, -0.1, 0.05), Vector3::new(-10.0, -5.0, 60.0));
        let second = (Vector3::new(0.2, -0.05, 0.1), Vector3::new(-9.0, -6.0, 58.0));

        let mut tracker = PoseTracker::new(&geometry, camera.clone(), SeedRecorder::default());
        let image = board_image(&camera, &geometry, &first.0, &first.1);
        tracker.update(Some(image.as_slice())).unwrap();
        let image = board_image(&camera, &geometry, &second.0, &second.1);
        let pose = tracker.update(Some(image.as_slice())).unwrap().clone();

        assert_relative_eq!(pose.matrix[(0, 3)], second.1.x, epsilon = 1e-4);
        assert_relative_eq!(pose.matrix[(2, 3)], -second.1.z, epsilon = 1e-4);
        assert_relative_eq!(
            pose.matrix.fixed_view::<3, 3>(0, 0).into_owned(),
            rotation_matrix(&second.0).transpose(),
            epsilon = 1e-6
        );

        let seeds = &tracker.solver.seeds;
        assert_eq!(seeds.len(), 2);
        assert!(seeds[0].is_none());
        let (rvec, tvec) = seeds[1].unwrap();
        assert_relative_eq!(rvec, first.0, epsilon = 1e-6);
        assert_relative_eq!(tvec, first.1, epsilon = 1e-4);
    }
}
