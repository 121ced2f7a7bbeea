//! Pinhole camera with rational radial and tangential distortion.
//!
//! The distortion vector follows the OpenCV layout `[k1, k2, p1, p2, k3, k4, k5, k6]`:
//!
//! ```text
//! r²     = x'² + y'²
//! radial = (1 + k1·r² + k2·r⁴ + k3·r⁶) / (1 + k4·r² + k5·r⁴ + k6·r⁶)
//! x''    = x'·radial + 2·p1·x'·y' + p2·(r² + 2·x'²)
//! y''    = y'·radial + p1·(r² + 2·y'²) + 2·p2·x'·y'
//! ```
//!
//! Parameters are persisted in the calibration record layout written by
//! [`crate::store`] (`Camera_Matrix`, `Distortion_Coefficients`, `image_Width`,
//! `image_Height`).

use crate::camera::{validation, CameraModel, CameraModelError, Intrinsics, Resolution};
use crate::util;
use nalgebra::{Matrix3, RealField, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use yaml_rust::{Yaml, YamlLoader};

/// Number of distortion coefficients carried by the model.
pub const DISTORTION_LEN: usize = 8;

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct RadTanModel {
    pub intrinsics: Intrinsics,
    /// Zero width or height means the image size is unknown and bounds are not checked.
    pub resolution: Resolution,
    /// `[k1, k2, p1, p2, k3, k4, k5, k6]`
    pub distortions: [f64; DISTORTION_LEN],
}

/// Applies the rational radial / tangential distortion to a normalized point.
///
/// Generic over the scalar so the same expression is used by the projection
/// and by the autodiff residuals of the optimizers. `d` must hold at least
/// [`DISTORTION_LEN`] coefficients.
pub fn distort<T: RealField>(d: &[T], x: T, y: T) -> (T, T) {
    let one = T::one();
    let two = nalgebra::convert::<f64, T>(2.0);

    let (k1, k2, p1, p2, k3) = (
        d[0].clone(),
        d[1].clone(),
        d[2].clone(),
        d[3].clone(),
        d[4].clone(),
    );
    let (k4, k5, k6) = (d[5].clone(), d[6].clone(), d[7].clone());

    let xx = x.clone() * x.clone();
    let yy = y.clone() * y.clone();
    let xy = x.clone() * y.clone();
    let r2 = xx.clone() + yy.clone();
    let r4 = r2.clone() * r2.clone();
    let r6 = r4.clone() * r2.clone();

    let numerator = one.clone() + k1 * r2.clone() + k2 * r4.clone() + k3 * r6.clone();
    let denominator = one + k4 * r2.clone() + k5 * r4 + k6 * r6;
    let radial = numerator / denominator;

    let xd = x * radial.clone()
        + two.clone() * p1.clone() * xy.clone()
        + p2.clone() * (r2.clone() + two.clone() * xx);
    let yd = y * radial + p1 * (r2 + two.clone() * yy) + two * p2 * xy;
    (xd, yd)
}

impl RadTanModel {
    /// Builds a model from a camera matrix and any of the common OpenCV
    /// coefficient counts (4, 5, 8, 12 or 14); the vector is padded or
    /// truncated to eight entries.
    pub fn from_camera_matrix(
        camera_matrix: &Matrix3<f64>,
        distortion: &[f64],
        resolution: Resolution,
    ) -> Result<Self, CameraModelError> {
        if !matches!(distortion.len(), 4 | 5 | 8 | 12 | 14) {
            return Err(CameraModelError::InvalidParams(format!(
                "Unsupported number of distortion coefficients: {}",
                distortion.len()
            )));
        }
        let mut distortions = [0.0; DISTORTION_LEN];
        for (slot, value) in distortions.iter_mut().zip(distortion) {
            *slot = *value;
        }

        let model = RadTanModel {
            intrinsics: Intrinsics::from_camera_matrix(camera_matrix),
            resolution,
            distortions,
        };
        model.validate_params()?;
        Ok(model)
    }

    pub fn camera_matrix(&self) -> Matrix3<f64> {
        self.intrinsics.camera_matrix()
    }

    /// Projects a point without checking the image bounds.
    ///
    /// Returns `None` for points on or behind the camera plane.
    pub fn project_point(&self, point_3d: &Vector3<f64>) -> Option<Vector2<f64>> {
        if point_3d.z < f64::EPSILON.sqrt() {
            return None;
        }
        let (xd, yd) = distort(
            &self.distortions,
            point_3d.x / point_3d.z,
            point_3d.y / point_3d.z,
        );
        Some(Vector2::new(
            self.intrinsics.fx * xd + self.intrinsics.cx,
            self.intrinsics.fy * yd + self.intrinsics.cy,
        ))
    }

    /// Removes lens distortion from a pixel, returning normalized coordinates
    /// on the `z = 1` plane.
    ///
    /// Uses the fixed-point iteration of OpenCV's `undistortPoints`.
    pub fn undistort_pixel(&self, point_2d: &Vector2<f64>) -> Result<Vector2<f64>, CameraModelError> {
        const MAX_ITERATIONS: usize = 20;
        const EPS: f64 = 1e-12;

        let [k1, k2, p1, p2, k3, k4, k5, k6] = self.distortions;
        let x0 = (point_2d.x - self.intrinsics.cx) / self.intrinsics.fx;
        let y0 = (point_2d.y - self.intrinsics.cy) / self.intrinsics.fy;
        let (mut x, mut y) = (x0, y0);

        for _ in 0..MAX_ITERATIONS {
            let r2 = x * x + y * y;
            let icdist = (1.0 + ((k6 * r2 + k5) * r2 + k4) * r2)
                / (1.0 + ((k3 * r2 + k2) * r2 + k1) * r2);
            if !icdist.is_finite() || icdist < 0.0 {
                return Err(CameraModelError::NumericalError(
                    "undistortion diverged".to_string(),
                ));
            }
            let delta_x = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
            let delta_y = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
            let next_x = (x0 - delta_x) * icdist;
            let next_y = (y0 - delta_y) * icdist;
            let step = (next_x - x).powi(2) + (next_y - y).powi(2);
            x = next_x;
            y = next_y;
            if step < EPS {
                break;
            }
        }

        Ok(Vector2::new(x, y))
    }
}

impl fmt::Debug for RadTanModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RadTanModel [fx: {} fy: {} cx: {} cy: {} distortions: {:?}]",
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.distortions,
        )
    }
}

/// An absent dimension reads as 0 (unknown); a present one must fit in `u32`.
fn image_dimension(doc: &Yaml, key: &str) -> Result<u32, CameraModelError> {
    match doc[key].as_i64() {
        None => Ok(0),
        Some(value) => u32::try_from(value).map_err(|_| {
            CameraModelError::InvalidParams(format!("{} out of range: {}", key, value))
        }),
    }
}

impl CameraModel for RadTanModel {
    /// Reads `Camera_Matrix`, `Distortion_Coefficients` and, when present,
    /// `image_Width` / `image_Height` from a calibration record.
    fn load_from_yaml(path: &str) -> Result<Self, CameraModelError> {
        let contents = util::read_yaml_document(Path::new(path))?;
        let docs = YamlLoader::load_from_str(&contents)?;

        if docs.is_empty() {
            return Err(CameraModelError::InvalidParams(
                "Empty YAML document".to_string(),
            ));
        }
        let doc = &docs[0];

        let (rows, cols, k) = util::yaml_matrix(&doc["Camera_Matrix"])
            .ok_or_else(|| CameraModelError::InvalidParams("Invalid Camera_Matrix".to_string()))?;
        if rows != 3 || cols != 3 || k.len() != 9 {
            return Err(CameraModelError::InvalidParams(format!(
                "Camera_Matrix must be 3x3, found {}x{}",
                rows, cols
            )));
        }
        let camera_matrix = Matrix3::from_row_slice(&k);

        let (_, _, distortion) = util::yaml_matrix(&doc["Distortion_Coefficients"])
            .ok_or_else(|| {
                CameraModelError::InvalidParams("Invalid Distortion_Coefficients".to_string())
            })?;

        let resolution = Resolution {
            width: image_dimension(doc, "image_Width")?,
            height: image_dimension(doc, "image_Height")?,
        };

        Self::from_camera_matrix(&camera_matrix, &distortion, resolution)
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        if self.distortions.iter().any(|d| !d.is_finite()) {
            return Err(CameraModelError::InvalidParams(
                "Distortion coefficients must be finite".to_string(),
            ));
        }
        Ok(())
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution
    }
}
