//! Perspective projection matching a calibrated camera.

use crate::camera::Resolution;
use crate::render::RenderError;
use nalgebra::{Matrix4, Vector2, Vector3};

/// How the viewport is sampled to obtain the frustum extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrustumConvention {
    /// Rays through the viewport edge midpoints; the bounds are symmetric
    /// about the optical axis in both directions.
    #[default]
    Symmetric,
    /// Left/right samples at `y = -h/2` and `y = h/2` and a bottom bound taken
    /// from the horizontal extent, with the halves rounded down to whole
    /// pixels. Kept for renderers tuned to that output.
    Legacy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrustumOptions {
    pub near: f64,
    pub far: f64,
    pub convention: FrustumConvention,
}

impl Default for FrustumOptions {
    fn default() -> Self {
        FrustumOptions {
            near: 0.1,
            far: 1000.0,
            convention: FrustumConvention::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frustum {
    pub matrix: Matrix4<f64>,
    pub left: f64,
    pub right: f64,
    pub bottom: f64,
    pub top: f64,
    pub near: f64,
    pub far: f64,
}

impl Frustum {
    /// Column-major element order, as `glLoadMatrix` expects.
    pub fn to_column_major(&self) -> [f64; 16] {
        let mut out = [0.0; 16];
        out.copy_from_slice(self.matrix.as_slice());
        out
    }
}

/// Builds the projection matrix of a camera with matrix `camera_matrix`
/// rendering into `viewport`.
pub fn build_frustum(
    camera_matrix: &nalgebra::Matrix3<f64>,
    viewport: Resolution,
    options: &FrustumOptions,
) -> Result<Frustum, RenderError> {
    let (near, far) = (options.near, options.far);
    if !(near > 0.0 && far > near && far.is_finite()) {
        return Err(RenderError::InvalidClipPlanes { near, far });
    }
    let k_inv = camera_matrix
        .try_inverse()
        .ok_or(RenderError::SingularCameraMatrix)?;

    let w = viewport.width as f64;
    let h = viewport.height as f64;
    let (x_min, x_max, half_w) = match options.convention {
        FrustumConvention::Symmetric => (
            Vector2::new(0.0, h / 2.0),
            Vector2::new(w, h / 2.0),
            w / 2.0,
        ),
        FrustumConvention::Legacy => {
            let half_h = (viewport.height / 2) as f64;
            (
                Vector2::new(0.0, -half_h),
                Vector2::new(w, half_h),
                (viewport.width / 2) as f64,
            )
        }
    };
    let y_min = Vector2::new(half_w, 0.0);
    let y_max = Vector2::new(half_w, h);

    let ray = |p: Vector2<f64>| -> Vector3<f64> { k_inv * Vector3::new(p.x, p.y, 1.0) * near };
    let extent_x = (ray(x_max) - ray(x_min)).norm();
    let extent_y = (ray(y_max) - ray(y_min)).norm();
    if !(extent_x > 0.0 && extent_y > 0.0) || !extent_x.is_finite() || !extent_y.is_finite() {
        return Err(RenderError::DegenerateViewport(viewport.width, viewport.height));
    }

    let left = -extent_x / 2.0;
    let right = extent_x / 2.0;
    let top = extent_y / 2.0;
    let bottom = match options.convention {
        FrustumConvention::Symmetric => -extent_y / 2.0,
        FrustumConvention::Legacy => -extent_x / 2.0,
    };

    let mut matrix = Matrix4::zeros();
    matrix[(0, 0)] = 2.0 * near / extent_x;
    matrix[(0, 2)] = (right + left) / extent_x;
    matrix[(1, 1)] = 2.0 * near / extent_y;
    matrix[(1, 2)] = (top + bottom) / extent_y;
    matrix[(2, 2)] = -(far + near) / (far - near);
    matrix[(2, 3)] = -2.0 * far * near / (far - near);
    matrix[(3, 2)] = -1.0;

    Ok(Frustum {
        matrix,
        left,
        right,
        bottom,
        top,
        near,
        far,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Matrix3;

    fn camera() -> Matrix3<f64> {
        Matrix3::new(500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0)
    }

    const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };

    #[test]
    fn test_symmetric_frustum() {
        let frustum = build_frustum(&camera(), VGA, &FrustumOptions::default()).unwrap();
        let m = frustum.matrix;

        assert_relative_eq!(m[(0, 0)], 1.5625, epsilon = 1e-12);
        assert_relative_eq!(m[(1, 1)], 0.2 / 0.096, epsilon = 1e-12);
        assert_relative_eq!(m[(0, 2)], 0.0, epsilon = 1e-12);
        assert_relative_eq!(m[(1, 2)], 0.0, epsilon = 1e-12);
        assert_relative_eq!(m[(2, 2)], -1000.1 / 999.9, epsilon = 1e-12);
        assert_relative_eq!(m[(2, 3)], -200.0 / 999.9, epsilon = 1e-12);
        assert_eq!(m[(3, 2)], -1.0);
        assert_eq!(m[(3, 3)], 0.0);
        assert_relative_eq!(frustum.bottom, -frustum.top, epsilon = 1e-15);
    }

    #[test]
    fn test_legacy_frustum() {
        let options = FrustumOptions {
            convention: FrustumConvention::Legacy,
            ..FrustumOptions::default()
        };
        let frustum = build_frustum(&camera(), VGA, &options).unwrap();
        let m = frustum.matrix;

        // The left/right rays are offset vertically: extent_x = |(0.128, 0.096)| = 0.16.
        assert_relative_eq!(m[(0, 0)], 1.25, epsilon = 1e-12);
        assert_relative_eq!(m[(1, 1)], 0.2 / 0.096, epsilon = 1e-12);
        assert_relative_eq!(frustum.bottom, -0.08, epsilon = 1e-12);
        assert_relative_eq!(m[(1, 2)], (0.048 - 0.08) / 0.096, epsilon = 1e-12);
    }

    #[test]
    fn test_legacy_frustum_on_odd_viewport() {
        let options = FrustumOptions {
            convention: FrustumConvention::Legacy,
            ..FrustumOptions::default()
        };
        let odd = Resolution {
            width: 641,
            height: 481,
        };
        let frustum = build_frustum(&camera(), odd, &options).unwrap();

        // Samples at (0, -240), (641, 240), (320, 0) and (320, 481).
        let extent_x = (641.0 / 500.0 * 0.1f64).hypot(480.0 / 500.0 * 0.1);
        let extent_y = 481.0 / 500.0 * 0.1;
        assert_relative_eq!(frustum.matrix[(0, 0)], 0.2 / extent_x, epsilon = 1e-12);
        assert_relative_eq!(frustum.matrix[(1, 1)], 0.2 / extent_y, epsilon = 1e-12);
        assert_relative_eq!(frustum.bottom, -extent_x / 2.0, epsilon = 1e-12);
        assert_relative_eq!(frustum.top, extent_y / 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_repeated_builds_are_identical() {
        let k = Matrix3::new(657.4025, 0.0, 319.5, 0.0, 661.0, 239.5, 0.0, 0.0, 1.0);
        let first = build_frustum(&k, VGA, &FrustumOptions::default()).unwrap();
        let second = build_frustum(&k, VGA, &FrustumOptions::default()).unwrap();
        assert_eq!(first.to_column_major(), second.to_column_major());
        assert_eq!(first.to_column_major()[11], -1.0);
    }

    #[test]
    fn test_rejects_singular_and_bad_planes() {
        assert_eq!(
            build_frustum(&Matrix3::zeros(), VGA, &FrustumOptions::default()),
            Err(RenderError::SingularCameraMatrix)
        );
        let options = FrustumOptions {
            near: 10.0,
            far: 1.0,
            ..FrustumOptions::default()
        };
        assert_eq!(
            build_frustum(&camera(), VGA, &options),
            Err(RenderError::InvalidClipPlanes {
                near: 10.0,
                far: 1.0
            })
        );
        let empty = Resolution {
            width: 0,
            height: 0,
        };
        assert_eq!(
            build_frustum(&camera(), empty, &FrustumOptions::default()),
            Err(RenderError::DegenerateViewport(0, 0))
        );
    }
}
