//! Rotation vectors (axis · angle) and Euler angle extraction.

use nalgebra::{Matrix3, RealField, Rotation3, Vector3};

/// Rotates `p` by the rotation vector `r` (Rodrigues' formula).
///
/// Generic so it can be used inside autodiff residuals; small angles fall back
/// to the first-order expansion `p + r × p`.
pub fn rotate_point<T: RealField>(r: &Vector3<T>, p: &Vector3<T>) -> Vector3<T> {
    let theta2 = r.dot(r);
    if theta2 > nalgebra::convert::<f64, T>(1e-12) {
        let theta = theta2.sqrt();
        let (sin_theta, cos_theta) = theta.clone().sin_cos();
        let k = r / theta;
        let k_cross_p = k.cross(p);
        let k_dot_p = k.dot(p);
        p * cos_theta.clone() + k_cross_p * sin_theta + k * (k_dot_p * (T::one() - cos_theta))
    } else {
        p + r.cross(p)
    }
}

/// Rotation matrix of a rotation vector.
pub fn rotation_matrix(rvec: &Vector3<f64>) -> Matrix3<f64> {
    *Rotation3::from_scaled_axis(*rvec).matrix()
}

/// Rotation vector of a rotation matrix. `r` is re-orthonormalised first.
pub fn rotation_vector(r: &Matrix3<f64>) -> Vector3<f64> {
    Rotation3::from_matrix(r).scaled_axis()
}

/// Euler angles in degrees `(x, y, z)` obtained from the RQ decomposition of
/// `m` with Givens rotations, using the same sign disambiguation as OpenCV's
/// `RQDecomp3x3`.
pub fn euler_angles_rq(m: &Matrix3<f64>) -> Vector3<f64> {
    let givens = |s: f64, c: f64| {
        let z = 1.0 / (c * c + s * s + f64::EPSILON).sqrt();
        (s * z, c * z)
    };

    let (s, c) = givens(m[(2, 1)], m[(2, 2)]);
    let mut qx = Matrix3::new(1.0, 0.0, 0.0, 0.0, c, s, 0.0, -s, c);
    let mut r = m * qx;
    r[(2, 1)] = 0.0;

    let (s, c) = givens(-r[(2, 0)], r[(2, 2)]);
    let mut qy = Matrix3::new(c, 0.0, -s, 0.0, 1.0, 0.0, s, 0.0, c);
    let mut m2 = r * qy;
    m2[(2, 0)] = 0.0;

    let (s, c) = givens(m2[(1, 0)], m2[(1, 1)]);
    let mut qz = Matrix3::new(c, s, 0.0, -s, c, 0.0, 0.0, 0.0, 1.0);
    let mut upper = m2 * qz;
    upper[(1, 0)] = 0.0;

    // Keep the first two diagonal entries of the upper-triangular factor positive
    // by moving a 180 degree turn into one of the Givens rotations.
    if upper[(0, 0)] < 0.0 {
        if upper[(1, 1)] < 0.0 {
            for (i, j) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
                qz[(i, j)] *= -1.0;
            }
        } else {
            for (i, j) in [(0, 0), (0, 2), (2, 0), (2, 2)] {
                qy[(i, j)] *= -1.0;
            }
        }
    } else if upper[(1, 1)] < 0.0 {
        for (i, j) in [(1, 1), (1, 2), (2, 1), (2, 2)] {
            qx[(i, j)] *= -1.0;
        }
    }

    let signed_angle = |cos: f64, sin: f64| {
        let angle = cos.clamp(-1.0, 1.0).acos();
        if sin >= 0.0 {
            angle.to_degrees()
        } else {
            -angle.to_degrees()
        }
    };

    Vector3::new(
        signed_angle(qx[(1, 1)], qx[(1, 2)]),
        signed_angle(qy[(0, 0)], qy[(2, 0)]),
        signed_angle(qz[(0, 0)], qz[(0, 1)]),
    )
}
