//! Plane-to-image homographies and their decomposition into a board pose.

use super::GeometryError;
use nalgebra::{DMatrix, Matrix3, Vector2, Vector3};

/// Hartley normalisation: zero mean, average distance `sqrt(2)`.
fn normalize_points(points: &[Vector2<f64>]) -> Option<(Vec<Vector2<f64>>, Matrix3<f64>)> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;
    let mean_dist = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
    if mean_dist <= f64::EPSILON {
        return None;
    }

    let scale = 2.0_f64.sqrt() / mean_dist;
    let t = Matrix3::new(
        scale,
        0.0,
        -scale * centroid.x,
        0.0,
        scale,
        -scale * centroid.y,
        0.0,
        0.0,
        1.0,
    );
    let normalized = points.iter().map(|p| (p - centroid) * scale).collect();
    Some((normalized, t))
}

/// Estimates `H` with `image ~ H · plane` by the normalised DLT.
///
/// The result is scaled so that `H[2,2] == 1` whenever that entry is not zero.
pub fn find_homography(
    plane: &[Vector2<f64>],
    image: &[Vector2<f64>],
) -> Result<Matrix3<f64>, GeometryError> {
    let n = plane.len();
    if n != image.len() {
        return Err(GeometryError::LengthMismatch(n, image.len()));
    }
    if n < 4 {
        return Err(GeometryError::NotEnoughPoints {
            required: 4,
            found: n,
        });
    }

    let degenerate = || GeometryError::Degenerate("points are coincident".to_string());
    let (plane_n, t_plane) = normalize_points(plane).ok_or_else(degenerate)?;
    let (image_n, t_image) = normalize_points(image).ok_or_else(degenerate)?;

    // Pad to at least 9 rows so the SVD exposes the full right null space.
    let rows = (2 * n).max(9);
    let mut a = DMatrix::<f64>::zeros(rows, 9);
    for (i, (p, q)) in plane_n.iter().zip(image_n.iter()).enumerate() {
        let (x, y, u, v) = (p.x, p.y, q.x, q.y);
        let r0 = 2 * i;
        let r1 = r0 + 1;

        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    let svd = a.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| GeometryError::Degenerate("SVD failed".to_string()))?;

    // nalgebra does not sort singular values, pick the smallest explicitly.
    let (min_index, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .ok_or_else(|| GeometryError::Degenerate("SVD failed".to_string()))?;
    let h = v_t.row(min_index);

    let mut h_mat = Matrix3::from_fn(|r, c| h[3 * r + c]);
    let t_image_inv = t_image
        .try_inverse()
        .ok_or_else(|| GeometryError::Degenerate("normalisation is singular".to_string()))?;
    h_mat = t_image_inv * h_mat * t_plane;

    let scale = h_mat[(2, 2)];
    if scale.abs() > f64::EPSILON {
        h_mat /= scale;
    }
    if !h_mat.iter().all(|v| v.is_finite()) {
        return Err(GeometryError::Degenerate(
            "homography is not finite".to_string(),
        ));
    }
    Ok(h_mat)
}

/// Splits a plane homography into the board rotation and translation given `K`.
///
/// The rotation is projected onto SO(3) and the sign is chosen so the board
/// lies in front of the camera.
pub fn decompose_homography(
    camera_matrix: &Matrix3<f64>,
    homography: &Matrix3<f64>,
) -> Result<(Matrix3<f64>, Vector3<f64>), GeometryError> {
    let k_inv = camera_matrix
        .try_inverse()
        .ok_or_else(|| GeometryError::Degenerate("camera matrix is singular".to_string()))?;

    let h1 = k_inv * homography.column(0);
    let h2 = k_inv * homography.column(1);
    let h3 = k_inv * homography.column(2);

    let norm = (h1.norm() + h2.norm()) * 0.5;
    if norm <= 1e-12 {
        return Err(GeometryError::Degenerate(
            "homography columns vanish".to_string(),
        ));
    }
    let lambda = 1.0 / norm;

    let mut r1 = h1 * lambda;
    let mut r2 = h2 * lambda;
    let mut t = h3 * lambda;
    if t.z < 0.0 {
        r1 = -r1;
        r2 = -r2;
        t = -t;
    }
    let r3 = r1.cross(&r2);
    if r3.norm() <= 1e-12 {
        return Err(GeometryError::Degenerate(
            "homography columns are parallel".to_string(),
        ));
    }

    let r = Matrix3::from_columns(&[r1, r2, r3]);
    let svd = r.svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => return Err(GeometryError::Degenerate("SVD failed".to_string())),
    };
    let mut rotation = u * v_t;
    if rotation.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        rotation = u_flipped * v_t;
    }

    Ok((rotation, t))
}
