//! Calibration pattern geometry and the planar projective helpers built on it.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod homography;
pub mod rotation;

pub use homography::{decompose_homography, find_homography};
pub use rotation::{euler_angles_rq, rotate_point, rotation_matrix, rotation_vector};

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum GeometryError {
    #[error("At least {required} point correspondences are needed, got {found}")]
    NotEnoughPoints { required: usize, found: usize },
    #[error("Point lists differ in length: {0} vs {1}")]
    LengthMismatch(usize, usize),
    #[error("Degenerate configuration: {0}")]
    Degenerate(String),
}

/// Kind of planar calibration target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pattern {
    Chessboard,
    CirclesGrid,
    AsymmetricCirclesGrid,
}

impl Pattern {
    /// Parses the names used by the settings document.
    pub fn from_name(name: &str) -> Option<Pattern> {
        match name.trim() {
            "CHESSBOARD" => Some(Pattern::Chessboard),
            "CIRCLES_GRID" => Some(Pattern::CirclesGrid),
            "ASYMMETRIC_CIRCLES_GRID" => Some(Pattern::AsymmetricCirclesGrid),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Pattern::Chessboard => "CHESSBOARD",
            Pattern::CirclesGrid => "CIRCLES_GRID",
            Pattern::AsymmetricCirclesGrid => "ASYMMETRIC_CIRCLES_GRID",
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Number of inner corners (or circles) per row (`width`) and per column (`height`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardSize {
    pub width: u32,
    pub height: u32,
}

impl BoardSize {
    pub fn new(width: u32, height: u32) -> Self {
        BoardSize { width, height }
    }

    pub fn point_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Canonical 3D points of a planar pattern, on the `Z = 0` plane.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternGeometry {
    pub pattern: Pattern,
    pub board_size: BoardSize,
    pub square_size: f64,
}

impl PatternGeometry {
    pub fn new(pattern: Pattern, board_size: BoardSize, square_size: f64) -> Self {
        PatternGeometry {
            pattern,
            board_size,
            square_size,
        }
    }

    /// Board points in row-major order: rows (`i`) outer, columns (`j`) inner.
    ///
    /// Chessboards and symmetric grids place point `(i, j)` at `(j·s, i·s, 0)`;
    /// asymmetric grids shift every other row by one spacing, `((2j + i mod 2)·s, i·s, 0)`.
    pub fn object_points(&self) -> Vec<Vector3<f64>> {
        let s = self.square_size;
        let mut points = Vec::with_capacity(self.board_size.point_count());
        for i in 0..self.board_size.height {
            for j in 0..self.board_size.width {
                let x = match self.pattern {
                    Pattern::Chessboard | Pattern::CirclesGrid => j as f64 * s,
                    Pattern::AsymmetricCirclesGrid => (2 * j + i % 2) as f64 * s,
                };
                points.push(Vector3::new(x, i as f64 * s, 0.0));
            }
        }
        points
    }

    pub fn point_count(&self) -> usize {
        self.board_size.point_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chessboard_points_row_major() {
        let geometry = PatternGeometry::new(Pattern::Chessboard, BoardSize::new(3, 2), 10.0);
        let points = geometry.object_points();

        assert_eq!(points.len(), 6);
        assert_eq!(points[0], Vector3::new(0.0, 0.0, 0.0));
        assert_eq!(points[1], Vector3::new(10.0, 0.0, 0.0));
        assert_eq!(points[3], Vector3::new(0.0, 10.0, 0.0));
        assert_eq!(points[5], Vector3::new(20.0, 10.0, 0.0));
        assert!(points.iter().all(|p| p.z == 0.0));
    }

    #[test]
    fn test_asymmetric_grid_offsets_odd_rows() {
        let geometry =
            PatternGeometry::new(Pattern::AsymmetricCirclesGrid, BoardSize::new(2, 2), 1.5);
        let points = geometry.object_points();

        assert_eq!(points[0], Vector3::new(0.0, 0.0, 0.0));
        assert_eq!(points[1], Vector3::new(3.0, 0.0, 0.0));
        assert_eq!(points[2], Vector3::new(1.5, 1.5, 0.0));
        assert_eq!(points[3], Vector3::new(4.5, 1.5, 0.0));
    }

    #[test]
    fn test_pattern_names() {
        for pattern in [
            Pattern::Chessboard,
            Pattern::CirclesGrid,
            Pattern::AsymmetricCirclesGrid,
        ] {
            assert_eq!(Pattern::from_name(pattern.name()), Some(pattern));
        }
        assert_eq!(Pattern::from_name("RING_GRID"), None);
    }
}
