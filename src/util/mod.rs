//! Small helpers shared by the parameter store, the camera model and the CLI:
//! OpenCV-style YAML documents, matrix records and error statistics.

use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use yaml_rust::Yaml;

#[derive(thiserror::Error, Debug)]
pub enum UtilError {
    #[error("Zero projection points")]
    ZeroProjectionPoints,
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
}

/// Reads a YAML document, dropping the `%YAML:1.0` directive written by OpenCV's
/// `FileStorage`, which is not valid YAML 1.2 syntax.
pub fn read_yaml_document(path: &Path) -> io::Result<String> {
    let contents = fs::read_to_string(path)?;
    Ok(strip_opencv_directive(&contents))
}

pub fn strip_opencv_directive(contents: &str) -> String {
    let mut lines = contents.lines().peekable();
    let mut out = String::with_capacity(contents.len());
    if let Some(first) = lines.peek() {
        if first.trim_start().starts_with("%YAML:") {
            lines.next();
            if lines.peek().map(|l| l.trim() == "---").unwrap_or(false) {
                lines.next();
            }
        }
    }
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Create the parent directory of `path` when it does not exist yet.
pub fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.exists() => {
            fs::create_dir_all(parent)
        }
        _ => Ok(()),
    }
}

/// Dense matrix in the layout OpenCV uses for `opencv-matrix` nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixRecord {
    pub rows: usize,
    pub cols: usize,
    pub dt: String,
    pub data: Vec<f64>,
}

impl MatrixRecord {
    pub fn from_matrix3(m: &Matrix3<f64>) -> Self {
        let mut data = Vec::with_capacity(9);
        for r in 0..3 {
            for c in 0..3 {
                data.push(m[(r, c)]);
            }
        }
        MatrixRecord {
            rows: 3,
            cols: 3,
            dt: "d".to_string(),
            data,
        }
    }

    pub fn column(values: &[f64]) -> Self {
        MatrixRecord {
            rows: values.len(),
            cols: 1,
            dt: "d".to_string(),
            data: values.to_vec(),
        }
    }

    /// Packs equally sized rows; `dt` follows OpenCV's channel notation ("d", "2f").
    pub fn from_rows(rows: &[Vec<f64>], cols: usize, dt: &str) -> Self {
        MatrixRecord {
            rows: rows.len(),
            cols,
            dt: dt.to_string(),
            data: rows.iter().flatten().copied().collect(),
        }
    }
}

/// Reads a number from a YAML scalar, accepting integers as well as reals.
pub fn yaml_f64(node: &Yaml) -> Option<f64> {
    match node {
        Yaml::Real(_) => node.as_f64(),
        Yaml::Integer(i) => Some(*i as f64),
        _ => None,
    }
}

/// Reads a matrix node written either as an OpenCV matrix mapping
/// (`rows`, `cols`, `data`) or as a flat sequence (treated as a column).
pub fn yaml_matrix(node: &Yaml) -> Option<(usize, usize, Vec<f64>)> {
    if let Some(seq) = node.as_vec() {
        let data = seq.iter().map(yaml_f64).collect::<Option<Vec<_>>>()?;
        return Some((data.len(), 1, data));
    }
    let rows = usize::try_from(node["rows"].as_i64()?).ok()?;
    let cols = usize::try_from(node["cols"].as_i64()?).ok()?;
    let data = node["data"]
        .as_vec()?
        .iter()
        .map(yaml_f64)
        .collect::<Option<Vec<_>>>()?;
    Some((rows, cols, data))
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl fmt::Debug for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Projection Error [ rmse: {}, min: {}, max: {}, mean: {}, stddev: {}, median: {} ]",
            self.rmse, self.min, self.max, self.mean, self.stddev, self.median
        )
    }
}

/// Summary statistics over a list of (per-view or per-point) errors.
pub fn error_statistics(errors: &[f64]) -> Result<ProjectionError, UtilError> {
    if errors.is_empty() {
        return Err(UtilError::ZeroProjectionPoints);
    }
    if errors.iter().any(|e| e.is_nan()) {
        return Err(UtilError::InvalidParams(
            "error list contains NaN".to_string(),
        ));
    }

    let n = errors.len() as f64;
    let mean = errors.iter().sum::<f64>() / n;
    let variance = errors.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    let rmse = (errors.iter().map(|x| x.powi(2)).sum::<f64>() / n).sqrt();
    let min = errors.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let max = errors.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));

    let mut sorted = errors.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    let median = if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    };

    Ok(ProjectionError {
        rmse,
        min,
        max,
        mean,
        stddev: variance.sqrt(),
        median,
    })
}
