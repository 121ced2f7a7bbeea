//! Calibration records in the OpenCV `FileStorage` layout.
//!
//! Records are written with `serde_yaml` (shortest round-trip float
//! formatting) and read back with `yaml-rust`, so every value written is
//! recovered exactly.

use crate::calibration::{CalibrationFlags, CalibrationRun};
use crate::camera::{CameraModel, CameraModelError, RadTanModel, Resolution};
use crate::geometry::BoardSize;
use crate::settings::Settings;
use crate::util::{self, MatrixRecord};
use log::{info, warn};
use nalgebra::{Matrix3, Vector2};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use yaml_rust::{Yaml, YamlLoader};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("YAML parse error: {0}")]
    Scan(#[from] yaml_rust::ScanError),
    #[error("Camera model error: {0}")]
    Camera(#[from] CameraModelError),
    #[error("Missing or malformed entry: {0}")]
    Missing(String),
}

/// What goes into a record besides the calibration result itself.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordLayout {
    pub board_size: BoardSize,
    pub square_size: f64,
    pub write_points: bool,
    pub write_extrinsics: bool,
}

impl From<&Settings> for RecordLayout {
    fn from(settings: &Settings) -> Self {
        RecordLayout {
            board_size: settings.board_size,
            square_size: settings.square_size,
            write_points: settings.write_points,
            write_extrinsics: settings.write_extrinsics,
        }
    }
}

#[derive(Serialize)]
struct CalibrationRecord {
    #[serde(rename = "calibration_Time")]
    calibration_time: String,
    #[serde(rename = "nrOfFrames")]
    frame_count: usize,
    #[serde(rename = "image_Width")]
    image_width: u32,
    #[serde(rename = "image_Height")]
    image_height: u32,
    #[serde(rename = "board_Width")]
    board_width: u32,
    #[serde(rename = "board_Height")]
    board_height: u32,
    #[serde(rename = "square_Size")]
    square_size: f64,
    #[serde(rename = "FixAspectRatio", skip_serializing_if = "Option::is_none")]
    fix_aspect_ratio: Option<f64>,
    #[serde(rename = "calibration_Flags")]
    calibration_flags: String,
    #[serde(rename = "flagValue")]
    flag_value: u32,
    #[serde(rename = "Camera_Matrix")]
    camera_matrix: MatrixRecord,
    #[serde(rename = "Distortion_Coefficients")]
    distortion_coefficients: MatrixRecord,
    #[serde(rename = "Avg_Reprojection_Error")]
    avg_reprojection_error: f64,
    #[serde(rename = "Per_View_Reprojection_Errors")]
    per_view_reprojection_errors: MatrixRecord,
    #[serde(rename = "Extrinsic_Parameters", skip_serializing_if = "Option::is_none")]
    extrinsic_parameters: Option<MatrixRecord>,
    #[serde(rename = "Image_points", skip_serializing_if = "Option::is_none")]
    image_points: Option<MatrixRecord>,
}

/// Writes a calibration record, creating the output directory if needed.
pub fn save_calibration(
    path: &Path,
    layout: &RecordLayout,
    run: &CalibrationRun,
) -> Result<(), StoreError> {
    let result = &run.result;
    let calibration_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
        .to_string();

    let extrinsic_parameters = layout.write_extrinsics.then(|| {
        let rows: Vec<Vec<f64>> = result
            .rvecs
            .iter()
            .zip(&result.tvecs)
            .map(|(r, t)| vec![r.x, r.y, r.z, t.x, t.y, t.z])
            .collect();
        MatrixRecord::from_rows(&rows, 6, "d")
    });
    let image_points = layout.write_points.then(|| {
        let rows: Vec<Vec<f64>> = run
            .observations
            .views()
            .iter()
            .map(|view| view.iter().flat_map(|p| [p.x, p.y]).collect())
            .collect();
        MatrixRecord::from_rows(&rows, run.observations.points_per_view(), "2f")
    });

    let record = CalibrationRecord {
        calibration_time,
        frame_count: run.observations.len(),
        image_width: run.image_size.width,
        image_height: run.image_size.height,
        board_width: layout.board_size.width,
        board_height: layout.board_size.height,
        square_size: layout.square_size,
        fix_aspect_ratio: result.aspect_ratio,
        calibration_flags: result.flags.annotation(),
        flag_value: result.flags.bits(),
        camera_matrix: MatrixRecord::from_matrix3(&result.camera_matrix),
        distortion_coefficients: MatrixRecord::column(&result.distortion),
        avg_reprojection_error: result.avg_error,
        per_view_reprojection_errors: MatrixRecord::column(&result.per_view_errors),
        extrinsic_parameters,
        image_points,
    };

    let body = serde_yaml::to_string(&record)?;
    util::ensure_parent_dir(path)?;
    fs::write(path, format!("%YAML:1.0\n---\n{}", body))?;
    info!("Calibration written to {}", path.display());
    Ok(())
}

/// Persists the run only when its result is valid. Returns whether it was written.
pub fn save_if_valid(
    path: &Path,
    layout: &RecordLayout,
    run: &CalibrationRun,
) -> Result<bool, StoreError> {
    if !run.result.valid {
        warn!("Calibration result is invalid, nothing written to {}", path.display());
        return Ok(false);
    }
    save_calibration(path, layout, run)?;
    Ok(true)
}

/// Camera parameters as read back from a record.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraParameters {
    pub camera_matrix: Matrix3<f64>,
    pub distortion: [f64; 8],
    pub image_size: Option<Resolution>,
}

impl CameraParameters {
    pub fn camera_model(&self) -> Result<RadTanModel, CameraModelError> {
        RadTanModel::from_camera_matrix(
            &self.camera_matrix,
            &self.distortion,
            self.image_size.unwrap_or(Resolution {
                width: 0,
                height: 0,
            }),
        )
    }
}

pub fn load_camera_parameters(path: &Path) -> Result<CameraParameters, StoreError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| StoreError::Missing(format!("non UTF-8 path {}", path.display())))?;
    let model = RadTanModel::load_from_yaml(path_str)?;
    let resolution = model.get_resolution();
    Ok(CameraParameters {
        camera_matrix: model.camera_matrix(),
        distortion: model.distortions,
        image_size: (resolution.width > 0 && resolution.height > 0).then_some(resolution),
    })
}

/// Detections and board description stored alongside a calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObservations {
    pub board_size: BoardSize,
    pub square_size: f64,
    pub image_size: Resolution,
    pub aspect_ratio: Option<f64>,
    pub flags: CalibrationFlags,
    pub views: Vec<Vec<Vector2<f64>>>,
}

fn required_u32(doc: &Yaml, key: &str) -> Result<u32, StoreError> {
    doc[key]
        .as_i64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| StoreError::Missing(key.to_string()))
}

fn required_f64(doc: &Yaml, key: &str) -> Result<f64, StoreError> {
    util::yaml_f64(&doc[key]).ok_or_else(|| StoreError::Missing(key.to_string()))
}

/// Reads the `Image_points` table (one row per view, two channels per point)
/// together with what is needed to solve it again.
pub fn load_image_points(path: &Path) -> Result<StoredObservations, StoreError> {
    let contents = util::read_yaml_document(path)?;
    let docs = YamlLoader::load_from_str(&contents)?;
    let doc = docs
        .first()
        .ok_or_else(|| StoreError::Missing("empty document".to_string()))?;

    let (rows, cols, data) = util::yaml_matrix(&doc["Image_points"])
        .ok_or_else(|| StoreError::Missing("Image_points".to_string()))?;
    let expected = rows.checked_mul(cols).and_then(|n| n.checked_mul(2));
    if cols == 0 || expected != Some(data.len()) {
        return Err(StoreError::Missing(format!(
            "Image_points holds {} values, expected {}x{}x2",
            data.len(),
            rows,
            cols
        )));
    }
    let views = data
        .chunks(cols * 2)
        .map(|row| row.chunks(2).map(|p| Vector2::new(p[0], p[1])).collect())
        .collect();

    Ok(StoredObservations {
        board_size: BoardSize::new(
            required_u32(doc, "board_Width")?,
            required_u32(doc, "board_Height")?,
        ),
        square_size: required_f64(doc, "square_Size")?,
        image_size: Resolution {
            width: required_u32(doc, "image_Width")?,
            height: required_u32(doc, "image_Height")?,
        },
        aspect_ratio: util::yaml_f64(&doc["FixAspectRatio"]),
        flags: CalibrationFlags::from_bits(required_u32(doc, "flagValue")?),
        views,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CalibrationResult, DistortionPolicy, ObservationSet};
    use crate::input::tests::temp_dir;
    use nalgebra::Vector3;

    fn sample_run(valid: bool) -> CalibrationRun {
        let mut observations = ObservationSet::new(3);
        observations
            .push(vec![
                Vector2::new(10.25, 20.5),
                Vector2::new(0.1, 0.2),
                Vector2::new(1.0 / 3.0, 639.999),
            ])
            .unwrap();
        observations
            .push(vec![
                Vector2::new(11.0, 21.0),
                Vector2::new(12.125, 22.0),
                Vector2::new(1e-7, 2.0_f64.sqrt()),
            ])
            .unwrap();

        let flags = CalibrationFlags::FIX_ASPECT_RATIO
            | CalibrationFlags::ZERO_TANGENT_DIST
            | DistortionPolicy::default().flags();
        CalibrationRun {
            observations,
            image_size: Resolution {
                width: 640,
                height: 480,
            },
            result: CalibrationResult {
                camera_matrix: Matrix3::new(
                    657.402_531_1,
                    0.0,
                    319.5,
                    0.0,
                    657.402_531_1,
                    239.5,
                    0.0,
                    0.0,
                    1.0,
                ),
                distortion: [-0.254_7, 0.118_3, 0.0, 0.0, -0.021_1, 0.0, 0.0, 0.0],
                rvecs: vec![Vector3::new(0.1, -0.2, 0.3), Vector3::new(0.01, 0.02, 0.03)],
                tvecs: vec![Vector3::new(-1.0, 2.0, 50.0), Vector3::new(3.0, 4.0, 60.0)],
                per_view_errors: vec![0.123_456_789, 0.2],
                avg_error: 0.171_3,
                solver_rms: 0.171_3,
                flags,
                aspect_ratio: Some(1.0),
                image_size: Resolution {
                    width: 640,
                    height: 480,
                },
                valid,
            },
        }
    }

    fn layout() -> RecordLayout {
        RecordLayout {
            board_size: BoardSize::new(3, 1),
            square_size: 25.0,
            write_points: true,
            write_extrinsics: true,
        }
    }

    #[test]
    fn test_round_trip_is_exact() {
        let path = temp_dir("store_round_trip").join("nested/out_camera_data.yml");
        let run = sample_run(true);
        save_calibration(&path, &layout(), &run).unwrap();

        let params = load_camera_parameters(&path).unwrap();
        assert_eq!(params.camera_matrix, run.result.camera_matrix);
        assert_eq!(params.distortion, run.result.distortion);
        assert_eq!(params.image_size, Some(run.image_size));

        let stored = load_image_points(&path).unwrap();
        assert_eq!(stored.views, run.observations.views());
        assert_eq!(stored.board_size, BoardSize::new(3, 1));
        assert_eq!(stored.square_size, 25.0);
        assert_eq!(stored.aspect_ratio, Some(1.0));
        assert_eq!(stored.flags, run.result.flags);
        assert_eq!(stored.image_size, run.image_size);
    }

    #[test]
    fn test_record_keys_and_annotation() {
        let path = temp_dir("store_keys").join("out.yml");
        save_calibration(&path, &layout(), &sample_run(true)).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("%YAML:1.0\n"));
        let docs = YamlLoader::load_from_str(&util::strip_opencv_directive(&text)).unwrap();
        let doc = &docs[0];
        assert_eq!(doc["nrOfFrames"].as_i64(), Some(2));
        assert_eq!(doc["flagValue"].as_i64(), Some(14346));
        assert_eq!(
            doc["calibration_Flags"].as_str(),
            Some("flags: +fix_aspectRatio +zero_tangent_dist +fix_k4 +fix_k5 +fix_k6")
        );
        assert!(doc["calibration_Time"].as_str().is_some());
        assert_eq!(doc["Extrinsic_Parameters"]["rows"].as_i64(), Some(2));
        assert_eq!(doc["Extrinsic_Parameters"]["cols"].as_i64(), Some(6));
        assert_eq!(doc["Image_points"]["dt"].as_str(), Some("2f"));
    }

    #[test]
    fn test_optional_sections_are_omitted() {
        let path = temp_dir("store_minimal").join("out.yml");
        let layout = RecordLayout {
            write_points: false,
            write_extrinsics: false,
            ..layout()
        };
        let mut run = sample_run(true);
        run.result.aspect_ratio = None;
        save_calibration(&path, &layout, &run).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(!text.contains("Image_points"));
        assert!(!text.contains("Extrinsic_Parameters"));
        assert!(!text.contains("FixAspectRatio"));
        assert!(matches!(
            load_image_points(&path),
            Err(StoreError::Missing(ref key)) if key == "Image_points"
        ));
    }

    #[test]
    fn test_invalid_result_is_not_written() {
        let path = temp_dir("store_invalid").join("never.yml");
        assert!(!save_if_valid(&path, &layout(), &sample_run(false)).unwrap());
        assert!(!path.exists());
        assert!(save_if_valid(&path, &layout(), &sample_run(true)).unwrap());
        assert!(path.exists());
    }

    fn write_points_record(name: &str, image_points: &str) -> std::path::PathBuf {
        let path = temp_dir(name).join("points.yml");
        fs::write(
            &path,
            format!(
                "%YAML:1.0\n---\nimage_Width: 640\nimage_Height: 480\nboard_Width: 3\n\
                 board_Height: 1\nsquare_Size: 25.0\nflagValue: 0\nImage_points: {}\n",
                image_points
            ),
        )
        .unwrap();
        path
    }

    #[test]
    fn test_malformed_image_points_are_rejected() {
        for (name, table) in [
            ("store_negative_rows", "{rows: -1, cols: 0, dt: 2f, data: []}"),
            ("store_huge_rows", "{rows: 9223372036854775807, cols: 0, dt: 2f, data: []}"),
            ("store_overflow", "{rows: 9223372036854775807, cols: 4, dt: 2f, data: []}"),
            ("store_empty_rows", "{rows: 0, cols: 0, dt: 2f, data: []}"),
            ("store_short_data", "{rows: 1, cols: 3, dt: 2f, data: [1, 2, 3]}"),
        ] {
            let path = write_points_record(name, table);
            assert!(
                matches!(load_image_points(&path), Err(StoreError::Missing(_))),
                "{} was accepted",
                table
            );
        }

        let path = write_points_record(
            "store_well_formed",
            "{rows: 1, cols: 3, dt: 2f, data: [1, 2, 3, 4, 5, 6]}",
        );
        let stored = load_image_points(&path).unwrap();
        assert_eq!(
            stored.views,
            vec![vec![
                Vector2::new(1.0, 2.0),
                Vector2::new(3.0, 4.0),
                Vector2::new(5.0, 6.0)
            ]]
        );
    }

    #[test]
    fn test_load_sample_parameters() {
        let params = load_camera_parameters(Path::new("samples/camera_params.yaml")).unwrap();
        assert_eq!(params.camera_matrix[(0, 0)], 657.4025);
        assert_eq!(params.distortion[4], -0.0211);
        assert_eq!(
            params.image_size,
            Some(Resolution {
                width: 640,
                height: 480
            })
        );
    }
}
