//! Validated calibration settings.
//!
//! The settings document is read with `serde_yaml` into [`RawSettings`] and then
//! checked as a whole by [`Settings::from_raw`]: every problem found is reported,
//! and a [`Settings`] value only exists when there were none.

use crate::calibration::{CalibrationFlags, CalibrationOptions, DistortionPolicy};
use crate::geometry::{BoardSize, Pattern, PatternGeometry};
use crate::input::{CaptureBackend, InputDescriptor, InputError, InputSource};
use crate::util;
use log::{error, info};
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Smallest accepted square / spacing size.
pub const MIN_SQUARE_SIZE: f64 = 1e-5;

/// One problem found while validating the settings document.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigIssue {
    #[error("Invalid board size: {width} x {height}")]
    InvalidBoardSize { width: i64, height: i64 },
    #[error("Invalid square size {0}")]
    InvalidSquareSize(f64),
    #[error("Invalid number of frames {0}")]
    InvalidFrameCount(i64),
    #[error("Unknown calibration pattern: {0:?}")]
    UnknownPattern(String),
    #[error("Invalid aspect ratio {0}")]
    InvalidAspectRatio(f64),
    #[error("Invalid input delay {0} ms")]
    InvalidDelay(i64),
    #[error("No input configured")]
    MissingInput,
    #[error("Input is unavailable: {0}")]
    InputUnavailable(String),
    #[error("Image list {0} is empty")]
    EmptyImageList(String),
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Invalid settings: {}", format_issues(.0))]
    Invalid(Vec<ConfigIssue>),
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse settings: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn format_issues(issues: &[ConfigIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Accepts `true` / `false`, `0` / `1` and their string forms.
fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolLike {
        Bool(bool),
        Int(i64),
        Text(String),
    }

    match BoolLike::deserialize(deserializer)? {
        BoolLike::Bool(b) => Ok(b),
        BoolLike::Int(i) => Ok(i != 0),
        BoolLike::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "expected a boolean, found {:?}",
                other
            ))),
        },
    }
}

/// The settings document as written, before validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawSettings {
    #[serde(rename = "BoardSize_Width")]
    pub board_width: i64,
    #[serde(rename = "BoardSize_Height")]
    pub board_height: i64,
    #[serde(rename = "Square_Size")]
    pub square_size: f64,
    #[serde(rename = "Calibrate_Pattern")]
    pub pattern: String,
    #[serde(rename = "Calibrate_NrOfFrameToUse")]
    pub frame_count: i64,
    /// 0 disables the fixed aspect ratio.
    #[serde(rename = "Calibrate_FixAspectRatio")]
    pub aspect_ratio: f64,
    #[serde(
        rename = "Calibrate_AssumeZeroTangentialDistortion",
        deserialize_with = "lenient_bool"
    )]
    pub zero_tangent_dist: bool,
    #[serde(
        rename = "Calibrate_FixPrincipalPointAtTheCenter",
        deserialize_with = "lenient_bool"
    )]
    pub fix_principal_point: bool,
    #[serde(rename = "Calibrate_FixK4", deserialize_with = "lenient_bool")]
    pub fix_k4: bool,
    #[serde(rename = "Calibrate_FixK5", deserialize_with = "lenient_bool")]
    pub fix_k5: bool,
    #[serde(rename = "Write_DetectedFeaturePoints", deserialize_with = "lenient_bool")]
    pub write_points: bool,
    #[serde(rename = "Write_extrinsicParameters", deserialize_with = "lenient_bool")]
    pub write_extrinsics: bool,
    #[serde(rename = "Write_outputFileName")]
    pub output_path: String,
    #[serde(
        rename = "Input_FlipAroundHorizontalAxis",
        deserialize_with = "lenient_bool"
    )]
    pub flip_vertical: bool,
    /// Milliseconds between accepted frames of a stream.
    #[serde(rename = "Input_Delay")]
    pub delay_ms: i64,
    #[serde(rename = "Input")]
    pub input: String,
}

impl Default for RawSettings {
    fn default() -> Self {
        RawSettings {
            board_width: 0,
            board_height: 0,
            square_size: 0.0,
            pattern: String::new(),
            frame_count: 0,
            aspect_ratio: 0.0,
            zero_tangent_dist: false,
            fix_principal_point: false,
            fix_k4: true,
            fix_k5: true,
            write_points: false,
            write_extrinsics: false,
            output_path: "out_camera_data.yml".to_string(),
            flip_vertical: false,
            delay_ms: 100,
            input: String::new(),
        }
    }
}

impl RawSettings {
    /// Parses a settings document. The values may sit under a top-level
    /// `Settings` key, and a leading `%YAML:1.0` directive is ignored.
    pub fn from_yaml_str(contents: &str) -> Result<RawSettings, ConfigError> {
        let contents = util::strip_opencv_directive(contents);
        let value: serde_yaml::Value = serde_yaml::from_str(&contents)?;
        let value = match value.get("Settings") {
            Some(inner) => inner.clone(),
            None => value,
        };
        Ok(serde_yaml::from_value(value)?)
    }

    pub fn load(path: &Path) -> Result<RawSettings, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }
}

/// Validated, immutable calibration settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub pattern: Pattern,
    pub board_size: BoardSize,
    pub square_size: f64,
    /// Number of views to accumulate; for image lists this is capped by the list length.
    pub frame_count: usize,
    /// The count requested in the document, before capping.
    pub requested_frames: usize,
    pub aspect_ratio: Option<f64>,
    /// Flags selected by the document (aspect ratio, tangential distortion, principal point).
    pub flags: CalibrationFlags,
    pub distortion_policy: DistortionPolicy,
    pub write_points: bool,
    pub write_extrinsics: bool,
    pub output_path: PathBuf,
    pub flip_vertical: bool,
    pub delay: Duration,
    pub input: InputDescriptor,
}

impl Settings {
    /// Loads and validates a settings file, opening the configured input.
    pub fn load(
        path: &Path,
        backend: &dyn CaptureBackend,
    ) -> Result<(Settings, InputSource), ConfigError> {
        let raw = RawSettings::load(path)?;
        Self::from_raw(raw, backend)
    }

    /// Validates every field and opens the input. All problems are logged and
    /// returned together in [`ConfigError::Invalid`].
    pub fn from_raw(
        raw: RawSettings,
        backend: &dyn CaptureBackend,
    ) -> Result<(Settings, InputSource), ConfigError> {
        let mut issues = Vec::new();

        let board_size = match (
            u32::try_from(raw.board_width),
            u32::try_from(raw.board_height),
        ) {
            (Ok(width), Ok(height)) if width > 0 && height > 0 => {
                Some(BoardSize::new(width, height))
            }
            _ => {
                issues.push(ConfigIssue::InvalidBoardSize {
                    width: raw.board_width,
                    height: raw.board_height,
                });
                None
            }
        };
        if !(raw.square_size > MIN_SQUARE_SIZE) {
            issues.push(ConfigIssue::InvalidSquareSize(raw.square_size));
        }
        if raw.frame_count <= 0 {
            issues.push(ConfigIssue::InvalidFrameCount(raw.frame_count));
        }
        let pattern = Pattern::from_name(&raw.pattern);
        if pattern.is_none() {
            issues.push(ConfigIssue::UnknownPattern(raw.pattern.clone()));
        }
        if !raw.aspect_ratio.is_finite() || raw.aspect_ratio < 0.0 {
            issues.push(ConfigIssue::InvalidAspectRatio(raw.aspect_ratio));
        }
        if raw.delay_ms < 0 {
            issues.push(ConfigIssue::InvalidDelay(raw.delay_ms));
        }

        let requested_frames = raw.frame_count.max(0) as usize;
        let mut frame_count = requested_frames;

        let mut opened = None;
        match InputDescriptor::classify(&raw.input) {
            Err(_) => issues.push(ConfigIssue::MissingInput),
            Ok(descriptor) => {
                if let InputDescriptor::ImageList(paths) = &descriptor {
                    if paths.is_empty() {
                        issues.push(ConfigIssue::EmptyImageList(raw.input.clone()));
                    }
                    frame_count = frame_count.min(paths.len());
                }
                match InputSource::open(&descriptor, backend) {
                    Ok(source) => opened = Some((descriptor, source)),
                    Err(InputError::Unavailable(what)) => {
                        issues.push(ConfigIssue::InputUnavailable(what))
                    }
                    Err(e) => issues.push(ConfigIssue::InputUnavailable(e.to_string())),
                }
            }
        }

        let (pattern, board_size, (input, source)) = match (pattern, board_size, opened) {
            (Some(pattern), Some(board_size), Some(opened)) if issues.is_empty() => {
                (pattern, board_size, opened)
            }
            _ => {
                for issue in &issues {
                    error!("{}", issue);
                }
                return Err(ConfigError::Invalid(issues));
            }
        };

        let mut flags = CalibrationFlags::empty();
        if raw.fix_principal_point {
            flags |= CalibrationFlags::FIX_PRINCIPAL_POINT;
        }
        if raw.zero_tangent_dist {
            flags |= CalibrationFlags::ZERO_TANGENT_DIST;
        }
        let aspect_ratio = if raw.aspect_ratio > 0.0 {
            flags |= CalibrationFlags::FIX_ASPECT_RATIO;
            Some(raw.aspect_ratio)
        } else {
            None
        };

        if frame_count < requested_frames {
            info!(
                "Image list holds {} images, using {} of the {} requested frames",
                frame_count, frame_count, requested_frames
            );
        }

        let settings = Settings {
            pattern,
            board_size,
            square_size: raw.square_size,
            frame_count,
            requested_frames,
            aspect_ratio,
            flags,
            distortion_policy: DistortionPolicy {
                fix_k4: raw.fix_k4,
                fix_k5: raw.fix_k5,
                fix_k6: true,
            },
            write_points: raw.write_points,
            write_extrinsics: raw.write_extrinsics,
            output_path: PathBuf::from(raw.output_path),
            flip_vertical: raw.flip_vertical,
            delay: Duration::from_millis(raw.delay_ms as u64),
            input,
        };
        Ok((settings, source))
    }

    pub fn geometry(&self) -> PatternGeometry {
        PatternGeometry::new(self.pattern, self.board_size, self.square_size)
    }

    /// Options handed to the calibrator: document flags plus the distortion policy.
    pub fn calibration_options(&self) -> CalibrationOptions {
        CalibrationOptions {
            flags: self.flags | self.distortion_policy.flags(),
            aspect_ratio: self.aspect_ratio,
            ..CalibrationOptions::default()
        }
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}x{} (square {}), {} frames from {}, output {}",
            self.pattern,
            self.board_size.width,
            self.board_size.height,
            self.square_size,
            self.frame_count,
            self.input,
            self.output_path.display()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::tests::temp_dir;
    use crate::input::NoCaptureBackend;
    use image::RgbImage;

    fn write_image_list(name: &str, count: usize) -> PathBuf {
        let dir = temp_dir(name);
        let mut entries = String::from("images:\n");
        for i in 0..count {
            let file = format!("view{}.png", i);
            RgbImage::new(8, 6).save(dir.join(&file)).unwrap();
            entries.push_str(&format!("  - {}\n", file));
        }
        let list = dir.join("list.yaml");
        std::fs::write(&list, entries).unwrap();
        list
    }

    fn raw_with_input(input: &str) -> RawSettings {
        RawSettings {
            board_width: 9,
            board_height: 6,
            square_size: 25.0,
            pattern: "CHESSBOARD".to_string(),
            frame_count: 5,
            input: input.to_string(),
            ..RawSettings::default()
        }
    }

    #[test]
    fn test_parse_sample_document() {
        let raw = RawSettings::load(Path::new("samples/settings.yaml")).unwrap();
        assert_eq!(raw.board_width, 9);
        assert_eq!(raw.board_height, 6);
        assert_eq!(raw.square_size, 25.0);
        assert_eq!(raw.pattern, "CHESSBOARD");
        assert_eq!(raw.aspect_ratio, 1.0);
        assert!(raw.zero_tangent_dist);
        assert!(!raw.fix_principal_point);
        assert!(raw.fix_k4 && raw.fix_k5);
        assert_eq!(raw.delay_ms, 100);
    }

    #[test]
    fn test_lenient_booleans() {
        let raw = RawSettings::from_yaml_str(
            "Calibrate_AssumeZeroTangentialDistortion: 1\nCalibrate_FixPrincipalPointAtTheCenter: \"true\"\nCalibrate_FixK4: 0\n",
        )
        .unwrap();
        assert!(raw.zero_tangent_dist);
        assert!(raw.fix_principal_point);
        assert!(!raw.fix_k4);
        assert!(raw.fix_k5);
    }

    #[test]
    fn test_board_width_zero_is_invalid() {
        let list = write_image_list("settings_zero_width", 1);
        let mut raw = raw_with_input(list.to_str().unwrap());
        raw.board_width = 0;

        match Settings::from_raw(raw, &NoCaptureBackend) {
            Err(ConfigError::Invalid(issues)) => {
                assert_eq!(
                    issues,
                    vec![ConfigIssue::InvalidBoardSize {
                        width: 0,
                        height: 6
                    }]
                );
            }
            other => panic!("expected invalid settings, got {:?}", other.map(|r| r.0)),
        }
    }

    #[test]
    fn test_board_size_beyond_u32_is_invalid() {
        let list = write_image_list("settings_huge_board", 1);
        let mut raw = raw_with_input(list.to_str().unwrap());
        raw.board_height = u32::MAX as i64 + 1;

        match Settings::from_raw(raw, &NoCaptureBackend) {
            Err(ConfigError::Invalid(issues)) => {
                assert_eq!(
                    issues,
                    vec![ConfigIssue::InvalidBoardSize {
                        width: 9,
                        height: 4_294_967_296
                    }]
                );
            }
            other => panic!("expected invalid settings, got {:?}", other.map(|r| r.0)),
        }
    }

    #[test]
    fn test_all_issues_are_reported() {
        let raw = RawSettings {
            square_size: 0.0,
            pattern: "HEXAGONS".to_string(),
            ..RawSettings::default()
        };
        match Settings::from_raw(raw, &NoCaptureBackend) {
            Err(ConfigError::Invalid(issues)) => {
                assert!(issues.contains(&ConfigIssue::InvalidSquareSize(0.0)));
                assert!(issues.contains(&ConfigIssue::InvalidFrameCount(0)));
                assert!(issues.contains(&ConfigIssue::UnknownPattern("HEXAGONS".to_string())));
                assert!(issues.contains(&ConfigIssue::MissingInput));
            }
            other => panic!("expected invalid settings, got {:?}", other.map(|r| r.0)),
        }
    }

    #[test]
    fn test_camera_without_backend_is_unavailable() {
        let result = Settings::from_raw(raw_with_input("0"), &NoCaptureBackend);
        assert!(matches!(
            result,
            Err(ConfigError::Invalid(ref issues))
                if matches!(issues.as_slice(), [ConfigIssue::InputUnavailable(_)])
        ));
    }

    #[test]
    fn test_image_list_caps_frame_count() {
        let list = write_image_list("settings_cap", 3);
        let mut raw = raw_with_input(list.to_str().unwrap());
        raw.aspect_ratio = 1.0;

        let (settings, source) = Settings::from_raw(raw, &NoCaptureBackend).unwrap();
        assert_eq!(settings.frame_count, 3);
        assert_eq!(settings.requested_frames, 5);
        assert!(!source.is_stream());
        assert_eq!(settings.aspect_ratio, Some(1.0));

        let options = settings.calibration_options();
        assert!(options.flags.contains(CalibrationFlags::FIX_ASPECT_RATIO));
        assert!(options.flags.contains(CalibrationFlags::FIX_K4));
        assert!(options.flags.contains(CalibrationFlags::FIX_K5));
        assert!(!options.flags.contains(CalibrationFlags::ZERO_TANGENT_DIST));
    }
}
