//! Frame acquisition: classification of the configured input and the
//! [`InputSource`] that hands out one image at a time.
//!
//! Live devices and video decoding are not part of this crate; they are
//! reached through the [`CaptureBackend`] / [`FrameSource`] traits. Image lists
//! are decoded with the `image` crate.

use crate::util;
use image::RgbImage;
use log::{debug, warn};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum InputError {
    #[error("No input configured")]
    MissingInput,
    #[error("Input is unavailable: {0}")]
    Unavailable(String),
    #[error("Not an image list: {0}")]
    NotAnImageList(String),
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where frames come from, as described by the `Input` setting.
#[derive(Debug, Clone, PartialEq)]
pub enum InputDescriptor {
    Camera(u32),
    VideoFile(PathBuf),
    ImageList(Vec<PathBuf>),
}

impl InputDescriptor {
    /// Classifies the raw `Input` value.
    ///
    /// A purely numeric token selects a camera. A `.yaml`, `.yml` or `.json`
    /// file that parses as a list of paths is an image list; anything else is
    /// treated as a video file.
    pub fn classify(raw: &str) -> Result<InputDescriptor, InputError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(InputError::MissingInput);
        }
        if raw.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(index) = raw.parse::<u32>() {
                return Ok(InputDescriptor::Camera(index));
            }
        }

        let path = PathBuf::from(raw);
        if is_list_extension(&path) {
            match read_image_list(&path) {
                Ok(paths) => return Ok(InputDescriptor::ImageList(paths)),
                Err(e) => debug!("{} is not an image list ({}), trying it as a video", raw, e),
            }
        }
        Ok(InputDescriptor::VideoFile(path))
    }
}

impl fmt::Display for InputDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputDescriptor::Camera(index) => write!(f, "camera #{}", index),
            InputDescriptor::VideoFile(path) => write!(f, "video {}", path.display()),
            InputDescriptor::ImageList(paths) => write!(f, "image list ({} entries)", paths.len()),
        }
    }
}

fn is_list_extension(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml") | Some("json")
    )
}

/// Reads an image-list document.
///
/// The top-level node is either a sequence of paths or a mapping whose first
/// sequence-valued entry holds them (`images: [...]`). Relative entries are
/// resolved against the directory of the list file.
pub fn read_image_list(path: &Path) -> Result<Vec<PathBuf>, InputError> {
    let not_a_list = |reason: &str| InputError::NotAnImageList(format!("{}: {}", path.display(), reason));

    let entries: Vec<String> = if path.extension().and_then(|e| e.to_str()) == Some("json") {
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path)?).map_err(|e| not_a_list(&e.to_string()))?;
        let seq = match value {
            serde_json::Value::Array(items) => items,
            serde_json::Value::Object(map) => map
                .into_iter()
                .find_map(|(_, v)| match v {
                    serde_json::Value::Array(items) => Some(items),
                    _ => None,
                })
                .ok_or_else(|| not_a_list("no sequence found"))?,
            _ => return Err(not_a_list("top-level node is not a sequence")),
        };
        seq.into_iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect::<Option<_>>()
            .ok_or_else(|| not_a_list("entries must be strings"))?
    } else {
        let contents = util::read_yaml_document(path)?;
        let value: serde_yaml::Value =
            serde_yaml::from_str(&contents).map_err(|e| not_a_list(&e.to_string()))?;
        let seq = match value {
            serde_yaml::Value::Sequence(items) => items,
            serde_yaml::Value::Mapping(map) => map
                .into_iter()
                .find_map(|(_, v)| match v {
                    serde_yaml::Value::Sequence(items) => Some(items),
                    _ => None,
                })
                .ok_or_else(|| not_a_list("no sequence found"))?,
            _ => return Err(not_a_list("top-level node is not a sequence")),
        };
        seq.into_iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect::<Option<_>>()
            .ok_or_else(|| not_a_list("entries must be strings"))?
    };

    let base = path.parent().unwrap_or_else(|| Path::new(""));
    Ok(entries
        .into_iter()
        .map(|entry| {
            let entry = PathBuf::from(entry);
            if entry.is_relative() {
                base.join(entry)
            } else {
                entry
            }
        })
        .collect())
}

/// A running stream of frames (camera or decoded video).
pub trait FrameSource {
    /// Next frame, or `None` at the end of the stream or on device failure.
    fn next_frame(&mut self) -> Option<RgbImage>;
}

/// Opens camera devices and video files.
pub trait CaptureBackend {
    fn open_camera(&self, index: u32) -> Result<Box<dyn FrameSource>, InputError>;
    fn open_video(&self, path: &Path) -> Result<Box<dyn FrameSource>, InputError>;
}

/// Backend for headless tools: every camera or video open fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCaptureBackend;

impl CaptureBackend for NoCaptureBackend {
    fn open_camera(&self, index: u32) -> Result<Box<dyn FrameSource>, InputError> {
        Err(InputError::Unavailable(format!(
            "camera #{} (no capture backend)",
            index
        )))
    }

    fn open_video(&self, path: &Path) -> Result<Box<dyn FrameSource>, InputError> {
        Err(InputError::Unavailable(format!(
            "{} (no capture backend)",
            path.display()
        )))
    }
}

/// An opened input.
pub enum InputSource {
    Camera {
        index: u32,
        source: Box<dyn FrameSource>,
    },
    VideoFile {
        path: PathBuf,
        source: Box<dyn FrameSource>,
    },
    ImageList {
        paths: Vec<PathBuf>,
        cursor: usize,
    },
}

impl InputSource {
    pub fn open(
        descriptor: &InputDescriptor,
        backend: &dyn CaptureBackend,
    ) -> Result<InputSource, InputError> {
        Ok(match descriptor {
            InputDescriptor::Camera(index) => InputSource::Camera {
                index: *index,
                source: backend.open_camera(*index)?,
            },
            InputDescriptor::VideoFile(path) => InputSource::VideoFile {
                path: path.clone(),
                source: backend.open_video(path)?,
            },
            InputDescriptor::ImageList(paths) => InputSource::ImageList {
                paths: paths.clone(),
                cursor: 0,
            },
        })
    }

    /// Returns the next frame of a stream, or the next decodable list entry.
    ///
    /// List entries that fail to decode are logged and skipped.
    pub fn next_image(&mut self) -> Option<RgbImage> {
        match self {
            InputSource::Camera { source, .. } | InputSource::VideoFile { source, .. } => {
                source.next_frame()
            }
            InputSource::ImageList { paths, cursor } => {
                while *cursor < paths.len() {
                    let path = &paths[*cursor];
                    *cursor += 1;
                    match image::open(path) {
                        Ok(img) => return Some(img.to_rgb8()),
                        Err(e) => warn!("Skipping {}: {}", path.display(), e),
                    }
                }
                None
            }
        }
    }

    /// Camera or video: debounce, refinement and reset apply.
    pub fn is_stream(&self) -> bool {
        !matches!(self, InputSource::ImageList { .. })
    }

    /// Camera: running out of frames is a device failure.
    pub fn is_live(&self) -> bool {
        matches!(self, InputSource::Camera { .. })
    }
}

impl fmt::Debug for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputSource::Camera { index, .. } => write!(f, "InputSource::Camera({})", index),
            InputSource::VideoFile { path, .. } => {
                write!(f, "InputSource::VideoFile({})", path.display())
            }
            InputSource::ImageList { paths, cursor } => {
                write!(f, "InputSource::ImageList({}/{})", cursor, paths.len())
            }
        }
    }
}
