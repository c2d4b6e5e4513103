use emolens_core::{CameraFacing, DeviceOrientation, ExtractorSettings, OrientationCode};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::engine::PipelineSettings;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Where the per-frame orientation code comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum OrientationMode {
    /// Ask iio-sensor-proxy for the device orientation on every frame.
    Sensor,
    /// Resolve from a fixed device orientation.
    Device(DeviceOrientation),
    /// Use this code for every frame.
    Code(OrientationCode),
}

impl FromStr for OrientationMode {
    type Err = String;

    /// `sensor`, `device:<orientation>` or `code:<name-or-number>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("sensor") {
            return Ok(Self::Sensor);
        }
        match s.split_once(':') {
            Some(("device", v)) => v.parse().map(Self::Device).map_err(|e| e.to_string()),
            Some(("code", v)) => v.parse().map(Self::Code).map_err(|e| e.to_string()),
            _ => Err(format!(
                "invalid orientation mode {s:?} (expected sensor, device:<orientation> or code:<code>)"
            )),
        }
    }
}

impl TryFrom<String> for OrientationMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for OrientationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrientationMode::Sensor => f.write_str("sensor"),
            OrientationMode::Device(d) => write!(f, "device:{d:?}"),
            OrientationMode::Code(c) => write!(f, "code:{c}"),
        }
    }
}

/// Application configuration: defaults, then the TOML file named by
/// `EMOLENS_CONFIG`, then `EMOLENS_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    pub capture_width: u32,
    pub capture_height: u32,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// SCRFD model file name inside `model_dir`.
    pub detector_model: String,
    /// FER+ model file name inside `model_dir`.
    pub classifier_model: String,
    pub camera_facing: CameraFacing,
    pub orientation: OrientationMode,
    /// Minimum SCRFD score for a face.
    pub score_threshold: f32,
    /// Faces smaller than this (pixels, shorter side) are ignored.
    pub min_face_size: u32,
    /// Context added around each face crop, as a fraction of the box.
    pub crop_margin: f32,
    /// Faces classified per frame, most confident first.
    pub max_faces: usize,
    /// Frames waiting for the worker; extra frames are dropped.
    pub frame_queue: usize,
    /// Skip frames that are almost entirely black.
    pub skip_dark_frames: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            capture_width: 640,
            capture_height: 480,
            model_dir: emolens_core::default_model_dir(),
            detector_model: "det_500m.onnx".to_string(),
            classifier_model: "emotion-ferplus-8.onnx".to_string(),
            camera_facing: CameraFacing::Front,
            // Desktop webcams deliver upright frames.
            orientation: OrientationMode::Code(OrientationCode::Up),
            score_threshold: 0.5,
            min_face_size: 24,
            crop_margin: 0.1,
            max_faces: 1,
            frame_queue: 2,
            skip_dark_frames: true,
        }
    }
}

impl Config {
    /// Load configuration from the optional file and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("EMOLENS_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file; keys it leaves out keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlay `EMOLENS_*` variables. Unparsable values are logged and ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("EMOLENS_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("EMOLENS_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("EMOLENS_DETECTOR_MODEL") {
            self.detector_model = v;
        }
        if let Some(v) = lookup("EMOLENS_CLASSIFIER_MODEL") {
            self.classifier_model = v;
        }
        env_parse(&lookup, "EMOLENS_CAPTURE_WIDTH", &mut self.capture_width);
        env_parse(&lookup, "EMOLENS_CAPTURE_HEIGHT", &mut self.capture_height);
        env_parse(&lookup, "EMOLENS_CAMERA_FACING", &mut self.camera_facing);
        env_parse(&lookup, "EMOLENS_ORIENTATION", &mut self.orientation);
        env_parse(&lookup, "EMOLENS_SCORE_THRESHOLD", &mut self.score_threshold);
        env_parse(&lookup, "EMOLENS_MIN_FACE_SIZE", &mut self.min_face_size);
        env_parse(&lookup, "EMOLENS_CROP_MARGIN", &mut self.crop_margin);
        env_parse(&lookup, "EMOLENS_MAX_FACES", &mut self.max_faces);
        env_parse(&lookup, "EMOLENS_FRAME_QUEUE", &mut self.frame_queue);
        if let Some(v) = lookup("EMOLENS_SKIP_DARK_FRAMES") {
            self.skip_dark_frames = v != "0" && !v.eq_ignore_ascii_case("false");
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.score_threshold > 0.0 && self.score_threshold < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "score_threshold must be in (0, 1), got {}",
                self.score_threshold
            )));
        }
        if !(self.crop_margin >= 0.0 && self.crop_margin <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "crop_margin must be in [0, 1], got {}",
                self.crop_margin
            )));
        }
        if self.max_faces == 0 {
            return Err(ConfigError::Invalid("max_faces must be at least 1".into()));
        }
        if self.frame_queue == 0 {
            return Err(ConfigError::Invalid("frame_queue must be at least 1".into()));
        }
        if self.capture_width == 0 || self.capture_height == 0 {
            return Err(ConfigError::Invalid("capture size must be non-zero".into()));
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join(&self.detector_model)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the FER+ classification model.
    pub fn classifier_model_path(&self) -> String {
        self.model_dir
            .join(&self.classifier_model)
            .to_string_lossy()
            .into_owned()
    }

    pub fn extractor_settings(&self) -> ExtractorSettings {
        ExtractorSettings {
            score_threshold: self.score_threshold,
            min_face_size: self.min_face_size,
            crop_margin: self.crop_margin,
            ..ExtractorSettings::default()
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            max_faces: self.max_faces,
            frame_queue: self.frame_queue,
            skip_dark_frames: self.skip_dark_frames,
            ..PipelineSettings::default()
        }
    }
}

fn env_parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T)
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.parse() {
        Ok(v) => *slot = v,
        Err(e) => tracing::warn!(key, value = %raw, error = %e, "ignoring unparsable setting"),
    }
}
