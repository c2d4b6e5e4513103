//! emolens-core: orientation resolution, face extraction and emotion classification.
//!
//! Face detection (SCRFD) and emotion classification (FER+) both run through
//! ONNX Runtime on the CPU. The models are treated as opaque services; this
//! crate only prepares their inputs and decodes their outputs.

pub mod classifier;
pub mod detector;
pub mod orientation;
pub mod types;

pub use classifier::{ClassifierError, EmotionClassifier, FerPlusClassifier, FERPLUS_LABELS};
pub use detector::{DetectorError, ExtractorSettings, FaceExtractor, ScrfdExtractor};
pub use orientation::{
    resolve, CameraFacing, DeviceOrientation, DeviceOrientationSource, FixedDeviceOrientation,
    OrientationCode, OrientationPolicy,
};
pub use types::{BoundingBox, EmotionScores, FaceImage};

use std::path::PathBuf;

/// Where model files live unless `EMOLENS_MODEL_DIR` says otherwise.
pub const SYSTEM_MODEL_DIR: &str = "/usr/share/emolens/models";

/// Model directory: `$EMOLENS_MODEL_DIR`, falling back to [`SYSTEM_MODEL_DIR`].
pub fn default_model_dir() -> PathBuf {
    std::env::var_os("EMOLENS_MODEL_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(SYSTEM_MODEL_DIR))
}
