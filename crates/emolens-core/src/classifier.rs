//! FER+ emotion classifier via ONNX Runtime.
//!
//! Classifies an upright 64x64 grayscale face crop into eight emotion labels,
//! using the `emotion-ferplus-8` model from the ONNX model zoo.

use crate::orientation::OrientationCode;
use crate::types::{EmotionScores, FaceImage};
use image::imageops::{self, FilterType};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const FERPLUS_INPUT_SIZE: u32 = 64;

/// Output order of the FER+ model.
pub const FERPLUS_LABELS: [&str; 8] = [
    "neutral",
    "happiness",
    "surprise",
    "sadness",
    "anger",
    "disgust",
    "fear",
    "contempt",
];

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("model file not found: {0}; download emotion-ferplus-8.onnx from the ONNX model zoo")]
    ModelNotFound(String),
    #[error("empty face crop")]
    EmptyFace,
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Opaque classification service: face crop + orientation → scores.
pub trait EmotionClassifier: Send {
    /// `Ok(None)` means the model produced no usable result for this face.
    fn classify(
        &mut self,
        face: &FaceImage,
        orientation: OrientationCode,
    ) -> Result<Option<EmotionScores>, ClassifierError>;
}

/// FER+ based emotion classifier.
pub struct FerPlusClassifier {
    session: Session,
}

impl FerPlusClassifier {
    /// Load the FER+ ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, ClassifierError> {
        if !Path::new(model_path).exists() {
            return Err(ClassifierError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded FER+ model"
        );

        Ok(Self { session })
    }

    /// Upright, resize and pack a face crop as `[1, 1, 64, 64]`.
    ///
    /// FER+ takes raw 0–255 intensities, no normalisation.
    fn preprocess(face: &FaceImage, orientation: OrientationCode) -> Array4<f32> {
        let upright = orientation.apply(&face.pixels);
        let resized = imageops::resize(&upright, FERPLUS_INPUT_SIZE, FERPLUS_INPUT_SIZE, FilterType::Triangle);

        let size = FERPLUS_INPUT_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 1, size, size));
        for (x, y, pixel) in resized.enumerate_pixels() {
            tensor[[0, 0, y as usize, x as usize]] = pixel.0[0] as f32;
        }
        tensor
    }
}

impl EmotionClassifier for FerPlusClassifier {
    fn classify(
        &mut self,
        face: &FaceImage,
        orientation: OrientationCode,
    ) -> Result<Option<EmotionScores>, ClassifierError> {
        if face.width() == 0 || face.height() == 0 {
            return Err(ClassifierError::EmptyFace);
        }

        let input = Self::preprocess(face, orientation);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, logits) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ClassifierError::InferenceFailed(format!("logits: {e}")))?;

        let scores = EmotionScores::from_logits(&FERPLUS_LABELS, logits);
        if scores.is_none() {
            tracing::debug!(len = logits.len(), "FER+ output unusable, no result");
        }
        Ok(scores)
    }
}
