//! Face extraction: SCRFD detection via ONNX Runtime, then cropping.
//!
//! The SCRFD model itself is opaque. This module letterboxes the frame into the
//! model input, decodes the three anchor-free stride heads, applies NMS and cuts
//! one grayscale crop per surviving box.

use crate::types::{BoundingBox, FaceImage};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
const SCRFD_OUTPUTS: usize = 9;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download det_500m.onnx or det_10g.onnx from insightface")]
    ModelNotFound(String),
    #[error("unexpected model layout: {0}")]
    BadModel(String),
    #[error("frame buffer is {actual} bytes, expected {expected}")]
    BadFrame { expected: usize, actual: usize },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Turns a grayscale frame into zero or more single-face crops.
pub trait FaceExtractor: Send {
    /// Faces in `pixels` (`width * height` bytes), most confident first.
    fn extract(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<FaceImage>, DetectorError>;
}

/// Tunables for [`ScrfdExtractor`].
#[derive(Debug, Clone, Copy)]
pub struct ExtractorSettings {
    /// Minimum detector score for a face to be kept.
    pub score_threshold: f32,
    /// IoU above which the weaker of two boxes is dropped.
    pub nms_threshold: f32,
    /// Faces whose shorter side is below this many pixels are ignored.
    pub min_face_size: u32,
    /// Extra context around each box, as a fraction of the box size.
    pub crop_margin: f32,
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        Self {
            score_threshold: 0.5,
            nms_threshold: 0.4,
            min_face_size: 24,
            crop_margin: 0.1,
        }
    }
}

/// Scale and padding used to map model coordinates back to the frame.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, target: u32) -> (Self, u32, u32) {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, target);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, target);
        let pad_x = ((target - new_w) / 2) as f32;
        let pad_y = ((target - new_h) / 2) as f32;
        (Self { scale, pad_x, pad_y }, new_w, new_h)
    }

    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// One stride head: where its score and box tensors sit in the output list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideHead {
    stride: usize,
    score: usize,
    bbox: usize,
}

/// SCRFD-based face extractor.
pub struct ScrfdExtractor {
    session: Session,
    heads: [StrideHead; 3],
    settings: ExtractorSettings,
}

impl ScrfdExtractor {
    /// Load the SCRFD ONNX model. Any failure here is a startup failure.
    pub fn load(model_path: &str, settings: ExtractorSettings) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < SCRFD_OUTPUTS {
            return Err(DetectorError::BadModel(format!(
                "SCRFD needs {SCRFD_OUTPUTS} outputs (score/bbox/kps per stride), got {}",
                names.len()
            )));
        }
        let heads = map_stride_heads(&names);

        tracing::info!(
            path = model_path,
            outputs = ?names,
            ?heads,
            score_threshold = settings.score_threshold,
            "loaded SCRFD model"
        );

        Ok(Self { session, heads, settings })
    }

    fn input_tensor(&self, frame: &GrayImage) -> (Array4<f32>, Letterbox) {
        let (letterbox, new_w, new_h) = Letterbox::fit(frame.width(), frame.height(), SCRFD_INPUT_SIZE);
        let resized = imageops::resize(frame, new_w, new_h, FilterType::Triangle);

        let size = SCRFD_INPUT_SIZE as usize;
        // Padding normalises to 0.0.
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        let (ox, oy) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
        for (x, y, pixel) in resized.enumerate_pixels() {
            let v = (pixel.0[0] as f32 - SCRFD_MEAN) / SCRFD_STD;
            let (tx, ty) = (ox + x as usize, oy + y as usize);
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = v;
            }
        }
        (tensor, letterbox)
    }
}

impl FaceExtractor for ScrfdExtractor {
    fn extract(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<FaceImage>, DetectorError> {
        let expected = width as usize * height as usize;
        if expected == 0 || pixels.len() < expected {
            return Err(DetectorError::BadFrame { expected, actual: pixels.len() });
        }
        let frame = GrayImage::from_raw(width, height, pixels[..expected].to_vec())
            .ok_or(DetectorError::BadFrame { expected, actual: pixels.len() })?;

        let (input, letterbox) = self.input_tensor(&frame);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for head in self.heads {
            let (_, scores) = outputs[head.score].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("scores stride {}: {e}", head.stride))
            })?;
            let (_, boxes) = outputs[head.bbox].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("boxes stride {}: {e}", head.stride))
            })?;
            candidates.extend(decode_head(
                scores,
                boxes,
                head.stride,
                SCRFD_INPUT_SIZE as usize,
                &letterbox,
                self.settings.score_threshold,
            ));
        }

        let kept = non_max_suppression(candidates, self.settings.nms_threshold);
        let faces = crop_faces(&frame, &kept, &self.settings);
        tracing::trace!(boxes = kept.len(), faces = faces.len(), "extracted faces");
        Ok(faces)
    }
}

/// Locate each stride's score and bbox tensors.
///
/// Exports either name them `score_8`, `bbox_16`, ... or use opaque numeric
/// names in the canonical order `[scores x3, boxes x3, kps x3]`.
fn map_stride_heads(names: &[String]) -> [StrideHead; 3] {
    let position = |prefix: &str, stride: usize| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let named: Option<Vec<StrideHead>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| {
            Some(StrideHead {
                stride,
                score: position("score", stride)?,
                bbox: position("bbox", stride)?,
            })
        })
        .collect();

    match named {
        Some(heads) => [heads[0], heads[1], heads[2]],
        None => std::array::from_fn(|i| StrideHead {
            stride: SCRFD_STRIDES[i],
            score: i,
            bbox: i + 3,
        }),
    }
}

/// Decode one stride head into frame-space boxes above `threshold`.
fn decode_head(
    scores: &[f32],
    boxes: &[f32],
    stride: usize,
    input_size: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let cells_per_row = input_size / stride;
    let anchors = cells_per_row * cells_per_row * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    (0..anchors.min(scores.len()))
        .filter(|&i| scores[i] > threshold)
        .filter_map(|i| {
            let d = boxes.get(i * 4..i * 4 + 4)?;
            let cell = i / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % cells_per_row) as f32 * s;
            let cy = (cell / cells_per_row) as f32 * s;

            let (x1, y1) = letterbox.to_frame(cx - d[0] * s, cy - d[1] * s);
            let (x2, y2) = letterbox.to_frame(cx + d[2] * s, cy + d[3] * s);
            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: scores[i],
            })
        })
        .collect()
}

/// Greedy NMS. Output is sorted by confidence, highest first.
fn non_max_suppression(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// Cut one crop per box, skipping boxes that are too small or off-frame.
fn crop_faces(frame: &GrayImage, boxes: &[BoundingBox], settings: &ExtractorSettings) -> Vec<FaceImage> {
    boxes
        .iter()
        .filter(|b| b.width.min(b.height) >= settings.min_face_size as f32)
        .filter_map(|b| {
            let (x, y, w, h) = b.to_crop_rect(settings.crop_margin, frame.width(), frame.height())?;
            Some(FaceImage {
                pixels: imageops::crop_imm(frame, x, y, w, h).to_image(),
                bbox: *b,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn bbox(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence }
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let boxes = vec![
            bbox(5.0, 5.0, 100.0, 100.0, 0.8),
            bbox(0.0, 0.0, 100.0, 100.0, 0.9),
            bbox(200.0, 200.0, 50.0, 50.0, 0.7),
        ];
        let kept = non_max_suppression(boxes, 0.4);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
        assert!((kept[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(non_max_suppression(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_landscape_frame() {
        let (lb, w, h) = Letterbox::fit(320, 240, 640);
        assert_eq!((w, h), (640, 480));
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 80.0);
        let (x, y) = lb.to_frame(100.0 * lb.scale + lb.pad_x, 50.0 * lb.scale + lb.pad_y);
        assert!((x - 100.0).abs() < 1e-3 && (y - 50.0).abs() < 1e-3);
    }

    #[test]
    fn test_map_stride_heads_named() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let heads = map_stride_heads(&names);
        assert_eq!(heads[0], StrideHead { stride: 8, score: 2, bbox: 0 });
        assert_eq!(heads[1], StrideHead { stride: 16, score: 5, bbox: 3 });
        assert_eq!(heads[2], StrideHead { stride: 32, score: 8, bbox: 6 });
    }

    #[test]
    fn test_map_stride_heads_positional() {
        let names: Vec<String> = (0..9).map(|i: usize| (440 + i).to_string()).collect();
        let heads = map_stride_heads(&names);
        assert_eq!(heads.map(|h| (h.score, h.bbox)), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_decode_head_single_anchor() {
        // Stride 32 on a 64px input: 2x2 cells, 2 anchors each → 8 anchors.
        let mut scores = vec![0.0f32; 8];
        let mut boxes = vec![0.0f32; 32];
        // Anchor 3 → cell 1 → (cx, cy) = (32, 0)
        scores[3] = 0.9;
        boxes[12..16].copy_from_slice(&[0.5, 0.0, 0.5, 1.0]);

        let identity = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let dets = decode_head(&scores, &boxes, 32, 64, &identity, 0.5);
        assert_eq!(dets.len(), 1);
        let d = dets[0];
        assert_eq!((d.x, d.y, d.width, d.height), (16.0, 0.0, 32.0, 32.0));
        assert!((d.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_decode_head_below_threshold_and_short_tensors() {
        let scores = vec![0.4f32, 0.9];
        let boxes = vec![0.0f32; 4]; // only anchor 0 has box data
        let identity = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        assert!(decode_head(&scores, &boxes, 32, 64, &identity, 0.5).is_empty());
    }

    #[test]
    fn test_crop_faces_filters_small_and_crops() {
        let frame = GrayImage::from_fn(100, 100, |x, _| Luma([x as u8]));
        let settings = ExtractorSettings { min_face_size: 20, crop_margin: 0.0, ..Default::default() };
        let boxes = [bbox(10.0, 10.0, 30.0, 40.0, 0.9), bbox(60.0, 60.0, 10.0, 10.0, 0.8)];

        let faces = crop_faces(&frame, &boxes, &settings);
        assert_eq!(faces.len(), 1);
        assert_eq!((faces[0].width(), faces[0].height()), (30, 40));
        assert_eq!(faces[0].pixels.get_pixel(0, 0).0[0], 10);
        assert_eq!(faces[0].bbox, boxes[0]);
    }
}
