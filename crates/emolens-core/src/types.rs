use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Axis-aligned face box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-Union with another box, 0.0 when either is empty.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);

        let inter = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Grow the box by `margin` (fraction of its size) on every side, then clip
    /// it to a `frame_width` × `frame_height` frame.
    ///
    /// Returns integer pixel bounds `(x, y, w, h)`, or `None` if nothing of the
    /// box lies inside the frame.
    pub fn to_crop_rect(
        &self,
        margin: f32,
        frame_width: u32,
        frame_height: u32,
    ) -> Option<(u32, u32, u32, u32)> {
        let dx = self.width * margin;
        let dy = self.height * margin;
        let x0 = (self.x - dx).floor().max(0.0);
        let y0 = (self.y - dy).floor().max(0.0);
        let x1 = (self.x + self.width + dx).ceil().min(frame_width as f32);
        let y1 = (self.y + self.height + dy).ceil().min(frame_height as f32);

        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
    }
}

/// A grayscale crop of a frame believed to contain exactly one face.
#[derive(Debug, Clone)]
pub struct FaceImage {
    pub pixels: GrayImage,
    /// Detector box the crop was cut from (before margin expansion).
    pub bbox: BoundingBox,
}

impl FaceImage {
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

/// Emotion label → confidence in [0, 1].
///
/// The key set is unordered; use [`ranked`](Self::ranked) for display order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmotionScores(HashMap<String, f32>);

impl EmotionScores {
    /// Build scores from raw logits with a numerically stable softmax.
    ///
    /// Returns `None` when the label and logit counts differ, when there are no
    /// logits, or when any logit is not finite.
    pub fn from_logits(labels: &[&str], logits: &[f32]) -> Option<Self> {
        if logits.is_empty() || labels.len() != logits.len() {
            return None;
        }
        if logits.iter().any(|v| !v.is_finite()) {
            return None;
        }

        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = logits.iter().map(|&v| (v - max).exp()).collect();
        let sum: f32 = exps.iter().sum();

        let map = labels
            .iter()
            .zip(exps)
            .map(|(label, e)| (label.to_string(), e / sum))
            .collect();
        Some(Self(map))
    }

    pub fn get(&self, label: &str) -> Option<f32> {
        self.0.get(label).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Labels sorted by confidence, highest first. Ties break alphabetically so
    /// rendering is stable.
    pub fn ranked(&self) -> Vec<(&str, f32)> {
        let mut entries: Vec<(&str, f32)> =
            self.0.iter().map(|(k, &v)| (k.as_str(), v)).collect();
        entries.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });
        entries
    }

    /// The most confident label.
    pub fn top(&self) -> Option<(&str, f32)> {
        self.ranked().into_iter().next()
    }
}

impl FromIterator<(String, f32)> for EmotionScores {
    fn from_iter<I: IntoIterator<Item = (String, f32)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
