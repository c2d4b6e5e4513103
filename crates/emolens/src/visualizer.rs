//! Terminal rendering of the latest emotion scores.

use crate::engine::ScoreUpdate;
use emolens_core::EmotionScores;
use std::fmt::Write as _;

const BAR_WIDTH: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Header plus one bar per label, redrawn in place.
    Bars,
    /// One JSON object per update, newline terminated.
    Json,
}

/// Holds the most recently completed inference and nothing else.
#[derive(Debug)]
pub struct Visualizer {
    mode: RenderMode,
    current: Option<ScoreUpdate>,
}

impl Visualizer {
    pub fn new(mode: RenderMode) -> Self {
        Self { mode, current: None }
    }

    pub fn mode(&self) -> RenderMode {
        self.mode
    }

    pub fn current(&self) -> Option<&ScoreUpdate> {
        self.current.as_ref()
    }

    /// Replace the displayed scores. Returns false, leaving the display
    /// untouched, if the update comes from an older frame than the one shown.
    pub fn apply(&mut self, update: ScoreUpdate) -> bool {
        if let Some(shown) = &self.current {
            if update.frame_index < shown.frame_index {
                tracing::trace!(
                    stale = update.frame_index,
                    shown = shown.frame_index,
                    "discarding stale update"
                );
                return false;
            }
        }
        self.current = Some(update);
        true
    }

    /// Render the current state. Empty until the first update arrives.
    pub fn render(&self) -> String {
        let Some(update) = &self.current else {
            return String::new();
        };
        match self.mode {
            RenderMode::Bars => {
                let mut out = format!(
                    "frame {} | orientation {} | face {}/{}\n",
                    update.frame_index,
                    update.orientation,
                    update.face + 1,
                    update.faces_in_frame
                );
                out.push_str(&render_bars(&update.scores));
                out
            }
            RenderMode::Json => match serde_json::to_string(update) {
                Ok(line) => line + "\n",
                Err(e) => {
                    tracing::warn!(error = %e, "failed to serialize update");
                    String::new()
                }
            },
        }
    }
}

/// One row per label, highest confidence first.
pub fn render_bars(scores: &EmotionScores) -> String {
    let label_width = scores.ranked().iter().map(|(l, _)| l.len()).max().unwrap_or(0);
    let mut out = String::new();
    for (label, confidence) in scores.ranked() {
        let filled = ((confidence.clamp(0.0, 1.0) * BAR_WIDTH as f32).round() as usize).min(BAR_WIDTH);
        let _ = writeln!(
            out,
            "{label:<label_width$} {:>5.1}% {}{}",
            confidence * 100.0,
            "#".repeat(filled),
            ".".repeat(BAR_WIDTH - filled),
        );
    }
    out
}
