//! Target (page) detection on the quarter preview.

use crate::frame::GreyFrame;

pub const DEFAULT_MIN_CONTRAST: f32 = 12.0;
pub const DEFAULT_MAX_CHANGE: f32 = 6.0;
pub const DEFAULT_TARGET_STABLE_FRAMES: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetStatus {
    Found,
    NotFound,
}

/// Decides, frame by frame, whether a page is under the camera.
pub trait TargetDetector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Inspect one quarter-resolution preview frame.
    fn detect(&mut self, frame: &GreyFrame) -> TargetStatus;

    /// Forget any history, e.g. after the arm was closed.
    fn reset(&mut self) {}
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TargetSettings {
    /// Minimum standard deviation of the frame for it to look like print.
    pub min_contrast: f32,
    /// Maximum mean absolute difference from the previous frame that still
    /// counts as still.
    pub max_change: f32,
    /// Consecutive still, contrasted frames before a target is acquired.
    pub stable_frames: u32,
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            min_contrast: DEFAULT_MIN_CONTRAST,
            max_change: DEFAULT_MAX_CHANGE,
            stable_frames: DEFAULT_TARGET_STABLE_FRAMES,
        }
    }
}

/// Contrast plus frame-to-frame correlation.
///
/// Acquiring a target needs `stable_frames` still frames with enough
/// contrast. Once acquired it is held for as long as the contrast is there,
/// so a hand moving over the page does not drop it.
#[derive(Debug, Default)]
pub struct CorrelationTarget {
    settings: TargetSettings,
    previous: Option<GreyFrame>,
    still_frames: u32,
    acquired: bool,
}

impl CorrelationTarget {
    pub fn new(settings: TargetSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired
    }
}

/// Population standard deviation of the samples.
pub fn contrast(frame: &GreyFrame) -> f32 {
    if frame.data.is_empty() {
        return 0.0;
    }
    let mean = frame.mean();
    let variance = frame
        .data
        .iter()
        .map(|&v| {
            let d = v as f32 - mean;
            d * d
        })
        .sum::<f32>()
        / frame.data.len() as f32;
    variance.sqrt()
}

/// Mean absolute difference of two equally sized frames.
pub fn mean_change(a: &GreyFrame, b: &GreyFrame) -> Option<f32> {
    if !a.same_size(b) || a.data.is_empty() {
        return None;
    }
    let total: u64 = a
        .data
        .iter()
        .zip(&b.data)
        .map(|(&x, &y)| x.abs_diff(y) as u64)
        .sum();
    Some(total as f32 / a.data.len() as f32)
}

impl TargetDetector for CorrelationTarget {
    fn name(&self) -> &'static str {
        "correlation"
    }

    fn detect(&mut self, frame: &GreyFrame) -> TargetStatus {
        let contrasted = contrast(frame) >= self.settings.min_contrast;
        let still = self
            .previous
            .as_ref()
            .and_then(|prev| mean_change(prev, frame))
            .is_some_and(|change| change <= self.settings.max_change);
        self.previous = Some(frame.clone());

        if !contrasted {
            if self.acquired {
                log::debug!("target: contrast lost");
            }
            self.acquired = false;
            self.still_frames = 0;
            return TargetStatus::NotFound;
        }
        if self.acquired {
            return TargetStatus::Found;
        }

        self.still_frames = if still { self.still_frames + 1 } else { 0 };
        if self.still_frames >= self.settings.stable_frames {
            self.acquired = true;
            log::debug!("target: acquired after {} still frames", self.still_frames);
            TargetStatus::Found
        } else {
            TargetStatus::NotFound
        }
    }

    fn reset(&mut self) {
        self.previous = None;
        self.still_frames = 0;
        self.acquired = false;
    }
}
