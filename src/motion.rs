//! Block motion estimator.
//!
//! Least-squares gradient optical flow between the current and previous grey
//! frame. Only pixels with a significant temporal difference take part: the
//! threshold is picked from the difference histogram so that roughly a fixed
//! number of points survive.
//!
//! A direction-agnostic pass over the whole frame seeds a direction
//! hypothesis. Each cell of a 3x3 grid is then estimated using only the points
//! whose normal flow agrees with it, and the strongest cell wins.

use crate::frame::GreyFrame;

pub const DEFAULT_GLOBAL_BUDGET: usize = 300;
pub const DEFAULT_REGION_BUDGET: usize = 100;
pub const DEFAULT_MOTION_SCALE: f32 = 4.0;
pub const DEFAULT_MIN_POINTS: usize = 8;

/// Normal equations with a determinant at or below this are singular.
const SINGULAR_DET: f64 = 1.0;
const GRID: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MotionSettings {
    pub global_budget: usize,
    pub region_budget: usize,
    /// Gain applied to the winning region, compensating the sampling step.
    pub scale: f32,
    pub min_points: usize,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            global_budget: DEFAULT_GLOBAL_BUDGET,
            region_budget: DEFAULT_REGION_BUDGET,
            scale: DEFAULT_MOTION_SCALE,
            min_points: DEFAULT_MIN_POINTS,
        }
    }
}

/// Displacement in pixels with its squared magnitude.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MotionVector {
    pub dx: f32,
    pub dy: f32,
    pub magnitude: f32,
}

impl MotionVector {
    pub const ZERO: MotionVector = MotionVector {
        dx: 0.0,
        dy: 0.0,
        magnitude: 0.0,
    };

    pub fn new(dx: f32, dy: f32) -> Self {
        Self {
            dx,
            dy,
            magnitude: dx * dx + dy * dy,
        }
    }

    pub fn scaled(self, gain: f32) -> Self {
        Self::new(self.dx * gain, self.dy * gain)
    }

    pub fn is_zero(&self) -> bool {
        self.magnitude == 0.0
    }
}

/// Half-open pixel rectangle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Region {
    x0: usize,
    y0: usize,
    x1: usize,
    y1: usize,
}

/// Sums of the 2x2 normal equations.
#[derive(Default)]
struct Normal {
    gxx: f64,
    gyy: f64,
    gxy: f64,
    dgx: f64,
    dgy: f64,
}

impl Normal {
    fn solve(&self) -> MotionVector {
        let det = self.gxx * self.gyy - self.gxy * self.gxy;
        if det.abs() <= SINGULAR_DET {
            return MotionVector::ZERO;
        }
        // brightness constancy: g . v = -diff
        let (bx, by) = (-self.dgx, -self.dgy);
        let dx = (self.gyy * bx - self.gxy * by) / det;
        let dy = (self.gxx * by - self.gxy * bx) / det;
        MotionVector::new(dx as f32, dy as f32)
    }
}

/// Largest `T` such that more than `budget` pixels have `|diff| > T`,
/// or 0 when the budget is never reached.
fn difference_threshold(histogram: &[usize; 256], budget: usize) -> i32 {
    let mut cumulative = 0usize;
    for level in (1..256).rev() {
        cumulative += histogram[level];
        if cumulative >= budget {
            return level as i32 - 1;
        }
    }
    0
}

fn estimate_region(
    cur: &GreyFrame,
    prev: &GreyFrame,
    region: Region,
    budget: usize,
    hypothesis: Option<(f32, f32)>,
    min_points: usize,
) -> Option<MotionVector> {
    let mut histogram = [0usize; 256];
    for y in region.y0..region.y1 {
        for x in region.x0..region.x1 {
            let diff = cur.at(x, y) as i32 - prev.at(x, y) as i32;
            histogram[diff.unsigned_abs() as usize] += 1;
        }
    }
    let threshold = difference_threshold(&histogram, budget);

    let mut normal = Normal::default();
    let (mut candidates, mut points) = (0usize, 0usize);
    for y in region.y0..region.y1 {
        for x in region.x0..region.x1 {
            let diff = cur.at(x, y) as i32 - prev.at(x, y) as i32;
            if diff.abs() <= threshold {
                continue;
            }
            candidates += 1;

            let gx = (cur.at(x + 1, y) as i32 - cur.at(x - 1, y) as i32
                + prev.at(x + 1, y) as i32
                - prev.at(x - 1, y) as i32) as f64
                / 4.0;
            let gy = (cur.at(x, y + 1) as i32 - cur.at(x, y - 1) as i32
                + prev.at(x, y + 1) as i32
                - prev.at(x, y - 1) as i32) as f64
                / 4.0;
            let diff = diff as f64;

            if let Some((hx, hy)) = hypothesis {
                // normal flow is -diff * g / |g|^2; only its sign matters
                if -diff * (gx * hx as f64 + gy * hy as f64) <= 0.0 {
                    continue;
                }
            }
            points += 1;
            normal.gxx += gx * gx;
            normal.gyy += gy * gy;
            normal.gxy += gx * gy;
            normal.dgx += diff * gx;
            normal.dgy += diff * gy;
        }
    }

    let accepted = match hypothesis {
        Some(_) => points >= min_points && points * 2 >= candidates,
        None => candidates >= min_points,
    };
    if !accepted {
        return None;
    }
    Some(normal.solve())
}

/// Motion estimator with a one-frame history.
#[derive(Debug, Default)]
pub struct MotionEstimator {
    settings: MotionSettings,
    previous: Option<GreyFrame>,
}

impl MotionEstimator {
    pub fn new(settings: MotionSettings) -> Self {
        Self {
            settings,
            previous: None,
        }
    }

    /// Forget the history; the next call compares a frame with itself.
    pub fn reset(&mut self) {
        self.previous = None;
    }

    /// Motion from the stored frame to `frame`, then `frame` becomes the
    /// stored frame.
    pub fn estimate(&mut self, frame: &GreyFrame) -> MotionVector {
        let motion = match self.previous.as_ref() {
            Some(prev) if prev.same_size(frame) => self.estimate_pair(frame, prev),
            // a frame compared with itself does not move
            _ => MotionVector::ZERO,
        };
        match self.previous.as_mut() {
            Some(prev) if prev.same_size(frame) => prev.data.copy_from_slice(&frame.data),
            _ => self.previous = Some(frame.clone()),
        }
        motion
    }

    fn estimate_pair(&self, cur: &GreyFrame, prev: &GreyFrame) -> MotionVector {
        let (w, h) = (cur.width as usize, cur.height as usize);
        if w < 2 + GRID as usize || h < 2 + GRID as usize {
            return MotionVector::ZERO;
        }
        let interior = Region {
            x0: 1,
            y0: 1,
            x1: w - 1,
            y1: h - 1,
        };
        let s = &self.settings;

        let Some(global) =
            estimate_region(cur, prev, interior, s.global_budget, None, s.min_points)
        else {
            return MotionVector::ZERO;
        };
        if global.is_zero() {
            return MotionVector::ZERO;
        }
        let hypothesis = Some((global.dx, global.dy));

        let mut best: Option<MotionVector> = None;
        for cell in grid(interior) {
            let Some(local) =
                estimate_region(cur, prev, cell, s.region_budget, hypothesis, s.min_points)
            else {
                continue;
            };
            if best.map_or(true, |b| local.magnitude > b.magnitude) {
                best = Some(local);
            }
        }
        best.map_or(MotionVector::ZERO, |b| b.scaled(s.scale))
    }
}

fn grid(area: Region) -> impl Iterator<Item = Region> {
    let (w, h) = (area.x1 - area.x0, area.y1 - area.y0);
    let n = GRID as usize;
    (0..n * n).map(move |i| {
        let (col, row) = (i % n, i / n);
        Region {
            x0: area.x0 + col * w / n,
            x1: area.x0 + (col + 1) * w / n,
            y0: area.y0 + row * h / n,
            y1: area.y0 + (row + 1) * h / n,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::TAU;

    fn page(width: u32, height: u32, shift_x: f32, shift_y: f32) -> GreyFrame {
        GreyFrame::from_fn(width, height, |x, y| {
            let fx = (TAU * (x as f32 - shift_x) / 20.0).sin();
            let fy = (TAU * (y as f32 - shift_y) / 24.0).sin();
            (128.0 + 60.0 * fx + 40.0 * fy).round() as u8
        })
    }

    #[test]
    fn identical_frames_do_not_move() {
        let mut estimator = MotionEstimator::default();
        let frame = page(80, 60, 0.0, 0.0);
        assert!(estimator.estimate(&frame).is_zero());
        assert_eq!(estimator.estimate(&frame), MotionVector::ZERO);
        assert_eq!(estimator.estimate(&frame), MotionVector::ZERO);
    }

    #[test]
    fn first_call_is_a_self_comparison() {
        let mut estimator = MotionEstimator::default();
        assert!(estimator.estimate(&page(80, 60, 3.0, 0.0)).is_zero());
    }

    #[test]
    fn horizontal_translation_is_signed() {
        let mut estimator = MotionEstimator::new(MotionSettings::default());
        estimator.estimate(&page(80, 60, 0.0, 0.0));
        let right = estimator.estimate(&page(80, 60, 1.0, 0.0));
        assert!(right.dx > 1.0, "{:?}", right);
        assert!(right.dx.abs() > 2.0 * right.dy.abs(), "{:?}", right);
        assert!(right.dx < 8.0, "{:?}", right);

        let left = estimator.estimate(&page(80, 60, 0.0, 0.0));
        assert!(left.dx < -1.0, "{:?}", left);
        assert!(left.dx.abs() > 2.0 * left.dy.abs(), "{:?}", left);
    }

    #[test]
    fn vertical_translation_is_signed() {
        let mut estimator = MotionEstimator::default();
        estimator.estimate(&page(80, 60, 0.0, 0.0));
        let down = estimator.estimate(&page(80, 60, 0.0, 1.0));
        assert!(down.dy > 1.0, "{:?}", down);
        assert!(down.dy.abs() > 2.0 * down.dx.abs(), "{:?}", down);
    }

    #[test]
    fn size_change_resets_history() {
        let mut estimator = MotionEstimator::default();
        estimator.estimate(&page(80, 60, 0.0, 0.0));
        assert!(estimator.estimate(&page(40, 30, 2.0, 0.0)).is_zero());
        assert!(!estimator.estimate(&page(40, 30, 3.0, 0.0)).is_zero());
    }

    #[test]
    fn flat_frames_are_singular() {
        let mut estimator = MotionEstimator::default();
        estimator.estimate(&GreyFrame::from_vec(40, 30, vec![50; 1200]).expect("frame"));
        let motion =
            estimator.estimate(&GreyFrame::from_vec(40, 30, vec![90; 1200]).expect("frame"));
        assert!(motion.is_zero());
    }

    #[test]
    fn threshold_keeps_the_budget() {
        let mut histogram = [0usize; 256];
        histogram[0] = 1000;
        histogram[10] = 50;
        histogram[20] = 50;
        assert_eq!(difference_threshold(&histogram, 40), 19);
        assert_eq!(difference_threshold(&histogram, 80), 9);
        assert_eq!(difference_threshold(&histogram, 500), 0);
        assert_eq!(difference_threshold(&[0; 256], 10), 0);
    }

    #[test]
    fn grid_covers_the_interior() {
        let area = Region {
            x0: 1,
            y0: 1,
            x1: 79,
            y1: 59,
        };
        let cells: Vec<_> = grid(area).collect();
        assert_eq!(cells.len(), 9);
        let covered: usize = cells.iter().map(|c| (c.x1 - c.x0) * (c.y1 - c.y0)).sum();
        assert_eq!(covered, 78 * 58);
    }
}
