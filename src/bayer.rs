//! Bayer image pipeline.
//!
//! Nearest-site sampling of an 8-bit Bayer mosaic: every output pixel reads
//! the sites of the 2x2 cell at `(2*step*x, 2*step*y)`. No interpolation; the
//! outputs feed exposure, motion and OCR logic, not a perceptual image.

use crate::frame::{ColorFrame, GreyFrame, PreviewPyramid, RawFrame};

/// Grid step used when sampling for white balance.
pub const WHITE_BALANCE_STEP: u32 = 8;

/// Fixed-point unity gain.
pub const UNITY_GAIN: u32 = 256;

/// Red and blue correction relative to green, fixed point (256 = 1.0).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColorGains {
    pub red: u32,
    pub blue: u32,
}

impl Default for ColorGains {
    fn default() -> Self {
        Self {
            red: UNITY_GAIN,
            blue: UNITY_GAIN,
        }
    }
}

fn output_size(raw: &RawFrame<'_>, step: u32) -> (u32, u32) {
    let cell = 2 * step.max(1);
    (raw.width / cell, raw.height / cell)
}

/// Grey image from the green site of every sampled cell.
pub fn demosaic_grey(raw: &RawFrame<'_>, step: u32) -> GreyFrame {
    let (width, height) = output_size(raw, step);
    let cell = 2 * step.max(1) as usize;
    let green = raw.pattern.green();
    GreyFrame::from_fn(width, height, |x, y| {
        raw.site(x as usize * cell, y as usize * cell, green)
    })
}

/// RGB image with red and blue scaled by `gains`, saturated at 255.
pub fn demosaic_color(raw: &RawFrame<'_>, step: u32, gains: ColorGains) -> ColorFrame {
    let (width, height) = output_size(raw, step);
    let cell = 2 * step.max(1) as usize;
    let (red, green, blue) = (raw.pattern.red(), raw.pattern.green(), raw.pattern.blue());

    let mut data = Vec::with_capacity(width as usize * height as usize * 3);
    for y in 0..height as usize {
        for x in 0..width as usize {
            let (cx, cy) = (x * cell, y * cell);
            data.push(apply_gain(raw.site(cx, cy, red), gains.red));
            data.push(raw.site(cx, cy, green));
            data.push(apply_gain(raw.site(cx, cy, blue), gains.blue));
        }
    }
    ColorFrame {
        width,
        height,
        data,
    }
}

#[inline]
fn apply_gain(value: u8, gain: u32) -> u8 {
    ((value as u32 * gain) >> 8).min(255) as u8
}

/// Gains that bring the red and blue sums up to the green sum.
///
/// Returns `None` when a channel sum is zero (black or degenerate frame).
pub fn compute_white_balance(raw: &RawFrame<'_>) -> Option<ColorGains> {
    let (cols, rows) = output_size(raw, WHITE_BALANCE_STEP);
    let cell = 2 * WHITE_BALANCE_STEP as usize;
    let (red, green, blue) = (raw.pattern.red(), raw.pattern.green(), raw.pattern.blue());

    let (mut r_sum, mut g_sum, mut b_sum) = (0u64, 0u64, 0u64);
    for y in 0..rows as usize {
        for x in 0..cols as usize {
            let (cx, cy) = (x * cell, y * cell);
            r_sum += raw.site(cx, cy, red) as u64;
            g_sum += raw.site(cx, cy, green) as u64;
            b_sum += raw.site(cx, cy, blue) as u64;
        }
    }
    if r_sum == 0 || g_sum == 0 || b_sum == 0 {
        return None;
    }
    Some(ColorGains {
        red: (g_sum * UNITY_GAIN as u64 / r_sum) as u32,
        blue: (g_sum * UNITY_GAIN as u64 / b_sum) as u32,
    })
}

/// Stateful wrapper holding the current white-balance gains.
#[derive(Debug, Default)]
pub struct BayerPipeline {
    gains: ColorGains,
}

impl BayerPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gains(&self) -> ColorGains {
        self.gains
    }

    /// Grey frames at steps 1, 2 and 4.
    pub fn pyramid(&self, raw: &RawFrame<'_>) -> PreviewPyramid {
        PreviewPyramid {
            full: demosaic_grey(raw, 1),
            half: demosaic_grey(raw, 2),
            quarter: demosaic_grey(raw, 4),
        }
    }

    pub fn color(&self, raw: &RawFrame<'_>, step: u32) -> ColorFrame {
        demosaic_color(raw, step, self.gains)
    }

    /// Recompute gains from `raw`. Keeps the old gains on a degenerate frame
    /// and returns whether they changed.
    pub fn update_white_balance(&mut self, raw: &RawFrame<'_>) -> bool {
        match compute_white_balance(raw) {
            Some(gains) => {
                log::debug!(
                    "white balance: red {} blue {} (was {} {})",
                    gains.red,
                    gains.blue,
                    self.gains.red,
                    self.gains.blue
                );
                let changed = gains != self.gains;
                self.gains = gains;
                changed
            }
            None => {
                log::debug!("white balance: degenerate frame, gains unchanged");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::BayerPattern;

    /// Raw frame where every site of the given colour has the given value.
    fn mosaic(width: u32, height: u32, pattern: BayerPattern, rgb: [u8; 3]) -> Vec<u8> {
        let mut data = vec![0u8; (width * height) as usize];
        let sites = [
            (pattern.red(), rgb[0]),
            (pattern.blue(), rgb[2]),
        ];
        for y in (0..height as usize).step_by(2) {
            for x in (0..width as usize).step_by(2) {
                for dy in 0..2 {
                    for dx in 0..2 {
                        data[(y + dy) * width as usize + x + dx] = rgb[1];
                    }
                }
                for (site, value) in sites {
                    data[(y + site.dy) * width as usize + x + site.dx] = value;
                }
            }
        }
        data
    }

    #[test]
    fn uniform_frame_stays_uniform_at_every_step() -> anyhow::Result<()> {
        let data = vec![117u8; 64 * 48];
        let raw = RawFrame::new(&data, 64, 48, 64, BayerPattern::Grbg)?;
        for step in [1, 2, 4, 8] {
            let grey = demosaic_grey(&raw, step);
            assert_eq!(grey.width, 64 / (2 * step));
            assert_eq!(grey.height, 48 / (2 * step));
            assert!(grey.data.iter().all(|&v| v == 117), "step {}", step);
        }
        Ok(())
    }

    #[test]
    fn grey_samples_the_green_site() -> anyhow::Result<()> {
        let data = mosaic(8, 8, BayerPattern::Rggb, [10, 200, 30]);
        let raw = RawFrame::new(&data, 8, 8, 8, BayerPattern::Rggb)?;
        let grey = demosaic_grey(&raw, 1);
        assert_eq!(grey.data, vec![200u8; 16]);
        Ok(())
    }

    #[test]
    fn color_applies_gains_with_saturation() -> anyhow::Result<()> {
        let data = mosaic(8, 8, BayerPattern::Bggr, [100, 80, 200]);
        let raw = RawFrame::new(&data, 8, 8, 8, BayerPattern::Bggr)?;
        let gains = ColorGains {
            red: 512,
            blue: 512,
        };
        let color = demosaic_color(&raw, 1, gains);
        assert_eq!(color.rgb(0, 0), [200, 80, 255]);
        assert_eq!(demosaic_color(&raw, 1, ColorGains::default()).rgb(3, 3), [100, 80, 200]);
        Ok(())
    }

    #[test]
    fn equal_channel_sums_give_neutral_gains() -> anyhow::Result<()> {
        let data = vec![90u8; 128 * 96];
        let raw = RawFrame::new(&data, 128, 96, 128, BayerPattern::Bggr)?;
        let gains = compute_white_balance(&raw).expect("non-degenerate");
        assert_eq!(gains, ColorGains { red: 256, blue: 256 });
        Ok(())
    }

    #[test]
    fn white_balance_corrects_a_blue_cast() -> anyhow::Result<()> {
        let data = mosaic(128, 96, BayerPattern::Bggr, [50, 100, 200]);
        let raw = RawFrame::new(&data, 128, 96, 128, BayerPattern::Bggr)?;
        let gains = compute_white_balance(&raw).expect("non-degenerate");
        assert_eq!(gains, ColorGains { red: 512, blue: 128 });

        let mut pipeline = BayerPipeline::new();
        assert!(pipeline.update_white_balance(&raw));
        assert_eq!(pipeline.color(&raw, 1).rgb(1, 1), [100, 100, 100]);
        Ok(())
    }

    #[test]
    fn black_frame_leaves_gains_unchanged() -> anyhow::Result<()> {
        let data = mosaic(64, 64, BayerPattern::Rggb, [0, 120, 0]);
        let raw = RawFrame::new(&data, 64, 64, 64, BayerPattern::Rggb)?;
        assert!(compute_white_balance(&raw).is_none());

        let mut pipeline = BayerPipeline::new();
        assert!(!pipeline.update_white_balance(&raw));
        assert_eq!(pipeline.gains(), ColorGains::default());
        Ok(())
    }

    #[test]
    fn missing_green_leaves_gains_unchanged() -> anyhow::Result<()> {
        let data = mosaic(64, 64, BayerPattern::Bggr, [100, 0, 100]);
        let raw = RawFrame::new(&data, 64, 64, 64, BayerPattern::Bggr)?;
        assert!(compute_white_balance(&raw).is_none());

        let mut pipeline = BayerPipeline::new();
        assert!(!pipeline.update_white_balance(&raw));
        assert_eq!(pipeline.color(&raw, 1).rgb(0, 0), [100, 0, 100]);
        Ok(())
    }

    #[test]
    fn pyramid_halves_each_level() -> anyhow::Result<()> {
        let data = vec![33u8; 640 * 480];
        let raw = RawFrame::new(&data, 640, 480, 640, BayerPattern::Bggr)?;
        let pyramid = BayerPipeline::new().pyramid(&raw);
        assert_eq!((pyramid.full.width, pyramid.full.height), (320, 240));
        assert_eq!((pyramid.half.width, pyramid.half.height), (160, 120));
        assert_eq!((pyramid.quarter.width, pyramid.quarter.height), (80, 60));
        Ok(())
    }
}
