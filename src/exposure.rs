//! Exposure controller.
//!
//! Bisection over the sensor's exposure register. Each frame's brightness
//! moves one of the search bounds to the current exposure, and the next
//! exposure is the midpoint. The search is over once the bounds are within
//! `convergence_width` of each other.

use crate::frame::GreyFrame;

pub const DEFAULT_TARGET_BRIGHTNESS: u32 = 150;
pub const DEFAULT_EXPOSURE_MIN: i32 = 0;
pub const DEFAULT_EXPOSURE_MAX: i32 = 1024;
pub const DEFAULT_CONVERGENCE_WIDTH: i32 = 10;

/// Share of pixels (from the bright end) left out of the average.
const BRIGHT_FRACTION: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExposureSettings {
    pub min: i32,
    pub max: i32,
    pub target: u32,
    pub convergence_width: i32,
}

impl Default for ExposureSettings {
    fn default() -> Self {
        Self {
            min: DEFAULT_EXPOSURE_MIN,
            max: DEFAULT_EXPOSURE_MAX,
            target: DEFAULT_TARGET_BRIGHTNESS,
            convergence_width: DEFAULT_CONVERGENCE_WIDTH,
        }
    }
}

/// Search state. Persists across frames until `recalibrate`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExposureState {
    pub exposure: i32,
    pub lower: i32,
    pub upper: i32,
    pub target: u32,
    pub converged: bool,
}

/// Outcome of one controller cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExposureStep {
    /// New exposure to write to the sensor.
    Adjusted { exposure: i32, brightness: u32 },
    /// Bounds are within the convergence width; exposure unchanged.
    Converged { exposure: i32 },
    /// No pixels contributed to the average; retry next frame.
    Degenerate,
}

/// Brightness of a frame with the brightest tenth of pixels left out.
///
/// Returns `None` when no pixel contributes.
pub fn scene_brightness(frame: &GreyFrame) -> Option<u32> {
    let mut histogram = [0usize; 256];
    for &v in &frame.data {
        histogram[v as usize] += 1;
    }

    let budget = frame.pixel_count() / BRIGHT_FRACTION;
    let mut cumulative = 0usize;
    let mut threshold = 0usize;
    for level in (0..256).rev() {
        cumulative += histogram[level];
        if cumulative >= budget {
            threshold = level;
            break;
        }
    }

    // The threshold bin only keeps what is left over after the bright budget.
    let at_threshold = cumulative - budget;
    let mut weighted = threshold * at_threshold;
    let mut count = at_threshold;
    for (level, &n) in histogram.iter().enumerate().take(threshold) {
        weighted += level * n;
        count += n;
    }
    if count == 0 {
        return None;
    }
    Some((weighted / count) as u32)
}

#[derive(Debug)]
pub struct ExposureController {
    settings: ExposureSettings,
    state: ExposureState,
}

impl ExposureController {
    pub fn new(settings: ExposureSettings) -> Self {
        Self {
            state: Self::fresh_state(&settings),
            settings,
        }
    }

    fn fresh_state(settings: &ExposureSettings) -> ExposureState {
        ExposureState {
            exposure: settings.min + (settings.max - settings.min) / 2,
            lower: settings.min,
            upper: settings.max,
            target: settings.target,
            converged: settings.max - settings.min <= settings.convergence_width,
        }
    }

    pub fn state(&self) -> ExposureState {
        self.state
    }

    pub fn exposure(&self) -> i32 {
        self.state.exposure
    }

    pub fn is_converged(&self) -> bool {
        self.state.converged
    }

    /// Restart the search over the full configured range.
    pub fn recalibrate(&mut self) {
        self.state = Self::fresh_state(&self.settings);
        log::info!(
            "exposure: recalibrating over [{}, {}]",
            self.state.lower,
            self.state.upper
        );
    }

    /// One bisection step from the brightness of `frame`.
    pub fn update(&mut self, frame: &GreyFrame) -> ExposureStep {
        if self.state.converged {
            return ExposureStep::Converged {
                exposure: self.state.exposure,
            };
        }
        let Some(brightness) = scene_brightness(frame) else {
            log::debug!("exposure: empty histogram, retrying next frame");
            return ExposureStep::Degenerate;
        };
        self.step(brightness)
    }

    fn step(&mut self, brightness: u32) -> ExposureStep {
        let state = &mut self.state;
        match brightness.cmp(&state.target) {
            std::cmp::Ordering::Less => state.lower = state.exposure,
            std::cmp::Ordering::Greater => state.upper = state.exposure,
            std::cmp::Ordering::Equal => {
                state.lower = state.exposure;
                state.upper = state.exposure;
            }
        }
        state.exposure = state.lower + (state.upper - state.lower) / 2;

        if state.upper - state.lower <= self.settings.convergence_width {
            state.converged = true;
            log::info!(
                "exposure: converged at {} (brightness {})",
                state.exposure,
                brightness
            );
        }
        log::debug!(
            "exposure: brightness {} -> exposure {} in [{}, {}]",
            brightness,
            state.exposure,
            state.lower,
            state.upper
        );
        ExposureStep::Adjusted {
            exposure: state.exposure,
            brightness,
        }
    }

    /// Manual offset, clamped to the configured range. Does not restart the
    /// search.
    pub fn nudge(&mut self, delta: i32) -> i32 {
        self.state.exposure = self
            .state
            .exposure
            .saturating_add(delta)
            .clamp(self.settings.min, self.settings.max);
        self.state.exposure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(value: u8) -> GreyFrame {
        GreyFrame::from_vec(80, 60, vec![value; 80 * 60]).expect("frame")
    }

    #[test]
    fn brightness_ignores_the_brightest_tenth() {
        // 90% at 100, 10% at 250 (a specular highlight)
        let mut data = vec![100u8; 90];
        data.extend(vec![250u8; 10]);
        let frame = GreyFrame::from_vec(10, 10, data).expect("frame");
        assert_eq!(scene_brightness(&frame), Some(100));
        assert_eq!(scene_brightness(&flat(40)), Some(40));
    }

    #[test]
    fn empty_frame_is_degenerate() {
        let mut controller = ExposureController::new(ExposureSettings::default());
        let before = controller.state();
        assert_eq!(
            controller.update(&GreyFrame::new(0, 0)),
            ExposureStep::Degenerate
        );
        assert_eq!(controller.state(), before);
    }

    #[test]
    fn bound_width_halves_every_iteration() {
        let settings = ExposureSettings::default();
        let mut controller = ExposureController::new(settings);
        let initial = (settings.max - settings.min) as f64;
        let mut k = 0;
        // alternate dark and bright frames
        while !controller.is_converged() {
            let frame = if k % 2 == 0 { flat(40) } else { flat(220) };
            controller.update(&frame);
            k += 1;
            let state = controller.state();
            let width = (state.upper - state.lower) as f64;
            assert!(width <= initial / 2f64.powi(k), "iteration {}", k);
        }
        assert!(k <= 7);
    }

    #[test]
    fn converged_controller_stops_moving() {
        let mut controller = ExposureController::new(ExposureSettings::default());
        while !controller.is_converged() {
            controller.update(&flat(40));
        }
        let exposure = controller.exposure();
        for value in [0, 40, 150, 255] {
            assert_eq!(
                controller.update(&flat(value)),
                ExposureStep::Converged { exposure }
            );
        }
        assert_eq!(controller.exposure(), exposure);
    }

    #[test]
    fn dark_scene_raises_exposure_monotonically() {
        let mut controller = ExposureController::new(ExposureSettings::default());
        let mut last = controller.exposure();
        for _ in 0..10 {
            if let ExposureStep::Adjusted { exposure, brightness } = controller.update(&flat(40)) {
                assert_eq!(brightness, 40);
                assert!(exposure >= last);
                last = exposure;
            }
        }
        assert!(controller.is_converged());
        assert!(last > DEFAULT_EXPOSURE_MAX - 2 * DEFAULT_CONVERGENCE_WIDTH);
    }

    #[test]
    fn on_target_brightness_collapses_the_bounds() {
        let mut controller = ExposureController::new(ExposureSettings::default());
        let step = controller.update(&flat(150));
        assert_eq!(
            step,
            ExposureStep::Adjusted {
                exposure: 512,
                brightness: 150
            }
        );
        assert!(controller.is_converged());
    }

    #[test]
    fn recalibrate_and_nudge() {
        let mut controller = ExposureController::new(ExposureSettings::default());
        controller.update(&flat(40));
        controller.recalibrate();
        assert_eq!(controller.state().lower, DEFAULT_EXPOSURE_MIN);
        assert_eq!(controller.state().upper, DEFAULT_EXPOSURE_MAX);
        assert!(!controller.is_converged());
        assert_eq!(controller.nudge(10_000), DEFAULT_EXPOSURE_MAX);
        assert_eq!(controller.nudge(-2_000), DEFAULT_EXPOSURE_MIN);
    }
}
