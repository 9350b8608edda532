//! Simulated capture driver (`stub://` devices).
//!
//! Renders synthetic 8-bit Bayer frames into driver-owned buffers and keeps
//! the same queue discipline as a real mmap driver: only queued buffers are
//! filled, `dequeue` hands out the oldest one, and the caller must `enqueue`
//! it again. Tests steer the scene and inject faults through `SimHandle`.

use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::f32::consts::TAU;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{BayerPattern, CaptureDriver, CellSite, CaptureMode, Control, FrameFormat, ModeRequest};
use crate::error::CaptureError;

const TEXTURE_PERIOD_X: f32 = 160.0;
const TEXTURE_PERIOD_Y: f32 = 192.0;

/// What the simulated sensor is looking at.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SimScene {
    /// Every sample has this value, whatever the exposure.
    Fixed(u8),
    /// Brightness scales with exposure and analog gain:
    /// `base * exposure * gain / reference`, saturated at 255.
    Lit { base: u16, reference: i32 },
    /// Flat colour: every red, green and blue site has its own value,
    /// whatever the exposure.
    Tinted { red: u8, green: u8, blue: u8 },
    /// Smooth grey page texture. The origin moves by the drift (raw pixels)
    /// after each delivered frame.
    Textured {
        origin_x: i32,
        origin_y: i32,
        drift_x: i32,
        drift_y: i32,
    },
}

impl Default for SimScene {
    fn default() -> Self {
        SimScene::Lit {
            base: 60,
            reference: 256,
        }
    }
}

/// Static description of the simulated sensor.
#[derive(Clone, Debug)]
pub struct SimConfig {
    pub pattern: BayerPattern,
    /// Extra bytes at the end of every row.
    pub row_padding: u32,
    /// Largest buffer count the driver grants.
    pub max_buffers: usize,
    /// Amplitude of uniform sensor noise added to every sample.
    pub noise: u8,
    pub scene: SimScene,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            pattern: BayerPattern::Bggr,
            row_padding: 0,
            max_buffers: 8,
            noise: 0,
            scene: SimScene::default(),
        }
    }
}

#[derive(Debug)]
struct SimState {
    scene: SimScene,
    noise: u8,
    max_buffers: usize,
    fail_dequeues: u32,
    fail_controls: bool,
    fail_writes: u32,
    reject_format: bool,
    deliver_non_bayer: bool,
    duplicate_next: bool,
    streaming: bool,
    mode: Option<CaptureMode>,
    controls: HashMap<Control, i32>,
    exposure_writes: Vec<i32>,
    frames_delivered: u64,
    last_dequeued: Option<usize>,
}

/// Shared handle for steering and observing a `SimDriver` after it has been
/// moved into the capture loop.
#[derive(Clone, Debug)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_scene(&self, scene: SimScene) {
        self.lock().scene = scene;
    }

    pub fn scene(&self) -> SimScene {
        self.lock().scene
    }

    /// Change the per-frame drift of a textured scene.
    pub fn set_drift(&self, dx: i32, dy: i32) {
        let mut state = self.lock();
        if let SimScene::Textured {
            drift_x, drift_y, ..
        } = &mut state.scene
        {
            *drift_x = dx;
            *drift_y = dy;
        }
    }

    /// Make the next `count` dequeues fail.
    pub fn fail_dequeues(&self, count: u32) {
        self.lock().fail_dequeues = count;
    }

    pub fn fail_controls(&self, fail: bool) {
        self.lock().fail_controls = fail;
    }

    /// Make the next `count` control writes fail. Reads keep working.
    pub fn fail_control_writes(&self, count: u32) {
        self.lock().fail_writes = count;
    }

    pub fn reject_format(&self, reject: bool) {
        self.lock().reject_format = reject;
    }

    pub fn deliver_non_bayer(&self, non_bayer: bool) {
        self.lock().deliver_non_bayer = non_bayer;
    }

    pub fn set_max_buffers(&self, count: usize) {
        self.lock().max_buffers = count;
    }

    /// Misbehave once: the next dequeue returns the previously dequeued index
    /// again, whoever owns it.
    pub fn duplicate_next_dequeue(&self) {
        self.lock().duplicate_next = true;
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().streaming
    }

    pub fn mode(&self) -> Option<CaptureMode> {
        self.lock().mode
    }

    pub fn control(&self, control: Control) -> i32 {
        self.lock().controls.get(&control).copied().unwrap_or_default()
    }

    /// Every exposure value written through `set_control`, in order.
    pub fn exposure_writes(&self) -> Vec<i32> {
        self.lock().exposure_writes.clone()
    }

    pub fn frames_delivered(&self) -> u64 {
        self.lock().frames_delivered
    }
}

/// Simulated driver.
pub struct SimDriver {
    pattern: BayerPattern,
    row_padding: u32,
    format: Option<FrameFormat>,
    /// Driver-owned buffer memory.
    buffers: Vec<Vec<u8>>,
    mapped: Vec<bool>,
    queue: VecDeque<usize>,
    state: Arc<Mutex<SimState>>,
}

impl SimDriver {
    pub fn new(config: SimConfig) -> Self {
        let controls = HashMap::from([
            (Control::Exposure, 512),
            (Control::AnalogGain, 1),
            (Control::DigitalGain, 1),
        ]);
        let state = SimState {
            scene: config.scene,
            noise: config.noise,
            max_buffers: config.max_buffers,
            fail_dequeues: 0,
            fail_controls: false,
            fail_writes: 0,
            reject_format: false,
            deliver_non_bayer: false,
            duplicate_next: false,
            streaming: false,
            mode: None,
            controls,
            exposure_writes: Vec::new(),
            frames_delivered: 0,
            last_dequeued: None,
        };
        Self {
            pattern: config.pattern,
            row_padding: config.row_padding,
            format: None,
            buffers: Vec::new(),
            mapped: Vec::new(),
            queue: VecDeque::new(),
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn render(&mut self, index: usize) {
        let Some(format) = self.format else {
            return;
        };
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let exposure = state.controls.get(&Control::Exposure).copied().unwrap_or(0);
        let gain = state.controls.get(&Control::AnalogGain).copied().unwrap_or(1);
        let noise = state.noise;
        let scene = state.scene;
        let pattern = self.pattern;
        let buffer = &mut self.buffers[index];
        let stride = format.stride as usize;
        let mut rng = rand::thread_rng();

        for y in 0..format.height as usize {
            let row = &mut buffer[y * stride..y * stride + format.width as usize];
            for (x, sample) in row.iter_mut().enumerate() {
                let base = match scene {
                    SimScene::Fixed(value) => value as i32,
                    SimScene::Lit { base, reference } => {
                        let lit = base as i64 * exposure as i64 * gain.max(1) as i64
                            / reference.max(1) as i64;
                        lit.min(255) as i32
                    }
                    SimScene::Textured {
                        origin_x, origin_y, ..
                    } => texture(x as i32 - origin_x, y as i32 - origin_y),
                    SimScene::Tinted { red, green, blue } => {
                        let site = CellSite { dx: x % 2, dy: y % 2 };
                        if site == pattern.red() {
                            red as i32
                        } else if site == pattern.blue() {
                            blue as i32
                        } else {
                            green as i32
                        }
                    }
                };
                let jitter = if noise > 0 {
                    rng.gen_range(-(noise as i32)..=noise as i32)
                } else {
                    0
                };
                *sample = (base + jitter).clamp(0, 255) as u8;
            }
        }

        if let SimScene::Textured {
            origin_x,
            origin_y,
            drift_x,
            drift_y,
        } = scene
        {
            state.scene = SimScene::Textured {
                origin_x: origin_x + drift_x,
                origin_y: origin_y + drift_y,
                drift_x,
                drift_y,
            };
        }
        state.frames_delivered += 1;
    }
}

/// Grey page pattern sampled at raw pixel coordinates.
pub(crate) fn texture(x: i32, y: i32) -> i32 {
    let fx = (TAU * x as f32 / TEXTURE_PERIOD_X).sin();
    let fy = (TAU * y as f32 / TEXTURE_PERIOD_Y).sin();
    (128.0 + 60.0 * fx + 40.0 * fy).round() as i32
}

impl CaptureDriver for SimDriver {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn set_format(&mut self, request: &ModeRequest) -> Result<FrameFormat, CaptureError> {
        let mut state = self.lock();
        if state.streaming {
            return Err(CaptureError::Driver {
                mode: request.mode,
                reason: "format change while streaming".to_string(),
            });
        }
        if state.reject_format || request.width == 0 || request.height == 0 {
            return Err(CaptureError::Driver {
                mode: request.mode,
                reason: format!("unsupported size {}x{}", request.width, request.height),
            });
        }
        let pattern = if state.deliver_non_bayer {
            None
        } else {
            Some(self.pattern)
        };
        state.mode = Some(request.mode);
        drop(state);

        // Bayer cells are 2x2: round down to even dimensions.
        let width = request.width & !1;
        let height = request.height & !1;
        let format = FrameFormat {
            width,
            height,
            stride: width + self.row_padding,
            pattern,
        };
        self.format = Some(format);
        Ok(format)
    }

    fn request_buffers(&mut self, count: usize) -> Result<usize, CaptureError> {
        let format = self.format.ok_or(CaptureError::NotConfigured)?;
        let granted = count.min(self.lock().max_buffers);
        let len = format.stride as usize * format.height as usize;
        self.buffers = (0..granted).map(|_| vec![0u8; len]).collect();
        self.mapped = vec![false; granted];
        self.queue.clear();
        Ok(granted)
    }

    fn map_buffer(&mut self, index: usize) -> Result<usize, CaptureError> {
        let len = self
            .buffers
            .get(index)
            .map(Vec::len)
            .ok_or_else(|| CaptureError::Driver {
                mode: self.lock().mode.unwrap_or(CaptureMode::Preview),
                reason: format!("no buffer {} to map", index),
            })?;
        self.mapped[index] = true;
        Ok(len)
    }

    fn release_buffers(&mut self) -> Result<(), CaptureError> {
        self.buffers.clear();
        self.mapped.clear();
        self.queue.clear();
        Ok(())
    }

    fn start_streaming(&mut self) -> Result<(), CaptureError> {
        if self.buffers.is_empty() {
            return Err(CaptureError::NotConfigured);
        }
        self.lock().streaming = true;
        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<(), CaptureError> {
        self.lock().streaming = false;
        Ok(())
    }

    fn enqueue(&mut self, index: usize) -> Result<(), CaptureError> {
        if index >= self.buffers.len() || self.queue.contains(&index) {
            return Err(CaptureError::Enqueue {
                index,
                reason: "buffer is not dequeued".to_string(),
            });
        }
        self.queue.push_back(index);
        Ok(())
    }

    fn dequeue(&mut self) -> Result<usize, CaptureError> {
        {
            let mut state = self.lock();
            if !state.streaming {
                return Err(CaptureError::Dequeue("stream is off".to_string()));
            }
            if state.fail_dequeues > 0 {
                state.fail_dequeues -= 1;
                return Err(CaptureError::Dequeue("sensor timeout".to_string()));
            }
            if state.duplicate_next {
                state.duplicate_next = false;
                if let Some(index) = state.last_dequeued {
                    return Ok(index);
                }
            }
        }
        let index = self
            .queue
            .pop_front()
            .ok_or_else(|| CaptureError::Dequeue("no buffers queued".to_string()))?;
        self.render(index);
        self.lock().last_dequeued = Some(index);
        Ok(index)
    }

    fn buffer(&self, index: usize) -> Option<&[u8]> {
        match self.mapped.get(index) {
            Some(true) => self.buffers.get(index).map(Vec::as_slice),
            _ => None,
        }
    }

    fn control(&self, control: Control) -> Result<i32, CaptureError> {
        let state = self.lock();
        if state.fail_controls {
            return Err(CaptureError::Control {
                control,
                reason: "i2c write failed".to_string(),
            });
        }
        Ok(state.controls.get(&control).copied().unwrap_or_default())
    }

    fn set_control(&mut self, control: Control, value: i32) -> Result<(), CaptureError> {
        let mut state = self.lock();
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(CaptureError::Control {
                control,
                reason: "i2c write failed".to_string(),
            });
        }
        if state.fail_controls {
            return Err(CaptureError::Control {
                control,
                reason: "i2c write failed".to_string(),
            });
        }
        state.controls.insert(control, value);
        if control == Control::Exposure {
            state.exposure_writes.push(value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preview_request() -> ModeRequest {
        ModeRequest {
            mode: CaptureMode::Preview,
            width: 64,
            height: 48,
            buffers: 4,
        }
    }

    #[test]
    fn fills_only_queued_buffers_in_order() -> anyhow::Result<()> {
        let mut driver = SimDriver::new(SimConfig {
            scene: SimScene::Fixed(77),
            ..SimConfig::default()
        });
        driver.set_format(&preview_request())?;
        assert_eq!(driver.request_buffers(3)?, 3);
        for index in 0..3 {
            driver.map_buffer(index)?;
            driver.enqueue(index)?;
        }
        driver.start_streaming()?;

        assert_eq!(driver.dequeue()?, 0);
        assert_eq!(driver.dequeue()?, 1);
        driver.enqueue(0)?;
        assert_eq!(driver.dequeue()?, 2);
        assert_eq!(driver.dequeue()?, 0);
        assert!(driver.dequeue().is_err());

        let bytes = driver.buffer(0).expect("mapped");
        assert!(bytes.iter().all(|&b| b == 77));
        Ok(())
    }

    #[test]
    fn lit_scene_follows_exposure() -> anyhow::Result<()> {
        let mut driver = SimDriver::new(SimConfig::default());
        driver.set_format(&preview_request())?;
        driver.request_buffers(1)?;
        driver.map_buffer(0)?;
        driver.enqueue(0)?;
        driver.start_streaming()?;

        driver.set_control(Control::Exposure, 256)?;
        let index = driver.dequeue()?;
        assert_eq!(driver.buffer(index).expect("mapped")[0], 60);

        driver.enqueue(index)?;
        driver.set_control(Control::Exposure, 512)?;
        let index = driver.dequeue()?;
        assert_eq!(driver.buffer(index).expect("mapped")[0], 120);
        assert_eq!(driver.handle().exposure_writes(), vec![256, 512]);
        Ok(())
    }

    #[test]
    fn textured_scene_drifts_between_frames() -> anyhow::Result<()> {
        let mut driver = SimDriver::new(SimConfig {
            scene: SimScene::Textured {
                origin_x: 0,
                origin_y: 0,
                drift_x: 8,
                drift_y: 0,
            },
            ..SimConfig::default()
        });
        driver.set_format(&preview_request())?;
        driver.request_buffers(2)?;
        for index in 0..2 {
            driver.map_buffer(index)?;
            driver.enqueue(index)?;
        }
        driver.start_streaming()?;
        let first = driver.dequeue()?;
        let second = driver.dequeue()?;
        let a = driver.buffer(first).expect("mapped");
        let b = driver.buffer(second).expect("mapped");
        // second frame is the first one moved right by 8 samples
        assert_eq!(b[8 + 10], a[10]);
        Ok(())
    }

    #[test]
    fn tinted_scene_fills_each_site() -> anyhow::Result<()> {
        let mut driver = SimDriver::new(SimConfig {
            pattern: BayerPattern::Rggb,
            scene: SimScene::Tinted {
                red: 10,
                green: 20,
                blue: 30,
            },
            ..SimConfig::default()
        });
        driver.set_format(&preview_request())?;
        driver.request_buffers(1)?;
        driver.map_buffer(0)?;
        driver.enqueue(0)?;
        driver.start_streaming()?;
        let index = driver.dequeue()?;
        let bytes = driver.buffer(index).expect("mapped");
        assert_eq!(&bytes[..2], &[10, 20]);
        assert_eq!(&bytes[64..66], &[20, 30]);
        Ok(())
    }

    #[test]
    fn counted_write_failures_recover() -> anyhow::Result<()> {
        let mut driver = SimDriver::new(SimConfig::default());
        driver.handle().fail_control_writes(1);
        assert!(driver.set_control(Control::Exposure, 100).is_err());
        assert_eq!(driver.control(Control::Exposure)?, 512);
        driver.set_control(Control::Exposure, 100)?;
        assert_eq!(driver.handle().exposure_writes(), vec![100]);
        Ok(())
    }

    #[test]
    fn unmapped_buffers_are_not_readable() -> anyhow::Result<()> {
        let mut driver = SimDriver::new(SimConfig::default());
        driver.set_format(&preview_request())?;
        driver.request_buffers(2)?;
        driver.map_buffer(0)?;
        assert!(driver.buffer(0).is_some());
        assert!(driver.buffer(1).is_none());
        Ok(())
    }
}
