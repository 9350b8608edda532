use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::camera::{
    CameraSettings, DEFAULT_FLASH_DURATION, DEFAULT_FLASH_EXPOSURE, DEFAULT_FLASH_GAIN,
    DEFAULT_MAX_CONSECUTIVE_FAILURES, DEFAULT_PREVIEW_EVERY, DEFAULT_SETTLE_DELAY,
};
use crate::exposure::ExposureSettings;
use crate::motion::MotionSettings;
use crate::pool::{ModeSize, ModeTable};
use crate::state::StateSettings;
use crate::target::TargetSettings;

const DEFAULT_DEVICE: &str = "stub://sensor";
const DEFAULT_ILLUMINATION: &str = "stub://led";

#[derive(Debug, Deserialize, Default)]
struct ReaderConfigFile {
    device: Option<String>,
    illumination: Option<String>,
    preview: Option<ModeConfigFile>,
    full: Option<ModeConfigFile>,
    exposure: Option<ExposureConfigFile>,
    motion: Option<MotionConfigFile>,
    gestures: Option<GestureConfigFile>,
    snapshot: Option<SnapshotConfigFile>,
    target: Option<TargetConfigFile>,
    preview_every: Option<u32>,
    color_preview: Option<bool>,
    max_consecutive_failures: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ModeConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    buffers: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct ExposureConfigFile {
    min: Option<i32>,
    max: Option<i32>,
    target: Option<u32>,
    convergence_width: Option<i32>,
}

#[derive(Debug, Deserialize, Default)]
struct MotionConfigFile {
    global_budget: Option<usize>,
    region_budget: Option<usize>,
    scale: Option<f32>,
    min_points: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct GestureConfigFile {
    threshold: Option<f32>,
    stability_threshold: Option<f32>,
    stable_frames: Option<u32>,
    cooldown: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct SnapshotConfigFile {
    settle_ms: Option<u64>,
    flash_ms: Option<u64>,
    flash_exposure: Option<i32>,
    flash_gain: Option<i32>,
}

#[derive(Debug, Deserialize, Default)]
struct TargetConfigFile {
    min_contrast: Option<f32>,
    max_change: Option<f32>,
    stable_frames: Option<u32>,
}

/// Everything `readerd` needs to build a camera.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Capture device; `stub://...` selects the simulated sensor.
    pub device: String,
    /// LED directory under /sys/class/leds, or `stub://...`.
    pub illumination: String,
    pub modes: ModeTable,
    pub camera: CameraSettings,
    pub target: TargetSettings,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self::from_file(ReaderConfigFile::default())
    }
}

impl ReaderConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("READER_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ReaderConfigFile) -> Self {
        let defaults = ModeTable::default();
        let modes = ModeTable {
            preview: mode_size(file.preview.as_ref(), defaults.preview),
            full: mode_size(file.full.as_ref(), defaults.full),
        };

        let exposure_file = file.exposure.unwrap_or_default();
        let exposure_defaults = ExposureSettings::default();
        let exposure = ExposureSettings {
            min: exposure_file.min.unwrap_or(exposure_defaults.min),
            max: exposure_file.max.unwrap_or(exposure_defaults.max),
            target: exposure_file.target.unwrap_or(exposure_defaults.target),
            convergence_width: exposure_file
                .convergence_width
                .unwrap_or(exposure_defaults.convergence_width),
        };

        let motion_file = file.motion.unwrap_or_default();
        let motion_defaults = MotionSettings::default();
        let motion = MotionSettings {
            global_budget: motion_file
                .global_budget
                .unwrap_or(motion_defaults.global_budget),
            region_budget: motion_file
                .region_budget
                .unwrap_or(motion_defaults.region_budget),
            scale: motion_file.scale.unwrap_or(motion_defaults.scale),
            min_points: motion_file.min_points.unwrap_or(motion_defaults.min_points),
        };

        let gestures = file.gestures.unwrap_or_default();
        let state_defaults = StateSettings::default();
        let state = StateSettings {
            gesture_threshold: gestures
                .threshold
                .unwrap_or(state_defaults.gesture_threshold),
            stability_threshold: gestures
                .stability_threshold
                .unwrap_or(state_defaults.stability_threshold),
            stable_frames: gestures
                .stable_frames
                .unwrap_or(state_defaults.stable_frames),
            gesture_cooldown: gestures.cooldown.unwrap_or(state_defaults.gesture_cooldown),
        };

        let snapshot = file.snapshot.unwrap_or_default();
        let camera = CameraSettings {
            exposure,
            motion,
            state,
            settle_delay: snapshot
                .settle_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_SETTLE_DELAY),
            flash_duration: snapshot
                .flash_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_FLASH_DURATION),
            flash_exposure: snapshot.flash_exposure.unwrap_or(DEFAULT_FLASH_EXPOSURE),
            flash_gain: snapshot.flash_gain.unwrap_or(DEFAULT_FLASH_GAIN),
            max_consecutive_failures: file
                .max_consecutive_failures
                .unwrap_or(DEFAULT_MAX_CONSECUTIVE_FAILURES),
            preview_every: file.preview_every.unwrap_or(DEFAULT_PREVIEW_EVERY),
            color_preview: file.color_preview.unwrap_or(false),
        };

        let target_file = file.target.unwrap_or_default();
        let target_defaults = TargetSettings::default();
        let target = TargetSettings {
            min_contrast: target_file
                .min_contrast
                .unwrap_or(target_defaults.min_contrast),
            max_change: target_file.max_change.unwrap_or(target_defaults.max_change),
            stable_frames: target_file
                .stable_frames
                .unwrap_or(target_defaults.stable_frames),
        };

        Self {
            device: file.device.unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
            illumination: file
                .illumination
                .unwrap_or_else(|| DEFAULT_ILLUMINATION.to_string()),
            modes,
            camera,
            target,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device) = std::env::var("READER_DEVICE") {
            if !device.trim().is_empty() {
                self.device = device;
            }
        }
        if let Ok(led) = std::env::var("READER_ILLUMINATION") {
            if !led.trim().is_empty() {
                self.illumination = led;
            }
        }
        if let Ok(every) = std::env::var("READER_PREVIEW_EVERY") {
            self.camera.preview_every = every
                .parse()
                .map_err(|_| anyhow!("READER_PREVIEW_EVERY must be a frame count"))?;
        }
        if let Ok(color) = std::env::var("READER_COLOR_PREVIEW") {
            self.camera.color_preview = parse_bool(&color)
                .ok_or_else(|| anyhow!("READER_COLOR_PREVIEW must be true or false"))?;
        }
        if let Ok(settle) = std::env::var("READER_SETTLE_MS") {
            let millis: u64 = settle
                .parse()
                .map_err(|_| anyhow!("READER_SETTLE_MS must be an integer number of milliseconds"))?;
            self.camera.settle_delay = Duration::from_millis(millis);
        }
        if let Ok(target) = std::env::var("READER_TARGET_BRIGHTNESS") {
            self.camera.exposure.target = target
                .parse()
                .map_err(|_| anyhow!("READER_TARGET_BRIGHTNESS must be an integer"))?;
        }
        if let Ok(max) = std::env::var("READER_MAX_FAILURES") {
            self.camera.max_consecutive_failures = max
                .parse()
                .map_err(|_| anyhow!("READER_MAX_FAILURES must be an integer"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        for (name, mode) in [("preview", self.modes.preview), ("full", self.modes.full)] {
            if mode.width < 2 || mode.height < 2 {
                return Err(anyhow!("{} size {}x{} is too small", name, mode.width, mode.height));
            }
            if mode.buffers == 0 {
                return Err(anyhow!("{} needs at least one buffer", name));
            }
        }

        let exposure = &self.camera.exposure;
        if exposure.min >= exposure.max {
            return Err(anyhow!(
                "exposure range [{}, {}] is empty",
                exposure.min,
                exposure.max
            ));
        }
        if exposure.target == 0 || exposure.target > 255 {
            return Err(anyhow!("target brightness must be within 1..=255"));
        }
        if exposure.convergence_width <= 0 {
            return Err(anyhow!("convergence width must be greater than zero"));
        }
        if !(exposure.min..=exposure.max).contains(&self.camera.flash_exposure) {
            return Err(anyhow!(
                "flash exposure {} outside [{}, {}]",
                self.camera.flash_exposure,
                exposure.min,
                exposure.max
            ));
        }

        let motion = &self.camera.motion;
        if motion.global_budget == 0 || motion.region_budget == 0 {
            return Err(anyhow!("motion point budgets must be greater than zero"));
        }
        if motion.scale <= 0.0 {
            return Err(anyhow!("motion scale must be positive"));
        }

        let state = &self.camera.state;
        if state.stability_threshold >= state.gesture_threshold {
            return Err(anyhow!(
                "stability threshold {} must be below gesture threshold {}",
                state.stability_threshold,
                state.gesture_threshold
            ));
        }
        if state.stable_frames == 0 || self.target.stable_frames == 0 {
            return Err(anyhow!("stable frame counts must be greater than zero"));
        }
        if self.camera.max_consecutive_failures == 0 {
            return Err(anyhow!("max consecutive failures must be greater than zero"));
        }
        Ok(())
    }
}

fn mode_size(file: Option<&ModeConfigFile>, default: ModeSize) -> ModeSize {
    ModeSize {
        width: file.and_then(|m| m.width).unwrap_or(default.width),
        height: file.and_then(|m| m.height).unwrap_or(default.height),
        buffers: file.and_then(|m| m.buffers).unwrap_or(default.buffers),
    }
}

fn read_config_file(path: &Path) -> Result<ReaderConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() -> Result<()> {
        let cfg = ReaderConfig::default();
        cfg.validate()?;
        assert_eq!(cfg.device, DEFAULT_DEVICE);
        assert_eq!(cfg.modes, ModeTable::default());
        assert_eq!(cfg.camera, CameraSettings::default());
        assert_eq!(cfg.target, TargetSettings::default());
        Ok(())
    }

    #[test]
    fn rejects_inconsistent_thresholds() {
        let mut cfg = ReaderConfig::default();
        cfg.camera.state.stability_threshold = 100.0;
        assert!(cfg.validate().is_err());

        let mut cfg = ReaderConfig::default();
        cfg.camera.flash_exposure = 5000;
        assert!(cfg.validate().is_err());

        let mut cfg = ReaderConfig::default();
        cfg.modes.full.buffers = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_boolean_words() {
        assert_eq!(parse_bool(" Yes "), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
