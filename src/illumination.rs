//! Page illumination.
//!
//! `SysfsLed` drives a Linux LED class device through its `brightness` file.
//! `SimLed` only records what it was asked to do.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub trait Illumination: Send {
    fn name(&self) -> &'static str;

    fn set(&mut self, on: bool) -> Result<()>;

    /// Switch on now and off again once `duration` has elapsed. Does not block.
    fn pulse(&mut self, duration: Duration) -> Result<()>;
}

/// Pick a backend from a device string: `stub://...` gives a `SimLed`,
/// anything else is taken as a sysfs LED directory.
pub fn open_illumination(device: &str) -> Result<Box<dyn Illumination>> {
    if device.starts_with("stub://") {
        return Ok(Box::new(SimLed::new()));
    }
    Ok(Box::new(SysfsLed::open(device)?))
}

// ----------------------------------------------------------------------------
// sysfs
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct SysfsLed {
    brightness: PathBuf,
    max_brightness: u32,
}

impl SysfsLed {
    /// `dir` is the LED directory, e.g. `/sys/class/leds/white:flash`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let max_path = dir.join("max_brightness");
        let max_brightness = std::fs::read_to_string(&max_path)
            .with_context(|| format!("read {}", max_path.display()))?
            .trim()
            .parse::<u32>()
            .with_context(|| format!("parse {}", max_path.display()))?;
        if max_brightness == 0 {
            anyhow::bail!("{} reports max_brightness 0", dir.display());
        }
        let led = Self {
            brightness: dir.join("brightness"),
            max_brightness,
        };
        log::info!(
            "SysfsLed: using {} (max brightness {})",
            dir.display(),
            max_brightness
        );
        Ok(led)
    }

    fn write(path: &Path, value: u32) -> Result<()> {
        std::fs::write(path, value.to_string())
            .with_context(|| format!("write {}", path.display()))
    }
}

impl Illumination for SysfsLed {
    fn name(&self) -> &'static str {
        "sysfs"
    }

    fn set(&mut self, on: bool) -> Result<()> {
        let value = if on { self.max_brightness } else { 0 };
        Self::write(&self.brightness, value)
    }

    fn pulse(&mut self, duration: Duration) -> Result<()> {
        self.set(true)?;
        let path = self.brightness.clone();
        std::thread::Builder::new()
            .name("led-pulse".to_string())
            .spawn(move || {
                std::thread::sleep(duration);
                if let Err(err) = Self::write(&path, 0) {
                    log::warn!("SysfsLed: pulse off failed: {:#}", err);
                }
            })
            .context("spawn led pulse thread")?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// simulated
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LedTransition {
    On,
    Off,
    Pulse(Duration),
}

/// Records transitions into a shared log readable through `transitions()`
/// after the LED has been boxed into the camera.
#[derive(Clone, Debug, Default)]
pub struct SimLed {
    log: Arc<Mutex<Vec<LedTransition>>>,
}

impl SimLed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transitions(&self) -> Vec<LedTransition> {
        self.log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record(&self, transition: LedTransition) {
        self.log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(transition);
    }
}

impl Illumination for SimLed {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn set(&mut self, on: bool) -> Result<()> {
        self.record(if on {
            LedTransition::On
        } else {
            LedTransition::Off
        });
        Ok(())
    }

    fn pulse(&mut self, duration: Duration) -> Result<()> {
        self.record(LedTransition::Pulse(duration));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_led_shares_its_log() -> Result<()> {
        let led = SimLed::new();
        let mut boxed: Box<dyn Illumination> = Box::new(led.clone());
        boxed.set(true)?;
        boxed.pulse(Duration::from_millis(5))?;
        boxed.set(false)?;
        assert_eq!(
            led.transitions(),
            vec![
                LedTransition::On,
                LedTransition::Pulse(Duration::from_millis(5)),
                LedTransition::Off
            ]
        );
        Ok(())
    }

    #[test]
    fn sysfs_led_writes_brightness() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("max_brightness"), "255\n")?;
        std::fs::write(dir.path().join("brightness"), "0\n")?;

        let mut led = SysfsLed::open(dir.path())?;
        led.set(true)?;
        assert_eq!(std::fs::read_to_string(dir.path().join("brightness"))?, "255");
        led.set(false)?;
        assert_eq!(std::fs::read_to_string(dir.path().join("brightness"))?, "0");
        Ok(())
    }

    #[test]
    fn sysfs_led_pulse_switches_off_later() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("max_brightness"), "7")?;
        let mut led = SysfsLed::open(dir.path())?;
        led.pulse(Duration::from_millis(20))?;
        assert_eq!(std::fs::read_to_string(dir.path().join("brightness"))?, "7");

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::fs::read_to_string(dir.path().join("brightness"))? != "0" {
            assert!(std::time::Instant::now() < deadline, "pulse never ended");
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }

    #[test]
    fn missing_led_directory_is_an_error() {
        assert!(SysfsLed::open("/nonexistent/leds/none").is_err());
        assert!(open_illumination("stub://led").is_ok());
    }
}
