//! Capture driver control surface.
//!
//! The core never talks to a sensor directly. Everything it needs from the
//! capture driver goes through `CaptureDriver`:
//! - format negotiation per `CaptureMode`
//! - buffer request / map / release
//! - stream start / stop
//! - dequeue / enqueue of buffer indices
//! - exposure and gain registers
//!
//! Device paths starting with `stub://` open the simulated driver. Real
//! devices are served by libv4l (feature: device-v4l2).

use anyhow::Result;

use crate::error::CaptureError;

pub mod sim;
#[cfg(feature = "device-v4l2")]
pub mod v4l2;

pub use sim::{SimConfig, SimDriver, SimHandle, SimScene};
#[cfg(feature = "device-v4l2")]
pub use v4l2::V4l2Driver;

/// Sensor mode. Changing it tears down and rebuilds the buffer pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CaptureMode {
    Preview,
    FullResolution,
}

/// 2x2 color filter layout, named by the top-left row then the second row.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BayerPattern {
    Rggb,
    #[default]
    Bggr,
    Grbg,
    Gbrg,
}

/// Offsets of one site inside a 2x2 Bayer cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CellSite {
    pub dx: usize,
    pub dy: usize,
}

impl BayerPattern {
    /// Green site used for grey extraction.
    pub fn green(self) -> CellSite {
        match self {
            BayerPattern::Rggb | BayerPattern::Bggr => CellSite { dx: 1, dy: 0 },
            BayerPattern::Grbg | BayerPattern::Gbrg => CellSite { dx: 0, dy: 0 },
        }
    }

    pub fn red(self) -> CellSite {
        match self {
            BayerPattern::Rggb => CellSite { dx: 0, dy: 0 },
            BayerPattern::Bggr => CellSite { dx: 1, dy: 1 },
            BayerPattern::Grbg => CellSite { dx: 1, dy: 0 },
            BayerPattern::Gbrg => CellSite { dx: 0, dy: 1 },
        }
    }

    pub fn blue(self) -> CellSite {
        match self {
            BayerPattern::Rggb => CellSite { dx: 1, dy: 1 },
            BayerPattern::Bggr => CellSite { dx: 0, dy: 0 },
            BayerPattern::Grbg => CellSite { dx: 0, dy: 1 },
            BayerPattern::Gbrg => CellSite { dx: 1, dy: 0 },
        }
    }

    /// V4L2 FourCC for the 8-bit variant of this layout.
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            BayerPattern::Rggb => *b"RGGB",
            BayerPattern::Bggr => *b"BA81",
            BayerPattern::Grbg => *b"GRBG",
            BayerPattern::Gbrg => *b"GBRG",
        }
    }

    pub fn from_fourcc(code: &[u8; 4]) -> Option<Self> {
        match code {
            b"RGGB" => Some(BayerPattern::Rggb),
            b"BA81" => Some(BayerPattern::Bggr),
            b"GRBG" => Some(BayerPattern::Grbg),
            b"GBRG" => Some(BayerPattern::Gbrg),
            _ => None,
        }
    }
}

/// Requested geometry for one capture mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModeRequest {
    pub mode: CaptureMode,
    pub width: u32,
    pub height: u32,
    pub buffers: usize,
}

/// Format the driver actually granted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    /// Bytes per raw row (>= width).
    pub stride: u32,
    /// `None` when the driver delivers something other than 8-bit Bayer.
    pub pattern: Option<BayerPattern>,
}

/// Sensor registers the core reads and writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Control {
    Exposure,
    AnalogGain,
    DigitalGain,
}

/// Abstract capture driver.
///
/// Buffer indices are handles into driver-owned memory. A buffer handed out
/// by `dequeue` belongs to the caller until it is passed back to `enqueue`.
pub trait CaptureDriver: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Negotiate the format for a mode. Streaming must be stopped.
    fn set_format(&mut self, request: &ModeRequest) -> Result<FrameFormat, CaptureError>;

    /// Ask for `count` buffers. Returns how many the driver granted.
    fn request_buffers(&mut self, count: usize) -> Result<usize, CaptureError>;

    /// Map buffer `index` into process memory. Returns its length in bytes.
    fn map_buffer(&mut self, index: usize) -> Result<usize, CaptureError>;

    /// Unmap every buffer and return them to the driver.
    fn release_buffers(&mut self) -> Result<(), CaptureError>;

    fn start_streaming(&mut self) -> Result<(), CaptureError>;

    fn stop_streaming(&mut self) -> Result<(), CaptureError>;

    /// Hand buffer `index` to the driver for refill.
    fn enqueue(&mut self, index: usize) -> Result<(), CaptureError>;

    /// Block until the oldest filled buffer is available and return its index.
    fn dequeue(&mut self) -> Result<usize, CaptureError>;

    /// Mapped memory of buffer `index`.
    fn buffer(&self, index: usize) -> Option<&[u8]>;

    fn control(&self, control: Control) -> Result<i32, CaptureError>;

    fn set_control(&mut self, control: Control, value: i32) -> Result<(), CaptureError>;
}

/// Open the driver for a device path.
pub fn open_driver(device: &str) -> Result<Box<dyn CaptureDriver>> {
    if device.starts_with("stub://") {
        log::info!("driver: {} uses the simulated sensor", device);
        return Ok(Box::new(SimDriver::new(SimConfig::default())));
    }
    #[cfg(feature = "device-v4l2")]
    {
        Ok(Box::new(V4l2Driver::open(device)?))
    }
    #[cfg(not(feature = "device-v4l2"))]
    {
        anyhow::bail!("device {} requires the device-v4l2 feature", device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_pattern_has_distinct_sites() {
        for pattern in [
            BayerPattern::Rggb,
            BayerPattern::Bggr,
            BayerPattern::Grbg,
            BayerPattern::Gbrg,
        ] {
            let (g, r, b) = (pattern.green(), pattern.red(), pattern.blue());
            assert_ne!(g, r);
            assert_ne!(g, b);
            assert_ne!(r, b);
            // red and blue sit on the diagonal of the cell
            assert_eq!(r.dx + b.dx, 1);
            assert_eq!(r.dy + b.dy, 1);
            assert_eq!(BayerPattern::from_fourcc(&pattern.fourcc()), Some(pattern));
        }
    }

    #[test]
    fn stub_paths_open_the_simulator() -> Result<()> {
        let driver = open_driver("stub://reader")?;
        assert_eq!(driver.name(), "sim");
        Ok(())
    }
}
