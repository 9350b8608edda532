//! Reader Vision
//!
//! Camera acquisition and real-time vision core of an assistive reading
//! device.
//!
//! # Architecture
//!
//! One capture loop owns everything that touches the sensor:
//!
//! 1. **Buffer pool**: mmap buffers cycled between driver and application,
//!    with read-after-release ruled out at compile time.
//! 2. **Bayer pipeline**: nearest-site demosaic into grey and color previews,
//!    white balance gains.
//! 3. **Exposure controller**: bisection of the exposure register towards a
//!    target brightness.
//! 4. **Motion estimator**: least-squares optical flow over a 3x3 grid.
//! 5. **State machine**: target acquisition, stable-page snapshots for OCR
//!    and gestures.
//!
//! # Module Structure
//!
//! - `driver`: capture driver trait, simulated sensor, V4L2 (feature `device-v4l2`)
//! - `pool`, `frame`: buffer ownership and frame types
//! - `bayer`, `exposure`, `motion`, `target`: per-frame vision stages
//! - `state`, `camera`: decisions and the orchestrating loop
//! - `illumination`: page light
//! - `config`: `ReaderConfig` for the `readerd` binary

pub mod bayer;
pub mod camera;
pub mod config;
pub mod driver;
pub mod error;
pub mod exposure;
pub mod frame;
pub mod illumination;
pub mod motion;
pub mod pool;
pub mod state;
pub mod target;

pub use bayer::{BayerPipeline, ColorGains};
pub use camera::{Camera, CameraCommand, CameraEvent, CameraHandle, CameraSettings, CameraStats};
pub use config::ReaderConfig;
pub use driver::{open_driver, BayerPattern, CaptureDriver, CaptureMode, Control};
pub use error::CaptureError;
pub use exposure::{ExposureController, ExposureSettings, ExposureState, ExposureStep};
pub use frame::{ColorFrame, GreyFrame, PreviewFrame, PreviewPyramid, RawFrame};
pub use illumination::{open_illumination, Illumination, SimLed, SysfsLed};
pub use motion::{MotionEstimator, MotionSettings, MotionVector};
pub use pool::{BufferPool, BufferSet, FrameView, ModeSize, ModeTable, Owner};
pub use state::{CameraState, CaptureStateMachine, StateSettings};
pub use target::{CorrelationTarget, TargetDetector, TargetSettings, TargetStatus};

/// Build a camera from a loaded configuration.
pub fn build_camera(config: &ReaderConfig) -> anyhow::Result<Camera> {
    let driver = open_driver(&config.device)?;
    let illumination = open_illumination(&config.illumination)?;
    let pool = BufferPool::new(driver, config.modes);
    Ok(Camera::new(
        pool,
        config.camera.clone(),
        Box::new(CorrelationTarget::new(config.target)),
        illumination,
    ))
}
