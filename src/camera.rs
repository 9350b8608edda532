//! Camera orchestrator.
//!
//! One capture loop owns the buffer pool, the Bayer pipeline, the exposure
//! controller, the motion estimator and the state machine. Every `tick`
//! drains pending commands, pulls one preview frame through the pipeline and
//! returns at most one discrete event. Preview frames go straight to the
//! event channel; `run` forwards the discrete events there too.
//!
//! Mode switches and the snapshot settle delay happen inside the tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use crate::bayer::{demosaic_grey, BayerPipeline};
use crate::driver::{CaptureMode, Control};
use crate::error::{CaptureError, Result};
use crate::exposure::{ExposureController, ExposureSettings, ExposureState, ExposureStep};
use crate::frame::{ColorFrame, GreyFrame, PreviewFrame, PreviewPyramid};
use crate::illumination::Illumination;
use crate::motion::{MotionEstimator, MotionSettings};
use crate::pool::{BufferPool, FrameView};
use crate::state::{
    CameraState, CaptureStateMachine, FrameObservation, Gesture, StateSettings, Transition,
};
use crate::target::TargetDetector;

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(150);
pub const DEFAULT_FLASH_DURATION: Duration = Duration::from_millis(400);
pub const DEFAULT_FLASH_EXPOSURE: i32 = 200;
pub const DEFAULT_FLASH_GAIN: i32 = 16;
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 10;
pub const DEFAULT_PREVIEW_EVERY: u32 = 1;

const GAIN_MIN: i32 = 1;
const GAIN_MAX: i32 = 255;

/// Output of the core to the UI and the text-recognition engine.
#[derive(Clone, Debug, PartialEq)]
pub enum CameraEvent {
    ShowPreviewFrame(PreviewFrame),
    TargetNotFound,
    ReaderReady,
    /// Full-resolution grey image ready for OCR.
    StartOcr(GreyFrame),
    GestureBackSentence,
    GesturePauseResume,
    ArmClosed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraCommand {
    RequestSnapshot,
    SetArmOpen(bool),
    SetGesturesEnabled(bool),
    SetIgnoreInputs(bool),
    NudgeExposure(i32),
    NudgeGain(i32),
    Recalibrate,
    TriggerWhiteBalance,
}

/// Cloneable sender of control inputs.
#[derive(Clone, Debug)]
pub struct CameraHandle {
    commands: Sender<CameraCommand>,
}

impl CameraHandle {
    /// Returns false once the camera is gone.
    pub fn send(&self, command: CameraCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn request_snapshot(&self) -> bool {
        self.send(CameraCommand::RequestSnapshot)
    }

    pub fn set_arm_open(&self, open: bool) -> bool {
        self.send(CameraCommand::SetArmOpen(open))
    }

    pub fn set_gestures_enabled(&self, enabled: bool) -> bool {
        self.send(CameraCommand::SetGesturesEnabled(enabled))
    }

    pub fn set_ignore_inputs(&self, ignore: bool) -> bool {
        self.send(CameraCommand::SetIgnoreInputs(ignore))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CameraSettings {
    pub exposure: ExposureSettings,
    pub motion: MotionSettings,
    pub state: StateSettings,
    pub settle_delay: Duration,
    /// How long the light stays on once a snapshot pulses it.
    pub flash_duration: Duration,
    pub flash_exposure: i32,
    pub flash_gain: i32,
    pub max_consecutive_failures: u32,
    /// Send a preview frame every N captured frames; 0 disables previews.
    pub preview_every: u32,
    pub color_preview: bool,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            exposure: ExposureSettings::default(),
            motion: MotionSettings::default(),
            state: StateSettings::default(),
            settle_delay: DEFAULT_SETTLE_DELAY,
            flash_duration: DEFAULT_FLASH_DURATION,
            flash_exposure: DEFAULT_FLASH_EXPOSURE,
            flash_gain: DEFAULT_FLASH_GAIN,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            preview_every: DEFAULT_PREVIEW_EVERY,
            color_preview: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CameraStats {
    pub frames_captured: u64,
    pub frames_skipped: u64,
    pub snapshots: u64,
    pub gestures: u64,
    pub consecutive_failures: u32,
}

/// What survives of a preview frame after its buffer is released.
struct Captured {
    pyramid: PreviewPyramid,
    color: Option<ColorFrame>,
}

pub struct Camera {
    pool: BufferPool,
    pipeline: BayerPipeline,
    exposure: ExposureController,
    motion: MotionEstimator,
    machine: CaptureStateMachine,
    target: Box<dyn TargetDetector>,
    illumination: Box<dyn Illumination>,
    settings: CameraSettings,
    events: Sender<CameraEvent>,
    events_rx: Option<Receiver<CameraEvent>>,
    commands: Receiver<CameraCommand>,
    commands_tx: Sender<CameraCommand>,
    stats: CameraStats,
    white_balance_pending: bool,
    /// The sensor does not hold the controller's exposure yet.
    exposure_pending: bool,
    /// A snapshot failed and is waiting for its retry.
    snapshot_retry: bool,
}

impl Camera {
    pub fn new(
        pool: BufferPool,
        settings: CameraSettings,
        target: Box<dyn TargetDetector>,
        illumination: Box<dyn Illumination>,
    ) -> Self {
        let (events, events_rx) = mpsc::channel();
        let (commands_tx, commands) = mpsc::channel();
        Self {
            pool,
            pipeline: BayerPipeline::new(),
            exposure: ExposureController::new(settings.exposure),
            motion: MotionEstimator::new(settings.motion),
            machine: CaptureStateMachine::new(settings.state),
            target,
            illumination,
            settings,
            events,
            events_rx: Some(events_rx),
            commands,
            commands_tx,
            stats: CameraStats::default(),
            white_balance_pending: false,
            exposure_pending: true,
            snapshot_retry: false,
        }
    }

    pub fn handle(&self) -> CameraHandle {
        CameraHandle {
            commands: self.commands_tx.clone(),
        }
    }

    /// The receiving end of the event channel. Only the first call gets it.
    pub fn take_events(&mut self) -> Option<Receiver<CameraEvent>> {
        self.events_rx.take()
    }

    pub fn state(&self) -> CameraState {
        self.machine.state()
    }

    pub fn is_arm_closed(&self) -> bool {
        self.machine.is_arm_closed()
    }

    pub fn stats(&self) -> CameraStats {
        self.stats
    }

    pub fn exposure_state(&self) -> ExposureState {
        self.exposure.state()
    }

    pub fn active_mode(&self) -> Option<CaptureMode> {
        self.pool.active().map(|set| set.mode)
    }

    /// Enter preview mode. The first exposure guess is written before the
    /// next capture.
    pub fn start(&mut self) -> Result<()> {
        let set = self.pool.configure(CaptureMode::Preview)?;
        self.exposure_pending = true;
        log::info!(
            "Camera: preview running on {} ({}x{}, target {:?}, light {})",
            self.pool.driver_name(),
            set.width,
            set.height,
            self.target.name(),
            self.illumination.name()
        );
        Ok(())
    }

    /// Tick until `stop` is set or `max_frames` frames were captured,
    /// forwarding every event to the channel.
    pub fn run(&mut self, stop: &AtomicBool, max_frames: Option<u64>) -> Result<()> {
        while !stop.load(Ordering::SeqCst) {
            if max_frames.is_some_and(|max| self.stats.frames_captured >= max) {
                break;
            }
            if let Some(event) = self.tick()? {
                self.publish(event);
            }
        }
        self.shutdown()
    }

    /// Light off, streaming off, buffers unmapped.
    pub fn shutdown(&mut self) -> Result<()> {
        self.light(false);
        self.pool.shutdown()?;
        log::info!(
            "Camera: stopped after {} frames ({} skipped, {} snapshots)",
            self.stats.frames_captured,
            self.stats.frames_skipped,
            self.stats.snapshots
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // per frame
    // ------------------------------------------------------------------------

    /// One capture cycle. Transient failures skip the frame and return
    /// `Ok(None)` until `max_consecutive_failures` is exceeded.
    pub fn tick(&mut self) -> Result<Option<CameraEvent>> {
        let command_event = self.drain_commands();
        if self.pool.active().is_none() {
            self.start()?;
        }
        if self.exposure_pending {
            if let Err(err) = self.write_exposure() {
                self.skip(err)?;
                return Ok(command_event);
            }
        }

        let view = match self.pool.acquire_next() {
            Ok(view) => view,
            Err(err) => {
                self.skip(err)?;
                return Ok(command_event);
            }
        };
        self.stats.frames_captured += 1;

        if self.machine.is_arm_closed() {
            self.release(view)?;
            self.stats.consecutive_failures = 0;
            return Ok(command_event);
        }

        let captured = self.copy_out(&view);
        self.release(view)?;
        let captured = captured?;

        if self.preview_due() {
            let preview = match captured.color {
                Some(color) => PreviewFrame::Color(color),
                None => PreviewFrame::Grey(captured.pyramid.full.clone()),
            };
            self.publish(CameraEvent::ShowPreviewFrame(preview));
        }

        if let ExposureStep::Adjusted { .. } = self.exposure.update(&captured.pyramid.half) {
            if let Err(err) = self.write_exposure() {
                self.skip(err)?;
                return Ok(command_event);
            }
        }

        let observation = FrameObservation {
            exposure_converged: self.exposure.is_converged(),
            target: self.target.detect(&captured.pyramid.quarter),
            motion: self.motion.estimate(&captured.pyramid.quarter),
        };
        let transition = self.machine.on_frame(&observation);
        let frame_event = self.apply(transition)?;
        if self.machine.state() != CameraState::LookingForStableImage {
            self.snapshot_retry = false;
        }
        // failed snapshots keep counting across the preview frames between retries
        if !self.snapshot_retry {
            self.stats.consecutive_failures = 0;
        }
        Ok(command_event.or(frame_event))
    }

    fn copy_out(&mut self, view: &FrameView) -> Result<Captured> {
        let raw = self.pool.frame(view)?;
        if self.white_balance_pending {
            self.white_balance_pending = false;
            self.pipeline.update_white_balance(&raw);
        }
        let color = if self.settings.color_preview && self.preview_due() {
            Some(self.pipeline.color(&raw, 1))
        } else {
            None
        };
        Ok(Captured {
            pyramid: self.pipeline.pyramid(&raw),
            color,
        })
    }

    fn preview_due(&self) -> bool {
        let every = self.settings.preview_every as u64;
        every > 0 && self.stats.frames_captured % every == 0
    }

    fn apply(&mut self, transition: Transition) -> Result<Option<CameraEvent>> {
        let event = match transition {
            Transition::Stay | Transition::ArmClosed | Transition::ArmOpened => None,
            Transition::Calibrated => {
                log::info!(
                    "Camera: exposure converged at {}, measuring white balance",
                    self.exposure.exposure()
                );
                self.white_balance_pending = true;
                None
            }
            Transition::TargetFound => Some(CameraEvent::ReaderReady),
            Transition::TargetLost => Some(CameraEvent::TargetNotFound),
            Transition::Gesture(gesture) => {
                self.stats.gestures += 1;
                Some(match gesture {
                    Gesture::BackSentence => CameraEvent::GestureBackSentence,
                    Gesture::PauseResume => CameraEvent::GesturePauseResume,
                })
            }
            Transition::CaptureSnapshot => match self.capture_snapshot() {
                Ok(image) => {
                    self.snapshot_retry = false;
                    self.machine.snapshot_done();
                    self.stats.snapshots += 1;
                    Some(CameraEvent::StartOcr(image))
                }
                Err(err) if err.is_transient() => {
                    self.machine.snapshot_failed();
                    self.snapshot_retry = true;
                    self.skip(err)?;
                    None
                }
                Err(err) => return Err(err),
            },
        };
        Ok(event)
    }

    // ------------------------------------------------------------------------
    // snapshot
    // ------------------------------------------------------------------------

    /// Full-resolution capture with flash exposure, then back to preview.
    fn capture_snapshot(&mut self) -> Result<GreyFrame> {
        let saved_gain = self.pool.control(Control::AnalogGain)?;
        self.pool.configure(CaptureMode::FullResolution)?;
        let image = self.capture_full();

        self.pool.configure(CaptureMode::Preview)?;
        self.retry_exposure();
        self.write_control(Control::AnalogGain, saved_gain);
        self.motion.reset();
        if let Ok(image) = &image {
            log::info!("Camera: snapshot {}x{} ready for OCR", image.width, image.height);
        }
        image
    }

    fn capture_full(&mut self) -> Result<GreyFrame> {
        self.pool
            .set_control(Control::Exposure, self.settings.flash_exposure)?;
        self.pool
            .set_control(Control::AnalogGain, self.settings.flash_gain)?;
        if let Err(err) = self.illumination.pulse(self.settings.flash_duration) {
            log::warn!("Camera: illumination pulse failed: {:#}", err);
        }
        std::thread::sleep(self.settings.settle_delay);

        let view = self.pool.acquire_next()?;
        let image = self.pool.frame(&view).map(|raw| demosaic_grey(&raw, 1));
        self.release(view)?;
        image
    }

    // ------------------------------------------------------------------------
    // commands
    // ------------------------------------------------------------------------

    fn drain_commands(&mut self) -> Option<CameraEvent> {
        let mut event = None;
        while let Ok(command) = self.commands.try_recv() {
            log::debug!("Camera: command {:?}", command);
            match command {
                CameraCommand::RequestSnapshot => {
                    self.machine.request_snapshot();
                }
                CameraCommand::SetArmOpen(open) => match self.machine.set_arm_open(open) {
                    Transition::ArmClosed => {
                        log::info!("Camera: arm closed");
                        self.light(false);
                        event = Some(CameraEvent::ArmClosed);
                    }
                    Transition::ArmOpened => {
                        log::info!("Camera: arm opened, recalibrating");
                        self.restart_calibration();
                    }
                    _ => {}
                },
                CameraCommand::SetGesturesEnabled(enabled) => {
                    self.machine.set_gestures_enabled(enabled)
                }
                CameraCommand::SetIgnoreInputs(ignore) => self.machine.set_ignore_inputs(ignore),
                CameraCommand::NudgeExposure(delta) => {
                    self.exposure.nudge(delta);
                    self.retry_exposure();
                }
                CameraCommand::NudgeGain(delta) => self.nudge_gain(delta),
                CameraCommand::Recalibrate => {
                    self.machine.recalibrate();
                    self.restart_calibration();
                }
                CameraCommand::TriggerWhiteBalance => self.white_balance_pending = true,
            }
        }
        event
    }

    fn restart_calibration(&mut self) {
        self.exposure.recalibrate();
        self.motion.reset();
        self.target.reset();
        self.retry_exposure();
    }

    fn nudge_gain(&mut self, delta: i32) {
        if self.pool.active().is_none() {
            return;
        }
        match self.pool.control(Control::AnalogGain) {
            Ok(gain) => {
                let gain = gain.saturating_add(delta).clamp(GAIN_MIN, GAIN_MAX);
                self.write_control(Control::AnalogGain, gain);
            }
            Err(err) => log::warn!("Camera: gain read failed: {}", err),
        }
    }

    // ------------------------------------------------------------------------
    // helpers
    // ------------------------------------------------------------------------

    /// Bring the sensor to the controller's exposure. The value stays pending
    /// until a write succeeds, so no frame is measured against an exposure
    /// the sensor never got.
    fn write_exposure(&mut self) -> Result<()> {
        self.exposure_pending = true;
        if self.pool.active().is_none() {
            return Ok(());
        }
        self.pool
            .set_control(Control::Exposure, self.exposure.exposure())?;
        self.exposure_pending = false;
        Ok(())
    }

    /// `write_exposure` outside the capture path; a failed write is retried
    /// before the next capture.
    fn retry_exposure(&mut self) {
        if let Err(err) = self.write_exposure() {
            log::warn!("Camera: exposure write failed, retrying next frame: {}", err);
        }
    }

    /// Write a control outside the exposure loop. Failures are logged only.
    fn write_control(&mut self, control: Control, value: i32) {
        if self.pool.active().is_none() {
            return;
        }
        if let Err(err) = self.pool.set_control(control, value) {
            log::warn!("Camera: {:?} write of {} failed: {}", control, value, err);
        }
    }

    fn light(&mut self, on: bool) {
        if let Err(err) = self.illumination.set(on) {
            log::warn!("Camera: illumination {} failed: {:#}", on, err);
        }
    }

    fn release(&mut self, view: FrameView) -> Result<()> {
        match self.pool.release(view) {
            // the pool keeps the buffer for requeue on the next acquire
            Err(err) if err.is_transient() => {
                log::debug!("Camera: deferred release: {}", err);
                Ok(())
            }
            other => other,
        }
    }

    fn skip(&mut self, err: CaptureError) -> Result<()> {
        if !err.is_transient() {
            return Err(err);
        }
        self.stats.frames_skipped += 1;
        self.stats.consecutive_failures += 1;
        if self.stats.consecutive_failures > self.settings.max_consecutive_failures {
            log::warn!(
                "Camera: giving up after {} consecutive failures",
                self.stats.consecutive_failures
            );
            return Err(CaptureError::Stalled(self.stats.consecutive_failures));
        }
        log::warn!("Camera: frame skipped: {}", err);
        Ok(())
    }

    /// Push an event to the channel. Dropped silently once nobody listens.
    pub fn publish(&self, event: CameraEvent) {
        if self.events.send(event).is_err() {
            log::debug!("Camera: event receiver dropped");
        }
    }
}
