//! Capture state machine.
//!
//! Pure decision logic: it sees one `FrameObservation` per preview frame
//! plus the control inputs, and answers with a `Transition`. Carrying a
//! transition out (mode switches, sensor writes, events) is the camera's job.

use crate::motion::MotionVector;
use crate::target::TargetStatus;

pub const DEFAULT_GESTURE_THRESHOLD: f32 = 64.0;
pub const DEFAULT_STABILITY_THRESHOLD: f32 = 4.0;
pub const DEFAULT_STABLE_FRAMES: u32 = 2;
pub const DEFAULT_GESTURE_COOLDOWN: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraState {
    Calibrating,
    LookingForTarget,
    ReadyOnTarget,
    LookingForStableImage,
    LookingForGestures,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Gesture {
    /// Dominant horizontal motion.
    BackSentence,
    /// Dominant vertical motion.
    PauseResume,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Stay,
    /// Exposure converged; white balance should be measured.
    Calibrated,
    TargetFound,
    TargetLost,
    Gesture(Gesture),
    /// Run the full-resolution capture, then call `snapshot_done`.
    CaptureSnapshot,
    ArmClosed,
    /// Arm reopened; exposure search restarts.
    ArmOpened,
}

/// Squared-magnitude thresholds are in preview pixels after motion scaling.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StateSettings {
    pub gesture_threshold: f32,
    pub stability_threshold: f32,
    pub stable_frames: u32,
    pub gesture_cooldown: u32,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            gesture_threshold: DEFAULT_GESTURE_THRESHOLD,
            stability_threshold: DEFAULT_STABILITY_THRESHOLD,
            stable_frames: DEFAULT_STABLE_FRAMES,
            gesture_cooldown: DEFAULT_GESTURE_COOLDOWN,
        }
    }
}

/// What the pipeline measured on one preview frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameObservation {
    pub exposure_converged: bool,
    pub target: TargetStatus,
    pub motion: MotionVector,
}

#[derive(Debug)]
pub struct CaptureStateMachine {
    settings: StateSettings,
    state: CameraState,
    arm_closed: bool,
    gestures_enabled: bool,
    ignore_inputs: bool,
    stable_frames: u32,
    cooldown: u32,
}

impl CaptureStateMachine {
    pub fn new(settings: StateSettings) -> Self {
        Self {
            settings,
            state: CameraState::Calibrating,
            arm_closed: false,
            gestures_enabled: false,
            ignore_inputs: false,
            stable_frames: 0,
            cooldown: 0,
        }
    }

    pub fn state(&self) -> CameraState {
        self.state
    }

    pub fn is_arm_closed(&self) -> bool {
        self.arm_closed
    }

    pub fn gestures_enabled(&self) -> bool {
        self.gestures_enabled
    }

    pub fn ignores_inputs(&self) -> bool {
        self.ignore_inputs
    }

    fn enter(&mut self, state: CameraState) {
        if self.state != state {
            log::debug!("state: {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        self.stable_frames = 0;
        self.cooldown = 0;
    }

    fn is_still(&self, motion: &MotionVector) -> bool {
        motion.magnitude < self.settings.stability_threshold
    }

    fn lose_target(&mut self) -> Transition {
        self.enter(CameraState::LookingForTarget);
        Transition::TargetLost
    }

    // ------------------------------------------------------------------------
    // control inputs
    // ------------------------------------------------------------------------

    /// Ask for an OCR snapshot. Accepted only while a target is held and
    /// inputs are not ignored; returns whether it was.
    pub fn request_snapshot(&mut self) -> bool {
        if self.arm_closed || self.ignore_inputs {
            log::debug!("state: snapshot request dropped");
            return false;
        }
        match self.state {
            CameraState::ReadyOnTarget | CameraState::LookingForGestures => {
                self.enter(CameraState::LookingForStableImage);
                true
            }
            CameraState::LookingForStableImage => true,
            _ => {
                log::debug!("state: snapshot request dropped in {:?}", self.state);
                false
            }
        }
    }

    pub fn set_arm_open(&mut self, open: bool) -> Transition {
        match (open, self.arm_closed) {
            (false, false) => {
                self.arm_closed = true;
                Transition::ArmClosed
            }
            (true, true) => {
                self.arm_closed = false;
                self.enter(CameraState::Calibrating);
                Transition::ArmOpened
            }
            _ => Transition::Stay,
        }
    }

    pub fn set_gestures_enabled(&mut self, enabled: bool) {
        self.gestures_enabled = enabled;
        if !enabled && self.state == CameraState::LookingForGestures {
            self.enter(CameraState::ReadyOnTarget);
        }
    }

    pub fn set_ignore_inputs(&mut self, ignore: bool) {
        self.ignore_inputs = ignore;
    }

    /// Restart from exposure calibration.
    pub fn recalibrate(&mut self) {
        self.enter(CameraState::Calibrating);
    }

    /// The snapshot was delivered.
    pub fn snapshot_done(&mut self) {
        let next = if self.gestures_enabled {
            CameraState::LookingForGestures
        } else {
            CameraState::ReadyOnTarget
        };
        self.enter(next);
    }

    /// The snapshot failed; wait for stillness again.
    pub fn snapshot_failed(&mut self) {
        self.stable_frames = 0;
    }

    // ------------------------------------------------------------------------
    // per frame
    // ------------------------------------------------------------------------

    pub fn on_frame(&mut self, frame: &FrameObservation) -> Transition {
        if self.arm_closed {
            return Transition::Stay;
        }
        let found = frame.target == TargetStatus::Found;

        match self.state {
            CameraState::Calibrating => {
                if frame.exposure_converged {
                    self.enter(CameraState::LookingForTarget);
                    return Transition::Calibrated;
                }
                Transition::Stay
            }
            CameraState::LookingForTarget => {
                if found {
                    self.enter(CameraState::ReadyOnTarget);
                    return Transition::TargetFound;
                }
                Transition::Stay
            }
            CameraState::ReadyOnTarget => {
                if !found {
                    return self.lose_target();
                }
                if self.gestures_enabled {
                    self.enter(CameraState::LookingForGestures);
                }
                Transition::Stay
            }
            CameraState::LookingForStableImage => {
                if !found {
                    return self.lose_target();
                }
                if !self.is_still(&frame.motion) {
                    self.stable_frames = 0;
                    return Transition::Stay;
                }
                self.stable_frames += 1;
                if self.stable_frames >= self.settings.stable_frames {
                    return Transition::CaptureSnapshot;
                }
                Transition::Stay
            }
            CameraState::LookingForGestures => self.look_for_gestures(frame, found),
        }
    }

    fn look_for_gestures(&mut self, frame: &FrameObservation, found: bool) -> Transition {
        let motion = frame.motion;
        if self.is_still(&motion) && !found {
            return self.lose_target();
        }
        if self.cooldown > 0 {
            self.cooldown -= 1;
            return Transition::Stay;
        }
        if motion.magnitude <= self.settings.gesture_threshold || self.ignore_inputs {
            return Transition::Stay;
        }
        self.cooldown = self.settings.gesture_cooldown;
        let gesture = if motion.dx.abs() >= motion.dy.abs() {
            Gesture::BackSentence
        } else {
            Gesture::PauseResume
        };
        log::debug!(
            "state: {:?} from motion ({:.1}, {:.1})",
            gesture,
            motion.dx,
            motion.dy
        );
        Transition::Gesture(gesture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(converged: bool, target: TargetStatus, dx: f32, dy: f32) -> FrameObservation {
        FrameObservation {
            exposure_converged: converged,
            target,
            motion: MotionVector::new(dx, dy),
        }
    }

    fn still(target: TargetStatus) -> FrameObservation {
        frame(true, target, 0.0, 0.0)
    }

    fn ready_machine() -> CaptureStateMachine {
        let mut machine = CaptureStateMachine::new(StateSettings::default());
        assert_eq!(machine.on_frame(&still(TargetStatus::NotFound)), Transition::Calibrated);
        assert_eq!(machine.on_frame(&still(TargetStatus::Found)), Transition::TargetFound);
        assert_eq!(machine.state(), CameraState::ReadyOnTarget);
        machine
    }

    #[test]
    fn calibration_waits_for_convergence() {
        let mut machine = CaptureStateMachine::new(StateSettings::default());
        let unconverged = frame(false, TargetStatus::Found, 0.0, 0.0);
        for _ in 0..5 {
            assert_eq!(machine.on_frame(&unconverged), Transition::Stay);
        }
        assert_eq!(machine.state(), CameraState::Calibrating);
        assert_eq!(machine.on_frame(&still(TargetStatus::Found)), Transition::Calibrated);
        assert_eq!(machine.state(), CameraState::LookingForTarget);
    }

    #[test]
    fn snapshot_waits_for_stillness() {
        let mut machine = ready_machine();
        assert!(machine.request_snapshot());
        assert_eq!(machine.state(), CameraState::LookingForStableImage);

        let shaky = frame(true, TargetStatus::Found, 3.0, 0.0);
        assert_eq!(machine.on_frame(&still(TargetStatus::Found)), Transition::Stay);
        assert_eq!(machine.on_frame(&shaky), Transition::Stay);
        assert_eq!(machine.on_frame(&still(TargetStatus::Found)), Transition::Stay);
        assert_eq!(
            machine.on_frame(&still(TargetStatus::Found)),
            Transition::CaptureSnapshot
        );
        machine.snapshot_done();
        assert_eq!(machine.state(), CameraState::ReadyOnTarget);
    }

    #[test]
    fn snapshot_requires_a_target() {
        let mut machine = CaptureStateMachine::new(StateSettings::default());
        assert!(!machine.request_snapshot());
        assert_eq!(machine.state(), CameraState::Calibrating);

        let mut machine = ready_machine();
        machine.set_ignore_inputs(true);
        assert!(!machine.request_snapshot());
        assert_eq!(machine.state(), CameraState::ReadyOnTarget);
    }

    #[test]
    fn target_loss_is_reported_once() {
        let mut machine = ready_machine();
        assert_eq!(machine.on_frame(&still(TargetStatus::NotFound)), Transition::TargetLost);
        assert_eq!(machine.state(), CameraState::LookingForTarget);
        assert_eq!(machine.on_frame(&still(TargetStatus::NotFound)), Transition::Stay);

        let mut machine = ready_machine();
        machine.request_snapshot();
        assert_eq!(machine.on_frame(&still(TargetStatus::NotFound)), Transition::TargetLost);
    }

    #[test]
    fn gestures_follow_dominant_axis_with_cooldown() {
        let mut machine = ready_machine();
        machine.set_gestures_enabled(true);
        assert_eq!(machine.on_frame(&still(TargetStatus::Found)), Transition::Stay);
        assert_eq!(machine.state(), CameraState::LookingForGestures);

        let sideways = frame(true, TargetStatus::Found, -12.0, 3.0);
        assert_eq!(
            machine.on_frame(&sideways),
            Transition::Gesture(Gesture::BackSentence)
        );
        for _ in 0..DEFAULT_GESTURE_COOLDOWN {
            assert_eq!(machine.on_frame(&sideways), Transition::Stay);
        }
        let vertical = frame(true, TargetStatus::Found, 1.0, 10.0);
        assert_eq!(
            machine.on_frame(&vertical),
            Transition::Gesture(Gesture::PauseResume)
        );
    }

    #[test]
    fn moving_scene_without_target_is_not_lost_while_gesturing() {
        let mut machine = ready_machine();
        machine.set_gestures_enabled(true);
        machine.on_frame(&still(TargetStatus::Found));

        let hand = frame(true, TargetStatus::NotFound, 2.0, 2.0);
        assert_eq!(machine.on_frame(&hand), Transition::Stay);
        assert_eq!(machine.on_frame(&still(TargetStatus::NotFound)), Transition::TargetLost);
    }

    #[test]
    fn ignored_inputs_suppress_gestures() {
        let mut machine = ready_machine();
        machine.set_gestures_enabled(true);
        machine.set_ignore_inputs(true);
        machine.on_frame(&still(TargetStatus::Found));
        let sideways = frame(true, TargetStatus::Found, 20.0, 0.0);
        assert_eq!(machine.on_frame(&sideways), Transition::Stay);

        machine.set_gestures_enabled(false);
        assert_eq!(machine.state(), CameraState::ReadyOnTarget);
    }

    #[test]
    fn snapshot_returns_to_gestures_when_enabled() {
        let mut machine = ready_machine();
        machine.set_gestures_enabled(true);
        assert!(machine.request_snapshot());
        machine.snapshot_done();
        assert_eq!(machine.state(), CameraState::LookingForGestures);
    }

    #[test]
    fn closed_arm_suppresses_everything() {
        let mut machine = ready_machine();
        assert_eq!(machine.set_arm_open(false), Transition::ArmClosed);
        assert_eq!(machine.set_arm_open(false), Transition::Stay);
        assert!(!machine.request_snapshot());
        for _ in 0..3 {
            assert_eq!(machine.on_frame(&still(TargetStatus::NotFound)), Transition::Stay);
        }

        assert_eq!(machine.set_arm_open(true), Transition::ArmOpened);
        assert_eq!(machine.state(), CameraState::Calibrating);
        assert_eq!(machine.set_arm_open(true), Transition::Stay);
    }
}
