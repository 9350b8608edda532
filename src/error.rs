use thiserror::Error;

use crate::driver::{CaptureMode, Control};

/// Errors raised by the capture path.
///
/// Driver and format errors are fatal for the current session. Dequeue and
/// control failures are transient: the loop skips the frame and retries.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("driver rejected {mode:?} configuration: {reason}")]
    Driver { mode: CaptureMode, reason: String },

    #[error("driver reported unusable format {width}x{height} ({reason})")]
    Format {
        width: u32,
        height: u32,
        reason: String,
    },

    #[error("buffer pool is not configured")]
    NotConfigured,

    #[error("dequeue failed: {0}")]
    Dequeue(String),

    #[error("enqueue of buffer {index} failed: {reason}")]
    Enqueue { index: usize, reason: String },

    #[error("driver returned buffer {0} which the application still owns")]
    Ownership(usize),

    #[error("buffer {index} belongs to configuration {view} (current {current})")]
    StaleView {
        index: usize,
        view: u64,
        current: u64,
    },

    #[error("control {control:?} failed: {reason}")]
    Control { control: Control, reason: String },

    #[error("capture stalled after {0} consecutive failures")]
    Stalled(u32),
}

impl CaptureError {
    /// Transient errors are recovered by skipping the current frame.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CaptureError::Dequeue(_) | CaptureError::Enqueue { .. } | CaptureError::Control { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CaptureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_errors() {
        assert!(CaptureError::Dequeue("busy".into()).is_transient());
        assert!(CaptureError::Control {
            control: Control::Exposure,
            reason: "EIO".into()
        }
        .is_transient());
        assert!(!CaptureError::Driver {
            mode: CaptureMode::Preview,
            reason: "no buffers".into()
        }
        .is_transient());
        assert!(!CaptureError::Ownership(2).is_transient());
        assert!(!CaptureError::Stalled(10).is_transient());
    }
}
