//! V4L2 capture driver.
//!
//! Connects to a local device node (e.g., /dev/video0) through libv4l and
//! exposes it as a `CaptureDriver`.
//!
//! libv4l's `MmapStream` re-queues its own kernel buffers on every `next()`.
//! The driver therefore copies each completed frame into one of its own
//! staging slots; slot ownership follows the usual dequeue/enqueue contract so
//! the buffer pool sees the same discipline as with raw mmap buffers.

use anyhow::{Context, Result};
use ouroboros::self_referencing;
use std::collections::VecDeque;

use super::{BayerPattern, CaptureDriver, CaptureMode, Control, FrameFormat, ModeRequest};
use crate::error::CaptureError;

const V4L2_CID_BASE: u32 = 0x0098_0900;
const V4L2_CID_IMAGE_SOURCE_CLASS_BASE: u32 = 0x009e_0900;
const V4L2_CID_IMAGE_PROC_CLASS_BASE: u32 = 0x009f_0900;

const V4L2_CID_EXPOSURE: u32 = V4L2_CID_BASE + 17;
const V4L2_CID_ANALOGUE_GAIN: u32 = V4L2_CID_IMAGE_SOURCE_CLASS_BASE + 3;
const V4L2_CID_DIGITAL_GAIN: u32 = V4L2_CID_IMAGE_PROC_CLASS_BASE + 5;

/// Bayer layouts tried in order when negotiating a format.
const PATTERN_PREFERENCE: [BayerPattern; 4] = [
    BayerPattern::Bggr,
    BayerPattern::Rggb,
    BayerPattern::Grbg,
    BayerPattern::Gbrg,
];

fn control_id(control: Control) -> u32 {
    match control {
        Control::Exposure => V4L2_CID_EXPOSURE,
        Control::AnalogGain => V4L2_CID_ANALOGUE_GAIN,
        Control::DigitalGain => V4L2_CID_DIGITAL_GAIN,
    }
}

#[self_referencing]
struct DeviceStream {
    device: v4l::Device,
    #[borrows(device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this>,
}

enum DeviceSlot {
    Idle(v4l::Device),
    Mapped(DeviceStream),
    Empty,
}

pub struct V4l2Driver {
    path: String,
    slot: DeviceSlot,
    mode: CaptureMode,
    format: Option<FrameFormat>,
    staging: Vec<Vec<u8>>,
    mapped: Vec<bool>,
    free: VecDeque<usize>,
}

impl V4l2Driver {
    pub fn open(path: &str) -> Result<Self> {
        let device =
            v4l::Device::with_path(path).with_context(|| format!("open v4l2 device {}", path))?;
        log::info!("V4l2Driver: opened {}", path);
        Ok(Self {
            path: path.to_string(),
            slot: DeviceSlot::Idle(device),
            mode: CaptureMode::Preview,
            format: None,
            staging: Vec::new(),
            mapped: Vec::new(),
            free: VecDeque::new(),
        })
    }

    fn device(&self) -> Option<&v4l::Device> {
        match &self.slot {
            DeviceSlot::Idle(device) => Some(device),
            DeviceSlot::Mapped(stream) => Some(stream.borrow_device()),
            DeviceSlot::Empty => None,
        }
    }

    /// Drop any mapped stream and take the bare device back.
    fn take_device(&mut self) -> Result<v4l::Device, CaptureError> {
        match std::mem::replace(&mut self.slot, DeviceSlot::Empty) {
            DeviceSlot::Idle(device) => Ok(device),
            DeviceSlot::Mapped(stream) => Ok(stream.into_heads().device),
            DeviceSlot::Empty => Err(self.driver_error("device handle lost")),
        }
    }

    fn driver_error(&self, reason: impl Into<String>) -> CaptureError {
        CaptureError::Driver {
            mode: self.mode,
            reason: format!("{}: {}", self.path, reason.into()),
        }
    }

    fn with_stream<T>(
        &mut self,
        f: impl FnOnce(&mut v4l::prelude::MmapStream<'_>) -> std::io::Result<T>,
    ) -> std::io::Result<T> {
        match &mut self.slot {
            DeviceSlot::Mapped(stream) => stream.with_stream_mut(|stream| f(stream)),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no mapped buffers",
            )),
        }
    }
}

impl CaptureDriver for V4l2Driver {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn set_format(&mut self, request: &ModeRequest) -> Result<FrameFormat, CaptureError> {
        use v4l::video::Capture;

        self.mode = request.mode;
        let device = self.take_device()?;
        let negotiated = (|| {
            let mut format = device.format()?;
            let mut granted = format;
            for pattern in PATTERN_PREFERENCE {
                format.width = request.width;
                format.height = request.height;
                format.fourcc = v4l::FourCC::new(&pattern.fourcc());
                granted = device.set_format(&format)?;
                if BayerPattern::from_fourcc(&granted.fourcc.repr).is_some() {
                    break;
                }
            }
            Ok::<_, std::io::Error>(granted)
        })();
        self.slot = DeviceSlot::Idle(device);

        let granted = negotiated.map_err(|err| self.driver_error(err.to_string()))?;
        let format = FrameFormat {
            width: granted.width,
            height: granted.height,
            stride: granted.stride.max(granted.width),
            pattern: BayerPattern::from_fourcc(&granted.fourcc.repr),
        };
        log::info!(
            "V4l2Driver: {:?} format {}x{} stride {} ({})",
            request.mode,
            format.width,
            format.height,
            format.stride,
            granted.fourcc
        );
        self.format = Some(format);
        Ok(format)
    }

    fn request_buffers(&mut self, count: usize) -> Result<usize, CaptureError> {
        use v4l::buffer::Type;

        let format = self.format.ok_or(CaptureError::NotConfigured)?;
        let device = self.take_device()?;
        let built = DeviceStreamTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, count as u32)
            },
        }
        .try_build_or_recover();
        match built {
            Ok(stream) => self.slot = DeviceSlot::Mapped(stream),
            Err((err, heads)) => {
                self.slot = DeviceSlot::Idle(heads.device);
                return Err(self.driver_error(format!("request {} buffers: {}", count, err)));
            }
        }

        let len = format.stride as usize * format.height as usize;
        self.staging = (0..count).map(|_| vec![0u8; len]).collect();
        self.mapped = vec![false; count];
        self.free.clear();
        Ok(count)
    }

    fn map_buffer(&mut self, index: usize) -> Result<usize, CaptureError> {
        let len = match self.staging.get(index) {
            Some(slot) => slot.len(),
            None => return Err(self.driver_error(format!("no buffer {} to map", index))),
        };
        self.mapped[index] = true;
        Ok(len)
    }

    fn release_buffers(&mut self) -> Result<(), CaptureError> {
        let device = self.take_device()?;
        self.slot = DeviceSlot::Idle(device);
        self.staging.clear();
        self.mapped.clear();
        self.free.clear();
        Ok(())
    }

    fn start_streaming(&mut self) -> Result<(), CaptureError> {
        use v4l::io::traits::Stream;
        self.with_stream(|stream| stream.start())
            .map_err(|err| self.driver_error(format!("stream on: {}", err)))
    }

    fn stop_streaming(&mut self) -> Result<(), CaptureError> {
        use v4l::io::traits::Stream;
        match self.with_stream(|stream| stream.stop()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(self.driver_error(format!("stream off: {}", err))),
        }
    }

    fn enqueue(&mut self, index: usize) -> Result<(), CaptureError> {
        if index >= self.staging.len() || self.free.contains(&index) {
            return Err(CaptureError::Enqueue {
                index,
                reason: "buffer is not dequeued".to_string(),
            });
        }
        self.free.push_back(index);
        Ok(())
    }

    fn dequeue(&mut self) -> Result<usize, CaptureError> {
        use v4l::io::traits::CaptureStream;

        let index = self
            .free
            .pop_front()
            .ok_or_else(|| CaptureError::Dequeue("no buffers queued".to_string()))?;
        let mut slot = std::mem::take(&mut self.staging[index]);
        let copied = self.with_stream(|stream| {
            let (buf, _meta) = stream.next()?;
            let n = buf.len().min(slot.len());
            slot[..n].copy_from_slice(&buf[..n]);
            Ok(())
        });
        self.staging[index] = slot;
        if let Err(err) = copied {
            self.free.push_front(index);
            return Err(CaptureError::Dequeue(err.to_string()));
        }
        Ok(index)
    }

    fn buffer(&self, index: usize) -> Option<&[u8]> {
        match self.mapped.get(index) {
            Some(true) => self.staging.get(index).map(Vec::as_slice),
            _ => None,
        }
    }

    fn control(&self, control: Control) -> Result<i32, CaptureError> {
        let device = self.device().ok_or(CaptureError::NotConfigured)?;
        let value = device
            .control(control_id(control))
            .map_err(|err| CaptureError::Control {
                control,
                reason: err.to_string(),
            })?;
        match value.value {
            v4l::control::Value::Integer(v) => Ok(v as i32),
            v4l::control::Value::Boolean(b) => Ok(b as i32),
            other => Err(CaptureError::Control {
                control,
                reason: format!("unexpected value {:?}", other),
            }),
        }
    }

    fn set_control(&mut self, control: Control, value: i32) -> Result<(), CaptureError> {
        let device = self.device().ok_or(CaptureError::NotConfigured)?;
        device
            .set_control(v4l::Control {
                id: control_id(control),
                value: v4l::control::Value::Integer(value as i64),
            })
            .map_err(|err| CaptureError::Control {
                control,
                reason: err.to_string(),
            })
    }
}
