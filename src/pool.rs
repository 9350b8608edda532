//! Capture buffer pool.
//!
//! Owns the driver and the set of buffers mapped for the current capture
//! mode, and tracks who owns each buffer:
//! - `Owner::Driver`: queued, the driver may be writing into it
//! - `Owner::Application`: dequeued, readable through a `FrameView`
//!
//! `FrameView` is a move-only token. Pixel access goes through
//! `BufferPool::frame(&view)`, whose `RawFrame` borrows the pool, and
//! `release(view)` consumes the token. Reading after release is therefore a
//! compile error:
//!
//! ```compile_fail
//! use reader_vision::driver::{CaptureMode, SimConfig, SimDriver};
//! use reader_vision::pool::{BufferPool, ModeTable};
//!
//! fn main() -> anyhow::Result<()> {
//!     let driver = SimDriver::new(SimConfig::default());
//!     let mut pool = BufferPool::new(Box::new(driver), ModeTable::default());
//!     pool.configure(CaptureMode::Preview)?;
//!     let view = pool.acquire_next()?;
//!     let raw = pool.frame(&view)?;
//!     pool.release(view)?;
//!     let _ = raw.at(0, 0);
//!     Ok(())
//! }
//! ```
//!
//! The intended cycle copies out, then releases:
//!
//! ```
//! use reader_vision::bayer::demosaic_grey;
//! use reader_vision::driver::{CaptureMode, SimConfig, SimDriver};
//! use reader_vision::pool::{BufferPool, ModeTable};
//!
//! fn main() -> anyhow::Result<()> {
//!     let driver = SimDriver::new(SimConfig::default());
//!     let mut pool = BufferPool::new(Box::new(driver), ModeTable::default());
//!     pool.configure(CaptureMode::Preview)?;
//!     let view = pool.acquire_next()?;
//!     let grey = demosaic_grey(&pool.frame(&view)?, 2);
//!     pool.release(view)?;
//!     assert_eq!(grey.width, 160);
//!     Ok(())
//! }
//! ```

use crate::driver::{BayerPattern, CaptureDriver, CaptureMode, Control, FrameFormat, ModeRequest};
use crate::error::{CaptureError, Result};
use crate::frame::RawFrame;

pub const DEFAULT_PREVIEW_WIDTH: u32 = 640;
pub const DEFAULT_PREVIEW_HEIGHT: u32 = 480;
pub const DEFAULT_PREVIEW_BUFFERS: usize = 4;
pub const DEFAULT_FULL_WIDTH: u32 = 2592;
pub const DEFAULT_FULL_HEIGHT: u32 = 1944;
pub const DEFAULT_FULL_BUFFERS: usize = 2;

/// Geometry requested for each capture mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModeTable {
    pub preview: ModeSize,
    pub full: ModeSize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModeSize {
    pub width: u32,
    pub height: u32,
    pub buffers: usize,
}

impl Default for ModeTable {
    fn default() -> Self {
        Self {
            preview: ModeSize {
                width: DEFAULT_PREVIEW_WIDTH,
                height: DEFAULT_PREVIEW_HEIGHT,
                buffers: DEFAULT_PREVIEW_BUFFERS,
            },
            full: ModeSize {
                width: DEFAULT_FULL_WIDTH,
                height: DEFAULT_FULL_HEIGHT,
                buffers: DEFAULT_FULL_BUFFERS,
            },
        }
    }
}

impl ModeTable {
    pub fn request(&self, mode: CaptureMode) -> ModeRequest {
        let size = match mode {
            CaptureMode::Preview => self.preview,
            CaptureMode::FullResolution => self.full,
        };
        ModeRequest {
            mode,
            width: size.width,
            height: size.height,
            buffers: size.buffers,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Owner {
    Driver,
    Application,
}

/// One mapped driver buffer.
#[derive(Clone, Copy, Debug)]
pub struct FrameBuffer {
    pub index: usize,
    pub len: usize,
    owner: Owner,
}

impl FrameBuffer {
    pub fn owner(&self) -> Owner {
        self.owner
    }
}

/// Result of a successful `configure`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferSet {
    pub mode: CaptureMode,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub pattern: BayerPattern,
    pub count: usize,
}

/// Ownership token for one dequeued buffer. Not `Clone`: hand it back to
/// `BufferPool::release` exactly once.
#[must_use = "dequeued buffers must be released back to the pool"]
#[derive(Debug)]
pub struct FrameView {
    index: usize,
    generation: u64,
    sequence: u64,
}

impl FrameView {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Frames acquired since the pool was created, starting at 1.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

pub struct BufferPool {
    driver: Box<dyn CaptureDriver>,
    modes: ModeTable,
    buffers: Vec<FrameBuffer>,
    active: Option<BufferSet>,
    /// Bumped on every configure; views from older generations are stale.
    generation: u64,
    sequence: u64,
    streaming: bool,
    /// Buffers whose enqueue failed; retried before the next dequeue.
    pending_requeue: Vec<usize>,
}

impl BufferPool {
    pub fn new(driver: Box<dyn CaptureDriver>, modes: ModeTable) -> Self {
        Self {
            driver,
            modes,
            buffers: Vec::new(),
            active: None,
            generation: 0,
            sequence: 0,
            streaming: false,
            pending_requeue: Vec::new(),
        }
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    pub fn active(&self) -> Option<BufferSet> {
        self.active
    }

    pub fn modes(&self) -> &ModeTable {
        &self.modes
    }

    /// Tear down the current mapping and map a fresh buffer set for `mode`.
    ///
    /// Any error leaves the pool unconfigured; callers treat it as fatal.
    pub fn configure(&mut self, mode: CaptureMode) -> Result<BufferSet> {
        self.teardown()?;
        self.generation += 1;

        let request = self.modes.request(mode);
        let format = self.driver.set_format(&request)?;
        let pattern = validate_format(&format)?;

        let granted = self.driver.request_buffers(request.buffers)?;
        if granted == 0 {
            return Err(CaptureError::Driver {
                mode,
                reason: format!("driver granted 0 of {} buffers", request.buffers),
            });
        }
        if granted < request.buffers {
            log::warn!(
                "BufferPool: driver granted {} of {} {:?} buffers",
                granted,
                request.buffers,
                mode
            );
        }

        let frame_len = format.stride as usize * format.height as usize;
        let mut buffers = Vec::with_capacity(granted);
        for index in 0..granted {
            let len = self.driver.map_buffer(index)?;
            if len < frame_len {
                let _ = self.driver.release_buffers();
                return Err(CaptureError::Format {
                    width: format.width,
                    height: format.height,
                    reason: format!("buffer {} holds {} bytes, need {}", index, len, frame_len),
                });
            }
            buffers.push(FrameBuffer {
                index,
                len,
                owner: Owner::Driver,
            });
        }
        for buffer in &buffers {
            self.driver.enqueue(buffer.index).map_err(|err| CaptureError::Driver {
                mode,
                reason: format!("initial queue: {}", err),
            })?;
        }
        self.driver.start_streaming()?;
        self.streaming = true;
        self.buffers = buffers;

        let set = BufferSet {
            mode,
            width: format.width,
            height: format.height,
            stride: format.stride,
            pattern,
            count: granted,
        };
        self.active = Some(set);
        log::info!(
            "BufferPool: {:?} configured on {} ({}x{}, {} buffers, {:?})",
            mode,
            self.driver.name(),
            set.width,
            set.height,
            set.count,
            set.pattern
        );
        Ok(set)
    }

    /// Block until the driver hands back the oldest filled buffer.
    pub fn acquire_next(&mut self) -> Result<FrameView> {
        if self.active.is_none() {
            return Err(CaptureError::NotConfigured);
        }
        self.retry_requeue();

        let index = self.driver.dequeue()?;
        let buffer = self
            .buffers
            .get_mut(index)
            .ok_or_else(|| CaptureError::Dequeue(format!("unknown buffer index {}", index)))?;
        if buffer.owner == Owner::Application {
            return Err(CaptureError::Ownership(index));
        }
        buffer.owner = Owner::Application;
        self.sequence += 1;
        Ok(FrameView {
            index,
            generation: self.generation,
            sequence: self.sequence,
        })
    }

    /// Raw pixels of a dequeued buffer. The view must be from the current
    /// configuration.
    pub fn frame(&self, view: &FrameView) -> Result<RawFrame<'_>> {
        let set = self.check_view(view)?;
        let data = self
            .driver
            .buffer(view.index)
            .ok_or(CaptureError::NotConfigured)?;
        RawFrame::new(data, set.width, set.height, set.stride, set.pattern).map_err(|err| {
            CaptureError::Format {
                width: set.width,
                height: set.height,
                reason: err.to_string(),
            }
        })
    }

    /// Give the buffer back to the driver for refill.
    pub fn release(&mut self, view: FrameView) -> Result<()> {
        self.check_view(&view)?;
        match self.driver.enqueue(view.index) {
            Ok(()) => {
                self.buffers[view.index].owner = Owner::Driver;
                Ok(())
            }
            Err(err) => {
                log::warn!(
                    "BufferPool: enqueue of buffer {} failed, will retry: {}",
                    view.index,
                    err
                );
                self.pending_requeue.push(view.index);
                Err(err)
            }
        }
    }

    /// Stop streaming and unmap everything.
    pub fn shutdown(&mut self) -> Result<()> {
        self.teardown()
    }

    pub fn owner(&self, index: usize) -> Option<Owner> {
        self.buffers.get(index).map(FrameBuffer::owner)
    }

    /// Buffers currently held by the application.
    pub fn in_flight(&self) -> usize {
        self.buffers
            .iter()
            .filter(|b| b.owner == Owner::Application)
            .count()
    }

    pub fn control(&self, control: Control) -> Result<i32> {
        self.driver.control(control)
    }

    pub fn set_control(&mut self, control: Control, value: i32) -> Result<()> {
        self.driver.set_control(control, value)
    }

    fn check_view(&self, view: &FrameView) -> Result<BufferSet> {
        let set = self.active.ok_or(CaptureError::NotConfigured)?;
        if view.generation != self.generation {
            return Err(CaptureError::StaleView {
                index: view.index,
                view: view.generation,
                current: self.generation,
            });
        }
        match self.buffers.get(view.index) {
            Some(buffer) if buffer.owner == Owner::Application => Ok(set),
            _ => Err(CaptureError::Ownership(view.index)),
        }
    }

    fn retry_requeue(&mut self) {
        let pending = std::mem::take(&mut self.pending_requeue);
        for index in pending {
            match self.driver.enqueue(index) {
                Ok(()) => self.buffers[index].owner = Owner::Driver,
                Err(err) => {
                    log::debug!("BufferPool: requeue of {} still failing: {}", index, err);
                    self.pending_requeue.push(index);
                }
            }
        }
    }

    fn teardown(&mut self) -> Result<()> {
        if self.streaming {
            self.driver.stop_streaming()?;
            self.streaming = false;
        }
        if self.active.take().is_some() {
            if self.in_flight() > 0 {
                log::debug!(
                    "BufferPool: dropping {} unreleased buffers on teardown",
                    self.in_flight()
                );
            }
            self.driver.release_buffers()?;
        }
        self.buffers.clear();
        self.pending_requeue.clear();
        Ok(())
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            log::warn!("BufferPool: teardown on drop failed: {}", err);
        }
    }
}

fn validate_format(format: &FrameFormat) -> Result<BayerPattern> {
    let Some(pattern) = format.pattern else {
        return Err(CaptureError::Format {
            width: format.width,
            height: format.height,
            reason: "not 8-bit Bayer".to_string(),
        });
    };
    if format.width < 2 || format.height < 2 || format.stride < format.width {
        return Err(CaptureError::Format {
            width: format.width,
            height: format.height,
            reason: format!("stride {}", format.stride),
        });
    }
    Ok(pattern)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{SimConfig, SimDriver, SimHandle, SimScene};
    use std::collections::HashSet;

    fn small_modes() -> ModeTable {
        ModeTable {
            preview: ModeSize {
                width: 64,
                height: 48,
                buffers: 4,
            },
            full: ModeSize {
                width: 256,
                height: 192,
                buffers: 2,
            },
        }
    }

    fn sim_pool() -> (BufferPool, SimHandle) {
        let driver = SimDriver::new(SimConfig {
            scene: SimScene::Fixed(90),
            ..SimConfig::default()
        });
        let handle = driver.handle();
        (BufferPool::new(Box::new(driver), small_modes()), handle)
    }

    #[test]
    fn configure_maps_and_starts_streaming() -> anyhow::Result<()> {
        let (mut pool, sim) = sim_pool();
        let set = pool.configure(CaptureMode::Preview)?;
        assert_eq!((set.width, set.height, set.count), (64, 48, 4));
        assert!(sim.is_streaming());
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.owner(0), Some(Owner::Driver));
        Ok(())
    }

    #[test]
    fn acquire_never_repeats_an_index_without_release() -> anyhow::Result<()> {
        let (mut pool, _sim) = sim_pool();
        pool.configure(CaptureMode::Preview)?;

        let mut views = Vec::new();
        let mut seen = HashSet::new();
        for _ in 0..4 {
            let view = pool.acquire_next()?;
            assert!(seen.insert(view.index()), "index handed out twice");
            assert_eq!(pool.owner(view.index()), Some(Owner::Application));
            views.push(view);
        }
        // every buffer is application-owned: the driver has nothing to fill
        assert!(pool.acquire_next().is_err());

        let first = views.remove(0);
        let index = first.index();
        pool.release(first)?;
        assert_eq!(pool.owner(index), Some(Owner::Driver));
        let again = pool.acquire_next()?;
        assert_eq!(again.index(), index);
        pool.release(again)?;
        for view in views {
            pool.release(view)?;
        }
        assert_eq!(pool.in_flight(), 0);
        Ok(())
    }

    #[test]
    fn driver_returning_owned_buffer_is_rejected() -> anyhow::Result<()> {
        let (mut pool, sim) = sim_pool();
        pool.configure(CaptureMode::Preview)?;
        let held = pool.acquire_next()?;
        sim.duplicate_next_dequeue();
        match pool.acquire_next() {
            Err(CaptureError::Ownership(index)) => assert_eq!(index, held.index()),
            other => panic!("expected ownership error, got {:?}", other),
        }
        pool.release(held)?;
        Ok(())
    }

    #[test]
    fn frame_reads_buffer_contents() -> anyhow::Result<()> {
        let (mut pool, _sim) = sim_pool();
        pool.configure(CaptureMode::Preview)?;
        let view = pool.acquire_next()?;
        {
            let raw = pool.frame(&view)?;
            assert_eq!(raw.width, 64);
            assert_eq!(raw.at(5, 5), 90);
        }
        pool.release(view)?;
        Ok(())
    }

    #[test]
    fn views_from_previous_mode_are_stale() -> anyhow::Result<()> {
        let (mut pool, sim) = sim_pool();
        pool.configure(CaptureMode::Preview)?;
        let old = pool.acquire_next()?;
        let set = pool.configure(CaptureMode::FullResolution)?;
        assert_eq!(set.width, 256);
        assert_eq!(sim.mode(), Some(CaptureMode::FullResolution));
        assert!(matches!(pool.frame(&old), Err(CaptureError::StaleView { .. })));
        assert!(matches!(pool.release(old), Err(CaptureError::StaleView { .. })));
        Ok(())
    }

    #[test]
    fn configure_failures_are_fatal_errors() {
        let (mut pool, sim) = sim_pool();
        sim.set_max_buffers(0);
        let err = pool.configure(CaptureMode::Preview).unwrap_err();
        assert!(matches!(err, CaptureError::Driver { .. }));
        assert!(!err.is_transient());

        sim.set_max_buffers(8);
        sim.deliver_non_bayer(true);
        let err = pool.configure(CaptureMode::Preview).unwrap_err();
        assert!(matches!(err, CaptureError::Format { .. }));
        assert!(pool.active().is_none());
        assert!(matches!(pool.acquire_next(), Err(CaptureError::NotConfigured)));
    }

    #[test]
    fn dequeue_failures_are_transient() -> anyhow::Result<()> {
        let (mut pool, sim) = sim_pool();
        pool.configure(CaptureMode::Preview)?;
        sim.fail_dequeues(1);
        let err = pool.acquire_next().unwrap_err();
        assert!(err.is_transient());
        let view = pool.acquire_next()?;
        pool.release(view)?;
        Ok(())
    }

    #[test]
    fn shutdown_stops_the_stream() -> anyhow::Result<()> {
        let (mut pool, sim) = sim_pool();
        pool.configure(CaptureMode::Preview)?;
        pool.shutdown()?;
        assert!(!sim.is_streaming());
        assert!(pool.active().is_none());
        Ok(())
    }
}
