//! Frame types.
//!
//! - `RawFrame`: borrowed 8-bit Bayer view over a pool buffer. Its lifetime is
//!   tied to the buffer pool, so it cannot outlive the buffer's release.
//! - `GreyFrame` / `ColorFrame`: owned images derived from a raw frame.
//! - `PreviewPyramid`: grey frames at full, half and quarter preview size.
//!
//! Owned frames are plain values. Anything handed to a consumer is a clone,
//! never a view into capture memory.

use anyhow::{anyhow, Context, Result};
use std::path::Path;

use crate::driver::{BayerPattern, CellSite};

// ----------------------------------------------------------------------------
// RawFrame: view over driver memory
// ----------------------------------------------------------------------------

/// Raw Bayer samples of one dequeued buffer.
///
/// There is no owned variant: copy out what you need through the Bayer
/// pipeline before the buffer is released.
#[derive(Clone, Copy, Debug)]
pub struct RawFrame<'a> {
    data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub pattern: BayerPattern,
}

impl<'a> RawFrame<'a> {
    pub fn new(
        data: &'a [u8],
        width: u32,
        height: u32,
        stride: u32,
        pattern: BayerPattern,
    ) -> Result<Self> {
        if stride < width {
            return Err(anyhow!("stride {} shorter than width {}", stride, width));
        }
        let needed = (stride as usize)
            .checked_mul(height as usize)
            .ok_or_else(|| anyhow!("raw frame dimensions overflow"))?;
        if data.len() < needed {
            return Err(anyhow!(
                "raw frame length mismatch: expected {}, got {}",
                needed,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            stride,
            pattern,
        })
    }

    /// Sample at raw coordinates. Callers stay in bounds.
    #[inline]
    pub fn at(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.stride as usize + x]
    }

    /// Sample of one site of the 2x2 cell whose top-left corner is `(x, y)`.
    #[inline]
    pub fn site(&self, x: usize, y: usize, site: CellSite) -> u8 {
        self.at(x + site.dx, y + site.dy)
    }
}

// ----------------------------------------------------------------------------
// Owned images
// ----------------------------------------------------------------------------

/// 8-bit grayscale image, row-major, no padding.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GreyFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl GreyFrame {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0u8; width as usize * height as usize],
        }
    }

    pub fn from_vec(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(anyhow!(
                "grey frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Frame filled by `f(x, y)`.
    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> u8) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    #[inline]
    pub fn at(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width as usize + x]
    }

    pub fn pixel_count(&self) -> usize {
        self.data.len()
    }

    pub fn same_size(&self, other: &GreyFrame) -> bool {
        self.width == other.width && self.height == other.height
    }

    pub fn mean(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&v| v as u64).sum::<u64>() as f32 / self.data.len() as f32
    }

    /// Write the frame as a baseline JPEG.
    pub fn save_jpeg(&self, path: &Path) -> Result<()> {
        let image = image::GrayImage::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| anyhow!("grey frame {}x{} has a short buffer", self.width, self.height))?;
        image
            .save_with_format(path, image::ImageFormat::Jpeg)
            .with_context(|| format!("write {}", path.display()))
    }
}

/// Interleaved RGB24 image.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ColorFrame {
    pub width: u32,
    pub height: u32,
    /// [R, G, B, R, G, B, ...]
    pub data: Vec<u8>,
}

impl ColorFrame {
    #[inline]
    pub fn rgb(&self, x: usize, y: usize) -> [u8; 3] {
        let offset = (y * self.width as usize + x) * 3;
        [
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
        ]
    }
}

/// Grey preview at three scales.
#[derive(Clone, Debug, Default)]
pub struct PreviewPyramid {
    pub full: GreyFrame,
    pub half: GreyFrame,
    pub quarter: GreyFrame,
}

/// Frame handed to the preview consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PreviewFrame {
    Grey(GreyFrame),
    Color(ColorFrame),
}
