//! Caller-owned thermal frame storage

use crate::packet::{FRAME_HEIGHT, FRAME_WIDTH};

/// A 160x120 16-bit grayscale thermal image
///
/// Allocate once with [`FrameImage::new`] and reuse it across
/// [`LeptonSession::retrieve_frame`](crate::session::LeptonSession::retrieve_frame)
/// calls to keep the frame path free of allocations.
#[derive(Clone, PartialEq, Eq)]
pub struct FrameImage {
    pixels: Box<[u16]>,
}

impl FrameImage {
    /// Frame width in pixels
    pub const WIDTH: usize = FRAME_WIDTH;
    /// Frame height in pixels
    pub const HEIGHT: usize = FRAME_HEIGHT;

    /// Create a zeroed frame
    pub fn new() -> Self {
        Self {
            pixels: vec![0u16; FRAME_WIDTH * FRAME_HEIGHT].into_boxed_slice(),
        }
    }

    /// Pixel value at column `x`, row `y`, or `None` if out of bounds
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> Option<u16> {
        if x >= FRAME_WIDTH || y >= FRAME_HEIGHT {
            return None;
        }
        Some(self.pixels[y * FRAME_WIDTH + x])
    }

    /// One image row, or `None` if out of bounds
    pub fn row(&self, y: usize) -> Option<&[u16]> {
        let start = y.checked_mul(FRAME_WIDTH)?;
        self.pixels.get(start..start + FRAME_WIDTH)
    }

    /// All pixels in row-major order
    pub fn pixels(&self) -> &[u16] {
        &self.pixels
    }

    /// Mutable pixels in row-major order
    pub fn pixels_mut(&mut self) -> &mut [u16] {
        &mut self.pixels
    }

    /// Minimum and maximum pixel values
    pub fn min_max(&self) -> (u16, u16) {
        self.pixels
            .iter()
            .fold((u16::MAX, u16::MIN), |(lo, hi), &p| (lo.min(p), hi.max(p)))
    }
}

impl Default for FrameImage {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FrameImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (min, max) = self.min_max();
        f.debug_struct("FrameImage")
            .field("width", &FRAME_WIDTH)
            .field("height", &FRAME_HEIGHT)
            .field("min", &min)
            .field("max", &max)
            .finish()
    }
}
