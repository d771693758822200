//! Face region → classifier tile.
//!
//! Crops a face region out of an RGB frame, resizes it to 48×48 with bilinear
//! crop-and-resize sampling (the same sampling the classifier was trained
//! with), collapses it to one channel by plain channel mean and scales it to
//! [0, 1].

use crate::buffers::{BufferTracker, TrackedBuffer};
use crate::types::FaceRegion;
use ndarray::Array4;

/// Side length of the classifier input tile.
pub const TILE_SIZE: usize = 48;

/// Fractional context margin added on each side of the detector box.
const CONTEXT_MARGIN: f32 = 0.03;
const PIXEL_SCALE: f32 = 1.0 / 255.0;
const RGB_CHANNELS: usize = 3;

/// Single-channel 48×48 tile in NHWC layout `[1, 48, 48, 1]`, values in [0, 1].
#[derive(Debug)]
pub struct NormalizedTile {
    tensor: TrackedBuffer<Array4<f32>>,
}

impl NormalizedTile {
    /// Build a tile from 48×48 row-major 8-bit grayscale pixels.
    ///
    /// Returns `None` if `pixels` is not exactly `48 * 48` long.
    pub fn from_gray_pixels(pixels: &[u8], tracker: &BufferTracker) -> Option<Self> {
        if pixels.len() != TILE_SIZE * TILE_SIZE {
            return None;
        }
        let mut tensor = Array4::<f32>::zeros((1, TILE_SIZE, TILE_SIZE, 1));
        for (dst, &p) in tensor.iter_mut().zip(pixels) {
            *dst = p as f32 * PIXEL_SCALE;
        }
        Some(Self {
            tensor: tracker.track(tensor),
        })
    }

    pub fn as_array(&self) -> &Array4<f32> {
        &self.tensor
    }

    pub fn pixel(&self, y: usize, x: usize) -> f32 {
        self.tensor[[0, y, x, 0]]
    }

    pub fn values(&self) -> impl Iterator<Item = f32> + '_ {
        self.tensor.iter().copied()
    }
}

/// Crop box in fractional image coordinates, each edge in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropBox {
    pub y1: f32,
    pub x1: f32,
    pub y2: f32,
    pub x2: f32,
}

impl CropBox {
    /// Fractional box for `region`, widened by the context margin and clamped.
    pub fn for_region(region: &FaceRegion, width: u32, height: u32) -> Option<Self> {
        if width == 0 || height == 0 || !region.is_valid() {
            return None;
        }
        let (w, h) = (width as f32, height as f32);
        Some(Self {
            y1: (region.y / h - CONTEXT_MARGIN).clamp(0.0, 1.0),
            x1: (region.x / w - CONTEXT_MARGIN).clamp(0.0, 1.0),
            y2: (region.bottom() / h + CONTEXT_MARGIN).clamp(0.0, 1.0),
            x2: (region.right() / w + CONTEXT_MARGIN).clamp(0.0, 1.0),
        })
    }
}

/// Converts face regions into classifier tiles, tracking every intermediate buffer.
#[derive(Debug, Clone, Default)]
pub struct RegionPreprocessor {
    tracker: BufferTracker,
}

impl RegionPreprocessor {
    pub fn new(tracker: BufferTracker) -> Self {
        Self { tracker }
    }

    pub fn tracker(&self) -> &BufferTracker {
        &self.tracker
    }

    /// Prepare the classifier tile for `region` in an RGB24 frame.
    ///
    /// Returns `None` ("undetectable") when the frame has no pixels yet, the
    /// buffer is shorter than `width * height * 3`, or the region is degenerate.
    /// Intermediates are released before returning on every path; only the
    /// returned tile stays live.
    pub fn prepare(
        &self,
        rgb: &[u8],
        width: u32,
        height: u32,
        region: &FaceRegion,
    ) -> Option<NormalizedTile> {
        let (w, h) = (width as usize, height as usize);
        if w == 0 || h == 0 {
            tracing::trace!("frame has zero dimensions; region undetectable");
            return None;
        }
        if rgb.len() < w * h * RGB_CHANNELS {
            tracing::debug!(
                expected = w * h * RGB_CHANNELS,
                actual = rgb.len(),
                "frame buffer too short; region undetectable"
            );
            return None;
        }
        let crop = CropBox::for_region(region, width, height)?;

        let resized = self
            .tracker
            .track(crop_and_resize(rgb, w, h, &crop, TILE_SIZE));
        let gray = self.tracker.track(channel_mean(&resized));

        let mut tensor = Array4::<f32>::zeros((1, TILE_SIZE, TILE_SIZE, 1));
        for (dst, &g) in tensor.iter_mut().zip(gray.iter()) {
            *dst = g * PIXEL_SCALE;
        }

        Some(NormalizedTile {
            tensor: self.tracker.track(tensor),
        })
    }
}

/// Bilinear crop-and-resize of an interleaved RGB image to `out_size`².
///
/// Sample positions follow `in = y1 * (H - 1) + i * (y2 - y1) * (H - 1) / (out - 1)`;
/// positions outside the image sample as 0.
fn crop_and_resize(rgb: &[u8], width: usize, height: usize, crop: &CropBox, out_size: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; out_size * out_size * RGB_CHANNELS];
    let max_y = (height - 1) as f32;
    let max_x = (width - 1) as f32;

    let step = |lo: f32, hi: f32, max: f32| -> f32 {
        if out_size > 1 {
            (hi - lo) * max / (out_size - 1) as f32
        } else {
            0.0
        }
    };
    let y_step = step(crop.y1, crop.y2, max_y);
    let x_step = step(crop.x1, crop.x2, max_x);
    let y_origin = if out_size > 1 { crop.y1 * max_y } else { 0.5 * (crop.y1 + crop.y2) * max_y };
    let x_origin = if out_size > 1 { crop.x1 * max_x } else { 0.5 * (crop.x1 + crop.x2) * max_x };

    let pixel = |y: usize, x: usize, c: usize| rgb[(y * width + x) * RGB_CHANNELS + c] as f32;

    for oy in 0..out_size {
        let in_y = y_origin + oy as f32 * y_step;
        if in_y < 0.0 || in_y > max_y {
            continue;
        }
        let top = in_y.floor() as usize;
        let bottom = in_y.ceil() as usize;
        let y_lerp = in_y - top as f32;

        for ox in 0..out_size {
            let in_x = x_origin + ox as f32 * x_step;
            if in_x < 0.0 || in_x > max_x {
                continue;
            }
            let left = in_x.floor() as usize;
            let right = in_x.ceil() as usize;
            let x_lerp = in_x - left as f32;

            let base = (oy * out_size + ox) * RGB_CHANNELS;
            for c in 0..RGB_CHANNELS {
                let tl = pixel(top, left, c);
                let tr = pixel(top, right, c);
                let bl = pixel(bottom, left, c);
                let br = pixel(bottom, right, c);
                let upper = tl + (tr - tl) * x_lerp;
                let lower = bl + (br - bl) * x_lerp;
                out[base + c] = upper + (lower - upper) * y_lerp;
            }
        }
    }

    out
}

/// Unweighted mean of the three color channels per pixel.
fn channel_mean(rgb: &[f32]) -> Vec<f32> {
    rgb.chunks_exact(RGB_CHANNELS)
        .map(|px| (px[0] + px[1] + px[2]) / RGB_CHANNELS as f32)
        .collect()
}
