//! Letterbox preprocessing for the square detector input.

use crate::detector::DetectorError;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;

const DETECTOR_MEAN: f32 = 127.5;
const DETECTOR_STD: f32 = 128.0;

/// Scale and padding applied when fitting an image into the `target × target` canvas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: u32,
    pub pad_y: u32,
    pub resized_width: u32,
    pub resized_height: u32,
    pub source_width: u32,
    pub source_height: u32,
    pub target: u32,
}

impl Letterbox {
    /// `None` for an empty source or target.
    pub fn compute(source_width: u32, source_height: u32, target: u32) -> Option<Self> {
        if source_width == 0 || source_height == 0 || target == 0 {
            return None;
        }

        let scale_w = target as f32 / source_width as f32;
        let scale_h = target as f32 / source_height as f32;
        let scale = scale_w.min(scale_h);

        let resized_width = ((source_width as f32 * scale).round() as u32).clamp(1, target);
        let resized_height = ((source_height as f32 * scale).round() as u32).clamp(1, target);

        Some(Self {
            scale,
            pad_x: (target - resized_width) / 2,
            pad_y: (target - resized_height) / 2,
            resized_width,
            resized_height,
            source_width,
            source_height,
            target,
        })
    }

    /// Original-image point to canvas point.
    pub fn to_canvas(&self, x: f32, y: f32) -> (f32, f32) {
        (
            x * self.scale + self.pad_x as f32,
            y * self.scale + self.pad_y as f32,
        )
    }

    /// Canvas point back to original-image point.
    pub fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// Resize `image` into a `1×3×T×T` NCHW tensor, RGB order, normalized to
/// the SCRFD input distribution. Padding normalizes to 0.0.
pub fn letterbox(image: &RgbImage, target: u32) -> Result<(Array4<f32>, Letterbox), DetectorError> {
    let lb = Letterbox::compute(image.width(), image.height(), target)
        .ok_or(DetectorError::EmptyImage)?;

    let resized = imageops::resize(image, lb.resized_width, lb.resized_height, FilterType::Triangle);

    let t = target as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, t, t));
    let (px, py) = (lb.pad_x as usize, lb.pad_y as usize);

    for (x, y, pixel) in resized.enumerate_pixels() {
        let (cx, cy) = (x as usize + px, y as usize + py);
        for c in 0..3 {
            tensor[[0, c, cy, cx]] = (pixel[c] as f32 - DETECTOR_MEAN) / DETECTOR_STD;
        }
    }

    Ok((tensor, lb))
}
