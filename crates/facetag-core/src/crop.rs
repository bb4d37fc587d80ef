//! Crop and tensor helpers shared by the embedding encoders.

use crate::recognizer::RecognizerError;
use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;

/// Integer pixel rectangle `(x, y, w, h)` of `region` clamped to the image.
/// Regions thinner than `min_px` after clamping are degenerate.
pub fn pixel_region(
    image: &RgbImage,
    region: &BoundingBox,
    min_px: u32,
) -> Result<(u32, u32, u32, u32), RecognizerError> {
    let clamped = region.clamp_to(image.width(), image.height());

    let x0 = clamped.left.floor() as u32;
    let y0 = clamped.top.floor() as u32;
    let x1 = (clamped.right().ceil() as u32).min(image.width());
    let y1 = (clamped.bottom().ceil() as u32).min(image.height());
    let (w, h) = (x1.saturating_sub(x0), y1.saturating_sub(y0));

    if w < min_px.max(1) || h < min_px.max(1) {
        return Err(RecognizerError::DegenerateCrop {
            width: w,
            height: h,
            min: min_px,
        });
    }
    Ok((x0, y0, w, h))
}

/// Cut `region` out of `image` and resize it to `width × height`.
pub fn crop_resized(
    image: &RgbImage,
    region: &BoundingBox,
    min_px: u32,
    width: u32,
    height: u32,
) -> Result<RgbImage, RecognizerError> {
    let (x, y, w, h) = pixel_region(image, region, min_px)?;
    let view = imageops::crop_imm(image, x, y, w, h).to_image();
    Ok(imageops::resize(&view, width, height, FilterType::Triangle))
}

/// RGB image to a `1×3×H×W` tensor with per-channel `(p - mean) / std`.
pub fn to_nchw(image: &RgbImage, mean: [f32; 3], std: [f32; 3]) -> Array4<f32> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - mean[c]) / std[c];
        }
    }
    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_crop_clamps_and_resizes() {
        let image = RgbImage::from_pixel(100, 80, Rgb([10, 20, 30]));
        let region = BoundingBox::from_corners(-20.0, 40.0, 50.0, 200.0);
        let crop = crop_resized(&image, &region, 8, 32, 64).unwrap();
        assert_eq!(crop.dimensions(), (32, 64));
        assert_eq!(crop.get_pixel(5, 5), &Rgb([10, 20, 30]));
    }

    #[test]
    fn test_degenerate_crop() {
        let image = RgbImage::new(100, 100);
        let region = BoundingBox::from_corners(95.0, 10.0, 130.0, 60.0);
        let err = crop_resized(&image, &region, 8, 112, 112).unwrap_err();
        assert!(matches!(err, RecognizerError::DegenerateCrop { width: 5, .. }));
    }

    #[test]
    fn test_to_nchw_per_channel() {
        let image = RgbImage::from_pixel(4, 2, Rgb([255, 0, 128]));
        let t = to_nchw(&image, [127.5; 3], [127.5; 3]);
        assert_eq!(t.shape(), &[1, 3, 2, 4]);
        assert!((t[[0, 0, 1, 3]] - 1.0).abs() < 1e-6);
        assert!((t[[0, 1, 0, 0]] + 1.0).abs() < 1e-6);
    }
}
