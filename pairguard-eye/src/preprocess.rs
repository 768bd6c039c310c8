//! Frame to model tensor conversion

use crate::error::VisionError;
use image::{imageops, imageops::FilterType, RgbImage};
use pairguard_core::Frame;

/// Resize a BGR frame to `(width, height)` and lay it out as a normalized RGB CHW tensor
pub fn frame_to_chw_tensor(frame: &Frame, width: u32, height: u32) -> Result<Vec<f32>, VisionError> {
    if width == 0 || height == 0 {
        return Err(VisionError::Processing("Target dimensions cannot be zero".to_string()));
    }
    if frame.channels != 3 || frame.expected_len() != Some(frame.data.len()) {
        return Err(VisionError::Processing(format!(
            "cannot convert {:?} to a tensor",
            frame
        )));
    }

    let mut rgb = frame.data.clone();
    for pixel in rgb.chunks_exact_mut(3) {
        pixel.swap(0, 2);
    }
    let image = RgbImage::from_raw(frame.width, frame.height, rgb)
        .ok_or_else(|| VisionError::Processing("frame buffer too small".to_string()))?;
    let resized = if image.dimensions() == (width, height) {
        image
    } else {
        imageops::resize(&image, width, height, FilterType::Triangle)
    };

    let plane = (width * height) as usize;
    let mut tensor = vec![0.0f32; plane * 3];
    for (i, pixel) in resized.pixels().enumerate() {
        for c in 0..3 {
            tensor[c * plane + i] = pixel[c] as f32 / 255.0;
        }
    }
    Ok(tensor)
}
