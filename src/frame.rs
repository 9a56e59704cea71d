//! Captured video frames.
//!
//! A `Frame` lives for one occupancy cycle: it is mapped to sub-images,
//! optionally written out as a screenshot, and dropped.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use image::RgbImage;

/// One decoded RGB8 frame.
#[derive(Debug)]
pub struct Frame {
    image: RgbImage,
    /// Wall-clock capture time, used for screenshot names and occupancy stamps.
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self {
            image,
            captured_at: Utc::now(),
        }
    }

    /// Wrap a tightly packed RGB buffer.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected_len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected_len {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected_len,
                width,
                height,
                pixels.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("pixel buffer does not fit {}x{}", width, height))?;
        Ok(Self::new(image))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rgb_checks_buffer_length() {
        assert!(Frame::from_rgb(vec![0; 12], 2, 2).is_ok());
        assert!(Frame::from_rgb(vec![0; 11], 2, 2).is_err());
    }

    #[test]
    fn short_buffer_error_names_sizes() {
        let err = Frame::from_rgb(vec![0; 5], 2, 1).unwrap_err();
        assert!(err.to_string().contains("expected 6 RGB bytes for 2x1"));
    }

    #[test]
    fn frame_reports_dimensions() {
        let frame = Frame::new(RgbImage::new(640, 480));
        assert_eq!(frame.width(), 640);
        assert_eq!(frame.height(), 480);
    }
}
