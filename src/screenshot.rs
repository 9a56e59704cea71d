//! Screenshot artifacts: one JPEG per successful capture.

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::frame::Frame;

pub trait ScreenshotSink: Send + Sync {
    /// Persist `frame` for `stream_id`; returns where it was written.
    fn save(&self, stream_id: &str, frame: &Frame) -> Result<PathBuf>;
}

/// Writes `{stream_id}_{YYYYmmdd_HHMMSS}.jpg` into a directory.
pub struct DirectoryScreenshotSink {
    root: PathBuf,
}

impl DirectoryScreenshotSink {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("create screenshot directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, stream_id: &str, frame: &Frame) -> Result<PathBuf> {
        if stream_id.is_empty()
            || !stream_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(anyhow!("stream id '{}' is not usable in a file name", stream_id));
        }
        let stamp = frame.captured_at.format("%Y%m%d_%H%M%S");
        Ok(self.root.join(format!("{}_{}.jpg", stream_id, stamp)))
    }
}

impl ScreenshotSink for DirectoryScreenshotSink {
    fn save(&self, stream_id: &str, frame: &Frame) -> Result<PathBuf> {
        let path = self.path_for(stream_id, frame)?;
        frame
            .image()
            .save_with_format(&path, image::ImageFormat::Jpeg)
            .with_context(|| format!("write screenshot {}", path.display()))?;
        log::debug!("screenshot saved: {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use image::RgbImage;

    #[test]
    fn names_are_deterministic() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = DirectoryScreenshotSink::new(dir.path().join("shots"))?;
        let mut frame = Frame::new(RgbImage::new(4, 4));
        frame.captured_at = chrono::Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let path = sink.path_for("a1b2c3d4", &frame)?;
        assert_eq!(
            path.file_name().and_then(|n| n.to_str()),
            Some("a1b2c3d4_20240309_140507.jpg")
        );
        Ok(())
    }

    #[test]
    fn saves_decodable_jpeg() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = DirectoryScreenshotSink::new(dir.path())?;
        let frame = Frame::new(RgbImage::from_pixel(8, 6, image::Rgb([10, 200, 30])));
        let path = sink.save("cam1", &frame)?;
        let reread = image::open(&path)?;
        assert_eq!((reread.width(), reread.height()), (8, 6));
        Ok(())
    }

    #[test]
    fn rejects_path_like_stream_ids() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = DirectoryScreenshotSink::new(dir.path())?;
        let frame = Frame::new(RgbImage::new(1, 1));
        assert!(sink.path_for("../etc", &frame).is_err());
        Ok(())
    }
}
