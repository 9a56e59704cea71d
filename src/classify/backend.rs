use anyhow::Result;
use image::RgbImage;

use crate::classify::result::PredictionResult;

/// Occupancy classifier.
///
/// Workers call `predict` concurrently from their own threads, so
/// implementations either hold no mutable state or synchronize internally.
/// The image is borrowed for the duration of the call only.
pub trait Classifier: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Classify one region's sub-image.
    fn predict(&self, image: &RgbImage) -> Result<PredictionResult>;

    /// Optional warm-up hook.
    fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}
