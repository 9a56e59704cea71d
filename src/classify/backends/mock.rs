use anyhow::{anyhow, Result};
use image::RgbImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;

use crate::classify::backend::Classifier;
use crate::classify::result::{ClassLabels, PredictionResult};

/// Stand-in used when no model weights are available.
///
/// Picks a random class with a confidence in [0.7, 0.99] and marks the result
/// as mocked so clients can tell it apart from real inference.
pub struct MockClassifier {
    labels: ClassLabels,
    rng: Mutex<StdRng>,
}

impl MockClassifier {
    pub fn new(labels: ClassLabels) -> Self {
        Self {
            labels,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic sequence, for tests and demos.
    pub fn seeded(labels: ClassLabels, seed: u64) -> Self {
        Self {
            labels,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for MockClassifier {
    fn default() -> Self {
        Self::new(ClassLabels::default())
    }
}

impl Classifier for MockClassifier {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn predict(&self, _image: &RgbImage) -> Result<PredictionResult> {
        if self.labels.is_empty() {
            return Err(anyhow!("mock classifier has no class labels"));
        }
        let (class_index, confidence) = {
            let mut rng = self
                .rng
                .lock()
                .map_err(|_| anyhow!("mock classifier rng lock poisoned"))?;
            let index = rng.gen_range(0..self.labels.len());
            let confidence: f32 = rng.gen_range(0.7..0.99);
            (index, (confidence * 10_000.0).round() / 10_000.0)
        };
        Ok(PredictionResult::from_output(class_index, confidence, &self.labels).mocked())
    }
}
