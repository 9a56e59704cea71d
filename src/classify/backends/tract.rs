#![cfg(feature = "backend-tract")]

use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::classify::backend::Classifier;
use crate::classify::result::{ClassLabels, PredictionResult};

type Plan = TypedRunnableModel<TypedModel>;

/// Tract-based ONNX occupancy classifier.
///
/// Sub-images are resized to the model's square input, normalized to [0, 1]
/// in NCHW order, and the logits are turned into probabilities with softmax.
/// The plan sits behind a mutex so concurrent workers serialize on inference.
pub struct TractClassifier {
    plan: Mutex<Plan>,
    input_size: u32,
    labels: ClassLabels,
}

impl TractClassifier {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32, labels: ClassLabels) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let plan = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            plan: Mutex::new(plan),
            input_size,
            labels,
        })
    }

    fn build_input(&self, image: &RgbImage) -> Tensor {
        let side = self.input_size;
        let resized = if image.dimensions() == (side, side) {
            image.clone()
        } else {
            image::imageops::resize(image, side, side, FilterType::Triangle)
        };
        let side = side as usize;
        tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, channel, y, x)| {
            resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0
        })
        .into_tensor()
    }

    fn top_class(outputs: TVec<TValue>) -> Result<(usize, f32)> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let logits = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let logits: Vec<f32> = logits.iter().copied().collect();
        if logits.is_empty() {
            return Err(anyhow!("model produced an empty output"));
        }
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exp: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
        let sum: f32 = exp.iter().sum();
        let (index, best) = exp
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc });
        Ok((index, best / sum))
    }
}

impl Classifier for TractClassifier {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn predict(&self, image: &RgbImage) -> Result<PredictionResult> {
        if image.width() == 0 || image.height() == 0 {
            return Err(anyhow!("cannot classify an empty image"));
        }
        let input = self.build_input(image);
        let outputs = {
            let plan = self
                .plan
                .lock()
                .map_err(|_| anyhow!("tract plan lock poisoned"))?;
            plan.run(tvec!(input.into()))
                .context("ONNX inference failed")?
        };
        let (index, confidence) = Self::top_class(outputs)?;
        Ok(PredictionResult::from_output(
            index,
            (confidence * 10_000.0).round() / 10_000.0,
            &self.labels,
        ))
    }

    fn warm_up(&self) -> Result<()> {
        let blank = RgbImage::new(self.input_size, self.input_size);
        self.predict(&blank).map(|_| ())
    }
}
