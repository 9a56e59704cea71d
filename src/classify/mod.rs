mod backend;
mod backends;
mod result;

use anyhow::Result;
use std::sync::Arc;

pub use backend::Classifier;
pub use backends::MockClassifier;
#[cfg(feature = "backend-tract")]
pub use backends::TractClassifier;
pub use result::{ClassLabels, PredictionResult, DEFAULT_CLASS_NAMES, DEFAULT_OCCUPIED_INDEX};

use crate::config::ClassifierSettings;

/// Build the classifier described by the settings.
///
/// Without model weights (or without the `backend-tract` feature) this falls
/// back to the mock classifier, so the service still runs end to end.
pub fn load_classifier(settings: &ClassifierSettings) -> Result<Arc<dyn Classifier>> {
    let labels = ClassLabels::new(settings.class_names.clone(), settings.occupied_index);

    if let Some(path) = &settings.model_path {
        #[cfg(feature = "backend-tract")]
        {
            let classifier = TractClassifier::new(path, settings.input_size, labels)?;
            classifier.warm_up()?;
            log::info!("classifier: loaded ONNX model from {}", path.display());
            return Ok(Arc::new(classifier));
        }
        #[cfg(not(feature = "backend-tract"))]
        {
            log::warn!(
                "classifier: model {} configured but the backend-tract feature is off; using mock predictions",
                path.display()
            );
        }
    } else {
        log::info!("classifier: no model configured; using mock predictions");
    }

    Ok(Arc::new(MockClassifier::new(labels)))
}
