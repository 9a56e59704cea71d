use serde::{Deserialize, Serialize};

/// Default label table: index 2 means a person is at the seat.
pub const DEFAULT_CLASS_NAMES: [&str; 3] = ["Unoccupied", "Unattended", "Occupied"];
pub const DEFAULT_OCCUPIED_INDEX: usize = 2;

/// Class names a model's output indices refer to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassLabels {
    names: Vec<String>,
    occupied_index: usize,
}

impl ClassLabels {
    pub fn new(names: Vec<String>, occupied_index: usize) -> Self {
        Self {
            names,
            occupied_index,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn occupied_index(&self) -> usize {
        self.occupied_index
    }
}

impl Default for ClassLabels {
    fn default() -> Self {
        Self::new(
            DEFAULT_CLASS_NAMES.iter().map(|s| s.to_string()).collect(),
            DEFAULT_OCCUPIED_INDEX,
        )
    }
}

/// Classification of one sub-image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub class_index: usize,
    #[serde(rename = "status")]
    pub class_name: String,
    pub confidence: f32,
    pub is_occupied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub is_mock: bool,
}

impl PredictionResult {
    /// Build a result from raw model output.
    ///
    /// Confidence is clamped into [0, 1]. An index missing from the label table
    /// or a non-finite confidence is kept but flagged through `error`.
    pub fn from_output(class_index: usize, confidence: f32, labels: &ClassLabels) -> Self {
        let mut error = None;
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            error = Some(format!("non-finite confidence {}", confidence));
            0.0
        };
        let class_name = match labels.name(class_index) {
            Some(name) => name.to_string(),
            None => {
                error = Some(format!(
                    "class index {} outside label table of {}",
                    class_index,
                    labels.len()
                ));
                "Unknown".to_string()
            }
        };
        let is_occupied = error.is_none() && class_index == labels.occupied_index();
        Self {
            class_index,
            class_name,
            confidence,
            is_occupied,
            error,
            is_mock: false,
        }
    }

    pub fn mocked(mut self) -> Self {
        self.is_mock = true;
        self
    }
}
