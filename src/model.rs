//! Stream and region configuration, and the per-region occupancy record.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::classify::PredictionResult;
use crate::error::MonitorError;

/// Position and size of a region on the floorplan image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FloorplanRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Crop box in frame-pixel space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CameraBox {
    /// Build a box from four independently optional values.
    ///
    /// Returns `None` unless all four are present, finite, the origin is
    /// non-negative and the size is positive after rounding to whole pixels.
    pub fn from_parts(
        x: Option<f64>,
        y: Option<f64>,
        width: Option<f64>,
        height: Option<f64>,
    ) -> Option<Self> {
        let (x, y, width, height) = (x?, y?, width?, height?);
        if ![x, y, width, height].iter().all(|v| v.is_finite()) {
            return None;
        }
        if x < 0.0 || y < 0.0 {
            return None;
        }
        let to_px = |v: f64| v.round().min(u32::MAX as f64) as u32;
        let cam = CameraBox {
            x: to_px(x),
            y: to_px(y),
            width: to_px(width),
            height: to_px(height),
        };
        if cam.width == 0 || cam.height == 0 {
            return None;
        }
        Some(cam)
    }
}

/// Region as it arrives from clients and config files: camera geometry is four
/// loose optional values.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RegionSpec {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(default)]
    pub camera_x: Option<f64>,
    #[serde(default)]
    pub camera_y: Option<f64>,
    #[serde(default)]
    pub camera_width: Option<f64>,
    #[serde(default)]
    pub camera_height: Option<f64>,
}

/// A configured seat or table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegionConfig {
    pub id: String,
    pub label: String,
    pub floorplan: FloorplanRect,
    pub camera: Option<CameraBox>,
}

impl RegionConfig {
    pub fn from_spec(spec: RegionSpec) -> Result<Self> {
        let id = spec.id.trim().to_string();
        if id.is_empty() {
            return Err(MonitorError::invalid_config("region id must not be empty").into());
        }
        let camera = CameraBox::from_parts(
            spec.camera_x,
            spec.camera_y,
            spec.camera_width,
            spec.camera_height,
        );
        let label = spec
            .label
            .filter(|label| !label.trim().is_empty())
            .unwrap_or_else(|| id.clone());
        Ok(Self {
            id,
            label,
            floorplan: FloorplanRect {
                x: spec.x,
                y: spec.y,
                width: spec.width,
                height: spec.height,
            },
            camera,
        })
    }
}

/// Request to monitor a new stream. The id is assigned by the supervisor.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct StreamRequest {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub regions: Option<Vec<RegionSpec>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub id: String,
    pub url: String,
    pub name: String,
    pub active: bool,
    pub regions: Vec<RegionConfig>,
    pub created_at: DateTime<Utc>,
}

impl StreamConfig {
    /// Validate region ids and the source address.
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(MonitorError::invalid_config("stream url is required").into());
        }
        let mut seen = HashSet::new();
        for region in &self.regions {
            if !seen.insert(region.id.as_str()) {
                return Err(MonitorError::invalid_config(format!(
                    "duplicate region id '{}' in stream {}",
                    region.id, self.id
                ))
                .into());
            }
        }
        Ok(())
    }
}

/// Latest classification of one region of one stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeatOccupancy {
    pub region_id: String,
    pub label: String,
    pub floorplan: FloorplanRect,
    pub camera: Option<CameraBox>,
    #[serde(flatten)]
    pub prediction: PredictionResult,
    pub last_updated: DateTime<Utc>,
}

impl SeatOccupancy {
    pub fn new(region: &RegionConfig, prediction: PredictionResult, at: DateTime<Utc>) -> Self {
        Self {
            region_id: region.id.clone(),
            label: region.label.clone(),
            floorplan: region.floorplan,
            camera: region.camera,
            prediction,
            last_updated: at,
        }
    }
}

/// Seats used when a stream is added without its own region layout.
pub fn demo_regions() -> Vec<RegionSpec> {
    [
        ("seat_1", 100.0, 150.0, "Table 1"),
        ("seat_2", 250.0, 150.0, "Table 2"),
        ("seat_3", 400.0, 150.0, "Table 3"),
        ("seat_4", 100.0, 300.0, "Table 4"),
        ("seat_5", 250.0, 300.0, "Table 5"),
        ("seat_6", 400.0, 300.0, "Table 6"),
    ]
    .into_iter()
    .map(|(id, x, y, label)| RegionSpec {
        id: id.to_string(),
        label: Some(label.to_string()),
        x,
        y,
        width: 80.0,
        height: 80.0,
        ..RegionSpec::default()
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn spec(id: &str, camera: [Option<f64>; 4]) -> RegionSpec {
        RegionSpec {
            id: id.to_string(),
            camera_x: camera[0],
            camera_y: camera[1],
            camera_width: camera[2],
            camera_height: camera[3],
            ..RegionSpec::default()
        }
    }

    #[test]
    fn camera_box_requires_all_four_values() {
        let full = RegionConfig::from_spec(spec(
            "r1",
            [Some(0.0), Some(0.0), Some(100.0), Some(100.0)],
        ))
        .unwrap();
        assert_eq!(
            full.camera,
            Some(CameraBox {
                x: 0,
                y: 0,
                width: 100,
                height: 100
            })
        );

        let partial =
            RegionConfig::from_spec(spec("r2", [Some(10.0), Some(10.0), None, Some(5.0)]))
                .unwrap();
        assert_eq!(partial.camera, None);
    }

    #[test]
    fn camera_box_rejects_degenerate_geometry() {
        assert_eq!(
            CameraBox::from_parts(Some(-1.0), Some(0.0), Some(10.0), Some(10.0)),
            None
        );
        assert_eq!(
            CameraBox::from_parts(Some(0.0), Some(0.0), Some(0.0), Some(10.0)),
            None
        );
        assert_eq!(
            CameraBox::from_parts(Some(0.0), Some(f64::NAN), Some(10.0), Some(10.0)),
            None
        );
    }

    #[test]
    fn label_defaults_to_region_id() {
        let region = RegionConfig::from_spec(spec("seat_9", [None; 4])).unwrap();
        assert_eq!(region.label, "seat_9");
    }

    #[test]
    fn duplicate_region_ids_are_rejected() {
        let region = RegionConfig::from_spec(spec("r1", [None; 4])).unwrap();
        let cfg = StreamConfig {
            id: "s1".to_string(),
            url: "stub://cam".to_string(),
            name: "cam".to_string(),
            active: true,
            regions: vec![region.clone(), region],
            created_at: Utc::now(),
        };
        let err = cfg.validate().unwrap_err();
        assert_eq!(
            MonitorError::kind_of(&err),
            Some(ErrorKind::InvalidStreamConfig)
        );
    }

    #[test]
    fn demo_regions_are_unique() {
        let ids: HashSet<_> = demo_regions().into_iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), 6);
    }
}
