//! Region-to-subimage mapping.
//!
//! Each configured region becomes exactly one sub-image: its camera box cropped
//! out of the frame when the box survives clamping, otherwise the whole frame.

use image::RgbImage;

use crate::frame::Frame;
use crate::model::{CameraBox, RegionConfig};

/// A region paired with the pixels its classifier call will see.
pub struct MappedRegion<'a> {
    pub region: &'a RegionConfig,
    pub image: RgbImage,
    /// Crop actually applied, `None` when the whole frame was used.
    pub crop: Option<CameraBox>,
}

/// Clamp a camera box to the frame. `None` when nothing of it remains.
pub fn clamp_to_frame(camera: CameraBox, frame_width: u32, frame_height: u32) -> Option<CameraBox> {
    let x0 = camera.x.min(frame_width);
    let y0 = camera.y.min(frame_height);
    let x1 = camera.x.saturating_add(camera.width).min(frame_width);
    let y1 = camera.y.saturating_add(camera.height).min(frame_height);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(CameraBox {
        x: x0,
        y: y0,
        width: x1 - x0,
        height: y1 - y0,
    })
}

/// Map every region to a sub-image. Never fails.
pub fn map_regions<'a>(frame: &Frame, regions: &'a [RegionConfig]) -> Vec<MappedRegion<'a>> {
    regions
        .iter()
        .map(|region| {
            let crop = region
                .camera
                .and_then(|camera| clamp_to_frame(camera, frame.width(), frame.height()));
            let image = match crop {
                Some(b) => {
                    image::imageops::crop_imm(frame.image(), b.x, b.y, b.width, b.height)
                        .to_image()
                }
                None => frame.image().clone(),
            };
            MappedRegion {
                region,
                image,
                crop,
            }
        })
        .collect()
}
