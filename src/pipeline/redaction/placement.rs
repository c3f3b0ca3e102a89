//! Substitute-image placement into redacted template zones.

use std::path::{Path, PathBuf};

use image::GenericImageView;
use tracing::{debug, warn};

use crate::pipeline::extraction::{ExtractionError, PdfDocument};
use crate::pipeline::layout::{normalize_rotation, BBox};
use crate::pipeline::template::ZoneId;

/// One image to draw into a zone instance, in the page's native frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePlacement {
    pub page: usize,
    pub zone_id: ZoneId,
    pub bbox: BBox,
    pub image_ref: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlacementOutcome {
    Placed { bbox: BBox },
    Failed { reason: String },
}

/// Largest box with the image's aspect ratio that fits `zone`, centred in it.
///
/// On pages rotated by 90 or 270 degrees the image is drawn rotated, so the
/// effective ratio is inverted.
pub fn fit_image(zone: &BBox, image_width: u32, image_height: u32, rotation: i32) -> BBox {
    if image_width == 0 || image_height == 0 || !zone.has_positive_area() {
        return *zone;
    }
    let ratio = image_width as f32 / image_height as f32;
    let effective = match normalize_rotation(rotation) {
        90 | 270 => 1.0 / ratio,
        _ => ratio,
    };

    let (bw, bh) = (zone.width(), zone.height());
    let (nw, nh) = if bw / bh > effective {
        (bh * effective, bh)
    } else {
        (bw, bw / effective)
    };
    let x0 = zone.x0 + (bw - nw) / 2.0;
    let y0 = zone.y0 + (bh - nh) / 2.0;
    BBox::new(x0, y0, x0 + nw, y0 + nh)
}

/// Absolute refs are used as-is; relative refs resolve against `image_root`.
pub fn resolve_image_path(image_root: Option<&Path>, image_ref: &str) -> PathBuf {
    let path = Path::new(image_ref);
    match image_root {
        Some(root) if path.is_relative() => root.join(path),
        _ => path.to_path_buf(),
    }
}

fn place_one(
    doc: &mut dyn PdfDocument,
    placement: &ImagePlacement,
    image_root: Option<&Path>,
) -> Result<BBox, ExtractionError> {
    let path = resolve_image_path(image_root, &placement.image_ref);
    let bytes = std::fs::read(&path)?;
    let (w, h) = image::load_from_memory(&bytes)
        .map_err(|e| ExtractionError::ImageProcessing(format!("{}: {e}", path.display())))?
        .dimensions();
    let rotation = doc.page_geometry(placement.page)?.rotation;
    let target = fit_image(&placement.bbox, w, h, rotation);
    doc.draw_image(placement.page, &target, &bytes, rotation)?;
    Ok(target)
}

/// Draw every placement. A missing or unreadable image never fails the
/// document; it is logged and reported as `Failed`.
pub fn place_images(
    doc: &mut dyn PdfDocument,
    placements: &[ImagePlacement],
    image_root: Option<&Path>,
) -> Vec<PlacementOutcome> {
    placements
        .iter()
        .map(|placement| match place_one(doc, placement, image_root) {
            Ok(bbox) => {
                debug!(page = placement.page, zone_id = %placement.zone_id, bbox = %bbox, "Image placed");
                PlacementOutcome::Placed { bbox }
            }
            Err(e) => {
                warn!(
                    page = placement.page,
                    zone_id = %placement.zone_id,
                    image = %placement.image_ref,
                    error = %e,
                    "Image placement failed"
                );
                PlacementOutcome::Failed { reason: e.to_string() }
            }
        })
        .collect()
}
