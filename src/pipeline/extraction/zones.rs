//! Zone fingerprinting: text and perceptual hash of each zone on a document.
//!
//! Zones arrive in the displayed frame. Word lookup happens on the rotated
//! (native) box, while raster crops for OCR and hashing use the box as drawn,
//! matching how the rasterizer addresses the page.

use std::collections::HashMap;
use std::io::Cursor;

use image::ImageOutputFormat;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::hash::perceptual_hash;
use super::types::{OcrEngine, PdfDocument, WordBox};
use super::ExtractionError;
use crate::config::{BOUNDS_TOLERANCE, HASH_DPI, OCR_DPI};
use crate::pipeline::layout::BBox;
use crate::pipeline::template::ZoneId;

/// Words touching the zone edge count as inside it.
const WORD_OVERLAP_TOLERANCE: f32 = 0.0;

/// One zone to fingerprint on one page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoneInstance {
    pub zone_id: ZoneId,
    pub page: usize,
    pub bbox: BBox,
}

/// Live content of a zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveFingerprint {
    pub zone_id: ZoneId,
    /// Page after clamping into the document.
    pub page: usize,
    /// Box as drawn, displayed frame.
    pub bbox: BBox,
    /// Box after the page's rotation was applied; this is what gets redacted.
    pub transformed: BBox,
    pub text: String,
    pub image_hash: String,
    pub ocr_used: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Box leaves the page after rotation.
    OutOfBounds,
    /// Box has no area or non-finite coordinates.
    InvalidZone,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedZone {
    pub zone_id: ZoneId,
    pub page: usize,
    pub bbox: BBox,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneExtraction {
    /// In input order, minus skipped zones.
    pub fingerprints: Vec<LiveFingerprint>,
    pub skipped: Vec<SkippedZone>,
}

pub struct ZoneExtractor {
    ocr: Option<Box<dyn OcrEngine + Send + Sync>>,
    ocr_dpi: u32,
    hash_dpi: u32,
}

impl ZoneExtractor {
    pub fn new(ocr: Option<Box<dyn OcrEngine + Send + Sync>>) -> Self {
        Self {
            ocr,
            ocr_dpi: OCR_DPI,
            hash_dpi: HASH_DPI,
        }
    }

    /// Extractor that never falls back to OCR.
    pub fn text_only() -> Self {
        Self::new(None)
    }

    pub fn extract(
        &self,
        doc: &dyn PdfDocument,
        zones: &[ZoneInstance],
    ) -> Result<ZoneExtraction, ExtractionError> {
        let page_count = doc.page_count();
        if page_count == 0 {
            return Err(ExtractionError::InvalidDocument("document has no pages".into()));
        }

        let mut out = ZoneExtraction::default();
        let mut words_by_page: HashMap<usize, Vec<WordBox>> = HashMap::new();

        for zone in zones {
            let page = zone.page.min(page_count - 1);
            let geometry = doc.page_geometry(page)?;
            let (native_w, native_h) = geometry.native_extent();
            let transformed = geometry.to_native(&zone.bbox);

            let reason = if !zone.bbox.has_positive_area() {
                Some(SkipReason::InvalidZone)
            } else if !transformed.fits_within(native_w, native_h, BOUNDS_TOLERANCE) {
                Some(SkipReason::OutOfBounds)
            } else {
                None
            };
            if let Some(reason) = reason {
                warn!(
                    zone_id = %zone.zone_id,
                    page,
                    bbox = %zone.bbox,
                    rotation = geometry.rotation,
                    reason = ?reason,
                    "Skipping zone"
                );
                out.skipped.push(SkippedZone {
                    zone_id: zone.zone_id,
                    page,
                    bbox: zone.bbox,
                    reason,
                });
                continue;
            }

            let words = match words_by_page.entry(page) {
                std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::hash_map::Entry::Vacant(e) => e.insert(doc.words(page)?),
            };
            let mut text = words
                .iter()
                .filter(|w| w.bbox.overlaps(&transformed, WORD_OVERLAP_TOLERANCE))
                .map(|w| w.text.as_str())
                .collect::<Vec<_>>()
                .join(" ")
                .trim()
                .to_string();

            let mut ocr_used = false;
            if text.is_empty() {
                if let Some(ocr) = &self.ocr {
                    ocr_used = true;
                    text = self.ocr_region(&**ocr, doc, page, &zone.bbox)?;
                }
            }

            let crop = doc.rasterize(page, &zone.bbox, self.hash_dpi)?;
            let image_hash = perceptual_hash(&crop);

            debug!(
                zone_id = %zone.zone_id,
                page,
                transformed = %transformed,
                text_len = text.len(),
                ocr_used,
                "Zone fingerprinted"
            );

            out.fingerprints.push(LiveFingerprint {
                zone_id: zone.zone_id,
                page,
                bbox: zone.bbox,
                transformed,
                text,
                image_hash,
                ocr_used,
            });
        }

        Ok(out)
    }

    /// OCR a crop; engine failures degrade to empty text.
    fn ocr_region(
        &self,
        ocr: &(dyn OcrEngine + Send + Sync),
        doc: &dyn PdfDocument,
        page: usize,
        bbox: &BBox,
    ) -> Result<String, ExtractionError> {
        let crop = doc.rasterize(page, bbox, self.ocr_dpi)?;
        let mut cursor = Cursor::new(Vec::new());
        crop.write_to(&mut cursor, ImageOutputFormat::Png)
            .map_err(|e| ExtractionError::ImageProcessing(format!("PNG encoding failed: {e}")))?;
        match ocr.ocr_image(&cursor.into_inner()) {
            Ok(result) => Ok(result.text.trim().to_string()),
            Err(e) => {
                warn!(page, bbox = %bbox, error = %e, "OCR fallback failed");
                Ok(String::new())
            }
        }
    }
}
