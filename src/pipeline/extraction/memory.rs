//! In-memory document engine.
//!
//! Documents are JSON fixtures: displayed page size, rotation, and styled word
//! boxes in the native frame. Redaction deletes every word a committed mark
//! intersects; drawn text becomes a new word, so a saved fixture can be
//! reopened and searched like real output. Rasterization paints word boxes onto
//! a white canvas, which is enough for perceptual hashes to track content.

use std::path::Path;

use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use super::types::{PageGeometry, PdfDocument, PdfEngine, TextSpan, TextStyle, WordBox};
use super::ExtractionError;
use crate::pipeline::layout::{normalize_rotation, BBox};

const POINTS_PER_INCH: f32 = 72.0;
const MAX_DIMENSION_PX: u32 = 4096;

/// Average glyph advance as a fraction of the font size.
const GLYPH_WIDTH_RATIO: f32 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryWord {
    pub bbox: BBox,
    pub text: String,
    #[serde(default)]
    pub style: TextStyle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedImage {
    pub bbox: BBox,
    pub rotation: i32,
    pub pixel_width: u32,
    pub pixel_height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryPage {
    pub width: f32,
    pub height: f32,
    #[serde(default)]
    pub rotation: i32,
    #[serde(default)]
    pub words: Vec<MemoryWord>,
    #[serde(default)]
    pub redactions: Vec<BBox>,
    #[serde(default)]
    pub images: Vec<PlacedImage>,
    #[serde(skip)]
    pending: Vec<BBox>,
}

impl MemoryPage {
    /// Empty page with the given displayed size.
    pub fn blank(width: f32, height: f32) -> Self {
        Self {
            width,
            height,
            rotation: 0,
            words: Vec::new(),
            redactions: Vec::new(),
            images: Vec::new(),
            pending: Vec::new(),
        }
    }

    pub fn with_rotation(mut self, rotation: i32) -> Self {
        self.rotation = rotation;
        self
    }

    /// Add a word in the native frame with the default style.
    pub fn with_word(self, bbox: BBox, text: &str) -> Self {
        self.with_styled_word(bbox, text, TextStyle::default())
    }

    pub fn with_styled_word(mut self, bbox: BBox, text: &str, style: TextStyle) -> Self {
        self.words.push(MemoryWord {
            bbox,
            text: text.to_string(),
            style,
        });
        self
    }

    /// Add one word per whitespace-separated token, laid out left to right
    /// from the top-left corner of `bbox`.
    pub fn with_phrase(mut self, bbox: BBox, phrase: &str, style: TextStyle) -> Self {
        let tokens: Vec<&str> = phrase.split_whitespace().collect();
        let total_chars: usize = tokens.iter().map(|t| t.chars().count() + 1).sum();
        let advance = bbox.width() / total_chars.max(1) as f32;
        let mut x = bbox.x0;
        for token in tokens {
            let w = advance * token.chars().count() as f32;
            self.words.push(MemoryWord {
                bbox: BBox::new(x, bbox.y0, x + w, bbox.y1),
                text: token.to_string(),
                style: style.clone(),
            });
            x += w + advance;
        }
        self
    }

    pub fn geometry(&self) -> PageGeometry {
        PageGeometry {
            width: self.width,
            height: self.height,
            rotation: self.rotation,
        }
    }

    pub fn text(&self) -> String {
        self.words
            .iter()
            .map(|w| w.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryDocument {
    pub pages: Vec<MemoryPage>,
}

impl MemoryDocument {
    pub fn new(pages: Vec<MemoryPage>) -> Self {
        Self { pages }
    }

    pub fn load(path: &Path) -> Result<Self, ExtractionError> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| {
            ExtractionError::InvalidDocument(format!("{}: {e}", path.display()))
        })
    }

    pub fn write_to(&self, path: &Path) -> Result<(), ExtractionError> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| ExtractionError::PdfSave(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    fn page(&self, page: usize) -> Result<&MemoryPage, ExtractionError> {
        self.pages.get(page).ok_or(ExtractionError::PageOutOfRange {
            page,
            count: self.pages.len(),
        })
    }

    fn page_mut(&mut self, page: usize) -> Result<&mut MemoryPage, ExtractionError> {
        let count = self.pages.len();
        self.pages
            .get_mut(page)
            .ok_or(ExtractionError::PageOutOfRange { page, count })
    }
}

impl PdfDocument for MemoryDocument {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn page_geometry(&self, page: usize) -> Result<PageGeometry, ExtractionError> {
        Ok(self.page(page)?.geometry())
    }

    fn words(&self, page: usize) -> Result<Vec<WordBox>, ExtractionError> {
        Ok(self
            .page(page)?
            .words
            .iter()
            .map(|w| WordBox {
                bbox: w.bbox,
                text: w.text.clone(),
            })
            .collect())
    }

    fn spans(&self, page: usize) -> Result<Vec<TextSpan>, ExtractionError> {
        Ok(self
            .page(page)?
            .words
            .iter()
            .map(|w| TextSpan {
                bbox: w.bbox,
                text: w.text.clone(),
                style: w.style.clone(),
            })
            .collect())
    }

    fn rasterize(&self, page: usize, region: &BBox, dpi: u32) -> Result<DynamicImage, ExtractionError> {
        let p = self.page(page)?;
        if !region.has_positive_area() {
            return Err(ExtractionError::PdfRendering {
                page,
                reason: format!("empty raster region {region}"),
            });
        }
        let geometry = p.geometry();
        let scale = (dpi as f32 / POINTS_PER_INCH)
            .min(MAX_DIMENSION_PX as f32 / region.width().max(region.height()));
        let w = ((region.width() * scale).ceil() as u32).clamp(1, MAX_DIMENSION_PX);
        let h = ((region.height() * scale).ceil() as u32).clamp(1, MAX_DIMENSION_PX);
        let mut canvas = RgbImage::from_pixel(w, h, Rgb([255, 255, 255]));

        let mut paint = |displayed: BBox, shade: u8| {
            let Some(clip) = displayed.intersection(region) else {
                return;
            };
            let px0 = ((clip.x0 - region.x0) * scale).floor().max(0.0) as u32;
            let py0 = ((clip.y0 - region.y0) * scale).floor().max(0.0) as u32;
            let px1 = (((clip.x1 - region.x0) * scale).ceil() as u32).min(w);
            let py1 = (((clip.y1 - region.y0) * scale).ceil() as u32).min(h);
            for y in py0..py1 {
                for x in px0..px1 {
                    canvas.put_pixel(x, y, Rgb([shade, shade, shade]));
                }
            }
        };

        for image in &p.images {
            paint(geometry.to_displayed(&image.bbox), 128);
        }
        for word in &p.words {
            paint(geometry.to_displayed(&word.bbox), ink_shade(&word.text));
        }
        for area in &p.redactions {
            paint(geometry.to_displayed(area), 255);
        }

        Ok(DynamicImage::ImageRgb8(canvas))
    }

    fn mark_redaction(&mut self, page: usize, bbox: &BBox) -> Result<(), ExtractionError> {
        self.page_mut(page)?.pending.push(*bbox);
        Ok(())
    }

    fn commit_redactions(&mut self, page: usize) -> Result<usize, ExtractionError> {
        let p = self.page_mut(page)?;
        let marks = std::mem::take(&mut p.pending);
        p.words
            .retain(|w| !marks.iter().any(|m| m.intersects(&w.bbox)));
        p.images
            .retain(|img| !marks.iter().any(|m| m.intersects(&img.bbox)));
        let applied = marks.len();
        p.redactions.extend(marks);
        Ok(applied)
    }

    fn draw_text(
        &mut self,
        page: usize,
        bbox: &BBox,
        text: &str,
        style: &TextStyle,
        rotation: i32,
    ) -> Result<bool, ExtractionError> {
        let p = self.page_mut(page)?;
        let (run, thickness) = match normalize_rotation(rotation) {
            90 | 270 => (bbox.height(), bbox.width()),
            _ => (bbox.width(), bbox.height()),
        };
        let needed = text.chars().count() as f32 * style.size * GLYPH_WIDTH_RATIO;
        if needed > run || style.size > thickness || style.size <= 0.0 {
            return Ok(false);
        }
        p.words.push(MemoryWord {
            bbox: *bbox,
            text: text.to_string(),
            style: style.clone(),
        });
        Ok(true)
    }

    fn draw_image(
        &mut self,
        page: usize,
        bbox: &BBox,
        image_bytes: &[u8],
        rotation: i32,
    ) -> Result<(), ExtractionError> {
        let decoded = image::load_from_memory(image_bytes)
            .map_err(|e| ExtractionError::ImageProcessing(e.to_string()))?;
        let p = self.page_mut(page)?;
        p.images.push(PlacedImage {
            bbox: *bbox,
            rotation,
            pixel_width: decoded.width(),
            pixel_height: decoded.height(),
        });
        Ok(())
    }

    fn save(&mut self, path: &Path) -> Result<(), ExtractionError> {
        self.write_to(path)
    }
}

/// Stable grey level per word so different text hashes differently.
fn ink_shade(text: &str) -> u8 {
    let sum: u32 = text.bytes().map(u32::from).sum();
    (sum % 120) as u8
}

/// Opens JSON fixture documents from disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryPdfEngine;

impl PdfEngine for MemoryPdfEngine {
    fn open(&self, path: &Path) -> Result<Box<dyn PdfDocument>, ExtractionError> {
        Ok(Box::new(MemoryDocument::load(path)?))
    }
}

// ── Failing text drawing for testing ──────────────────────

/// Fixture engine whose documents reject every `draw_text` call, the way a
/// backend does when a font cannot be loaded.
#[cfg(test)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct NoFontEngine;

#[cfg(test)]
impl PdfEngine for NoFontEngine {
    fn open(&self, path: &Path) -> Result<Box<dyn PdfDocument>, ExtractionError> {
        Ok(Box::new(NoFontDocument(MemoryDocument::load(path)?)))
    }
}

#[cfg(test)]
pub(crate) struct NoFontDocument(pub MemoryDocument);

#[cfg(test)]
impl PdfDocument for NoFontDocument {
    fn page_count(&self) -> usize {
        self.0.page_count()
    }

    fn page_geometry(&self, page: usize) -> Result<PageGeometry, ExtractionError> {
        self.0.page_geometry(page)
    }

    fn words(&self, page: usize) -> Result<Vec<WordBox>, ExtractionError> {
        self.0.words(page)
    }

    fn spans(&self, page: usize) -> Result<Vec<TextSpan>, ExtractionError> {
        self.0.spans(page)
    }

    fn rasterize(&self, page: usize, region: &BBox, dpi: u32) -> Result<DynamicImage, ExtractionError> {
        self.0.rasterize(page, region, dpi)
    }

    fn mark_redaction(&mut self, page: usize, bbox: &BBox) -> Result<(), ExtractionError> {
        self.0.mark_redaction(page, bbox)
    }

    fn commit_redactions(&mut self, page: usize) -> Result<usize, ExtractionError> {
        self.0.commit_redactions(page)
    }

    fn draw_text(
        &mut self,
        page: usize,
        _bbox: &BBox,
        _text: &str,
        style: &TextStyle,
        _rotation: i32,
    ) -> Result<bool, ExtractionError> {
        Err(ExtractionError::PdfEdit {
            page,
            reason: format!("font {:?} could not be loaded", style.font),
        })
    }

    fn draw_image(
        &mut self,
        page: usize,
        bbox: &BBox,
        image_bytes: &[u8],
        rotation: i32,
    ) -> Result<(), ExtractionError> {
        self.0.draw_image(page, bbox, image_bytes, rotation)
    }

    fn save(&mut self, path: &Path) -> Result<(), ExtractionError> {
        self.0.save(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GenericImageView;

    fn a4_with_acme() -> MemoryDocument {
        MemoryDocument::new(vec![MemoryPage::blank(595.0, 842.0)
            .with_word(BBox::new(20.0, 20.0, 60.0, 40.0), "ACME")
            .with_word(BBox::new(65.0, 20.0, 100.0, 40.0), "Corp")
            .with_word(BBox::new(300.0, 500.0, 340.0, 520.0), "Elsewhere")])
    }

    #[test]
    fn commit_removes_intersecting_words_only() {
        let mut doc = a4_with_acme();
        doc.mark_redaction(0, &BBox::new(10.0, 10.0, 110.0, 60.0)).unwrap();
        assert_eq!(doc.words(0).unwrap().len(), 3, "marks are not applied before commit");
        assert_eq!(doc.commit_redactions(0).unwrap(), 1);
        let words = doc.words(0).unwrap();
        assert_eq!(words.len(), 1);
        assert_eq!(words[0].text, "Elsewhere");
        assert_eq!(doc.pages[0].redactions.len(), 1);
    }

    #[test]
    fn draw_text_respects_fit() {
        let mut doc = a4_with_acme();
        let style = TextStyle::default();
        let wide = BBox::new(0.0, 0.0, 100.0, 20.0);
        assert!(doc.draw_text(0, &wide, "[REDACTED]", &style, 0).unwrap());
        let narrow = BBox::new(0.0, 0.0, 30.0, 20.0);
        assert!(!doc.draw_text(0, &narrow, "[REDACTED]", &style, 0).unwrap());
        let small = TextStyle { size: 2.5, ..TextStyle::default() };
        assert!(doc.draw_text(0, &narrow, "[REDACTED]", &small, 0).unwrap());
    }

    #[test]
    fn raster_size_follows_dpi() {
        let doc = a4_with_acme();
        let img = doc.rasterize(0, &BBox::new(0.0, 0.0, 72.0, 36.0), 144).unwrap();
        assert_eq!(img.dimensions(), (144, 72));
    }

    #[test]
    fn raster_reflects_content() {
        let doc = a4_with_acme();
        let region = BBox::new(10.0, 10.0, 110.0, 60.0);
        let before = doc.rasterize(0, &region, 100).unwrap();
        let mut redacted = doc.clone();
        redacted.mark_redaction(0, &region).unwrap();
        redacted.commit_redactions(0).unwrap();
        let after = redacted.rasterize(0, &region, 100).unwrap();
        assert_ne!(before.to_rgb8().into_raw(), after.to_rgb8().into_raw());
        assert!(after.to_rgb8().pixels().all(|p| p.0 == [255, 255, 255]));
    }

    #[test]
    fn out_of_range_page_is_an_error() {
        let doc = a4_with_acme();
        assert!(matches!(
            doc.page_geometry(3),
            Err(ExtractionError::PageOutOfRange { page: 3, count: 1 })
        ));
    }

    #[test]
    fn engine_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let mut doc = a4_with_acme();
        doc.save(&path).unwrap();
        let reopened = MemoryPdfEngine.open(&path).unwrap();
        assert_eq!(reopened.page_count(), 1);
        assert_eq!(reopened.words(0).unwrap().len(), 3);
    }

    #[test]
    fn unreadable_fixture_is_invalid_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, b"%PDF-1.7 not json").unwrap();
        assert!(matches!(
            MemoryPdfEngine.open(&path),
            Err(ExtractionError::InvalidDocument(_))
        ));
    }

    #[test]
    fn phrase_is_split_into_words() {
        let page = MemoryPage::blank(595.0, 842.0).with_phrase(
            BBox::new(100.0, 100.0, 200.0, 112.0),
            "John Smith",
            TextStyle::default(),
        );
        assert_eq!(page.words.len(), 2);
        assert_eq!(page.words[0].text, "John");
        assert!(page.words[0].bbox.x1 <= page.words[1].bbox.x0);
        assert_eq!(page.text(), "John Smith");
    }
}
