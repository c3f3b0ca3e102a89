//! PDF backend over Google PDFium.
//!
//! `PdfiumDocument` keeps the document as bytes. Every operation binds
//! PDFium, loads the bytes, works, and (for edits) saves back to bytes,
//! because the upstream `Pdfium` type is `!Send`. The OS caches the
//! `dlopen`/`LoadLibrary` call, so repeat loads are near-free.
//!
//! PDFium reports text and object positions in the native page space with a
//! bottom-left origin. They are flipped to the top-left native frame used by
//! [`PdfDocument`]. Page width and height are reported with rotation applied.

use std::collections::BTreeMap;
use std::path::Path;

use image::{DynamicImage, GenericImageView};
use pdfium_render::prelude::*;
use tracing::{debug, warn};

use super::types::{PageGeometry, PdfDocument, PdfEngine, TextSpan, TextStyle, WordBox};
use super::ExtractionError;
use crate::pipeline::layout::{normalize_rotation, BBox};

type RawDocument<'a> = pdfium_render::prelude::PdfDocument<'a>;

/// Maximum dimension (width or height) for rendered page images.
const MAX_DIMENSION_PX: u32 = 4096;

/// PDF points per inch (standard PDF unit).
const POINTS_PER_INCH: f32 = 72.0;

/// Average glyph advance as a fraction of the font size, used to decide fit.
const GLYPH_WIDTH_RATIO: f32 = 0.55;

/// Baseline offset above the bottom of the line box, as a fraction of the size.
const DESCENT_RATIO: f32 = 0.2;

/// Load the PDFium dynamic library.
///
/// Discovery order:
/// 1. `PDFIUM_DYNAMIC_LIB_PATH` env var (explicit path)
/// 2. Alongside the running executable, or in `lib/` next to it
/// 3. System library search paths
fn load_pdfium() -> Result<Pdfium, ExtractionError> {
    if let Ok(path) = std::env::var("PDFIUM_DYNAMIC_LIB_PATH") {
        debug!(path = %path, "Loading PDFium from env var");
        let bindings = Pdfium::bind_to_library(&path).map_err(|e| {
            ExtractionError::InvalidDocument(format!("Failed to load PDFium from {path}: {e}"))
        })?;
        return Ok(Pdfium::new(bindings));
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(exe_dir) = exe.parent() {
            let candidates = [exe_dir.to_path_buf(), exe_dir.join("lib"), exe_dir.join("..").join("lib")];
            for dir in &candidates {
                let lib_path = Pdfium::pdfium_platform_library_name_at_path(
                    dir.to_string_lossy().as_ref(),
                );
                if let Ok(bindings) = Pdfium::bind_to_library(&lib_path) {
                    debug!(dir = %dir.display(), "Loaded PDFium from candidate directory");
                    return Ok(Pdfium::new(bindings));
                }
            }
        }
    }

    let bindings = Pdfium::bind_to_system_library().map_err(|e| {
        ExtractionError::InvalidDocument(format!(
            "PDFium library not found. Set PDFIUM_DYNAMIC_LIB_PATH or install PDFium: {e}"
        ))
    })?;
    Ok(Pdfium::new(bindings))
}

fn map_load_error(e: PdfiumError) -> ExtractionError {
    let msg = e.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("password") || lower.contains("encrypt") {
        ExtractionError::InvalidDocument(format!("encrypted PDF: {msg}"))
    } else {
        ExtractionError::InvalidDocument(format!("Failed to load PDF: {msg}"))
    }
}

/// Pixel dimensions for rendering, both clamped to [1, MAX_DIMENSION_PX].
/// Preserves aspect ratio when capping.
fn compute_render_dimensions(width_points: f32, height_points: f32, dpi: u32) -> (u32, u32) {
    let scale = dpi as f32 / POINTS_PER_INCH;
    let raw_w = (width_points * scale).max(1.0);
    let raw_h = (height_points * scale).max(1.0);

    let max_dim = raw_w.max(raw_h);
    if max_dim > MAX_DIMENSION_PX as f32 {
        let ratio = MAX_DIMENSION_PX as f32 / max_dim;
        let w = ((raw_w * ratio) as u32).clamp(1, MAX_DIMENSION_PX);
        let h = ((raw_h * ratio) as u32).clamp(1, MAX_DIMENSION_PX);
        (w, h)
    } else {
        (raw_w as u32, raw_h as u32)
    }
}

fn rotation_degrees(rotation: PdfPageRenderRotation) -> i32 {
    match rotation {
        PdfPageRenderRotation::None => 0,
        PdfPageRenderRotation::Degrees90 => 90,
        PdfPageRenderRotation::Degrees180 => 180,
        PdfPageRenderRotation::Degrees270 => 270,
    }
}

/// Bottom-left PDFium rectangle to a top-left native box.
fn to_native_box(rect: &PdfRect, media_height: f32) -> BBox {
    BBox::new(
        rect.left().value,
        media_height - rect.top().value,
        rect.right().value,
        media_height - rect.bottom().value,
    )
}

/// Top-left native box to a bottom-left PDFium rectangle.
fn to_pdf_rect(bbox: &BBox, media_height: f32) -> PdfRect {
    PdfRect::new_from_values(media_height - bbox.y1, bbox.x0, media_height - bbox.y0, bbox.x1)
}

/// Pixel window `(x, y, w, h)` of a point-space clip inside a rendered page,
/// at least one pixel and never past the bitmap edge. `None` for an empty bitmap.
fn crop_window(clip: &BBox, scale: (f32, f32), width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    if width == 0 || height == 0 {
        return None;
    }
    let (sx, sy) = scale;
    let x = ((clip.x0 * sx).floor().max(0.0) as u32).min(width - 1);
    let y = ((clip.y0 * sy).floor().max(0.0) as u32).min(height - 1);
    let w = ((clip.width() * sx).ceil() as u32).clamp(1, width - x);
    let h = ((clip.height() * sy).ceil() as u32).clamp(1, height - y);
    Some((x, y, w, h))
}

fn edit_error(page: usize) -> impl Fn(PdfiumError) -> ExtractionError {
    move |e| ExtractionError::PdfEdit {
        page,
        reason: e.to_string(),
    }
}

/// Where to put the text origin (bottom-left PDF coordinates) so a run of
/// `text_width` x `size` sits centred in `rect` and reads upright once the page
/// rotation is applied.
fn text_anchor(rect: &PdfRect, text_width: f32, size: f32, rotation: u32) -> (f32, f32) {
    let (l, b, r, t) = (rect.left().value, rect.bottom().value, rect.right().value, rect.top().value);
    let (w, h) = (r - l, t - b);
    match rotation {
        90 => (r - (w - size) / 2.0 - DESCENT_RATIO * size, b + (h - text_width) / 2.0),
        180 => (r - (w - text_width) / 2.0, t - (h - size) / 2.0 - DESCENT_RATIO * size),
        270 => (l + (w - size) / 2.0 + DESCENT_RATIO * size, t - (h - text_width) / 2.0),
        _ => (l + (w - text_width) / 2.0, b + (h - size) / 2.0 + DESCENT_RATIO * size),
    }
}

/// Opens PDFs from disk through PDFium.
pub struct PdfiumEngine;

impl PdfiumEngine {
    /// Create an engine, verifying the PDFium library is loadable.
    pub fn new() -> Result<Self, ExtractionError> {
        let _ = load_pdfium()?;
        Ok(Self)
    }
}

impl PdfEngine for PdfiumEngine {
    fn open(&self, path: &Path) -> Result<Box<dyn PdfDocument>, ExtractionError> {
        let bytes = std::fs::read(path)?;
        let doc = PdfiumDocument::from_bytes(bytes)?;
        debug!(document = %path.display(), pages = doc.geometry.len(), "Opened PDF");
        Ok(Box::new(doc))
    }
}

pub struct PdfiumDocument {
    bytes: Vec<u8>,
    geometry: Vec<PageGeometry>,
    pending: BTreeMap<usize, Vec<BBox>>,
}

impl PdfiumDocument {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ExtractionError> {
        let pdfium = load_pdfium()?;
        let geometry = {
            let document = pdfium
                .load_pdf_from_byte_slice(&bytes, None)
                .map_err(map_load_error)?;
            let mut geometry = Vec::new();
            for (index, page) in document.pages().iter().enumerate() {
                let rotation = page
                    .rotation()
                    .map(rotation_degrees)
                    .map_err(|e| ExtractionError::PdfRendering {
                        page: index,
                        reason: e.to_string(),
                    })?;
                geometry.push(PageGeometry {
                    width: page.width().value,
                    height: page.height().value,
                    rotation,
                });
            }
            geometry
        };
        Ok(Self {
            bytes,
            geometry,
            pending: BTreeMap::new(),
        })
    }

    fn geometry_of(&self, page: usize) -> Result<PageGeometry, ExtractionError> {
        self.geometry
            .get(page)
            .copied()
            .ok_or(ExtractionError::PageOutOfRange {
                page,
                count: self.geometry.len(),
            })
    }

    fn page_index(&self, page: usize) -> Result<u16, ExtractionError> {
        self.geometry_of(page)?;
        u16::try_from(page).map_err(|_| ExtractionError::PageOutOfRange {
            page,
            count: self.geometry.len(),
        })
    }

    /// Run a read-only operation against a freshly loaded document.
    fn read<T>(&self, f: impl FnOnce(&RawDocument<'_>) -> Result<T, ExtractionError>) -> Result<T, ExtractionError> {
        let pdfium = load_pdfium()?;
        let document = pdfium
            .load_pdf_from_byte_slice(&self.bytes, None)
            .map_err(map_load_error)?;
        f(&document)
    }

    /// Run an edit and keep the resulting bytes.
    fn edit<T>(&mut self, f: impl FnOnce(&mut RawDocument<'_>) -> Result<T, ExtractionError>) -> Result<T, ExtractionError> {
        let pdfium = load_pdfium()?;
        let (result, bytes) = {
            let mut document = pdfium
                .load_pdf_from_byte_slice(&self.bytes, None)
                .map_err(map_load_error)?;
            let result = f(&mut document)?;
            let bytes = document
                .save_to_bytes()
                .map_err(|e| ExtractionError::PdfSave(e.to_string()))?;
            (result, bytes)
        };
        self.bytes = bytes;
        Ok(result)
    }
}

impl PdfDocument for PdfiumDocument {
    fn page_count(&self) -> usize {
        self.geometry.len()
    }

    fn page_geometry(&self, page: usize) -> Result<PageGeometry, ExtractionError> {
        self.geometry_of(page)
    }

    fn words(&self, page: usize) -> Result<Vec<WordBox>, ExtractionError> {
        let index = self.page_index(page)?;
        let (_, media_h) = self.geometry_of(page)?.media_size();
        self.read(|document| {
            let pdf_page = document.pages().get(index).map_err(edit_error(page))?;
            let text = pdf_page.text().map_err(edit_error(page))?;

            let mut words = Vec::new();
            let mut current: Option<WordBox> = None;
            for ch in text.chars().iter() {
                let glyph = ch.unicode_char().filter(|c| !c.is_whitespace());
                let bounds = ch.loose_bounds().ok().map(|r| to_native_box(&r, media_h));
                match (glyph, bounds) {
                    (Some(c), Some(b)) => {
                        let continues = current.as_ref().is_some_and(|w| {
                            let prev_mid = (w.bbox.y0 + w.bbox.y1) / 2.0;
                            let mid = (b.y0 + b.y1) / 2.0;
                            (mid - prev_mid).abs() <= w.bbox.height() / 2.0 && b.x0 >= w.bbox.x0
                        });
                        if !continues {
                            words.extend(current.take());
                        }
                        let word = current.get_or_insert_with(|| WordBox {
                            bbox: b,
                            text: String::new(),
                        });
                        word.bbox = word.bbox.union(&b);
                        word.text.push(c);
                    }
                    _ => words.extend(current.take()),
                }
            }
            words.extend(current);
            Ok(words)
        })
    }

    fn spans(&self, page: usize) -> Result<Vec<TextSpan>, ExtractionError> {
        let index = self.page_index(page)?;
        let (_, media_h) = self.geometry_of(page)?.media_size();
        self.read(|document| {
            let pdf_page = document.pages().get(index).map_err(edit_error(page))?;
            let mut spans = Vec::new();
            for object in pdf_page.objects().iter() {
                let Some(text_object) = object.as_text_object() else {
                    continue;
                };
                let Ok(bounds) = object.bounds() else {
                    continue;
                };
                let color = object
                    .fill_color()
                    .map(|c| [c.red(), c.green(), c.blue()])
                    .unwrap_or([0, 0, 0]);
                spans.push(TextSpan {
                    bbox: to_native_box(&bounds.to_rect(), media_h),
                    text: text_object.text(),
                    style: TextStyle {
                        font: text_object.font().name(),
                        size: text_object.scaled_font_size().value,
                        color,
                    },
                });
            }
            Ok(spans)
        })
    }

    fn rasterize(&self, page: usize, region: &BBox, dpi: u32) -> Result<DynamicImage, ExtractionError> {
        let index = self.page_index(page)?;
        let geometry = self.geometry_of(page)?;
        let clip = region
            .intersection(&BBox::new(0.0, 0.0, geometry.width, geometry.height))
            .filter(BBox::has_positive_area)
            .ok_or_else(|| ExtractionError::PdfRendering {
                page,
                reason: format!("raster region {region} is off the page"),
            })?;

        let (target_w, target_h) = compute_render_dimensions(geometry.width, geometry.height, dpi);
        let full = self.read(|document| {
            let pdf_page = document.pages().get(index).map_err(|e| ExtractionError::PdfRendering {
                page,
                reason: e.to_string(),
            })?;
            let config = PdfRenderConfig::new()
                .set_target_width(target_w as i32)
                .set_maximum_height(target_h as i32);
            let bitmap = pdf_page
                .render_with_config(&config)
                .map_err(|e| ExtractionError::PdfRendering {
                    page,
                    reason: format!("Rendering failed: {e}"),
                })?;
            Ok(bitmap.as_image())
        })?;

        let scale = (
            full.width() as f32 / geometry.width,
            full.height() as f32 / geometry.height,
        );
        let (x, y, w, h) = crop_window(&clip, scale, full.width(), full.height()).ok_or_else(|| {
            ExtractionError::PdfRendering {
                page,
                reason: "PDFium returned an empty bitmap".into(),
            }
        })?;
        Ok(full.crop_imm(x, y, w, h))
    }

    fn mark_redaction(&mut self, page: usize, bbox: &BBox) -> Result<(), ExtractionError> {
        self.geometry_of(page)?;
        self.pending.entry(page).or_default().push(*bbox);
        Ok(())
    }

    /// Deletes every text and image object a mark intersects, then paints
    /// each mark white.
    fn commit_redactions(&mut self, page: usize) -> Result<usize, ExtractionError> {
        let index = self.page_index(page)?;
        let (_, media_h) = self.geometry_of(page)?.media_size();
        let marks = self.pending.remove(&page).unwrap_or_default();
        if marks.is_empty() {
            return Ok(0);
        }

        self.edit(|document| {
            let mut pdf_page = document.pages().get(index).map_err(edit_error(page))?;

            let doomed: Vec<usize> = pdf_page
                .objects()
                .iter()
                .enumerate()
                .filter(|(_, object)| {
                    matches!(
                        object.object_type(),
                        PdfPageObjectType::Text | PdfPageObjectType::Image
                    )
                })
                .filter(|(_, object)| {
                    object.bounds().is_ok_and(|q| {
                        let b = to_native_box(&q.to_rect(), media_h);
                        marks.iter().any(|m| m.intersects(&b))
                    })
                })
                .map(|(i, _)| i)
                .collect();
            for i in doomed.iter().rev() {
                pdf_page
                    .objects_mut()
                    .remove_object_at_index(*i)
                    .map_err(edit_error(page))?;
            }

            for mark in &marks {
                pdf_page
                    .objects_mut()
                    .create_path_object_rect(to_pdf_rect(mark, media_h), None, None, Some(PdfColor::WHITE))
                    .map_err(edit_error(page))?;
            }
            debug!(page, marks = marks.len(), removed = doomed.len(), "Redactions applied");
            Ok(marks.len())
        })
    }

    fn draw_text(
        &mut self,
        page: usize,
        bbox: &BBox,
        text: &str,
        style: &TextStyle,
        rotation: i32,
    ) -> Result<bool, ExtractionError> {
        let index = self.page_index(page)?;
        let (_, media_h) = self.geometry_of(page)?.media_size();
        let rotation = normalize_rotation(rotation);
        let (run, thickness) = match rotation {
            90 | 270 => (bbox.height(), bbox.width()),
            _ => (bbox.width(), bbox.height()),
        };
        let text_width = text.chars().count() as f32 * style.size * GLYPH_WIDTH_RATIO;
        if style.size <= 0.0 || text_width > run || style.size > thickness {
            return Ok(false);
        }

        let rect = to_pdf_rect(bbox, media_h);
        let (x, y) = text_anchor(&rect, text_width, style.size, rotation);
        let [r, g, b] = style.color;
        self.edit(|document| {
            let font = match style.font.as_str() {
                "courier" => document.fonts_mut().courier(),
                "times" => document.fonts_mut().times_roman(),
                "symbol" => document.fonts_mut().symbol(),
                "zapfdingbats" => document.fonts_mut().zapf_dingbats(),
                _ => document.fonts_mut().helvetica(),
            };
            let mut pdf_page = document.pages().get(index).map_err(edit_error(page))?;
            let mut object = pdf_page
                .objects_mut()
                .create_text_object(PdfPoints::ZERO, PdfPoints::ZERO, text, font, PdfPoints::new(style.size))
                .map_err(edit_error(page))?;
            object
                .set_fill_color(PdfColor::new(r, g, b, 255))
                .map_err(edit_error(page))?;
            if rotation != 0 {
                object
                    .rotate_counter_clockwise_degrees(rotation as f32)
                    .map_err(edit_error(page))?;
            }
            object
                .translate(PdfPoints::new(x), PdfPoints::new(y))
                .map_err(edit_error(page))?;
            Ok(true)
        })
    }

    /// Image is pre-rotated against the page rotation so it reads upright.
    fn draw_image(
        &mut self,
        page: usize,
        bbox: &BBox,
        image_bytes: &[u8],
        rotation: i32,
    ) -> Result<(), ExtractionError> {
        let index = self.page_index(page)?;
        let (_, media_h) = self.geometry_of(page)?.media_size();
        let decoded = image::load_from_memory(image_bytes)
            .map_err(|e| ExtractionError::ImageProcessing(e.to_string()))?;
        let upright = match normalize_rotation(rotation) {
            90 => decoded.rotate270(),
            180 => decoded.rotate180(),
            270 => decoded.rotate90(),
            _ => decoded,
        };
        let rect = to_pdf_rect(bbox, media_h);
        self.edit(|document| {
            let mut pdf_page = document.pages().get(index).map_err(edit_error(page))?;
            pdf_page
                .objects_mut()
                .create_image_object(
                    rect.left(),
                    rect.bottom(),
                    &upright,
                    Some(PdfPoints::new(bbox.width())),
                    Some(PdfPoints::new(bbox.height())),
                )
                .map_err(edit_error(page))?;
            Ok(())
        })
    }

    fn save(&mut self, path: &Path) -> Result<(), ExtractionError> {
        if !self.pending.is_empty() {
            warn!(pages = self.pending.len(), "Saving with uncommitted redaction marks");
        }
        std::fs::write(path, &self.bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a4_at_100dpi() {
        let (w, h) = compute_render_dimensions(595.0, 842.0, 100);
        assert!(w > 820 && w < 830, "A4 width at 100dpi: got {w}");
        assert!(h > 1165 && h < 1175, "A4 height at 100dpi: got {h}");
    }

    #[test]
    fn dimension_guard_caps_oversized() {
        // A0 at 300 DPI is far beyond the cap.
        let (w, h) = compute_render_dimensions(2384.0, 3370.0, 300);
        assert!(w <= MAX_DIMENSION_PX && h <= MAX_DIMENSION_PX);
        let ratio = h as f32 / w as f32;
        assert!((ratio - 3370.0 / 2384.0).abs() < 0.01, "aspect {ratio}");
    }

    #[test]
    fn zero_points_clamped_to_1() {
        let (w, h) = compute_render_dimensions(0.0, 0.0, 300);
        assert!(w >= 1 && h >= 1);
    }

    #[test]
    fn rect_conversion_flips_the_y_axis() {
        let native = BBox::new(10.0, 20.0, 110.0, 70.0);
        let rect = to_pdf_rect(&native, 842.0);
        assert_eq!(rect.bottom().value, 772.0);
        assert_eq!(rect.top().value, 822.0);
        assert_eq!(to_native_box(&rect, 842.0), native);
    }

    #[test]
    fn flip_uses_media_height_on_turned_pages() {
        // 842 x 595 landscape media shown upside down.
        let geometry = PageGeometry { width: 842.0, height: 595.0, rotation: 180 };
        let (_, media_h) = geometry.media_size();
        let glyph = PdfRect::new_from_values(565.0, 20.0, 585.0, 60.0);
        assert_eq!(to_native_box(&glyph, media_h), BBox::new(20.0, 10.0, 60.0, 30.0));
    }

    #[test]
    fn crop_window_stays_inside_the_bitmap() {
        let clip = BBox::new(590.0, 830.0, 595.0, 842.0);
        let (x, y, w, h) = crop_window(&clip, (1.0, 1.0), 595, 842).unwrap();
        assert!(x + w <= 595 && y + h <= 842);
        assert!(w >= 1 && h >= 1);

        // Clip right at the far edge still yields one pixel.
        let edge = BBox::new(595.0, 842.0, 600.0, 850.0);
        assert_eq!(crop_window(&edge, (1.0, 1.0), 595, 842), Some((594, 841, 1, 1)));
    }

    #[test]
    fn crop_window_rejects_an_empty_bitmap() {
        let clip = BBox::new(0.0, 0.0, 10.0, 10.0);
        assert_eq!(crop_window(&clip, (0.0, 0.0), 0, 0), None);
        assert_eq!(crop_window(&clip, (1.0, 1.0), 100, 0), None);
    }

    #[test]
    fn upright_text_is_centred() {
        let rect = PdfRect::new_from_values(100.0, 0.0, 120.0, 100.0);
        let (x, y) = text_anchor(&rect, 60.0, 10.0, 0);
        assert_eq!(x, 20.0);
        assert_eq!(y, 107.0);
    }

    #[test]
    fn quarter_turn_anchor_stays_inside_the_box() {
        let rect = PdfRect::new_from_values(0.0, 0.0, 100.0, 20.0);
        for rotation in [90, 180, 270] {
            let (x, y) = text_anchor(&rect, 60.0, 10.0, rotation);
            assert!((0.0..=20.0).contains(&x), "{rotation}: x {x}");
            assert!((0.0..=100.0).contains(&y), "{rotation}: y {y}");
        }
    }
}
