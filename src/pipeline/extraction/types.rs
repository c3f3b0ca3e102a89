use std::path::Path;

use image::DynamicImage;
use serde::{Deserialize, Serialize};

use super::ExtractionError;
use crate::pipeline::layout::{native_extent, normalize_rotation, BBox};

/// Displayed size of a page (rotation applied) plus its rotation in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageGeometry {
    pub width: f32,
    pub height: f32,
    pub rotation: i32,
}

impl PageGeometry {
    /// Size of the unrotated frame that word boxes and edits are expressed in.
    pub fn native_extent(&self) -> (f32, f32) {
        native_extent(self.width, self.height, self.rotation)
    }

    /// Width and height of the unrotated media box, as a PDF library stores it.
    /// Differs from [`Self::native_extent`] on half-turned pages.
    pub fn media_size(&self) -> (f32, f32) {
        match normalize_rotation(self.rotation) {
            90 | 270 => (self.height, self.width),
            _ => (self.width, self.height),
        }
    }

    /// Displayed-frame box to native frame.
    pub fn to_native(&self, bbox: &BBox) -> BBox {
        bbox.for_rotation(self.width, self.height, self.rotation)
    }

    /// Native-frame box back to the displayed frame.
    pub fn to_displayed(&self, bbox: &BBox) -> BBox {
        bbox.from_rotation(self.width, self.height, self.rotation)
    }
}

/// One word of extractable text, in the page's native frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordBox {
    pub bbox: BBox,
    pub text: String,
}

/// Font, size and fill colour of a run of text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextStyle {
    pub font: String,
    pub size: f32,
    pub color: [u8; 3],
}

impl Default for TextStyle {
    fn default() -> Self {
        Self {
            font: "helv".into(),
            size: 12.0,
            color: [0, 0, 0],
        }
    }
}

/// A styled run of text, in the page's native frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSpan {
    pub bbox: BBox,
    pub text: String,
    pub style: TextStyle,
}

/// Raw OCR result from the engine
#[derive(Debug, Clone)]
pub struct OcrPageResult {
    pub text: String,
    pub confidence: f32,
}

/// OCR engine abstraction (allows mocking for tests)
pub trait OcrEngine {
    /// Recognize text in an encoded (PNG) raster.
    fn ocr_image(&self, image_bytes: &[u8]) -> Result<OcrPageResult, ExtractionError>;
}

/// Opens documents. Each call reopens from storage; nothing is cached.
pub trait PdfEngine {
    fn open(&self, path: &Path) -> Result<Box<dyn PdfDocument>, ExtractionError>;
}

/// The narrow set of page operations the pipeline needs from a PDF library.
///
/// Coordinates are top-left origin points. `rasterize` takes a region of the
/// displayed page; every other operation uses the native, unrotated frame.
pub trait PdfDocument {
    fn page_count(&self) -> usize;

    fn page_geometry(&self, page: usize) -> Result<PageGeometry, ExtractionError>;

    fn words(&self, page: usize) -> Result<Vec<WordBox>, ExtractionError>;

    fn spans(&self, page: usize) -> Result<Vec<TextSpan>, ExtractionError>;

    /// Plain text of a page, one visual line per output line.
    fn page_text(&self, page: usize) -> Result<String, ExtractionError> {
        Ok(join_lines(&self.words(page)?))
    }

    fn rasterize(&self, page: usize, region: &BBox, dpi: u32) -> Result<DynamicImage, ExtractionError>;

    /// Queue an opaque white-fill redaction. Nothing changes until commit.
    fn mark_redaction(&mut self, page: usize, bbox: &BBox) -> Result<(), ExtractionError>;

    /// Apply every queued redaction on the page in one step. Returns how many
    /// marks were applied.
    fn commit_redactions(&mut self, page: usize) -> Result<usize, ExtractionError>;

    /// Draw `text` inside `bbox`. Returns `false` without drawing if it does not fit.
    fn draw_text(
        &mut self,
        page: usize,
        bbox: &BBox,
        text: &str,
        style: &TextStyle,
        rotation: i32,
    ) -> Result<bool, ExtractionError>;

    fn draw_image(
        &mut self,
        page: usize,
        bbox: &BBox,
        image_bytes: &[u8],
        rotation: i32,
    ) -> Result<(), ExtractionError>;

    fn save(&mut self, path: &Path) -> Result<(), ExtractionError>;
}

/// Join words into lines: a new line starts when a word's vertical centre
/// moves by more than half the previous word's height.
pub fn join_lines(words: &[WordBox]) -> String {
    let mut out = String::new();
    let mut last: Option<&BBox> = None;
    for word in words {
        if let Some(prev) = last {
            let prev_mid = (prev.y0 + prev.y1) / 2.0;
            let mid = (word.bbox.y0 + word.bbox.y1) / 2.0;
            if (mid - prev_mid).abs() > prev.height() / 2.0 {
                out.push('\n');
            } else {
                out.push(' ');
            }
        }
        out.push_str(&word.text);
        last = Some(&word.bbox);
    }
    out
}
