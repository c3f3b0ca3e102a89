pub mod types;
pub mod hash;
pub mod zones;
pub mod ocr;
pub mod memory;
#[cfg(feature = "pdfium")]
pub mod pdfium;

pub use types::*;
pub use hash::*;
pub use zones::*;
pub use ocr::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Page {page} out of range (document has {count} pages)")]
    PageOutOfRange { page: usize, count: usize },

    #[error("Rendering failed on page {page}: {reason}")]
    PdfRendering { page: usize, reason: String },

    #[error("PDF edit failed on page {page}: {reason}")]
    PdfEdit { page: usize, reason: String },

    #[error("Failed to save document: {0}")]
    PdfSave(String),

    #[error("Image processing error: {0}")]
    ImageProcessing(String),

    #[error("OCR processing failed: {0}")]
    OcrProcessing(String),
}
