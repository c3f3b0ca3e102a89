//! OCR engines for zone crops.
//!
//! The production engine asks an Ollama vision model to transcribe the crop.
//! Drawings rarely need more than a few words recovered per zone, so the
//! prompt asks for plain text only.

use std::sync::Arc;

use base64::Engine as _;

use super::types::{OcrEngine, OcrPageResult};
use super::ExtractionError;
use crate::pipeline::ollama::LlmClient;

const VISION_OCR_PROMPT: &str = "\
Transcribe every piece of text visible in this image, exactly as written. \
Output plain text only, one line per visual line, with no commentary. \
If there is no text, output nothing.";

/// Vision OCR engine backed by an Ollama vision model.
pub struct OllamaVisionOcr {
    client: Arc<dyn LlmClient + Send + Sync>,
    model_name: String,
}

impl OllamaVisionOcr {
    pub fn new(client: Arc<dyn LlmClient + Send + Sync>, model_name: String) -> Self {
        Self { client, model_name }
    }
}

impl OcrEngine for OllamaVisionOcr {
    fn ocr_image(&self, image_bytes: &[u8]) -> Result<OcrPageResult, ExtractionError> {
        let _span = tracing::debug_span!(
            "vision_ocr",
            model = %self.model_name,
            image_size = image_bytes.len(),
        )
        .entered();

        let images = vec![base64::engine::general_purpose::STANDARD.encode(image_bytes)];
        let raw = self
            .client
            .generate_with_images(&self.model_name, VISION_OCR_PROMPT, &images)
            .map_err(|e| ExtractionError::OcrProcessing(format!("Vision OCR failed: {e}")))?;

        let text = clean_transcription(&raw);
        let confidence = if text.is_empty() { 0.0 } else { 0.7 };
        Ok(OcrPageResult { text, confidence })
    }
}

/// Strip code fences and blank lines some models wrap their answer in.
fn clean_transcription(raw: &str) -> String {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Mock for testing ──────────────────────────────────────

/// Mock OCR engine for unit testing without a model server.
pub struct MockOcrEngine {
    pub text: String,
    pub confidence: f32,
}

impl MockOcrEngine {
    pub fn new(text: &str, confidence: f32) -> Self {
        Self {
            text: text.to_string(),
            confidence,
        }
    }
}

impl OcrEngine for MockOcrEngine {
    fn ocr_image(&self, _image_bytes: &[u8]) -> Result<OcrPageResult, ExtractionError> {
        Ok(OcrPageResult {
            text: self.text.clone(),
            confidence: self.confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ollama::MockLlmClient;

    #[test]
    fn mock_ocr_returns_text() {
        let engine = MockOcrEngine::new("ACME Corp", 0.92);
        let result = engine.ocr_image(b"fake_image_bytes").unwrap();
        assert_eq!(result.text, "ACME Corp");
        assert!((result.confidence - 0.92).abs() < f32::EPSILON);
    }

    #[test]
    fn vision_ocr_cleans_fenced_output() {
        let client = Arc::new(MockLlmClient::new("```\nACME Corp\n\n  Drawing 42 \n```"));
        let engine = OllamaVisionOcr::new(client, "llava".into());
        let result = engine.ocr_image(b"png").unwrap();
        assert_eq!(result.text, "ACME Corp\nDrawing 42");
        assert!(result.confidence > 0.0);
    }

    #[test]
    fn vision_ocr_empty_answer_has_zero_confidence() {
        let client = Arc::new(MockLlmClient::new("  \n"));
        let engine = OllamaVisionOcr::new(client, "llava".into());
        let result = engine.ocr_image(b"png").unwrap();
        assert!(result.text.is_empty());
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn vision_ocr_offline_is_an_error() {
        let engine = OllamaVisionOcr::new(Arc::new(MockLlmClient::offline()), "llava".into());
        let err = engine.ocr_image(b"png").unwrap_err();
        assert!(matches!(err, ExtractionError::OcrProcessing(_)));
    }
}
