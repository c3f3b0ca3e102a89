//! LLM-assisted sensitive-term suggestion.
//!
//! Page text is deduplicated, chunked on sentence boundaries and sent to a
//! local model with the caller's drawing context. Suggested terms are merged
//! into the manual name list. Every failure here degrades to "no suggestions";
//! augmentation never fails a batch.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pipeline::extraction::PdfDocument;
use crate::pipeline::ollama::{LlmClient, OllamaError};

#[derive(Error, Debug)]
pub enum AugmentError {
    #[error("Term suggestion model unavailable: {0}")]
    Llm(#[from] OllamaError),

    #[error("Could not read document text: {0}")]
    DocumentText(String),
}

pub const MAX_CHUNK_CHARS: usize = 2000;

pub const TERM_SYSTEM_PROMPT: &str = "You review text extracted from manufacturing drawings \
and list only the phrases that identify a person, company or account. Reply with a JSON \
array of strings and nothing else.";

/// Suggests sensitive terms found in free text.
pub trait TermSuggester {
    fn suggest_terms(&self, text: &str, context: &str) -> Result<Vec<String>, AugmentError>;
}

/// Term suggester backed by an Ollama model.
pub struct OllamaTermSuggester {
    client: Arc<dyn LlmClient + Send + Sync>,
    model: String,
}

impl OllamaTermSuggester {
    pub fn new(client: Arc<dyn LlmClient + Send + Sync>, model: String) -> Self {
        Self { client, model }
    }
}

impl TermSuggester for OllamaTermSuggester {
    fn suggest_terms(&self, text: &str, context: &str) -> Result<Vec<String>, AugmentError> {
        let mut detected = Vec::new();
        for (i, chunk) in chunk_text(text, MAX_CHUNK_CHARS).iter().enumerate() {
            let prompt = build_term_prompt(chunk, context);
            let response = self.client.generate(&self.model, &prompt, TERM_SYSTEM_PROMPT)?;
            let terms = parse_terms(&response);
            debug!(chunk = i, terms = terms.len(), "Terms suggested");
            detected.extend(terms);
        }
        Ok(dedupe_terms(detected))
    }
}

pub fn build_term_prompt(chunk: &str, context: &str) -> String {
    format!(
        r#"Context:
{context}

Below is a slice of the text extracted from a manufacturing-drawing PDF.
Only return a JSON array of the phrases that are SENSITIVE
(e.g. personal names, emails, phone numbers, addresses, account codes).

<text>
{chunk}
</text>

Output format:
["term1", "term2", ...]"#
    )
}

static SENTENCE_END: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[.?!]\s+").unwrap());

/// Split on sentence ends and pack sentences into chunks of at most
/// `max_chars` (a single longer sentence becomes its own chunk).
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for m in SENTENCE_END.find_iter(text) {
        sentences.push(&text[start..m.start() + 1]);
        start = m.end();
    }
    if start < text.len() {
        sentences.push(&text[start..]);
    }

    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut length = 0;
    for sentence in sentences {
        let len = sentence.chars().count();
        if length + len > max_chars && !current.is_empty() {
            chunks.push(current.join(" "));
            current.clear();
            length = 0;
        }
        current.push(sentence);
        length += len;
    }
    if !current.is_empty() {
        chunks.push(current.join(" "));
    }
    chunks
}

/// Parse a model reply as a JSON array of strings, tolerating code fences.
/// Falls back to splitting on commas.
pub fn parse_terms(response: &str) -> Vec<String> {
    let body = response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    if let Ok(serde_json::Value::Array(items)) = serde_json::from_str::<serde_json::Value>(body) {
        return items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }

    body.trim_matches(|c| c == '[' || c == ']')
        .split(',')
        .map(|t| t.trim().trim_matches('"').trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Case-insensitive dedupe keeping first spelling and order.
pub fn dedupe_terms(terms: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    terms
        .into_iter()
        .filter(|t| seen.insert(t.to_lowercase()))
        .collect()
}

/// Append suggestions not already present in `manual` (case-insensitive).
pub fn merge_terms(manual: &[String], suggested: Vec<String>) -> Vec<String> {
    dedupe_terms(manual.iter().cloned().chain(suggested).collect())
}

/// All page text, one line per visual line, dropping repeated lines
/// (title blocks and borders repeat on every sheet).
pub fn document_text(doc: &dyn PdfDocument) -> Result<String, AugmentError> {
    let mut seen = HashSet::new();
    let mut lines = Vec::new();
    for page in 0..doc.page_count() {
        let text = doc
            .page_text(page)
            .map_err(|e| AugmentError::DocumentText(e.to_string()))?;
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if seen.insert(line.to_lowercase()) {
                lines.push(line.to_string());
            }
        }
    }
    Ok(lines.join("\n"))
}

/// Manual names plus model suggestions for `doc`. Falls back to the manual
/// names unchanged when the suggester fails.
pub fn augment_names(
    suggester: &dyn TermSuggester,
    doc: &dyn PdfDocument,
    context: &str,
    manual: &[String],
) -> Vec<String> {
    let suggested = document_text(doc).and_then(|text| {
        if text.is_empty() {
            Ok(Vec::new())
        } else {
            suggester.suggest_terms(&text, context)
        }
    });
    match suggested {
        Ok(terms) => {
            let merged = merge_terms(manual, terms);
            info!(
                manual = manual.len(),
                total = merged.len(),
                "Manual names augmented"
            );
            merged
        }
        Err(e) => {
            warn!(error = %e, "Term suggestion unavailable, using manual names only");
            manual.to_vec()
        }
    }
}

// ── Mock for testing ──────────────────────────────────────

/// Suggester returning fixed terms, or failing like an offline model.
pub struct MockTermSuggester {
    terms: Option<Vec<String>>,
}

impl MockTermSuggester {
    pub fn new(terms: &[&str]) -> Self {
        Self {
            terms: Some(terms.iter().map(|t| t.to_string()).collect()),
        }
    }

    pub fn offline() -> Self {
        Self { terms: None }
    }
}

impl TermSuggester for MockTermSuggester {
    fn suggest_terms(&self, _text: &str, _context: &str) -> Result<Vec<String>, AugmentError> {
        self.terms
            .clone()
            .ok_or_else(|| AugmentError::Llm(OllamaError::Connection("mock://offline".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::extraction::memory::{MemoryDocument, MemoryPage};
    use crate::pipeline::layout::BBox;
    use crate::pipeline::ollama::MockLlmClient;

    #[test]
    fn chunks_respect_sentence_boundaries() {
        let text = "First sentence here. Second one! Third?";
        let chunks = chunk_text(text, 25);
        assert_eq!(chunks, vec!["First sentence here.", "Second one! Third?"]);
        assert_eq!(chunk_text(text, 2000), vec![text.to_string()]);
    }

    #[test]
    fn oversized_sentence_is_its_own_chunk() {
        let long = "x".repeat(50);
        let text = format!("Short. {long}. Tail.");
        let chunks = chunk_text(&text, 20);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1], format!("{long}."));
    }

    #[test]
    fn empty_text_has_no_chunks() {
        assert!(chunk_text("", 2000).is_empty());
    }

    #[test]
    fn parses_json_arrays_and_fenced_replies() {
        assert_eq!(parse_terms(r#"["John Smith", "ACME"]"#), vec!["John Smith", "ACME"]);
        assert_eq!(
            parse_terms("```json\n[\"a@b.com\", 42, \"\"]\n```"),
            vec!["a@b.com"]
        );
    }

    #[test]
    fn falls_back_to_comma_split() {
        assert_eq!(
            parse_terms(r#"["John Smith", ACME Corp, 'x'"#),
            vec!["John Smith", "ACME Corp", "'x'"]
        );
        assert!(parse_terms("").is_empty());
    }

    #[test]
    fn merge_skips_case_insensitive_duplicates() {
        let manual = vec!["John Smith".to_string()];
        let merged = merge_terms(&manual, vec!["john smith".into(), "ACME".into(), "acme".into()]);
        assert_eq!(merged, vec!["John Smith", "ACME"]);
    }

    fn drawing() -> MemoryDocument {
        let page = || {
            MemoryPage::blank(595.0, 842.0)
                .with_word(BBox::new(10.0, 10.0, 50.0, 20.0), "Drawn")
                .with_word(BBox::new(55.0, 10.0, 90.0, 20.0), "by")
                .with_word(BBox::new(10.0, 40.0, 50.0, 50.0), "Rev")
        };
        MemoryDocument::new(vec![page(), page()])
    }

    #[test]
    fn document_text_drops_repeated_lines() {
        assert_eq!(document_text(&drawing()).unwrap(), "Drawn by\nRev");
    }

    #[test]
    fn ollama_suggester_parses_model_output() {
        let client = Arc::new(MockLlmClient::new(r#"["Jane Doe", "jane doe"]"#));
        let suggester = OllamaTermSuggester::new(client, "llama3".into());
        assert_eq!(suggester.suggest_terms("Jane Doe drew this.", "ctx").unwrap(), vec!["Jane Doe"]);
    }

    #[test]
    fn augmentation_degrades_when_offline() {
        let manual = vec!["ACME".to_string()];
        let offline = OllamaTermSuggester::new(Arc::new(MockLlmClient::offline()), "llama3".into());
        assert_eq!(augment_names(&offline, &drawing(), "ctx", &manual), manual);
        assert_eq!(
            augment_names(&MockTermSuggester::offline(), &drawing(), "ctx", &manual),
            manual
        );
    }

    #[test]
    fn augmentation_merges_suggestions() {
        let manual = vec!["ACME".to_string()];
        let merged = augment_names(&MockTermSuggester::new(&["Jane Doe", "acme"]), &drawing(), "", &manual);
        assert_eq!(merged, vec!["ACME", "Jane Doe"]);
    }
}
