//! Manual name detection: locate user-supplied phrases on every page and
//! sample the style of the text they cover.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::RedactionRect;
use crate::pipeline::extraction::{ExtractionError, PdfDocument, TextSpan, TextStyle, WordBox};
use crate::pipeline::layout::BBox;

/// A located name that should be overwritten with `new_text` after redaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplacementRequest {
    pub page: usize,
    /// Native-frame box of the matched text.
    pub rect: BBox,
    pub old_text: String,
    pub new_text: String,
    pub style: TextStyle,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManualMatches {
    /// Every occurrence of every name. Always redacted.
    pub rects: Vec<RedactionRect>,
    /// The subset of occurrences that have a replacement mapping.
    pub replacements: Vec<ReplacementRequest>,
}

/// Map a PDF font name onto one of the base-14 families the writer can embed.
pub fn normalize_font_name(font: &str) -> String {
    let f = font.to_lowercase();
    let family = if f.contains("helv") || f.contains("arial") {
        "helv"
    } else if f.contains("courier") {
        "courier"
    } else if f.contains("times") {
        "times"
    } else if f.contains("symbol") {
        "symbol"
    } else if f.contains("dingbat") || f.contains("zapf") {
        "zapfdingbats"
    } else {
        "helv"
    };
    family.to_string()
}

/// Style of the first span overlapping `rect`, or the default style.
pub fn sample_style(spans: &[TextSpan], rect: &BBox) -> TextStyle {
    spans
        .iter()
        .find(|span| span.bbox.intersects(rect))
        .map(|span| TextStyle {
            font: normalize_font_name(&span.style.font),
            ..span.style.clone()
        })
        .unwrap_or_default()
}

fn fold(token: &str) -> String {
    let trimmed = token.trim_matches(|c: char| !c.is_alphanumeric());
    if trimmed.is_empty() {
        token.to_lowercase()
    } else {
        trimmed.to_lowercase()
    }
}

/// Case-insensitive search for `phrase` as a run of consecutive words.
/// Surrounding punctuation on a word is ignored. Each hit is the union of the
/// matched word boxes.
pub fn find_phrase(words: &[WordBox], phrase: &str) -> Vec<BBox> {
    let tokens: Vec<String> = phrase.split_whitespace().map(fold).collect();
    if tokens.is_empty() || words.len() < tokens.len() {
        return Vec::new();
    }

    let mut hits = Vec::new();
    let mut start = 0;
    while start + tokens.len() <= words.len() {
        let window = &words[start..start + tokens.len()];
        let matched = window
            .iter()
            .zip(&tokens)
            .all(|(word, token)| fold(&word.text) == *token);
        if matched {
            let bbox = window[1..]
                .iter()
                .fold(window[0].bbox, |acc, w| acc.union(&w.bbox));
            hits.push(bbox);
            start += tokens.len();
        } else {
            start += 1;
        }
    }
    hits
}

/// Find every occurrence of every name on every page.
///
/// Names are trimmed; empty names are ignored. A replacement is requested for
/// an occurrence when `replacements` maps the name (as given) to new text.
pub fn collect_manual_matches(
    doc: &dyn PdfDocument,
    names: &[String],
    replacements: &BTreeMap<String, String>,
) -> Result<ManualMatches, ExtractionError> {
    let names: Vec<&str> = names
        .iter()
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .collect();
    let mut out = ManualMatches::default();
    if names.is_empty() {
        return Ok(out);
    }

    for page in 0..doc.page_count() {
        let words = doc.words(page)?;
        let mut spans: Option<Vec<TextSpan>> = None;
        for name in &names {
            for rect in find_phrase(&words, name) {
                debug!(page, name, bbox = %rect, "Manual name matched");
                out.rects.push(RedactionRect::new(page, rect));
                if let Some(new_text) = replacements.get(*name) {
                    if spans.is_none() {
                        spans = Some(doc.spans(page)?);
                    }
                    let page_spans = spans.as_deref().unwrap_or_default();
                    out.replacements.push(ReplacementRequest {
                        page,
                        rect,
                        old_text: (*name).to_string(),
                        new_text: new_text.clone(),
                        style: sample_style(page_spans, &rect),
                    });
                }
            }
        }
    }

    info!(
        names = names.len(),
        matches = out.rects.len(),
        replacements = out.replacements.len(),
        "Manual name detection complete"
    );
    Ok(out)
}
