use std::collections::BTreeMap;

use tracing::{debug, info};

use super::RedactionRect;
use crate::pipeline::extraction::{ExtractionError, PdfDocument};
use crate::pipeline::layout::BBox;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RedactionSummary {
    /// Pages that had at least one mark committed.
    pub pages: Vec<usize>,
    pub applied: usize,
    /// Malformed rectangles or rectangles on pages the document does not have.
    pub skipped: usize,
}

/// Burns white-fill redactions into a document, one commit per page.
#[derive(Debug, Default, Clone, Copy)]
pub struct RedactionEngine;

impl RedactionEngine {
    pub fn redact(
        &self,
        doc: &mut dyn PdfDocument,
        rects: &[RedactionRect],
    ) -> Result<RedactionSummary, ExtractionError> {
        let page_count = doc.page_count();
        let mut summary = RedactionSummary::default();

        let mut by_page: BTreeMap<usize, Vec<BBox>> = BTreeMap::new();
        for rect in rects {
            if rect.page >= page_count || !rect.bbox.has_positive_area() {
                debug!(page = rect.page, bbox = %rect.bbox, "Skipping malformed redaction rectangle");
                summary.skipped += 1;
                continue;
            }
            by_page.entry(rect.page).or_default().push(rect.bbox);
        }

        for (page, boxes) in by_page {
            for bbox in &boxes {
                doc.mark_redaction(page, bbox)?;
            }
            summary.applied += doc.commit_redactions(page)?;
            summary.pages.push(page);
        }

        info!(
            pages = summary.pages.len(),
            applied = summary.applied,
            skipped = summary.skipped,
            "Redactions committed"
        );
        Ok(summary)
    }
}
