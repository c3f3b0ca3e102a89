//! Style-matched text substitution over already-redacted names.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::{RedactionRect, ReplacementRequest};
use crate::pipeline::extraction::{ExtractionError, PdfDocument, TextStyle};
use crate::pipeline::layout::BBox;

/// Padding applied around the matched text as (left, top, right, bottom).
pub const OVERLAY_PADDING: (f32, f32, f32, f32) = (4.0, 2.0, 4.0, 4.0);
pub const MAX_FIT_ATTEMPTS: usize = 10;
pub const SHRINK_FACTOR: f32 = 0.9;

#[derive(Debug, Clone, PartialEq)]
pub enum OverlayOutcome {
    Drawn { font_size: f32 },
    /// The original text lies inside a redacted template zone.
    OverlapsTemplateZone,
    /// The new text is longer than the text it replaces.
    TooLong,
    /// No font size tried was small enough.
    DidNotFit,
    /// The document refused the drawing. The name stays redacted.
    Failed { reason: String },
}

/// Draws replacement text where manual names were redacted.
#[derive(Debug, Clone, Copy)]
pub struct ReplacementOverlay {
    pub padding: (f32, f32, f32, f32),
    pub max_attempts: usize,
    pub shrink: f32,
}

impl Default for ReplacementOverlay {
    fn default() -> Self {
        Self {
            padding: OVERLAY_PADDING,
            max_attempts: MAX_FIT_ATTEMPTS,
            shrink: SHRINK_FACTOR,
        }
    }
}

impl ReplacementOverlay {
    /// Apply every request in order. `template_rects` are the template zones
    /// redacted on this document; a request whose original box intersects one
    /// on the same page is left alone. Returns one outcome per request; a
    /// failed drawing never stops the rest.
    pub fn apply(
        &self,
        doc: &mut dyn PdfDocument,
        requests: &[ReplacementRequest],
        template_rects: &[RedactionRect],
    ) -> Vec<OverlayOutcome> {
        let mut by_page: BTreeMap<usize, Vec<BBox>> = BTreeMap::new();
        for r in template_rects {
            by_page.entry(r.page).or_default().push(r.bbox);
        }

        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            let overlaps = by_page
                .get(&request.page)
                .is_some_and(|zones| zones.iter().any(|z| z.intersects(&request.rect)));
            let outcome = if overlaps {
                debug!(page = request.page, old = %request.old_text, "Replacement overlaps a template zone");
                OverlayOutcome::OverlapsTemplateZone
            } else if request.new_text.chars().count() > request.old_text.chars().count() {
                debug!(page = request.page, old = %request.old_text, "Replacement text longer than original");
                OverlayOutcome::TooLong
            } else {
                self.draw(doc, request).unwrap_or_else(|e| {
                    warn!(
                        page = request.page,
                        old = %request.old_text,
                        error = %e,
                        "Replacement text could not be drawn"
                    );
                    OverlayOutcome::Failed { reason: e.to_string() }
                })
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    fn draw(
        &self,
        doc: &mut dyn PdfDocument,
        request: &ReplacementRequest,
    ) -> Result<OverlayOutcome, ExtractionError> {
        let (left, top, right, bottom) = self.padding;
        let rect = request.rect.padded(left, top, right, bottom);
        let rotation = doc.page_geometry(request.page)?.rotation;

        let mut style = request.style.clone();
        for attempt in 0..self.max_attempts {
            if doc.draw_text(request.page, &rect, &request.new_text, &style, rotation)? {
                debug!(
                    page = request.page,
                    attempt,
                    font_size = style.size,
                    "Replacement text drawn"
                );
                return Ok(OverlayOutcome::Drawn { font_size: style.size });
            }
            style = TextStyle {
                size: style.size * self.shrink,
                ..style
            };
        }

        warn!(
            page = request.page,
            text = %request.new_text,
            bbox = %rect,
            "Replacement text does not fit even at the smallest size"
        );
        Ok(OverlayOutcome::DidNotFit)
    }
}
