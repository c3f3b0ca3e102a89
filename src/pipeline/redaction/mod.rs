//! Destructive edits: opaque redaction, styled text substitution and
//! substitute-image placement. All coordinates are in the page's native frame.

pub mod engine;
pub mod detection;
pub mod overlay;
pub mod placement;

pub use engine::*;
pub use detection::*;
pub use overlay::*;
pub use placement::*;

use serde::{Deserialize, Serialize};

use crate::pipeline::layout::BBox;

/// A rectangle to white out on one page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RedactionRect {
    pub page: usize,
    pub bbox: BBox,
}

impl RedactionRect {
    pub fn new(page: usize, bbox: BBox) -> Self {
        Self { page, bbox }
    }

    /// Build from loosely-typed input. Negative pages and boxes that are not
    /// four numbers yield `None`.
    pub fn from_parts(page: i64, bbox: &[f32]) -> Option<Self> {
        let page = usize::try_from(page).ok()?;
        Some(Self {
            page,
            bbox: BBox::from_slice(bbox)?,
        })
    }
}
