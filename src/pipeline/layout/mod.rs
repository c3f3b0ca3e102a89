//! Paper class and orientation of a page, inferred from its physical size.
//!
//! Thresholds are on the longer side in points and are fixed: templates
//! captured on one installation must classify identically on every other.

pub mod bbox;

pub use bbox::{native_extent, normalize_rotation, BBox};

use serde::{Deserialize, Serialize};

use crate::pipeline::extraction::types::PdfDocument;
use crate::pipeline::extraction::ExtractionError;

/// Longer-side thresholds in points, checked from largest to smallest.
pub mod thresholds {
    pub const A1_ABOVE: f32 = 2000.0;
    pub const A2_ABOVE: f32 = 1500.0;
    pub const A3_ABOVE: f32 = 1100.0;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Paper {
    A1,
    A2,
    A3,
    A4,
    #[default]
    Any,
}

impl Paper {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A1 => "A1",
            Self::A2 => "A2",
            Self::A3 => "A3",
            Self::A4 => "A4",
            Self::Any => "ANY",
        }
    }
}

impl std::str::FromStr for Paper {
    type Err = std::convert::Infallible;

    /// Unknown values widen to `Any` rather than failing.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_uppercase().as_str() {
            "A1" => Self::A1,
            "A2" => Self::A2,
            "A3" => Self::A3,
            "A4" => Self::A4,
            _ => Self::Any,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Orientation {
    Horizontal,
    Vertical,
    #[default]
    Any,
}

impl Orientation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Horizontal => "H",
            Self::Vertical => "V",
            Self::Any => "ANY",
        }
    }
}

impl std::str::FromStr for Orientation {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_uppercase().as_str() {
            "H" | "HOR" | "HORIZ" | "HORIZONTAL" | "LANDSCAPE" => Self::Horizontal,
            "V" | "VERT" | "VERTICAL" | "PORTRAIT" | "P" => Self::Vertical,
            _ => Self::Any,
        })
    }
}

macro_rules! lenient_string_conversions {
    ($($name:ident),+) => {
        $(
            impl From<String> for $name {
                fn from(s: String) -> Self {
                    match s.parse() {
                        Ok(v) => v,
                        Err(never) => match never {},
                    }
                }
            }

            impl From<$name> for String {
                fn from(v: $name) -> Self {
                    v.as_str().to_string()
                }
            }

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    f.write_str(self.as_str())
                }
            }
        )+
    };
}

lenient_string_conversions!(Paper, Orientation);

/// Concrete layout of a page. Never contains `Any`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageLayout {
    pub paper: Paper,
    pub orientation: Orientation,
}

impl PageLayout {
    /// Whether a zone tagged with `paper`/`orientation` applies to this layout.
    /// `Any` is a wildcard on each axis independently.
    pub fn admits(&self, paper: Paper, orientation: Orientation) -> bool {
        (paper == Paper::Any || paper == self.paper)
            && (orientation == Orientation::Any || orientation == self.orientation)
    }
}

impl std::fmt::Display for PageLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.paper, self.orientation)
    }
}

/// Classify a page from its displayed width and height in points.
pub fn classify_layout(width: f32, height: f32) -> PageLayout {
    let orientation = if width >= height {
        Orientation::Horizontal
    } else {
        Orientation::Vertical
    };
    let longest = width.max(height);
    let paper = if longest > thresholds::A1_ABOVE {
        Paper::A1
    } else if longest > thresholds::A2_ABOVE {
        Paper::A2
    } else if longest > thresholds::A3_ABOVE {
        Paper::A3
    } else {
        Paper::A4
    };
    PageLayout { paper, orientation }
}

/// Classify a whole document by its first page.
pub fn classify_document(doc: &dyn PdfDocument) -> Result<PageLayout, ExtractionError> {
    if doc.page_count() == 0 {
        return Err(ExtractionError::InvalidDocument(
            "document has no pages".into(),
        ));
    }
    let geometry = doc.page_geometry(0)?;
    Ok(classify_layout(geometry.width, geometry.height))
}

/// Per-page layouts, for documents that mix sheet sizes.
pub fn classify_pages(doc: &dyn PdfDocument) -> Result<Vec<PageLayout>, ExtractionError> {
    (0..doc.page_count())
        .map(|page| {
            let geometry = doc.page_geometry(page)?;
            Ok(classify_layout(geometry.width, geometry.height))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::extraction::memory::{MemoryDocument, MemoryPage};

    #[test]
    fn a4_portrait() {
        let layout = classify_layout(595.0, 842.0);
        assert_eq!(layout.paper, Paper::A4);
        assert_eq!(layout.orientation, Orientation::Vertical);
    }

    #[test]
    fn a3_landscape() {
        let layout = classify_layout(1191.0, 842.0);
        assert_eq!(layout.paper, Paper::A3);
        assert_eq!(layout.orientation, Orientation::Horizontal);
    }

    #[test]
    fn thresholds_are_exclusive() {
        assert_eq!(classify_layout(1100.0, 700.0).paper, Paper::A4);
        assert_eq!(classify_layout(1100.5, 700.0).paper, Paper::A3);
        assert_eq!(classify_layout(1500.0, 700.0).paper, Paper::A3);
        assert_eq!(classify_layout(1684.0, 1191.0).paper, Paper::A2);
        assert_eq!(classify_layout(2000.0, 1000.0).paper, Paper::A2);
        assert_eq!(classify_layout(2384.0, 1684.0).paper, Paper::A1);
    }

    #[test]
    fn square_page_is_horizontal() {
        assert_eq!(classify_layout(600.0, 600.0).orientation, Orientation::Horizontal);
    }

    #[test]
    fn any_is_wildcard_on_each_axis() {
        let papers = [Paper::A1, Paper::A2, Paper::A3, Paper::A4];
        let orientations = [Orientation::Horizontal, Orientation::Vertical];
        for paper in papers {
            for orientation in orientations {
                let layout = PageLayout { paper, orientation };
                assert!(layout.admits(Paper::Any, Orientation::Any));
                assert!(layout.admits(paper, Orientation::Any));
                assert!(layout.admits(Paper::Any, orientation));
            }
        }
        let a4v = classify_layout(595.0, 842.0);
        assert!(!a4v.admits(Paper::A3, Orientation::Any));
        assert!(!a4v.admits(Paper::Any, Orientation::Horizontal));
        assert!(a4v.admits(Paper::A4, Orientation::Vertical));
    }

    #[test]
    fn lenient_parsing() {
        assert_eq!("a3".parse::<Paper>().unwrap(), Paper::A3);
        assert_eq!("B5".parse::<Paper>().unwrap(), Paper::Any);
        assert_eq!("landscape".parse::<Orientation>().unwrap(), Orientation::Horizontal);
        assert_eq!(" P ".parse::<Orientation>().unwrap(), Orientation::Vertical);
        assert_eq!("".parse::<Orientation>().unwrap(), Orientation::Any);
    }

    #[test]
    fn serde_uses_short_codes() {
        let json = serde_json::to_string(&(Paper::Any, Orientation::Horizontal)).unwrap();
        assert_eq!(json, r#"["ANY","H"]"#);
        let back: (Paper, Orientation) = serde_json::from_str(r#"["a2","portrait"]"#).unwrap();
        assert_eq!(back, (Paper::A2, Orientation::Vertical));
    }

    #[test]
    fn zero_page_document_is_invalid() {
        let doc = MemoryDocument::new(Vec::new());
        let err = classify_document(&doc).unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidDocument(_)));
    }

    #[test]
    fn document_classified_by_first_page() {
        let doc = MemoryDocument::new(vec![
            MemoryPage::blank(595.0, 842.0),
            MemoryPage::blank(1191.0, 842.0),
        ]);
        let layout = classify_document(&doc).unwrap();
        assert_eq!(layout, classify_layout(595.0, 842.0));
        let pages = classify_pages(&doc).unwrap();
        assert_eq!(pages[1].paper, Paper::A3);
    }
}
