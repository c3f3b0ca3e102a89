//! Axis-aligned rectangles in page points, plus the rotation-aware transform.
//!
//! Zones are drawn against the page as displayed: top-left origin, rotation
//! already applied. Word boxes and redaction marks live in the page's native,
//! unrotated frame. [`BBox::for_rotation`] maps the first frame into the second
//! and must be applied identically when a template is captured and when a
//! target document is extracted or redacted.

use serde::{Deserialize, Serialize};

/// Rectangle `(x0, y0, x1, y1)` with a top-left origin, in PDF points.
///
/// Construction through [`BBox::new`] always normalizes the corners so that
/// `x0 <= x1` and `y0 <= y1`. Serialized as a four-element array.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BBox {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self {
            x0: x0.min(x1),
            y0: y0.min(y1),
            x1: x0.max(x1),
            y1: y0.max(y1),
        }
    }

    /// Build from a loosely-shaped slice. Anything other than four values is rejected.
    pub fn from_slice(values: &[f32]) -> Option<Self> {
        match values {
            [x0, y0, x1, y1] => Some(Self::new(*x0, *y0, *x1, *y1)),
            _ => None,
        }
    }

    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }

    pub fn has_positive_area(&self) -> bool {
        self.width() > 0.0 && self.height() > 0.0 && self.width().is_finite() && self.height().is_finite()
    }

    /// Tolerant overlap test; rectangles that merely touch count as overlapping.
    pub fn overlaps(&self, other: &BBox, tol: f32) -> bool {
        !(self.x1 < other.x0 - tol
            || self.x0 > other.x1 + tol
            || self.y1 < other.y0 - tol
            || self.y0 > other.y1 + tol)
    }

    /// Strict intersection: the shared region must have positive area.
    pub fn intersects(&self, other: &BBox) -> bool {
        self.x0 < other.x1 && other.x0 < self.x1 && self.y0 < other.y1 && other.y0 < self.y1
    }

    pub fn intersection(&self, other: &BBox) -> Option<BBox> {
        if !self.intersects(other) {
            return None;
        }
        Some(BBox::new(
            self.x0.max(other.x0),
            self.y0.max(other.y0),
            self.x1.min(other.x1),
            self.y1.min(other.y1),
        ))
    }

    pub fn union(&self, other: &BBox) -> BBox {
        BBox::new(
            self.x0.min(other.x0),
            self.y0.min(other.y0),
            self.x1.max(other.x1),
            self.y1.max(other.y1),
        )
    }

    /// Grow each edge outward by the given amounts.
    pub fn padded(&self, left: f32, top: f32, right: f32, bottom: f32) -> BBox {
        BBox::new(self.x0 - left, self.y0 - top, self.x1 + right, self.y1 + bottom)
    }

    /// True if the box has positive area and lies within `[0, width] x [0, height]`,
    /// allowing `tol` points of slack on every edge.
    pub fn fits_within(&self, width: f32, height: f32, tol: f32) -> bool {
        self.has_positive_area()
            && self.x0 >= -tol
            && self.y0 >= -tol
            && self.x1 <= width + tol
            && self.y1 <= height + tol
    }

    /// Map a box drawn on the displayed page into the page's native frame.
    ///
    /// `pw`/`ph` are the displayed page width and height. Rotations are taken
    /// modulo 360; angles that are not a multiple of 90 pass through unchanged.
    pub fn for_rotation(&self, pw: f32, ph: f32, rotation: i32) -> BBox {
        let BBox { x0, y0, x1, y1 } = *self;
        match normalize_rotation(rotation) {
            90 => BBox::new(y0, pw - x1, y1, pw - x0),
            180 => BBox::new(ph - y1, pw - x1, ph - y0, pw - x0),
            270 => BBox::new(ph - y1, x0, ph - y0, x1),
            _ => BBox::new(x0, y0, x1, y1),
        }
    }

    /// Inverse of [`BBox::for_rotation`]: native frame back to the displayed page.
    pub fn from_rotation(&self, pw: f32, ph: f32, rotation: i32) -> BBox {
        match normalize_rotation(rotation) {
            r @ (90 | 180 | 270) => self.for_rotation(ph, pw, (360 - r) as i32),
            _ => *self,
        }
    }
}

impl From<[f32; 4]> for BBox {
    fn from(v: [f32; 4]) -> Self {
        BBox::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BBox> for [f32; 4] {
    fn from(b: BBox) -> Self {
        [b.x0, b.y0, b.x1, b.y1]
    }
}

impl std::fmt::Display for BBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.1}, {:.1}, {:.1}, {:.1})", self.x0, self.y0, self.x1, self.y1)
    }
}

/// Reduce a rotation to `[0, 360)`.
pub fn normalize_rotation(rotation: i32) -> u32 {
    rotation.rem_euclid(360) as u32
}

/// Extent `(width, height)` of the native frame that [`BBox::for_rotation`] maps into.
pub fn native_extent(pw: f32, ph: f32, rotation: i32) -> (f32, f32) {
    match normalize_rotation(rotation) {
        90 | 180 | 270 => (ph, pw),
        _ => (pw, ph),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: &BBox, b: &BBox) {
        let eps = 1e-3;
        assert!(
            (a.x0 - b.x0).abs() < eps
                && (a.y0 - b.y0).abs() < eps
                && (a.x1 - b.x1).abs() < eps
                && (a.y1 - b.y1).abs() < eps,
            "expected {b}, got {a}"
        );
    }

    #[test]
    fn new_normalizes_reversed_corners() {
        let b = BBox::new(110.0, 60.0, 10.0, 10.0);
        assert_eq!(b, BBox::new(10.0, 10.0, 110.0, 60.0));
        assert_eq!(b.x0, 10.0);
        assert_eq!(b.y1, 60.0);
    }

    #[test]
    fn identity_at_zero_degrees() {
        let b = BBox::new(10.0, 10.0, 110.0, 60.0);
        assert_eq!(b.for_rotation(595.0, 842.0, 0), b);
        assert_eq!(b.for_rotation(595.0, 842.0, 360), b);
    }

    #[test]
    fn ninety_degree_rule() {
        let b = BBox::new(10.0, 20.0, 110.0, 60.0);
        // (y1, pw - x2, y2, pw - x1)
        let t = b.for_rotation(842.0, 595.0, 90);
        assert_close(&t, &BBox::new(20.0, 732.0, 60.0, 832.0));
    }

    #[test]
    fn one_eighty_degree_rule() {
        let b = BBox::new(10.0, 20.0, 110.0, 60.0);
        // (ph - y2, pw - x2, ph - y1, pw - x1)
        let t = b.for_rotation(595.0, 842.0, 180);
        assert_close(&t, &BBox::new(782.0, 485.0, 822.0, 585.0));
    }

    #[test]
    fn two_seventy_degree_rule() {
        let b = BBox::new(10.0, 20.0, 110.0, 60.0);
        // (ph - y2, x1, ph - y1, x2)
        let t = b.for_rotation(842.0, 595.0, 270);
        assert_close(&t, &BBox::new(535.0, 10.0, 575.0, 110.0));
    }

    #[test]
    fn odd_angles_pass_through() {
        let b = BBox::new(10.0, 20.0, 110.0, 60.0);
        assert_eq!(b.for_rotation(595.0, 842.0, 45), b);
        assert_eq!(b.for_rotation(595.0, 842.0, 91), b);
    }

    #[test]
    fn negative_rotation_wraps() {
        let b = BBox::new(10.0, 20.0, 110.0, 60.0);
        assert_eq!(b.for_rotation(842.0, 595.0, -90), b.for_rotation(842.0, 595.0, 270));
    }

    #[test]
    fn round_trip_for_every_quarter_turn() {
        let boxes = [
            BBox::new(10.0, 10.0, 110.0, 60.0),
            BBox::new(0.0, 0.0, 595.0, 842.0),
            BBox::new(300.5, 12.25, 410.0, 99.75),
        ];
        for rotation in [0, 90, 180, 270] {
            for b in &boxes {
                let there = b.for_rotation(595.0, 842.0, rotation);
                let back = there.from_rotation(595.0, 842.0, rotation);
                assert_close(&back, b);
            }
        }
    }

    #[test]
    fn transformed_box_stays_in_native_extent() {
        let b = BBox::new(5.0, 5.0, 590.0, 837.0);
        for rotation in [0, 90, 180, 270] {
            let (nw, nh) = native_extent(595.0, 842.0, rotation);
            let t = b.for_rotation(595.0, 842.0, rotation);
            assert!(t.fits_within(nw, nh, 0.1), "rotation {rotation}: {t} outside {nw}x{nh}");
        }
    }

    #[test]
    fn overlap_is_tolerant_of_touching_edges() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let touching = BBox::new(10.0, 0.0, 20.0, 10.0);
        let apart = BBox::new(10.5, 0.0, 20.0, 10.0);
        assert!(a.overlaps(&touching, 0.0));
        assert!(!a.intersects(&touching));
        assert!(!a.overlaps(&apart, 0.0));
        assert!(a.overlaps(&apart, 1.0));
    }

    #[test]
    fn fits_within_rejects_out_of_bounds_and_empty() {
        assert!(BBox::new(0.0, 0.0, 595.05, 842.0).fits_within(595.0, 842.0, 0.1));
        assert!(!BBox::new(0.0, 0.0, 596.0, 842.0).fits_within(595.0, 842.0, 0.1));
        assert!(!BBox::new(10.0, 10.0, 10.0, 50.0).fits_within(595.0, 842.0, 0.1));
    }

    #[test]
    fn serializes_as_array() {
        let b = BBox::new(1.0, 2.0, 3.0, 4.0);
        let json = serde_json::to_string(&b).unwrap();
        assert_eq!(json, "[1.0,2.0,3.0,4.0]");
        let back: BBox = serde_json::from_str("[3.0,4.0,1.0,2.0]").unwrap();
        assert_eq!(back, b);
    }

    #[test]
    fn from_slice_requires_four_values() {
        assert!(BBox::from_slice(&[1.0, 2.0, 3.0]).is_none());
        assert_eq!(BBox::from_slice(&[1.0, 2.0, 3.0, 4.0]), Some(BBox::new(1.0, 2.0, 3.0, 4.0)));
    }
}
