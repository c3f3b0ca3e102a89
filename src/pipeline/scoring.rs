//! Confidence scoring of live zone content against a reference fingerprint.
//!
//! Text similarity is containment: the share of reference words still present.
//! Extra live words never lower the score. Image similarity is one minus the
//! normalized Hamming distance of the perceptual hashes. A pair of hashes that
//! cannot be compared yields no image score, and the zone is low-confidence.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::pipeline::extraction::hash::{hash_distance, HashError};
use crate::pipeline::extraction::LiveFingerprint;
use crate::pipeline::layout::BBox;
use crate::pipeline::template::{ReferenceFingerprint, ZoneId};

#[derive(Error, Debug, PartialEq)]
pub enum ScoringError {
    #[error("Image hash comparison failed: {0}")]
    Hash(#[from] HashError),
}

/// Ratio of the text/image thresholds to the combined threshold.
pub const SIGNAL_THRESHOLD_RATIO: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub combined: f64,
    pub text: f64,
    pub image: f64,
}

impl Thresholds {
    /// Derive per-signal thresholds from a combined threshold.
    pub fn from_combined(combined: f64) -> Self {
        Self {
            combined,
            text: combined * SIGNAL_THRESHOLD_RATIO,
            image: combined * SIGNAL_THRESHOLD_RATIO,
        }
    }
}

/// Scores for one replicated zone on one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub page: usize,
    pub zone_id: ZoneId,
    /// Box as drawn.
    pub bbox: BBox,
    /// Box in the page's native frame.
    pub transformed: BBox,
    pub text_score: f64,
    /// `None` when the stored and live hashes cannot be compared.
    pub image_score: Option<f64>,
    pub combined_score: f64,
}

impl ScoreRecord {
    /// Any single weak signal disqualifies the zone.
    pub fn is_low_confidence(&self, thresholds: &Thresholds) -> bool {
        self.combined_score < thresholds.combined
            || self.text_score < thresholds.text
            || self.image_score.map_or(true, |s| s < thresholds.image)
    }
}

fn word_set(text: &str) -> HashSet<String> {
    text.split_whitespace().map(str::to_lowercase).collect()
}

/// `|ref ∩ live| / |ref|` over case-insensitive word sets; 1.0 for an empty reference.
pub fn text_score(reference: &str, live: &str) -> f64 {
    let reference = word_set(reference);
    if reference.is_empty() {
        return 1.0;
    }
    let live = word_set(live);
    let common = reference.iter().filter(|w| live.contains(*w)).count();
    common as f64 / reference.len() as f64
}

pub fn image_score(reference_hash: &str, live_hash: &str) -> Result<f64, ScoringError> {
    let (distance, bits) = hash_distance(reference_hash, live_hash)?;
    Ok(1.0 - distance as f64 / bits as f64)
}

/// Score one live zone. An incomparable hash counts as zero in the combined
/// score and leaves `image_score` empty.
pub fn score(reference: &ReferenceFingerprint, live: &LiveFingerprint) -> ScoreRecord {
    let text = text_score(&reference.text, &live.text);
    let image = match image_score(&reference.image_hash, &live.image_hash) {
        Ok(image) => Some(image),
        Err(e) => {
            warn!(
                page = live.page,
                zone_id = %live.zone_id,
                error = %e,
                "Image hashes not comparable; zone is low-confidence"
            );
            None
        }
    };
    ScoreRecord {
        page: live.page,
        zone_id: live.zone_id,
        bbox: live.bbox,
        transformed: live.transformed,
        text_score: text,
        image_score: image,
        combined_score: (text + image.unwrap_or(0.0)) / 2.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_reference_is_vacuously_confident() {
        assert_eq!(text_score("", "anything at all"), 1.0);
        assert_eq!(text_score("   ", ""), 1.0);
    }

    #[test]
    fn identical_text_scores_one() {
        assert_eq!(text_score("ACME Corp", "ACME Corp"), 1.0);
    }

    #[test]
    fn containment_is_case_insensitive_and_asymmetric() {
        assert_eq!(text_score("ACME Corp", "acme corp plus extra words"), 1.0);
        assert_eq!(text_score("ACME Corp Ltd Inc", "acme corp"), 0.5);
        assert_eq!(text_score("ACME", "Globex"), 0.0);
    }

    #[test]
    fn text_score_stays_in_unit_interval() {
        let samples = ["", "a", "a a a", "A b C", "x y z w", "b"];
        for r in samples {
            for l in samples {
                let s = text_score(r, l);
                assert!((0.0..=1.0).contains(&s), "{r:?} vs {l:?} gave {s}");
            }
        }
    }

    fn encoded(bytes: &[u8]) -> String {
        let hash: img_hash::ImageHash = img_hash::ImageHash::from_bytes(bytes).unwrap();
        hash.to_base64()
    }

    #[test]
    fn image_score_identity_and_symmetry() {
        let a = encoded(&[0xff; 8]);
        let b = encoded(&[0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0]);
        assert_eq!(image_score(&a, &a).unwrap(), 1.0);
        assert_eq!(image_score(&a, &b).unwrap(), image_score(&b, &a).unwrap());
        assert_eq!(image_score(&a, &b).unwrap(), 0.5);
    }

    #[test]
    fn image_score_rejects_mismatched_lengths() {
        let err = image_score(&encoded(&[0xff; 8]), &encoded(&[0; 32])).unwrap_err();
        assert!(matches!(err, ScoringError::Hash(HashError::LengthMismatch { .. })));
    }

    #[test]
    fn thresholds_derive_from_combined() {
        let t = Thresholds::from_combined(0.9);
        assert_eq!(t.combined, 0.9);
        assert!((t.text - 0.81).abs() < 1e-9);
        assert!((t.image - 0.81).abs() < 1e-9);
    }

    fn record(text: f64, image: f64) -> ScoreRecord {
        ScoreRecord {
            page: 0,
            zone_id: ZoneId(0),
            bbox: BBox::new(0.0, 0.0, 1.0, 1.0),
            transformed: BBox::new(0.0, 0.0, 1.0, 1.0),
            text_score: text,
            image_score: Some(image),
            combined_score: (text + image) / 2.0,
        }
    }

    #[test]
    fn any_weak_signal_disqualifies() {
        let t = Thresholds::from_combined(0.9);
        assert!(!record(1.0, 1.0).is_low_confidence(&t));
        assert!(!record(0.95, 0.9).is_low_confidence(&t));
        // Combined 0.9 passes, but text alone is under 0.81.
        assert!(record(0.8, 1.0).is_low_confidence(&t));
        assert!(record(1.0, 0.79).is_low_confidence(&t));
        assert!(record(0.85, 0.85).is_low_confidence(&t));
    }

    fn fingerprints(reference_hash: &str, live_hash: &str) -> (ReferenceFingerprint, LiveFingerprint) {
        let reference = ReferenceFingerprint {
            zone_id: ZoneId(4),
            text: "ACME Corp".into(),
            image_hash: reference_hash.into(),
        };
        let live = LiveFingerprint {
            zone_id: ZoneId(4),
            page: 2,
            bbox: BBox::new(10.0, 10.0, 110.0, 60.0),
            transformed: BBox::new(10.0, 10.0, 110.0, 60.0),
            text: "ACME".into(),
            image_hash: live_hash.into(),
            ocr_used: false,
        };
        (reference, live)
    }

    #[test]
    fn score_combines_both_signals() {
        let hash = encoded(&[0xff; 8]);
        let (reference, live) = fingerprints(&hash, &hash);
        let record = score(&reference, &live);
        assert_eq!(record.page, 2);
        assert_eq!(record.zone_id, ZoneId(4));
        assert_eq!(record.text_score, 0.5);
        assert_eq!(record.image_score, Some(1.0));
        assert_eq!(record.combined_score, 0.75);
    }

    #[test]
    fn incomparable_hashes_make_the_zone_low_confidence() {
        let t = Thresholds::from_combined(0.5);
        let live = encoded(&[0xff; 8]);
        for reference_hash in ["ffffffffffffffff".to_string(), "garbage!".to_string(), encoded(&[0xff; 32])] {
            let (mut reference, live) = fingerprints(&reference_hash, &live);
            reference.text = "ACME".into();
            let record = score(&reference, &live);
            assert_eq!(record.text_score, 1.0);
            assert_eq!(record.image_score, None, "{reference_hash}");
            assert_eq!(record.combined_score, 0.5);
            assert!(record.is_low_confidence(&t));
        }
    }
}
