//! Perceptual image fingerprints for zone crops.
//!
//! 64-bit DCT mean hash (pHash), stored as base64. Older tooling stored
//! hexadecimal hashes from a different hashing library; those are recognised
//! but never compared, since their bits do not line up with ours.

use image::DynamicImage;
use img_hash::{HashAlg, HasherConfig, ImageHash};
use thiserror::Error;

/// Bits in a freshly computed hash.
pub const HASH_BITS: u32 = 64;

#[derive(Error, Debug, PartialEq)]
pub enum HashError {
    #[error("Undecodable image hash: {0:?}")]
    Decode(String),

    #[error("Legacy hexadecimal image hash {0:?} is not comparable")]
    Legacy(String),

    #[error("Image hash length mismatch: {left} bits vs {right} bits")]
    LengthMismatch { left: u32, right: u32 },
}

/// Compute the perceptual hash of a raster.
pub fn perceptual_hash(image: &DynamicImage) -> String {
    let hasher = HasherConfig::new()
        .hash_alg(HashAlg::Mean)
        .hash_size(8, 8)
        .preproc_dct()
        .to_hasher();
    hasher.hash_image(image).to_base64()
}

/// A 64-bit or 256-bit hash written as hexadecimal by older tooling.
pub fn is_legacy_hash(encoded: &str) -> bool {
    let s = encoded.trim();
    (s.len() == 16 || s.len() == 64) && hex::decode(s).is_ok()
}

/// Decode a stored base64 hash. Legacy hexadecimal hashes are an error.
pub fn decode_hash(encoded: &str) -> Result<ImageHash, HashError> {
    let trimmed = encoded.trim();
    if trimmed.is_empty() {
        return Err(HashError::Decode(encoded.to_string()));
    }
    if is_legacy_hash(trimmed) {
        return Err(HashError::Legacy(encoded.to_string()));
    }
    let hash: Result<ImageHash, _> = ImageHash::from_base64(trimmed);
    hash.map_err(|_| HashError::Decode(encoded.to_string()))
}

/// Hamming distance and bit length of two stored hashes.
///
/// Hashes of different lengths come from different algorithms and cannot be
/// compared; that is an error rather than a meaningless score.
pub fn hash_distance(a: &str, b: &str) -> Result<(u32, u32), HashError> {
    let a = decode_hash(a)?;
    let b = decode_hash(b)?;
    let left = (a.as_bytes().len() * 8) as u32;
    let right = (b.as_bytes().len() * 8) as u32;
    if left != right || left == 0 {
        return Err(HashError::LengthMismatch { left, right });
    }
    Ok((a.dist(&b), left))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn striped(width: u32, height: u32, period: u32) -> DynamicImage {
        let img = RgbImage::from_fn(width, height, |x, _| {
            if (x / period) % 2 == 0 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn hash_is_deterministic() {
        let img = striped(64, 64, 8);
        assert_eq!(perceptual_hash(&img), perceptual_hash(&img));
    }

    #[test]
    fn hash_has_64_bits() {
        let encoded = perceptual_hash(&striped(40, 20, 5));
        let decoded = decode_hash(&encoded).unwrap();
        assert_eq!(decoded.as_bytes().len() * 8, HASH_BITS as usize);
    }

    #[test]
    fn identical_hashes_have_zero_distance() {
        let encoded = perceptual_hash(&striped(64, 64, 8));
        assert_eq!(hash_distance(&encoded, &encoded).unwrap(), (0, 64));
    }

    fn encoded(bytes: &[u8]) -> String {
        let hash: ImageHash = ImageHash::from_bytes(bytes).unwrap();
        hash.to_base64()
    }

    #[test]
    fn distance_counts_differing_bits() {
        let mut half = [0xffu8; 8];
        half[7] = 0x00;
        let (d, bits) = hash_distance(&encoded(&[0xff; 8]), &encoded(&half)).unwrap();
        assert_eq!(bits, 64);
        assert_eq!(d, 8);
    }

    #[test]
    fn length_mismatch_is_an_error() {
        let err = hash_distance(&encoded(&[0xff; 8]), &encoded(&[0xff; 32])).unwrap_err();
        assert_eq!(err, HashError::LengthMismatch { left: 64, right: 256 });
    }

    #[test]
    fn legacy_hex_hashes_are_never_compared() {
        assert!(is_legacy_hash("ffffffffffffff00"));
        assert!(is_legacy_hash(&"0a".repeat(32)));
        assert!(!is_legacy_hash(&encoded(&[0xff; 8])));
        assert!(!is_legacy_hash("ffffffffffffff0"));

        let live = encoded(&[0xff; 8]);
        let err = hash_distance("ffffffffffffffff", &live).unwrap_err();
        assert_eq!(err, HashError::Legacy("ffffffffffffffff".into()));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(decode_hash(""), Err(HashError::Decode(_))));
        assert!(matches!(decode_hash("!!not a hash!!"), Err(HashError::Decode(_))));
    }
}
