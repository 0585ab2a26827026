//! Perceptual fingerprints.
//!
//! The primary hash is a 64-bit DCT mean hash (pHash); mean (`ahash`) and
//! gradient (`dhash`) hashes are recorded alongside it for diagnostics only.
//! All hashes are serialized as 16 lowercase hex characters.

use image::{ColorType, RgbImage};
use img_hash::{HashAlg, HasherConfig};
use psdforge_core::{AppError, HashRecord};
use serde_json::Map;
use std::path::Path;

/// Bits per hash, and the distance reported for incomparable hashes
pub const MAX_DISTANCE: u32 = 64;
const HASH_SIDE: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Perceptual,
    Mean,
    Gradient,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PerceptualHasher;

impl PerceptualHasher {
    pub fn new() -> Self {
        Self
    }

    /// Decode `path`, normalize it to RGB and fingerprint it.
    ///
    /// Unreadable images are a `HashFailure`.
    pub fn hash_image(&self, path: &Path) -> Result<(String, HashRecord), AppError> {
        let decoded = image::open(path).map_err(|e| {
            AppError::HashFailure(format!("Failed to open {}: {}", path.display(), e))
        })?;
        let file_size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        let image_mode = mode_name(decoded.color());
        let rgb = decoded.to_rgb8();

        let phash = digest(&rgb, Kind::Perceptual)?;
        let record = HashRecord {
            phash: phash.clone(),
            ahash: Some(digest(&rgb, Kind::Mean)?),
            dhash: Some(digest(&rgb, Kind::Gradient)?),
            image_size: rgb.dimensions(),
            image_mode,
            file_size,
            created_at: Some(chrono::Utc::now().to_rfc3339()),
            source_path: path.display().to_string(),
            extra: Map::new(),
        };
        Ok((phash, record))
    }

    /// pHash of an in-memory bitmap
    pub fn phash(&self, image: &RgbImage) -> Result<String, AppError> {
        digest(image, Kind::Perceptual)
    }

    /// Mean hash of an in-memory bitmap, used as the composite fingerprint
    pub fn average_hash(&self, image: &RgbImage) -> Result<String, AppError> {
        digest(image, Kind::Mean)
    }
}

fn digest(image: &RgbImage, kind: Kind) -> Result<String, AppError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(AppError::HashFailure("Cannot hash an empty image".to_string()));
    }

    let config = HasherConfig::new().hash_size(HASH_SIDE, HASH_SIDE);
    let hasher = match kind {
        Kind::Perceptual => config.hash_alg(HashAlg::Mean).preproc_dct(),
        Kind::Mean => config.hash_alg(HashAlg::Mean),
        Kind::Gradient => config.hash_alg(HashAlg::Gradient),
    }
    .to_hasher();

    // img_hash links its own `image` version, so the pixels cross over raw
    let buffer = img_hash::image::RgbImage::from_raw(width, height, image.as_raw().clone())
        .ok_or_else(|| AppError::HashFailure("Failed to create image for hashing".to_string()))?;
    let hash = hasher.hash_image(&img_hash::image::DynamicImage::ImageRgb8(buffer));

    Ok(hex::encode(hash.as_bytes()))
}

fn mode_name(color: ColorType) -> String {
    match color {
        ColorType::L8 | ColorType::L16 => "L",
        ColorType::La8 | ColorType::La16 => "LA",
        ColorType::Rgb8 | ColorType::Rgb16 | ColorType::Rgb32F => "RGB",
        ColorType::Rgba8 | ColorType::Rgba16 | ColorType::Rgba32F => "RGBA",
        _ => "RGB",
    }
    .to_string()
}

/// Hamming distance between two hex hashes.
///
/// Returns [`MAX_DISTANCE`] when either side fails to parse or the lengths
/// differ, so bad entries sort last instead of raising.
pub fn hamming_distance(a: &str, b: &str) -> u32 {
    let (Ok(a), Ok(b)) = (hex::decode(a), hex::decode(b)) else {
        return MAX_DISTANCE;
    };
    if a.is_empty() || a.len() != b.len() {
        return MAX_DISTANCE;
    }
    a.iter().zip(&b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::rgb_image;
    use tempfile::tempdir;

    fn checkerboard(size: u32) -> RgbImage {
        rgb_image(size, size, |x, y| {
            if (x / 16 + y / 16) % 2 == 0 {
                [0, 0, 0]
            } else {
                [255, 255, 255]
            }
        })
    }

    #[test]
    fn test_distance_self_is_zero() {
        assert_eq!(hamming_distance("ffee000011112222", "ffee000011112222"), 0);
    }

    #[test]
    fn test_distance_symmetry() {
        let pairs = [
            ("0000000000000000", "ffffffffffffffff"),
            ("0f0f0f0f0f0f0f0f", "00000000000000ff"),
            ("8000000000000001", "0000000000000000"),
        ];
        for (a, b) in pairs {
            assert_eq!(hamming_distance(a, b), hamming_distance(b, a));
        }
        assert_eq!(hamming_distance("0000000000000000", "ffffffffffffffff"), 64);
        assert_eq!(hamming_distance("8000000000000001", "0000000000000000"), 2);
    }

    #[test]
    fn test_distance_parse_failure_is_max() {
        assert_eq!(hamming_distance("zz", "00"), MAX_DISTANCE);
        assert_eq!(hamming_distance("0000", "00000000"), MAX_DISTANCE);
        assert_eq!(hamming_distance("", ""), MAX_DISTANCE);
    }

    #[test]
    fn test_hashes_are_16_hex_chars() {
        let hasher = PerceptualHasher::new();
        let img = checkerboard(64);
        let phash = hasher.phash(&img).unwrap();
        let ahash = hasher.average_hash(&img).unwrap();
        assert_eq!(phash.len(), 16);
        assert_eq!(ahash.len(), 16);
        assert!(phash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hash_is_deterministic() {
        let hasher = PerceptualHasher::new();
        let img = checkerboard(64);
        assert_eq!(hasher.phash(&img).unwrap(), hasher.phash(&img).unwrap());
    }

    #[test]
    fn test_hash_image_from_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("board.png");
        checkerboard(64).save(&path).unwrap();

        let (phash, record) = PerceptualHasher::new().hash_image(&path).unwrap();
        assert_eq!(record.phash, phash);
        assert_eq!(record.image_size, (64, 64));
        assert_eq!(record.image_mode, "RGB");
        assert!(record.ahash.is_some());
        assert!(record.dhash.is_some());
        assert!(record.file_size > 0);
        assert!(record.created_at.is_some());
    }

    #[test]
    fn test_unreadable_image_is_hash_failure() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.jpeg");
        std::fs::write(&path, b"definitely not an image").unwrap();

        let err = PerceptualHasher::new().hash_image(&path).unwrap_err();
        assert!(matches!(err, AppError::HashFailure(_)));
    }
}
