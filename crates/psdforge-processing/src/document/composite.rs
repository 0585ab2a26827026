//! Layer compositing.

use ::image::{Rgb, RgbImage};
use ::psd::Psd;
use psdforge_core::AppError;
use std::panic::{catch_unwind, AssertUnwindSafe};

use super::header::PsdHeader;
use super::merged::{decode_merged, Sections, MODE_RGB};

/// Flattened RGB bitmap of a PSD
#[derive(Debug, Clone)]
pub struct Composite {
    pub image: RgbImage,
    /// True when compositing produced no visible pixels and a white
    /// background was substituted.
    pub was_empty: bool,
    pub layer_count: usize,
}

/// Decode the container and flatten it onto white.
///
/// Layered RGB documents are flattened from their visible layers, falling
/// back to the merged image data if that fails. Every other document is read
/// from the merged image data, with CMYK, grayscale, bitmap, duotone and
/// indexed samples converted to RGB. An unreadable container is a
/// `DecodeFailure`. A composite with no visible pixels, or a color mode with
/// no RGB rendering, yields a white bitmap with `was_empty` set.
pub fn composite(data: &[u8]) -> Result<Composite, AppError> {
    let header = PsdHeader::parse(data)?;
    if !header.has_valid_dimensions() {
        return Err(AppError::DecodeFailure(
            "PSD has invalid dimensions".to_string(),
        ));
    }
    let (width, height) = (header.width, header.height);
    let layer_count = Sections::split(data, &header)?.layer_count();

    let rgba = if header.color_mode == MODE_RGB && layer_count > 0 {
        match flatten_layers(data) {
            Ok(buf) => Some(buf),
            Err(e) => {
                tracing::warn!(error = %e, layer_count, "Layer compositing failed, using merged image data");
                decode_merged(data, &header)?
            }
        }
    } else {
        decode_merged(data, &header)?
    };

    let expected_len = width as usize * height as usize * 4;
    let image = match rgba {
        Some(buf) if buf.len() != expected_len => {
            return Err(AppError::CompositeFailure(format!(
                "Composite has {} bytes, expected {}",
                buf.len(),
                expected_len
            )));
        }
        Some(buf) if has_visible_pixels(&buf) => Some(flatten_onto_white(width, height, &buf)),
        Some(_) => None,
        None => {
            tracing::warn!(
                color_mode = header.color_mode_name(),
                "Color mode has no RGB rendering"
            );
            None
        }
    };

    match image {
        Some(image) => Ok(Composite {
            image,
            was_empty: false,
            layer_count,
        }),
        None => {
            tracing::warn!(width, height, "PSD composite is empty, creating white background");
            Ok(Composite {
                image: RgbImage::from_pixel(width, height, Rgb([255, 255, 255])),
                was_empty: true,
                layer_count,
            })
        }
    }
}

fn flatten_layers(data: &[u8]) -> Result<Vec<u8>, AppError> {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let psd = Psd::from_bytes(data).map_err(|e| AppError::CompositeFailure(e.to_string()))?;
        psd.flatten_layers_rgba(&|(_, layer)| layer.visible())
            .map_err(|e| AppError::CompositeFailure(e.to_string()))
    }));

    match result {
        Ok(res) => res,
        Err(_) => Err(AppError::CompositeFailure(
            "PSD compositor panicked".to_string(),
        )),
    }
}

fn has_visible_pixels(rgba: &[u8]) -> bool {
    rgba.chunks_exact(4).any(|px| px[3] != 0)
}

/// Alpha-blend RGBA onto an opaque white background.
pub fn flatten_onto_white(width: u32, height: u32, rgba: &[u8]) -> RgbImage {
    let mut out = RgbImage::new(width, height);
    for (dst, src) in out.pixels_mut().zip(rgba.chunks_exact(4)) {
        let alpha = src[3] as u32;
        let blend = |c: u8| ((c as u32 * alpha + 255 * (255 - alpha) + 127) / 255) as u8;
        *dst = Rgb([blend(src[0]), blend(src[1]), blend(src[2])]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{build_psd, LayerSpec, PsdSpec, MODE_LAB};

    #[test]
    fn test_composite_flat_rgb() {
        let data = build_psd(&PsdSpec::solid(8, 6, [200, 10, 40]));
        let composite = composite(&data).unwrap();
        assert_eq!(composite.image.dimensions(), (8, 6));
        assert!(!composite.was_empty);
        assert_eq!(composite.image.get_pixel(3, 3), &Rgb([200, 10, 40]));
    }

    #[test]
    fn test_composite_cmyk_converts_to_rgb() {
        let composite = composite(&build_psd(&PsdSpec::cmyk(16, 16, [255, 0, 255, 255]))).unwrap();
        assert!(!composite.was_empty);
        // Magenta ink only
        assert_eq!(composite.image.get_pixel(8, 8), &Rgb([255, 0, 255]));
    }

    #[test]
    fn test_composite_layered_document() {
        let spec = PsdSpec::from_fn(8, 8, |x, _| if x < 4 { [0, 0, 255] } else { [255, 0, 0] })
            .with_layer(LayerSpec::filled("Background", 0, 0, 8, 8, [255, 0, 0]))
            .with_layer(LayerSpec::filled("Badge", 0, 0, 4, 8, [0, 0, 255]));
        let composite = composite(&build_psd(&spec)).unwrap();
        assert_eq!(composite.layer_count, 2);
        assert!(!composite.was_empty);
        assert_eq!(composite.image.get_pixel(1, 4), &Rgb([0, 0, 255]));
        assert_eq!(composite.image.get_pixel(6, 4), &Rgb([255, 0, 0]));
    }

    #[test]
    fn test_composite_fully_transparent_is_empty() {
        let spec = PsdSpec::solid(6, 6, [10, 200, 10]).with_alpha(|_, _| 0);
        let composite = composite(&build_psd(&spec)).unwrap();
        assert!(composite.was_empty);
        assert_eq!(composite.image.get_pixel(3, 3), &Rgb([255, 255, 255]));
    }

    #[test]
    fn test_composite_lab_falls_back_to_white() {
        let spec = PsdSpec::with_planes(4, 4, MODE_LAB, vec![vec![200; 16], vec![128; 16], vec![128; 16]]);
        let composite = composite(&build_psd(&spec)).unwrap();
        assert!(composite.was_empty);
        assert_eq!(composite.image.dimensions(), (4, 4));
    }

    #[test]
    fn test_composite_truncated_data_is_decode_failure() {
        let mut data = build_psd(&PsdSpec::cmyk(8, 8, [0, 0, 0, 0]));
        data.truncate(data.len() - 20);
        assert!(matches!(composite(&data), Err(AppError::DecodeFailure(_))));
    }

    #[test]
    fn test_composite_rejects_garbage() {
        let result = composite(b"8BPS this is not a real container");
        assert!(matches!(result, Err(AppError::DecodeFailure(_))));
    }

    #[test]
    fn test_flatten_onto_white() {
        let rgba = [0, 0, 0, 0, 0, 0, 0, 255, 100, 100, 100, 128];
        let out = flatten_onto_white(3, 1, &rgba);
        assert_eq!(out.get_pixel(0, 0), &Rgb([255, 255, 255]));
        assert_eq!(out.get_pixel(1, 0), &Rgb([0, 0, 0]));
        let mid = out.get_pixel(2, 0)[0];
        assert!(mid > 100 && mid < 255);
    }

    #[test]
    fn test_has_visible_pixels() {
        assert!(!has_visible_pixels(&[1, 2, 3, 0, 4, 5, 6, 0]));
        assert!(has_visible_pixels(&[1, 2, 3, 0, 4, 5, 6, 1]));
    }
}
