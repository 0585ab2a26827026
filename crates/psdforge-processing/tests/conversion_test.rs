//! End-to-end conversion and deduplication against a file-backed hash index.
//!
//! Run with: `cargo test -p psdforge-processing --test conversion_test`

use psdforge_core::{ConversionOptions, DuplicateAction, OutputFormat, QualityProfile, Resolution};
use psdforge_processing::test_helpers::{write_psd, LayerSpec, PsdSpec, MODE_LAB};
use psdforge_processing::{DuplicateDetector, ExternalTools, ImageOptimizer, PsdConverter};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

fn scenario_options() -> ConversionOptions {
    ConversionOptions {
        format: OutputFormat::Jpeg,
        quality: Some(75),
        generate_thumbnails: false,
        enable_deduplication: true,
        ..ConversionOptions::default()
    }
}

fn converter(index: &Path) -> (PsdConverter, Arc<DuplicateDetector>) {
    let detector = Arc::new(DuplicateDetector::new(index, 5));
    let converter = PsdConverter::new()
        .with_optimizer(ImageOptimizer::with_tools(ExternalTools::none()))
        .with_detector(Arc::clone(&detector));
    (converter, detector)
}

fn banner() -> PsdSpec {
    PsdSpec::from_fn(2000, 1500, |x, y| {
        if (x / 250 + y / 250) % 2 == 0 {
            [30, 60, 200]
        } else {
            [240, 220, 40]
        }
    })
}

#[test]
fn test_first_conversion_registers_unique_hash() {
    let dir = tempdir().unwrap();
    let index_path = dir.path().join("hash_database.json");
    let input = write_psd(dir.path(), "banner.psd", &banner());
    let (converter, detector) = converter(&index_path);

    let output = dir.path().join("job_b").join("banner.jpeg");
    let result = converter.convert(&input, &output, &scenario_options());

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.quality, Some(75));
    assert_eq!(result.dimensions, Some(Resolution::new(2000, 1500)));
    assert_eq!(detector.len(), 1);
    assert!(index_path.exists());

    let info = result.deduplication.as_ref().unwrap();
    let check = &info.results["banner.jpeg"];
    assert_eq!(check.action, DuplicateAction::StoreUnique);
    let phash = check.phash.as_deref().unwrap();

    let final_name = result
        .output_file
        .as_ref()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .unwrap()
        .to_string();
    assert!(final_name.starts_with(&phash[..8]));
    assert_eq!(Some(final_name.as_str()), check.recommended_filename.as_deref());
    assert!(result.output_file.as_ref().unwrap().exists());
}

#[test]
fn test_second_conversion_is_duplicate_and_kept() {
    let dir = tempdir().unwrap();
    let index_path = dir.path().join("hash_database.json");
    let input = write_psd(dir.path(), "banner.psd", &banner());
    let (converter, detector) = converter(&index_path);

    let first = converter.convert(&input, &dir.path().join("job_b").join("banner.jpeg"), &scenario_options());
    assert!(first.success);
    let first_hash = first.deduplication.as_ref().unwrap().results["banner.jpeg"]
        .phash
        .clone()
        .unwrap();

    let second_output = dir.path().join("job_c").join("banner.jpeg");
    let second = converter.convert(&input, &second_output, &scenario_options());

    assert!(second.success, "{:?}", second.error);
    assert!(second_output.exists());
    assert_eq!(detector.len(), 1);

    let info = second.deduplication.as_ref().unwrap();
    let check = &info.results["banner.jpeg"];
    assert!(check.is_duplicate);
    assert_eq!(check.action, DuplicateAction::SkipDuplicate);
    let reference = &info.duplicate_references["banner.jpeg"];
    assert_eq!(reference.hash, first_hash);
    assert_eq!(reference.action, "kept_for_job");

    // A fresh detector over the same file sees the persisted entry
    let reopened = DuplicateDetector::new(&index_path, 5);
    assert_eq!(reopened.len(), 1);
}

#[test]
fn test_high_quality_profile_with_thumbnails() {
    let dir = tempdir().unwrap();
    let input = write_psd(dir.path(), "card.psd", &PsdSpec::split_vertical(900, 600));
    let converter = PsdConverter::new().with_optimizer(ImageOptimizer::with_tools(ExternalTools::none()));
    let options = ConversionOptions {
        format: OutputFormat::WebP,
        quality_profile: QualityProfile::HighQuality,
        enable_deduplication: false,
        ..ConversionOptions::default()
    };

    let result = converter.convert(&input, &dir.path().join("card.webp"), &options);
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.quality, Some(90));
    let sizes: Vec<Resolution> = result.thumbnails.iter().map(|t| t.dimensions).collect();
    assert_eq!(
        sizes,
        vec![
            Resolution::new(150, 100),
            Resolution::new(300, 200),
            Resolution::new(800, 533),
        ]
    );
    assert!(result.thumbnails.iter().all(|t| t.path.exists()));
}

#[test]
fn test_invalid_quality_rejected_before_io() {
    use psdforge_core::validation::RawConversionParams;

    let params = RawConversionParams {
        quality: Some(150),
        ..RawConversionParams::default()
    };
    let err = params.into_options().unwrap_err();
    assert_eq!(err.kind(), "invalid_input");
}

fn convert_flat(spec: &PsdSpec) -> (psdforge_core::ConversionResult, image::RgbImage) {
    let dir = tempdir().unwrap();
    let input = write_psd(dir.path(), "doc.psd", spec);
    let converter = PsdConverter::new().with_optimizer(ImageOptimizer::with_tools(ExternalTools::none()));
    let result = converter.convert(
        &input,
        &dir.path().join("doc.jpeg"),
        &ConversionOptions::basic(OutputFormat::Jpeg, 95),
    );
    assert!(result.success, "{:?}", result.error);
    let decoded = image::open(result.output_file.as_ref().unwrap()).unwrap().to_rgb8();
    (result, decoded)
}

fn assert_near(image: &image::RgbImage, x: u32, y: u32, expected: [u8; 3]) {
    let actual = image.get_pixel(x, y).0;
    for (a, e) in actual.iter().zip(expected) {
        assert!((*a as i16 - e as i16).abs() <= 8, "pixel ({}, {}) is {:?}, expected {:?}", x, y, actual, expected);
    }
}

#[test]
fn test_cmyk_document_converts_to_rgb() {
    // Full cyan ink, stored inverted
    let (result, image) = convert_flat(&PsdSpec::cmyk(32, 32, [0, 255, 255, 255]).with_rle());
    assert!(!result.composite_was_empty);
    assert_near(&image, 16, 16, [0, 255, 255]);
}

#[test]
fn test_grayscale_document() {
    let (result, image) = convert_flat(&PsdSpec::grayscale(32, 32, |_, _| 100));
    assert!(!result.composite_was_empty);
    assert_near(&image, 16, 16, [100, 100, 100]);
}

#[test]
fn test_indexed_document_uses_palette() {
    let palette = [[200, 30, 30], [30, 30, 200]];
    let spec = PsdSpec::indexed(32, 32, &palette, |x, _| if x < 16 { 0 } else { 1 });
    let (result, image) = convert_flat(&spec);
    assert!(!result.composite_was_empty);
    assert_near(&image, 4, 16, [200, 30, 30]);
    assert_near(&image, 28, 16, [30, 30, 200]);
}

#[test]
fn test_partial_alpha_flattens_onto_white() {
    let spec = PsdSpec::solid(32, 32, [0, 0, 0]).with_alpha(|_, _| 128);
    let (result, image) = convert_flat(&spec);
    assert!(!result.composite_was_empty);
    assert_near(&image, 16, 16, [127, 127, 127]);
}

#[test]
fn test_layered_document_is_composited() {
    let spec = PsdSpec::from_fn(32, 32, |x, _| if x < 16 { [0, 0, 255] } else { [255, 0, 0] })
        .with_layer(LayerSpec::filled("Background", 0, 0, 32, 32, [255, 0, 0]))
        .with_layer(LayerSpec::filled("Badge", 0, 0, 16, 32, [0, 0, 255]));
    let (result, image) = convert_flat(&spec);
    assert!(!result.composite_was_empty);
    assert_near(&image, 4, 16, [0, 0, 255]);
    assert_near(&image, 28, 16, [255, 0, 0]);
}

#[test]
fn test_lab_document_falls_back_to_white() {
    let spec = PsdSpec::with_planes(16, 16, MODE_LAB, vec![vec![200; 256], vec![128; 256], vec![128; 256]]);
    let (result, image) = convert_flat(&spec);
    assert!(result.composite_was_empty);
    assert_near(&image, 8, 8, [255, 255, 255]);
}
