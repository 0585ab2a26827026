//! Archive processing end to end: validate, extract, convert, summarize.

use psdforge_core::{ConversionOptions, OutputFormat};
use psdforge_processing::test_helpers::{build_psd, PsdSpec};
use psdforge_processing::{ExternalTools, ImageOptimizer, PsdConverter};
use psdforge_services::{ArchiveProcessor, FileOutcome, ProgressCallback};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;
use zip::write::FileOptions;

fn write_zip(path: &Path, entries: &[(&str, Vec<u8>)]) {
    let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
    for (name, data) in entries {
        zip.start_file(*name, FileOptions::default()).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap();
}

fn processor() -> ArchiveProcessor {
    let converter = PsdConverter::new().with_optimizer(ImageOptimizer::with_tools(ExternalTools::none()));
    ArchiveProcessor::new(Arc::new(converter), 2)
}

#[tokio::test]
async fn test_bad_signature_entry_never_reaches_converter() {
    let dir = tempdir().unwrap();
    let zip_path = dir.path().join("batch.zip");

    let mut forged = build_psd(&PsdSpec::solid(40, 40, [0, 0, 0]));
    forged[..4].copy_from_slice(b"PK\x03\x04");

    write_zip(
        &zip_path,
        &[
            ("red.psd", build_psd(&PsdSpec::solid(40, 40, [255, 0, 0]))),
            ("nested/green.psd", build_psd(&PsdSpec::solid(48, 32, [0, 255, 0]))),
            ("art/../blue.psd", build_psd(&PsdSpec::split_vertical(64, 40))),
            ("forged.psd", forged),
            ("__MACOSX/._red.psd", build_psd(&PsdSpec::solid(40, 40, [1, 1, 1]))),
        ],
    );

    let seen: Arc<Mutex<Vec<(f64, usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: ProgressCallback = Arc::new(move |percent: f64, done: usize, total: usize, _o: &FileOutcome| {
        sink.lock().unwrap().push((percent, done, total));
    });

    let out_dir = dir.path().join("out");
    let options = ConversionOptions::basic(OutputFormat::Jpeg, 75);
    let summary = processor()
        .process_archive(&zip_path, &out_dir, &options, Some(callback))
        .await;

    assert!(summary.error.is_none(), "{:?}", summary.error);
    assert_eq!(summary.total_files, 3);
    assert_eq!(summary.successful_conversions, 3);
    assert!(summary.success);
    assert!(summary.results.iter().all(|o| o.entry != "forged.psd"));
    assert!(!out_dir.join("forged.jpeg").exists());
    assert!(out_dir.join("red.jpeg").exists());
    assert!(out_dir.join("blue.jpeg").exists());

    let expected_ratio = psdforge_core::compression_ratio(
        summary.total_converted_size,
        summary.total_original_size,
    );
    assert_eq!(summary.overall_compression_ratio, expected_ratio);

    let calls = seen.lock().unwrap().clone();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls.last().unwrap(), &(100.0, 3, 3));
}

#[tokio::test]
async fn test_archive_without_psd_is_rejected() {
    let dir = tempdir().unwrap();
    let zip_path = dir.path().join("docs.zip");
    write_zip(&zip_path, &[("readme.txt", b"nothing to see".to_vec())]);

    let summary = processor()
        .process_archive(
            &zip_path,
            &dir.path().join("out"),
            &ConversionOptions::basic(OutputFormat::WebP, 80),
            None,
        )
        .await;

    assert!(!summary.success);
    assert_eq!(summary.total_files, 0);
    assert_eq!(summary.error.as_deref(), Some("No PSD files found in ZIP archive"));
}

#[tokio::test]
async fn test_cancelled_archive_starts_no_entries() {
    let dir = tempdir().unwrap();
    let zip_path = dir.path().join("batch.zip");
    write_zip(
        &zip_path,
        &[
            ("a.psd", build_psd(&PsdSpec::solid(24, 24, [10, 10, 10]))),
            ("b.psd", build_psd(&PsdSpec::solid(24, 24, [20, 20, 20]))),
        ],
    );

    let cancel = CancellationToken::new();
    cancel.cancel();
    let out_dir = dir.path().join("out");
    let summary = processor()
        .process_archive_until(
            &zip_path,
            &out_dir,
            &ConversionOptions::basic(OutputFormat::Jpeg, 80),
            None,
            &cancel,
        )
        .await;

    assert!(!summary.success);
    assert_eq!(summary.total_files, 2);
    assert_eq!(summary.failed_conversions, 2);
    assert!(summary
        .results
        .iter()
        .all(|o| o.result.error_kind.as_deref() == Some("cancelled")));
    assert!(!out_dir.join("a.jpeg").exists());
}
