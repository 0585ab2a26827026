use psdforge_core::{OutputFormat, QualityProfile, Recommendation, Resolution, UseCase};

/// Derive optimization settings from image size and intended use.
///
/// Size rules run first and use-case rules after them, so a use case can
/// override what the size suggested (print never downscales, archive always
/// compresses hardest).
pub fn recommend(image_size: Resolution, _file_size: u64, use_case: UseCase) -> Recommendation {
    let megapixels = image_size.megapixels();

    let mut rec = Recommendation {
        quality_profile: QualityProfile::WebOptimized,
        should_downscale: false,
        recommended_max_resolution: None,
        recommended_formats: vec![OutputFormat::Jpeg],
        generate_thumbnails: true,
        strip_metadata: true,
        reasoning: Vec::new(),
    };

    if megapixels > 50.0 {
        rec.quality_profile = QualityProfile::MaximumCompression;
        rec.should_downscale = true;
        rec.recommended_max_resolution = Some(Resolution::new(6000, 6000));
        rec.reasoning
            .push("Very large image - aggressive compression recommended".to_string());
    } else if megapixels > 20.0 {
        rec.quality_profile = QualityProfile::StorageOptimized;
        rec.should_downscale = true;
        rec.recommended_max_resolution = Some(Resolution::new(4000, 4000));
        rec.reasoning
            .push("Large image - storage optimization recommended".to_string());
    } else if megapixels < 1.0 {
        rec.quality_profile = QualityProfile::HighQuality;
        rec.generate_thumbnails = false;
        rec.reasoning.push("Small image - preserve quality".to_string());
    }

    match use_case {
        UseCase::Archive => {
            rec.quality_profile = QualityProfile::MaximumCompression;
            rec.strip_metadata = false;
            rec.reasoning
                .push("Archive use - prioritize compression over metadata".to_string());
        }
        UseCase::Web => {
            rec.recommended_formats = vec![OutputFormat::WebP, OutputFormat::Jpeg];
            rec.reasoning
                .push("Web use - modern formats preferred".to_string());
        }
        UseCase::Print => {
            rec.quality_profile = QualityProfile::HighQuality;
            rec.should_downscale = false;
            rec.reasoning
                .push("Print use - preserve resolution and quality".to_string());
        }
    }

    rec
}
