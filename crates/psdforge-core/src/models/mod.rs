pub mod conversion;
pub mod dedup;
pub mod job;
pub mod options;

pub use conversion::{
    compression_ratio, ConversionOptions, ConversionRequest, ConversionResult, OptimizationResult,
    Recommendation, ThumbnailInfo, DEFAULT_QUALITY,
};
pub use dedup::{
    DedupStats, DeduplicationInfo, DuplicateAction, DuplicateCheckResult, DuplicateReference,
    HashRecord, SimilarImage,
};
pub use job::{ExecutionStrategy, InputKind, Job, JobMetadata, JobStatus};
pub use options::{ConcurrencyMode, OutputFormat, QualityProfile, Resolution, UseCase};
