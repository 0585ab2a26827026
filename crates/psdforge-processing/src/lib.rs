//! psdforge processing
//!
//! The CPU-bound half of the pipeline. Everything in here is synchronous and
//! is expected to run on a blocking thread or in an isolated worker process:
//!
//! - [`document`]: PSD header parsing and layer compositing
//! - [`optimizer`]: resolution, metadata and format-specific compression policy
//! - [`hashing`] and [`dedup`]: perceptual fingerprints and the persisted hash index
//! - [`converter`]: end-to-end PSD conversion built from the pieces above

pub mod compression;
pub mod converter;
pub mod dedup;
pub mod document;
pub mod hashing;
pub mod optimizer;
pub mod orientation;
pub mod recommend;
pub mod validator;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use compression::{ExternalTools, Technique};
pub use converter::PsdConverter;
pub use dedup::{BatchDedupReport, DedupStatistics, DeduplicationManager, DuplicateDetector};
pub use hashing::{hamming_distance, PerceptualHasher, MAX_DISTANCE};
pub use optimizer::{ImageOptimizer, OptimizeParams, THUMBNAIL_SIZES};
pub use recommend::recommend;
pub use validator::{PsdValidator, ValidationError, PSD_SIGNATURE};
