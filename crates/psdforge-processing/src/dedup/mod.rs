//! Perceptual-hash duplicate detection over a persisted index

pub mod detector;
pub mod index;
pub mod manager;

pub use detector::{
    find_similar_in, recommended_filename, BatchDedupReport, DedupStatistics, DuplicateDetector,
    DEFAULT_SIMILARITY_THRESHOLD,
};
pub use index::HashIndex;
pub use manager::{DeduplicationManager, DeduplicationReport, ManagedAction, ManagedOutcome};
