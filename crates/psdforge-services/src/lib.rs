//! psdforge services
//!
//! Coordination built on top of the converter: unpacking and converting ZIP
//! archives of PSD files, and sweeping stale job artifacts off disk.

pub mod archive;
pub mod cleanup;

pub use archive::{
    zip_info, ArchiveError, ArchiveLimits, ArchiveProcessor, ArchiveSummary, FileOutcome,
    ProgressCallback, ZipEntryInfo, ZipInfo,
};
pub use cleanup::{CleanupSweeper, SweepReport};
