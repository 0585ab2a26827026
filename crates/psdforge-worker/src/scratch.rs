//! Per-job scratch files.
//!
//! A [`JobWorkspace`] owns the spooled upload and the job output directory.
//! Dropping it removes the upload always, and the output directory unless
//! [`JobWorkspace::keep_output`] was called. Every exit path of a job, panics
//! and cancellation included, goes through `Drop`. Blocking conversions hold
//! a clone of the `Arc` they run under, so removal waits for them.

use chrono::Utc;
use psdforge_core::AppError;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::NamedTempFile;

pub struct JobWorkspace {
    input: NamedTempFile,
    output_dir: PathBuf,
    keep_output: AtomicBool,
}

impl JobWorkspace {
    /// Spool `data` to `uploads_dir/upload_{ts}_*` and create `jobs_dir/job_{id}`.
    pub fn create(
        uploads_dir: &Path,
        jobs_dir: &Path,
        job_id: &str,
        filename: &str,
        data: &[u8],
    ) -> Result<Self, AppError> {
        std::fs::create_dir_all(uploads_dir)?;
        let suffix = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e.to_lowercase()))
            .unwrap_or_default();
        let prefix = format!("upload_{}_", Utc::now().format("%Y%m%d_%H%M%S"));

        let mut input = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(&suffix)
            .tempfile_in(uploads_dir)?;
        input.write_all(data)?;
        input.flush()?;

        let output_dir = jobs_dir.join(format!("job_{}", job_id));
        std::fs::create_dir_all(&output_dir)?;

        Ok(Self {
            input,
            output_dir,
            keep_output: AtomicBool::new(false),
        })
    }

    pub fn input_path(&self) -> &Path {
        self.input.path()
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Leave the output directory in place for the caller. The periodic sweep
    /// removes it once it is past retention.
    pub fn keep_output(&self) {
        self.keep_output.store(true, Ordering::SeqCst);
    }
}

impl Drop for JobWorkspace {
    fn drop(&mut self) {
        if self.keep_output.load(Ordering::SeqCst) {
            return;
        }
        match std::fs::remove_dir_all(&self.output_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %self.output_dir.display(),
                error = %e,
                "Failed to remove job output directory"
            ),
        }
    }
}
