//! Periodic removal of stale job artifacts.

use psdforge_core::Config;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub removed: usize,
    pub failed: usize,
}

/// Deletes entries older than the retention window directly under each root.
///
/// Roots are job output and upload spool directories. Each entry is a file or
/// a whole `job_{id}` directory.
#[derive(Debug, Clone)]
pub struct CleanupSweeper {
    roots: Vec<PathBuf>,
    retention: Duration,
}

impl CleanupSweeper {
    pub fn new(roots: Vec<PathBuf>, retention: Duration) -> Self {
        Self { roots, retention }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            vec![config.jobs_dir(), config.uploads_dir()],
            Duration::from_secs(config.job_retention_hours * 3600),
        )
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// One best-effort pass. Failures are counted and logged, never returned.
    pub fn sweep(&self) -> SweepReport {
        let now = SystemTime::now();
        let mut report = SweepReport::default();

        for root in &self.roots {
            let entries = match std::fs::read_dir(root) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    tracing::error!(root = %root.display(), error = %e, "Failed to read cleanup root");
                    report.failed += 1;
                    continue;
                }
            };

            for entry in entries.flatten() {
                report.scanned += 1;
                let path = entry.path();
                let age = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .map(|modified| now.duration_since(modified).unwrap_or(Duration::ZERO));

                match age {
                    Ok(age) if age > self.retention => match remove_path(&path) {
                        Ok(()) => {
                            tracing::debug!(path = %path.display(), age_secs = age.as_secs(), "Removed stale artifact");
                            report.removed += 1;
                        }
                        Err(e) => {
                            tracing::error!(path = %path.display(), error = %e, "Failed to remove stale artifact");
                            report.failed += 1;
                        }
                    },
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Could not read artifact age");
                        report.failed += 1;
                    }
                }
            }
        }

        report
    }

    /// Start the sweep loop. The first pass runs immediately.
    pub fn start(self: Arc<Self>, every: Duration, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                tracing::info!("Starting scheduled cleanup of job artifacts");
                let sweeper = Arc::clone(&self);
                match tokio::task::spawn_blocking(move || sweeper.sweep()).await {
                    Ok(report) => tracing::info!(
                        scanned = report.scanned,
                        removed = report.removed,
                        failed = report.failed,
                        "Cleanup completed"
                    ),
                    Err(e) => tracing::error!(error = %e, "Cleanup task failed"),
                }
            }

            tracing::debug!("Cleanup loop stopped");
        })
    }
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::tempdir;

    fn age(path: &Path, by: Duration) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    #[test]
    fn test_sweep_removes_only_stale_entries() {
        let dir = tempdir().unwrap();
        let jobs = dir.path().join("jobs");
        let stale_job = jobs.join("job_old");
        std::fs::create_dir_all(&stale_job).unwrap();
        std::fs::write(jobs.join("fresh.jpeg"), b"x").unwrap();
        let stale_file = jobs.join("stale.jpeg");
        std::fs::write(&stale_file, b"x").unwrap();
        age(&stale_file, Duration::from_secs(7200));

        let sweeper = CleanupSweeper::new(
            vec![jobs.clone(), dir.path().join("missing")],
            Duration::from_secs(3600),
        );
        let report = sweeper.sweep();

        assert_eq!(report.scanned, 3);
        assert_eq!(report.removed, 1);
        assert_eq!(report.failed, 0);
        assert!(!stale_file.exists());
        assert!(jobs.join("fresh.jpeg").exists());
        assert!(stale_job.exists());
    }

    #[test]
    fn test_zero_retention_removes_directories() {
        let dir = tempdir().unwrap();
        let job = dir.path().join("job_1");
        std::fs::create_dir_all(job.join("nested")).unwrap();
        std::fs::write(job.join("nested").join("a.jpeg"), b"x").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let report = CleanupSweeper::new(vec![dir.path().to_path_buf()], Duration::ZERO).sweep();
        assert_eq!(report.removed, 1);
        assert!(!job.exists());
    }

    #[tokio::test]
    async fn test_loop_stops_on_cancel() {
        let dir = tempdir().unwrap();
        let sweeper = Arc::new(CleanupSweeper::new(vec![dir.path().to_path_buf()], Duration::from_secs(60)));
        let cancel = CancellationToken::new();
        let handle = sweeper.start(Duration::from_millis(10), cancel.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
