//! Queue counters, host figures and the periodic sampler.

use psdforge_core::ConcurrencyMode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Disks, System};
use tokio_util::sync::CancellationToken;

/// Lifetime job counters
#[derive(Debug, Default)]
pub struct TaskMetrics {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    rejected: AtomicU64,
}

impl TaskMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Refused at intake (queue full)
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, active_count: usize, queue_depth: usize) -> MetricsSnapshot {
        let submitted = self.submitted.load(Ordering::Relaxed);
        let completed = self.completed.load(Ordering::Relaxed);
        let success_rate = if submitted == 0 {
            0.0
        } else {
            completed as f64 / submitted as f64 * 100.0
        };

        MetricsSnapshot {
            active_count,
            queue_depth,
            submitted,
            completed,
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            success_rate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub active_count: usize,
    pub queue_depth: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rejected: u64,
    /// completed / submitted, in percent
    pub success_rate: f64,
}

/// Host figures from `sysinfo`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub cpu_count: usize,
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub memory_usage_percent: f64,
    /// Disk holding the work directory
    pub disk_mount_point: Option<PathBuf>,
    pub disk_total_bytes: u64,
    pub disk_available_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub accepting: bool,
    pub thread_pool_size: usize,
    pub thread_pool_available: usize,
    pub process_pool_enabled: bool,
    pub process_pool_size: usize,
    pub process_pool_available: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationSummary {
    pub max_workers: usize,
    pub concurrency_mode: ConcurrencyMode,
    pub queue_size: usize,
    pub timeout_seconds: u64,
}

/// Everything `Orchestrator::system_metrics` reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemReport {
    pub task_metrics: MetricsSnapshot,
    pub pools: PoolStatus,
    pub configuration: ConfigurationSummary,
    pub total_jobs: usize,
    pub job_statuses: BTreeMap<String, usize>,
    /// `None` when the host probe failed
    pub system: Option<SystemMetrics>,
}

/// Reads host figures. CPU usage needs two refreshes, so the probe keeps its
/// `System` between calls.
#[derive(Clone)]
pub struct SystemProbe {
    system: Arc<Mutex<System>>,
    work_dir: PathBuf,
}

impl SystemProbe {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();

        Self {
            system: Arc::new(Mutex::new(system)),
            work_dir: work_dir.into(),
        }
    }

    pub fn sample(&self) -> anyhow::Result<SystemMetrics> {
        let mut system = self.system.lock().map_err(|e| {
            tracing::error!(error = %e, "Failed to acquire system lock for metrics");
            anyhow::anyhow!("Failed to sample system metrics: mutex poisoned")
        })?;
        system.refresh_cpu();
        system.refresh_memory();

        let cpus = system.cpus();
        let cpu_usage_percent = if cpus.is_empty() {
            0.0
        } else {
            cpus.iter().map(|cpu| cpu.cpu_usage()).sum::<f32>() / cpus.len() as f32
        };
        let memory_total_bytes = system.total_memory();
        let memory_used_bytes = system.used_memory();
        let memory_usage_percent = if memory_total_bytes == 0 {
            0.0
        } else {
            memory_used_bytes as f64 / memory_total_bytes as f64 * 100.0
        };

        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .iter()
            .filter(|disk| self.work_dir.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().components().count());

        Ok(SystemMetrics {
            cpu_usage_percent,
            cpu_count: cpus.len(),
            memory_total_bytes,
            memory_used_bytes,
            memory_usage_percent,
            disk_mount_point: disk.map(|d| d.mount_point().to_path_buf()),
            disk_total_bytes: disk.map(|d| d.total_space()).unwrap_or(0),
            disk_available_bytes: disk.map(|d| d.available_space()).unwrap_or(0),
        })
    }

    /// `sample` on a blocking thread
    pub async fn sample_async(&self) -> anyhow::Result<SystemMetrics> {
        let probe = self.clone();
        tokio::task::spawn_blocking(move || probe.sample())
            .await
            .map_err(|e| anyhow::anyhow!("spawn_blocking for system metrics: {}", e))?
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }
}

/// Log a sample every `every`. A failed pass waits `backoff` before the next one.
pub fn start_sampler<F>(
    sample: F,
    every: Duration,
    backoff: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> anyhow::Result<MetricsSnapshot> + Send + Sync + 'static,
{
    tokio::spawn(async move {
        tracing::info!(interval_secs = every.as_secs(), "Metrics sampler started");
        loop {
            let delay = match sample() {
                Ok(snapshot) => {
                    if snapshot.submitted > 0 {
                        tracing::info!(
                            active = snapshot.active_count,
                            queue = snapshot.queue_depth,
                            submitted = snapshot.submitted,
                            completed = snapshot.completed,
                            failed = snapshot.failed,
                            success_rate = format!("{:.1}", snapshot.success_rate),
                            "Task metrics"
                        );
                    }
                    every
                }
                Err(e) => {
                    tracing::error!(error = %e, backoff_secs = backoff.as_secs(), "Error in task monitoring");
                    backoff
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        tracing::debug!("Metrics sampler stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_success_rate_against_submitted() {
        let metrics = TaskMetrics::new();
        assert_eq!(metrics.snapshot(0, 0).success_rate, 0.0);

        for _ in 0..4 {
            metrics.record_submitted();
        }
        metrics.record_completed();
        metrics.record_completed();
        metrics.record_completed();
        metrics.record_failed();

        let snapshot = metrics.snapshot(1, 2);
        assert_eq!(snapshot.success_rate, 75.0);
        assert_eq!(snapshot.active_count, 1);
        assert_eq!(snapshot.queue_depth, 2);
        assert_eq!(snapshot.failed, 1);
    }

    #[test]
    fn test_system_probe_reports_memory() {
        let probe = SystemProbe::new(std::env::temp_dir());
        let metrics = probe.sample().unwrap();
        assert!(metrics.memory_total_bytes > 0);
        assert!(metrics.memory_usage_percent >= 0.0);
        assert!(metrics.memory_usage_percent <= 100.0);
    }

    #[tokio::test]
    async fn test_sampler_survives_errors_and_stops_on_cancel() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let handle = {
            let calls = calls.clone();
            let metrics = TaskMetrics::new();
            start_sampler(
                move || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        anyhow::bail!("probe failed");
                    }
                    Ok(metrics.snapshot(0, 0))
                },
                Duration::from_millis(5),
                Duration::from_millis(5),
                cancel.clone(),
            )
        };

        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }
}
