use psdforge_core::{ConcurrencyMode, Config};
use psdforge_services::ArchiveLimits;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::strategy::process_pool_size;

/// Program (and leading arguments) that runs one conversion in isolation.
///
/// The orchestrator appends the path of a JSON request file and reads a JSON
/// `ConversionResult` from the program's stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// The running executable's hidden `worker` subcommand
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?).arg("worker"))
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Thread pool size
    pub max_workers: usize,
    pub concurrency_mode: ConcurrencyMode,
    pub job_timeout: Duration,
    pub queue_size: usize,
    pub batch_size: usize,
    pub large_file_threshold_bytes: u64,
    pub cleanup_interval: Duration,
    pub job_retention: Duration,
    pub metrics_interval: Duration,
    pub metrics_backoff: Duration,
    pub shutdown_drain: Duration,
    pub jobs_dir: PathBuf,
    pub uploads_dir: PathBuf,
    pub max_upload_bytes: u64,
    pub archive_limits: ArchiveLimits,
    pub process_pool_size: usize,
    /// Without a command, process-pool jobs run on the thread pool instead.
    pub worker_command: Option<WorkerCommand>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl OrchestratorConfig {
    pub fn from_config(config: &Config) -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            max_workers: config.max_workers,
            concurrency_mode: config.concurrency_mode,
            job_timeout: Duration::from_secs(config.job_timeout_secs),
            queue_size: config.queue_size,
            batch_size: config.batch_size,
            large_file_threshold_bytes: config.large_file_threshold_bytes,
            cleanup_interval: Duration::from_secs(config.cleanup_interval_secs),
            job_retention: Duration::from_secs(config.job_retention_hours * 3600),
            metrics_interval: Duration::from_secs(config.metrics_interval_secs),
            metrics_backoff: Duration::from_secs(config.metrics_backoff_secs),
            shutdown_drain: Duration::from_secs(config.shutdown_drain_secs),
            jobs_dir: config.jobs_dir(),
            uploads_dir: config.uploads_dir(),
            max_upload_bytes: config.max_upload_bytes,
            archive_limits: ArchiveLimits::from_config(config),
            process_pool_size: process_pool_size(config.max_workers, cores),
            worker_command: None,
        }
    }

    pub fn with_worker_command(mut self, command: WorkerCommand) -> Self {
        self.worker_command = Some(command);
        self
    }

    /// Point job output and upload spool directories under `work_dir`.
    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        self.jobs_dir = work_dir.join("jobs");
        self.uploads_dir = work_dir.join("uploads");
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_converts_units() {
        let config = Config {
            job_timeout_secs: 12,
            job_retention_hours: 2,
            ..Config::default()
        };
        let orchestrator = OrchestratorConfig::from_config(&config);

        assert_eq!(orchestrator.job_timeout, Duration::from_secs(12));
        assert_eq!(orchestrator.job_retention, Duration::from_secs(7200));
        assert!(orchestrator.process_pool_size >= 1);
        assert!(orchestrator.process_pool_size <= config.max_workers);
        assert!(orchestrator.worker_command.is_none());
    }

    #[test]
    fn test_with_work_dir() {
        let config = OrchestratorConfig::default().with_work_dir("/srv/psdforge");
        assert_eq!(config.jobs_dir, PathBuf::from("/srv/psdforge/jobs"));
        assert_eq!(config.uploads_dir, PathBuf::from("/srv/psdforge/uploads"));
    }

    #[test]
    fn test_worker_command_builder() {
        let command = WorkerCommand::new("/usr/bin/psdforge").arg("worker");
        assert_eq!(command.args, vec!["worker".to_string()]);
    }
}
