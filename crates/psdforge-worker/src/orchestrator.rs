//! Job orchestrator.
//!
//! `submit` validates a payload, records a PENDING job and places it on a
//! bounded intake channel. A dispatcher task takes jobs off the channel, waits
//! for a permit in the job's execution domain and spawns the job on a task
//! tracker. Each job runs under a per-job cancellation token and the
//! configured timeout.

use bytes::Bytes;
use futures::future::join_all;
use psdforge_core::error::LogLevel;
use psdforge_core::utils::{file_stem_or, generate_job_id, sanitize_filename};
use psdforge_core::validation::{validate_payload, validate_quality};
use psdforge_core::{
    AppError, ConversionRequest, ConversionResult, ExecutionStrategy, InputKind, Job, JobMetadata,
    JobStatus,
};
use psdforge_processing::PsdConverter;
use psdforge_services::{
    ArchiveProcessor, ArchiveSummary, CleanupSweeper, FileOutcome, ProgressCallback,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::OrchestratorConfig;
use crate::job_table::JobTable;
use crate::metrics::{
    start_sampler, ConfigurationSummary, MetricsSnapshot, PoolStatus, SystemProbe, SystemReport,
    TaskMetrics,
};
use crate::process::{ProcessRunner, WorkerRequest};
use crate::scratch::JobWorkspace;
use crate::sink::ResultSink;
use crate::strategy::select_strategy;

const PROGRESS_SPOOLED: f32 = 20.0;
const PROGRESS_CONVERTED: f32 = 90.0;
/// Share of the progress bar covered by archive entry conversions
const ARCHIVE_PROGRESS_SPAN: f32 = 0.7;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn join_error(e: tokio::task::JoinError) -> AppError {
    AppError::Internal(format!("Conversion task failed: {}", e))
}

fn abandoned() -> AppError {
    AppError::Cancelled("Job abandoned after timeout or cancellation".to_string())
}

fn checkpoint(abandon: &CancellationToken) -> Result<(), AppError> {
    if abandon.is_cancelled() {
        return Err(abandoned());
    }
    Ok(())
}

/// What a finished job produced. Stored as the job's `result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutput {
    pub output_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversion: Option<ConversionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<ArchiveSummary>,
    /// One entry per artifact handed to the result sink
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storage: Vec<serde_json::Value>,
}

impl JobOutput {
    fn psd(output_dir: &Path, result: ConversionResult) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            conversion: Some(result),
            archive: None,
            storage: Vec::new(),
        }
    }

    fn archive(output_dir: &Path, summary: ArchiveSummary) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            conversion: None,
            archive: Some(summary),
            storage: Vec::new(),
        }
    }

    /// Why the job should be FAILED, if it should.
    ///
    /// An archive fails when it was rejected or when no entry converted.
    /// Partial archive failures are reported in the summary only.
    pub fn error(&self) -> Option<AppError> {
        if let Some(result) = &self.conversion {
            return result.to_error();
        }
        if let Some(summary) = &self.archive {
            if summary.error.is_some() || summary.successful_conversions == 0 {
                return Some(summary.to_error().unwrap_or_else(|| {
                    AppError::InvalidInput("No archive entry could be converted".to_string())
                }));
            }
        }
        None
    }

    /// Primary outputs of successful conversions
    pub fn artifacts(&self) -> Vec<PathBuf> {
        let conversions = self
            .conversion
            .iter()
            .chain(self.archive.iter().flat_map(|s| s.results.iter().map(|o| &o.result)));
        conversions
            .filter(|r| r.success)
            .filter_map(|r| r.output_file.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    /// `None` when the request was refused at submission
    pub job_id: Option<String>,
    pub filename: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: Vec<String>,
    pub failed: Vec<BatchFailure>,
}

struct QueuedJob {
    job_id: String,
    strategy: ExecutionStrategy,
    source: Bytes,
    token: CancellationToken,
}

struct Inner {
    config: OrchestratorConfig,
    converter: Arc<PsdConverter>,
    archive: ArchiveProcessor,
    sink: Option<Arc<dyn ResultSink>>,
    runner: Option<ProcessRunner>,
    jobs: Arc<JobTable>,
    metrics: TaskMetrics,
    probe: SystemProbe,
    intake: Mutex<Option<mpsc::Sender<QueuedJob>>>,
    inline_permits: Arc<Semaphore>,
    thread_permits: Arc<Semaphore>,
    process_permits: Arc<Semaphore>,
    job_tokens: Mutex<HashMap<String, CancellationToken>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    background_started: AtomicBool,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Owns the job table, the intake queue and the worker pools.
///
/// Cloning gives another handle to the same orchestrator. Call
/// [`Orchestrator::shutdown`] before dropping the last handle to drain work.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Must be called from within a tokio runtime: the dispatcher starts here.
    pub fn new(
        config: OrchestratorConfig,
        converter: Arc<PsdConverter>,
        sink: Option<Arc<dyn ResultSink>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let runner = config.worker_command.clone().map(ProcessRunner::new);
        if runner.is_none() {
            tracing::info!("No worker command configured, process-pool jobs run on the thread pool");
        }

        let archive = ArchiveProcessor::new(Arc::clone(&converter), config.max_workers)
            .with_limits(config.archive_limits);
        let work_dir = config
            .jobs_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| config.jobs_dir.clone());

        let inner = Arc::new(Inner {
            inline_permits: Arc::new(Semaphore::new(config.max_workers.max(1))),
            thread_permits: Arc::new(Semaphore::new(config.max_workers.max(1))),
            process_permits: Arc::new(Semaphore::new(config.process_pool_size.max(1))),
            probe: SystemProbe::new(work_dir),
            config,
            converter,
            archive,
            sink,
            runner,
            jobs: Arc::new(JobTable::new()),
            metrics: TaskMetrics::new(),
            intake: Mutex::new(Some(tx)),
            job_tokens: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            dispatcher: Mutex::new(None),
            background_started: AtomicBool::new(false),
            background: Mutex::new(Vec::new()),
        });

        let dispatcher = tokio::spawn(dispatch_loop(
            Arc::downgrade(&inner),
            rx,
            inner.shutdown.clone(),
        ));
        *lock(&inner.dispatcher) = Some(dispatcher);

        tracing::info!(
            max_workers = inner.config.max_workers,
            process_pool_size = inner.config.process_pool_size,
            queue_size = inner.config.queue_size,
            mode = %inner.config.concurrency_mode,
            "Orchestrator started"
        );

        Self { inner }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Validate and enqueue a request. Returns the new job id.
    ///
    /// Nothing is recorded for a request that fails validation. A full intake
    /// queue is `QueueFull`, never a wait.
    #[tracing::instrument(skip(self, request), fields(filename = %request.filename, size_bytes = request.source.len()))]
    pub async fn submit(&self, request: ConversionRequest) -> Result<String, AppError> {
        let inner = &self.inner;
        let size = request.source.len() as u64;
        let kind = validate_payload(&request.filename, size, inner.config.max_upload_bytes)?;
        if let Some(quality) = request.options.quality {
            validate_quality(i64::from(quality))?;
        }

        let sender = lock(&inner.intake)
            .clone()
            .ok_or_else(|| AppError::Cancelled("Orchestrator is shut down".to_string()))?;

        let strategy = inner.effective_strategy(kind, size);
        let job_id = generate_job_id();
        let token = inner.shutdown.child_token();
        inner.jobs.insert(Job::new(
            job_id.clone(),
            JobMetadata {
                filename: request.filename,
                file_type: kind,
                file_size: size,
                options: request.options,
                strategy: Some(strategy),
            },
        ));
        lock(&inner.job_tokens).insert(job_id.clone(), token.clone());

        let queued = QueuedJob {
            job_id: job_id.clone(),
            strategy,
            source: request.source,
            token,
        };
        if let Err(e) = sender.try_send(queued) {
            inner.jobs.remove(&job_id);
            inner.forget_token(&job_id);
            return Err(match e {
                TrySendError::Full(_) => {
                    inner.metrics.record_rejected();
                    tracing::warn!(capacity = inner.config.queue_size, "Intake queue full, rejecting job");
                    AppError::QueueFull {
                        capacity: inner.config.queue_size,
                    }
                }
                TrySendError::Closed(_) => AppError::Cancelled("Orchestrator is shut down".to_string()),
            });
        }

        inner.metrics.record_submitted();
        inner.ensure_background();
        tracing::info!(job_id = %job_id, strategy = %strategy, "Job submitted");
        Ok(job_id)
    }

    pub fn get_job(&self, job_id: &str) -> Option<Job> {
        self.inner.jobs.get(job_id)
    }

    pub fn list_jobs(&self) -> Vec<Job> {
        self.inner.jobs.list()
    }

    /// Follow a job's updates
    pub fn subscribe(&self, job_id: &str) -> Option<watch::Receiver<Job>> {
        self.inner.jobs.subscribe(job_id)
    }

    /// Wait until the job is terminal.
    pub async fn wait(&self, job_id: &str) -> Result<Job, AppError> {
        self.inner
            .jobs
            .wait_terminal(job_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("Job {}", job_id)))
    }

    /// Cancel a PENDING or PROCESSING job.
    pub fn cancel(&self, job_id: &str) -> Result<Job, AppError> {
        let inner = &self.inner;
        let job = inner
            .jobs
            .get(job_id)
            .ok_or_else(|| AppError::NotFound(format!("Job {}", job_id)))?;
        if job.status.is_terminal() {
            return Err(AppError::InvalidInput(format!(
                "Job {} is already {}",
                job_id, job.status
            )));
        }

        let job = inner.jobs.transition(job_id, JobStatus::Cancelled, |j| {
            j.error_message = Some("Cancelled by request".to_string());
        })?;
        inner.metrics.record_cancelled();
        if let Some(token) = lock(&inner.job_tokens).get(job_id) {
            token.cancel();
        }
        tracing::info!(job_id = %job_id, "Job cancelled");
        Ok(job)
    }

    /// Run requests in groups of `batch_size` (configured size when `None`).
    ///
    /// Each group is submitted together and awaited as a whole before the next
    /// group starts. One failed job does not stop its siblings.
    pub async fn batch_process(
        &self,
        requests: Vec<ConversionRequest>,
        batch_size: Option<usize>,
    ) -> BatchReport {
        let group_size = batch_size.unwrap_or(self.inner.config.batch_size).max(1);
        let mut report = BatchReport {
            total: requests.len(),
            ..BatchReport::default()
        };

        let mut remaining = requests;
        while !remaining.is_empty() {
            let take = group_size.min(remaining.len());
            let group: Vec<ConversionRequest> = remaining.drain(..take).collect();

            let mut submitted = Vec::with_capacity(group.len());
            for request in group {
                let filename = request.filename.clone();
                match self.submit(request).await {
                    Ok(job_id) => submitted.push((job_id, filename)),
                    Err(e) => {
                        tracing::error!(filename = %filename, error = %e, "Batch job failed");
                        report.failed.push(BatchFailure {
                            job_id: None,
                            filename,
                            error: e.to_string(),
                        });
                    }
                }
            }

            let finished = join_all(submitted.iter().map(|(job_id, _)| self.wait(job_id))).await;
            for ((job_id, filename), outcome) in submitted.into_iter().zip(finished) {
                match outcome {
                    Ok(job) if job.status == JobStatus::Completed => report.succeeded.push(job_id),
                    Ok(job) => {
                        tracing::error!(job_id = %job_id, status = %job.status, "Batch job failed");
                        report.failed.push(BatchFailure {
                            job_id: Some(job_id),
                            filename,
                            error: job.error_message.unwrap_or_else(|| job.status.to_string()),
                        });
                    }
                    Err(e) => report.failed.push(BatchFailure {
                        job_id: Some(job_id),
                        filename,
                        error: e.to_string(),
                    }),
                }
            }
        }

        tracing::info!(
            total = report.total,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Batch processing finished"
        );
        report
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.snapshot()
    }

    /// Queue counters, pool state, configuration and host figures.
    pub async fn system_metrics(&self) -> SystemReport {
        let inner = &self.inner;
        let system = match inner.probe.sample_async().await {
            Ok(system) => Some(system),
            Err(e) => {
                tracing::warn!(error = %e, "Host metrics unavailable");
                None
            }
        };

        let mut job_statuses = BTreeMap::new();
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            job_statuses.insert(status.to_string(), inner.jobs.count(status));
        }

        SystemReport {
            task_metrics: inner.snapshot(),
            pools: PoolStatus {
                accepting: lock(&inner.intake).is_some(),
                thread_pool_size: inner.config.max_workers,
                thread_pool_available: inner.thread_permits.available_permits(),
                process_pool_enabled: inner.runner.is_some(),
                process_pool_size: inner.config.process_pool_size,
                process_pool_available: inner.process_permits.available_permits(),
            },
            configuration: ConfigurationSummary {
                max_workers: inner.config.max_workers,
                concurrency_mode: inner.config.concurrency_mode,
                queue_size: inner.config.queue_size,
                timeout_seconds: inner.config.job_timeout.as_secs(),
            },
            total_jobs: inner.jobs.len(),
            job_statuses,
            system,
        }
    }

    /// Stop intake, cancel live jobs and wait for running work to drain.
    ///
    /// Work still running after the drain window is left to finish on its
    /// own. Child processes are killed when their job task is dropped.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        tracing::info!("Shutting down orchestrator");

        lock(&inner.intake).take();
        inner.shutdown.cancel();

        let mut cancelled = 0usize;
        for job_id in inner.jobs.live_ids() {
            let moved = inner.jobs.transition(&job_id, JobStatus::Cancelled, |j| {
                j.error_message = Some("Orchestrator shut down".to_string());
            });
            if moved.is_ok() {
                inner.metrics.record_cancelled();
                cancelled += 1;
            }
        }

        let dispatcher = lock(&inner.dispatcher).take();
        if let Some(handle) = dispatcher {
            let _ = handle.await;
        }

        inner.tracker.close();
        if tokio::time::timeout(inner.config.shutdown_drain, inner.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                drain_secs = inner.config.shutdown_drain.as_secs(),
                "Drain window elapsed with jobs still running"
            );
        }

        let background: Vec<JoinHandle<()>> = lock(&inner.background).drain(..).collect();
        for handle in background {
            let _ = handle.await;
        }

        tracing::info!(cancelled, "Orchestrator stopped");
    }
}

async fn dispatch_loop(
    inner: Weak<Inner>,
    mut rx: mpsc::Receiver<QueuedJob>,
    shutdown: CancellationToken,
) {
    loop {
        let queued = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Some(queued) => queued,
                None => break,
            },
        };

        let Some(orchestrator) = inner.upgrade() else {
            break;
        };
        if queued.token.is_cancelled() {
            tracing::debug!(job_id = %queued.job_id, "Skipping cancelled job");
            orchestrator.forget_token(&queued.job_id);
            continue;
        }

        let permits = orchestrator.permits_for(queued.strategy);
        let permit = tokio::select! {
            _ = queued.token.cancelled() => {
                orchestrator.forget_token(&queued.job_id);
                continue;
            }
            permit = permits.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let job_runner = Arc::clone(&orchestrator);
        orchestrator
            .tracker
            .spawn(async move { job_runner.run_job(queued, permit).await });
    }
    tracing::debug!("Dispatcher stopped");
}

impl Inner {
    fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot(
            self.jobs.count(JobStatus::Processing),
            self.jobs.count(JobStatus::Pending),
        )
    }

    fn forget_token(&self, job_id: &str) {
        lock(&self.job_tokens).remove(job_id);
    }

    fn effective_strategy(&self, kind: InputKind, size: u64) -> ExecutionStrategy {
        if kind == InputKind::Zip {
            // Archive entries fan out on the archive processor's own blocking pool
            return ExecutionStrategy::ThreadPool;
        }
        match select_strategy(
            size,
            self.config.large_file_threshold_bytes,
            self.config.concurrency_mode,
        ) {
            ExecutionStrategy::ProcessPool if self.runner.is_none() => ExecutionStrategy::ThreadPool,
            strategy => strategy,
        }
    }

    fn permits_for(&self, strategy: ExecutionStrategy) -> Arc<Semaphore> {
        match strategy {
            ExecutionStrategy::Inline => Arc::clone(&self.inline_permits),
            ExecutionStrategy::ThreadPool => Arc::clone(&self.thread_permits),
            ExecutionStrategy::ProcessPool => Arc::clone(&self.process_permits),
        }
    }

    /// Start the sweep, pruning and metrics loops once.
    fn ensure_background(self: &Arc<Self>) {
        if self.background_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let config = &self.config;
        let sweeper = Arc::new(CleanupSweeper::new(
            vec![config.jobs_dir.clone(), config.uploads_dir.clone()],
            config.job_retention,
        ));
        let weak = Arc::downgrade(self);

        let mut handles = lock(&self.background);
        handles.push(sweeper.start(config.cleanup_interval, self.shutdown.child_token()));
        handles.push(start_job_pruner(
            Arc::clone(&self.jobs),
            config.cleanup_interval,
            config.job_retention,
            self.shutdown.child_token(),
        ));
        handles.push(start_sampler(
            move || {
                let inner = weak
                    .upgrade()
                    .ok_or_else(|| anyhow::anyhow!("Orchestrator dropped"))?;
                Ok(inner.snapshot())
            },
            config.metrics_interval,
            config.metrics_backoff,
            self.shutdown.child_token(),
        ));
        tracing::info!("Background cleanup and metrics tasks started");
    }

    #[tracing::instrument(skip(self, queued, permit), fields(job_id = %queued.job_id, strategy = %queued.strategy))]
    async fn run_job(self: Arc<Self>, queued: QueuedJob, permit: OwnedSemaphorePermit) {
        let job = match self
            .jobs
            .transition(&queued.job_id, JobStatus::Processing, |j| j.progress = 0.0)
        {
            Ok(job) => job,
            Err(e) => {
                tracing::debug!(error = %e, "Job no longer runnable");
                self.forget_token(&queued.job_id);
                return;
            }
        };
        tracing::info!(filename = %job.metadata.filename, "Job started");

        // The work task owns the pool slot and the scratch workspace, so both
        // outlive a timeout until the blocking conversion actually returns.
        let abandon = queued.token.child_token();
        let mut work = {
            let inner = Arc::clone(&self);
            let job = job.clone();
            let abandon = abandon.clone();
            let source = queued.source;
            self.tracker.spawn(async move {
                let _permit = permit;
                let outcome = inner.execute(&job, source, &abandon).await;
                if abandon.is_cancelled() {
                    tracing::debug!(job_id = %job.id, "Abandoned job work finished");
                }
                outcome
            })
        };

        let started = Instant::now();
        let timeout = self.config.job_timeout;
        let outcome = tokio::select! {
            _ = queued.token.cancelled() => Err(AppError::Cancelled("Job cancelled".to_string())),
            joined = tokio::time::timeout(timeout, &mut work) => match joined {
                Ok(joined) => joined.map_err(join_error).and_then(|outcome| outcome),
                Err(_) => Err(AppError::Timeout { seconds: timeout.as_secs() }),
            },
        };
        abandon.cancel();

        self.finish(&job.id, outcome, started.elapsed());
        self.forget_token(&job.id);
    }

    /// Spool, convert and hand results to the sink. Once `abandon` fires the
    /// remaining stages are skipped and the workspace is removed on return.
    async fn execute(&self, job: &Job, source: Bytes, abandon: &CancellationToken) -> Result<JobOutput, AppError> {
        let workspace = {
            let uploads_dir = self.config.uploads_dir.clone();
            let jobs_dir = self.config.jobs_dir.clone();
            let job_id = job.id.clone();
            let filename = job.metadata.filename.clone();
            let workspace = tokio::task::spawn_blocking(move || {
                JobWorkspace::create(&uploads_dir, &jobs_dir, &job_id, &filename, &source)
            })
            .await
            .map_err(join_error)??;
            Arc::new(workspace)
        };
        checkpoint(abandon)?;
        self.jobs.set_progress(&job.id, PROGRESS_SPOOLED);

        let mut output = match job.metadata.file_type {
            InputKind::Psd => self.convert_psd(job, &workspace, abandon).await?,
            InputKind::Zip => self.convert_archive(job, &workspace, abandon).await,
        };
        checkpoint(abandon)?;
        self.jobs.set_progress(&job.id, PROGRESS_CONVERTED);

        if output.error().is_none() {
            if let Some(sink) = &self.sink {
                for artifact in output.artifacts() {
                    checkpoint(abandon)?;
                    let stored = sink.store(job, &artifact).await?;
                    output.storage.push(stored);
                }
            }
            checkpoint(abandon)?;
            workspace.keep_output();
        }
        Ok(output)
    }

    async fn convert_psd(
        &self,
        job: &Job,
        workspace: &Arc<JobWorkspace>,
        abandon: &CancellationToken,
    ) -> Result<JobOutput, AppError> {
        let options = job.metadata.options.clone();
        let stem = sanitize_filename(&file_stem_or(Path::new(&job.metadata.filename), "converted"));
        let stem = if stem.is_empty() { "converted".to_string() } else { stem };
        let output_path = workspace
            .output_dir()
            .join(format!("{}.{}", stem, options.format.extension()));

        let strategy = job.metadata.strategy.unwrap_or(ExecutionStrategy::Inline);
        let result = match (&self.runner, strategy) {
            (Some(runner), ExecutionStrategy::ProcessPool) => {
                let request = WorkerRequest {
                    max_file_size: Some(self.config.max_upload_bytes),
                    ..WorkerRequest::new(workspace.input_path(), &output_path, &options)
                };
                // Dropping the run kills the worker process
                let mut result = tokio::select! {
                    _ = abandon.cancelled() => return Err(abandoned()),
                    result = runner.run(&request) => result?,
                };
                if options.optimize_storage && options.enable_deduplication {
                    let converter = Arc::clone(&self.converter);
                    result = tokio::task::spawn_blocking(move || {
                        converter.apply_deduplication(&mut result);
                        result
                    })
                    .await
                    .map_err(join_error)?;
                }
                result
            }
            _ => {
                let converter = Arc::clone(&self.converter);
                let workspace = Arc::clone(workspace);
                tokio::task::spawn_blocking(move || {
                    converter.convert(workspace.input_path(), &output_path, &options)
                })
                .await
                .map_err(join_error)?
            }
        };

        Ok(JobOutput::psd(workspace.output_dir(), result))
    }

    async fn convert_archive(
        &self,
        job: &Job,
        workspace: &Arc<JobWorkspace>,
        abandon: &CancellationToken,
    ) -> JobOutput {
        let table = Arc::clone(&self.jobs);
        let job_id = job.id.clone();
        let callback: ProgressCallback = Arc::new(
            move |percent: f64, completed: usize, total: usize, outcome: &FileOutcome| {
                table.set_progress(&job_id, PROGRESS_SPOOLED + ARCHIVE_PROGRESS_SPAN * percent as f32);
                tracing::debug!(
                    job_id = %job_id,
                    entry = %outcome.entry,
                    completed,
                    total,
                    "Archive entry finished"
                );
            },
        );

        let summary = self
            .archive
            .process_archive_until(
                workspace.input_path(),
                workspace.output_dir(),
                &job.metadata.options,
                Some(callback),
                abandon,
            )
            .await;
        JobOutput::archive(workspace.output_dir(), summary)
    }

    fn finish(&self, job_id: &str, outcome: Result<JobOutput, AppError>, elapsed: Duration) {
        let duration_ms = elapsed.as_millis() as u64;
        let (output, error) = match outcome {
            Ok(output) => {
                let error = output.error();
                (Some(output), error)
            }
            Err(e) => (None, Some(e)),
        };
        let result = output.as_ref().and_then(|o| match serde_json::to_value(o) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Could not serialize job result");
                None
            }
        });

        let next = match &error {
            None => JobStatus::Completed,
            Some(AppError::Cancelled(_)) => JobStatus::Cancelled,
            Some(_) => JobStatus::Failed,
        };
        let message = error.as_ref().map(|e| e.to_string());
        if let Err(e) = self.jobs.transition(job_id, next, |job| {
            job.result = result;
            job.error_message = message;
        }) {
            tracing::debug!(job_id = %job_id, error = %e, "Job already finished");
            return;
        }

        match (&next, &error) {
            (JobStatus::Completed, _) => {
                self.metrics.record_completed();
                tracing::info!(job_id = %job_id, duration_ms, "Job completed");
            }
            (JobStatus::Cancelled, _) => {
                self.metrics.record_cancelled();
                tracing::info!(job_id = %job_id, duration_ms, "Job cancelled");
            }
            (_, Some(err)) => {
                self.metrics.record_failed();
                match err.log_level() {
                    LogLevel::Debug => {
                        tracing::debug!(job_id = %job_id, error = %err, duration_ms, "Job failed")
                    }
                    LogLevel::Warn => {
                        tracing::warn!(job_id = %job_id, error = %err, duration_ms, "Job failed")
                    }
                    LogLevel::Error => {
                        tracing::error!(job_id = %job_id, error = %err, duration_ms, "Job failed")
                    }
                }
            }
            (_, None) => self.metrics.record_failed(),
        }
    }
}

/// Drop finished jobs from the table once they are past retention.
fn start_job_pruner(
    jobs: Arc<JobTable>,
    every: Duration,
    retention: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let pruned = jobs.prune_finished(retention);
            if pruned > 0 {
                tracing::info!(pruned, "Pruned finished jobs");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn converted(success: bool, output: &str) -> ConversionResult {
        if success {
            ConversionResult {
                success: true,
                output_file: Some(PathBuf::from(output)),
                ..ConversionResult::default()
            }
        } else {
            ConversionResult::failure(None, None, 10, &AppError::DecodeFailure("bad".into()))
        }
    }

    #[test]
    fn test_psd_output_error_follows_result() {
        let ok = JobOutput::psd(Path::new("/jobs/job_1"), converted(true, "/jobs/job_1/a.jpeg"));
        assert!(ok.error().is_none());
        assert_eq!(ok.artifacts(), vec![PathBuf::from("/jobs/job_1/a.jpeg")]);

        let failed = JobOutput::psd(Path::new("/jobs/job_1"), converted(false, ""));
        assert!(matches!(failed.error(), Some(AppError::DecodeFailure(_))));
        assert!(failed.artifacts().is_empty());
    }

    #[test]
    fn test_archive_output_fails_only_without_successes() {
        let outcome = |success, output: &str| FileOutcome {
            entry: "x.psd".into(),
            result: converted(success, output),
        };

        let partial = ArchiveSummary::from_outcomes(
            Path::new("a.zip"),
            vec![outcome(true, "/out/a.jpeg"), outcome(false, "")],
        );
        let output = JobOutput::archive(Path::new("/out"), partial);
        assert!(output.error().is_none());
        assert_eq!(output.artifacts(), vec![PathBuf::from("/out/a.jpeg")]);

        let none = ArchiveSummary::from_outcomes(Path::new("a.zip"), vec![outcome(false, "")]);
        assert!(JobOutput::archive(Path::new("/out"), none).error().is_some());
    }

    #[test]
    fn test_output_serializes_without_empty_sections() {
        let output = JobOutput::psd(Path::new("/out"), converted(true, "/out/a.jpeg"));
        let value = serde_json::to_value(&output).unwrap();
        assert!(value.get("archive").is_none());
        assert!(value.get("storage").is_none());
        assert_eq!(value["conversion"]["success"], true);
    }
}
