//! psdforge worker
//!
//! The job orchestrator. It owns the job table, a bounded intake queue and
//! three execution domains for conversion work:
//!
//! - inline: the tokio blocking pool of the orchestrator's own runtime
//! - thread pool: blocking threads gated by `max_workers`
//! - process pool: a re-invoked worker program, gated by `cores - 1`
//!
//! Status writes happen only on the async control plane. Worker threads and
//! processes hand back a [`psdforge_core::ConversionResult`] and nothing else.

pub mod config;
pub mod job_table;
pub mod metrics;
pub mod orchestrator;
pub mod process;
pub mod scratch;
pub mod sink;
pub mod strategy;

pub use config::{OrchestratorConfig, WorkerCommand};
pub use job_table::JobTable;
pub use metrics::{
    ConfigurationSummary, MetricsSnapshot, PoolStatus, SystemMetrics, SystemProbe, SystemReport,
    TaskMetrics,
};
pub use orchestrator::{BatchFailure, BatchReport, JobOutput, Orchestrator};
pub use process::{execute_request, ProcessRunner, WorkerRequest};
pub use scratch::JobWorkspace;
pub use sink::{ResultSink, StorageSink};
pub use strategy::{process_pool_size, select_strategy};
