//! Execution domain selection.

use psdforge_core::{ConcurrencyMode, ExecutionStrategy};

/// Pick where a job runs from its payload size and the configured mode.
///
/// Oversized payloads always go to an isolated process, whatever the mode.
pub fn select_strategy(
    payload_bytes: u64,
    large_file_threshold_bytes: u64,
    mode: ConcurrencyMode,
) -> ExecutionStrategy {
    if payload_bytes > large_file_threshold_bytes || mode == ConcurrencyMode::Multiprocessing {
        return ExecutionStrategy::ProcessPool;
    }

    match mode {
        ConcurrencyMode::Threading => ExecutionStrategy::ThreadPool,
        _ => ExecutionStrategy::Inline,
    }
}

/// Process pool size that leaves one core for the orchestrator.
pub fn process_pool_size(max_workers: usize, available_cores: usize) -> usize {
    max_workers
        .min(available_cores.saturating_sub(1))
        .max(1)
}
