//! Process isolation for conversions.
//!
//! The parent writes a [`WorkerRequest`] to a JSON file, runs the configured
//! worker program with that path as its last argument and reads one JSON
//! [`ConversionResult`] from the child's stdout. The child never touches the
//! hash index. Deduplication runs in the parent once the result is back.

use psdforge_core::{AppError, ConversionOptions, ConversionResult};
use psdforge_processing::PsdConverter;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::config::WorkerCommand;

/// Longest stderr excerpt carried into an error message
const STDERR_EXCERPT: usize = 2048;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub options: ConversionOptions,
    #[serde(default)]
    pub max_file_size: Option<u64>,
}

impl WorkerRequest {
    /// Request for a child process. Deduplication is switched off because the
    /// parent applies it.
    pub fn new(input: &Path, output: &Path, options: &ConversionOptions) -> Self {
        Self {
            input: input.to_path_buf(),
            output: output.to_path_buf(),
            options: ConversionOptions {
                enable_deduplication: false,
                ..options.clone()
            },
            max_file_size: None,
        }
    }

    pub fn read_from(path: &Path) -> Result<Self, AppError> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}

/// Run a request in the current process. Entry point of the worker program.
pub fn execute_request(request: &WorkerRequest) -> ConversionResult {
    let mut converter = PsdConverter::new();
    if let Some(max) = request.max_file_size {
        converter = converter.with_max_file_size(max);
    }
    converter.convert(&request.input, &request.output, &request.options)
}

pub struct ProcessRunner {
    command: WorkerCommand,
}

impl ProcessRunner {
    pub fn new(command: WorkerCommand) -> Self {
        Self { command }
    }

    pub fn command(&self) -> &WorkerCommand {
        &self.command
    }

    /// Run one request in a child process.
    ///
    /// The child is killed if this future is dropped, so an outer timeout or
    /// cancellation does not leave it running.
    pub async fn run(&self, request: &WorkerRequest) -> Result<ConversionResult, AppError> {
        let mut request_file = tempfile::Builder::new()
            .prefix("worker_request_")
            .suffix(".json")
            .tempfile()?;
        serde_json::to_writer(request_file.as_file_mut(), request)?;
        request_file.as_file_mut().flush()?;

        tracing::debug!(
            program = %self.command.program.display(),
            input = %request.input.display(),
            "Spawning worker process"
        );

        let output = Command::new(&self.command.program)
            .args(&self.command.args)
            .arg(request_file.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                AppError::Internal(format!(
                    "Failed to start worker process {}: {}",
                    self.command.program.display(),
                    e
                ))
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(AppError::Internal(format!(
                "Worker process exited with {}: {}",
                output.status,
                tail(&stderr, STDERR_EXCERPT).trim()
            )));
        }
        if !stderr.trim().is_empty() {
            tracing::debug!(stderr = %stderr.trim(), "Worker process output");
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            AppError::Internal(format!("Worker process returned an unreadable result: {}", e))
        })
    }
}

/// Last `max_chars` characters of `s`
fn tail(s: &str, max_chars: usize) -> &str {
    let count = s.chars().count();
    if count <= max_chars {
        return s;
    }
    let start = s
        .char_indices()
        .nth(count - max_chars)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use psdforge_core::OutputFormat;
    use psdforge_processing::test_helpers::{write_psd, PsdSpec};
    use tempfile::tempdir;

    #[test]
    fn test_tail_keeps_end() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
        assert_eq!(tail("héllo", 4), "éllo");
    }

    #[test]
    fn test_request_disables_dedup() {
        let options = ConversionOptions::default();
        assert!(options.enable_deduplication);
        let request = WorkerRequest::new(Path::new("a.psd"), Path::new("a.jpeg"), &options);
        assert!(!request.options.enable_deduplication);
        assert_eq!(request.options.format, options.format);
    }

    #[test]
    fn test_request_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("req.json");
        let request = WorkerRequest::new(
            Path::new("in.psd"),
            Path::new("out.webp"),
            &ConversionOptions::basic(OutputFormat::WebP, 60),
        );
        std::fs::write(&path, serde_json::to_vec(&request).unwrap()).unwrap();

        let loaded = WorkerRequest::read_from(&path).unwrap();
        assert_eq!(loaded.output, PathBuf::from("out.webp"));
        assert_eq!(loaded.options.quality, Some(60));
        assert!(WorkerRequest::read_from(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_execute_request_converts_in_process() {
        let dir = tempdir().unwrap();
        let input = write_psd(dir.path(), "in.psd", &PsdSpec::solid(64, 48, [10, 120, 200]));
        let output = dir.path().join("out.jpeg");
        let request = WorkerRequest::new(&input, &output, &ConversionOptions::basic(OutputFormat::Jpeg, 80));

        let result = execute_request(&request);
        assert!(result.success, "{:?}", result.error);
        assert!(output.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_child_is_an_error() {
        let runner = ProcessRunner::new(WorkerCommand::new("sh").arg("-c").arg("echo broken >&2; exit 3"));
        let request = WorkerRequest::new(Path::new("a.psd"), Path::new("a.jpeg"), &ConversionOptions::default());

        let err = runner.run(&request).await.unwrap_err();
        assert!(err.to_string().contains("broken"), "{}", err);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_result_is_parsed_from_stdout() {
        let json = serde_json::to_string(&ConversionResult {
            success: true,
            optimized_size: 7,
            ..ConversionResult::default()
        })
        .unwrap();
        let script = format!("printf '%s' '{}'", json);
        let runner = ProcessRunner::new(WorkerCommand::new("sh").arg("-c").arg(script));
        let request = WorkerRequest::new(Path::new("a.psd"), Path::new("a.jpeg"), &ConversionOptions::default());

        let result = runner.run(&request).await.unwrap();
        assert!(result.success);
        assert_eq!(result.optimized_size, 7);
    }
}
