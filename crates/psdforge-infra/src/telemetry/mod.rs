//! Tracing subscriber initialization
//!
//! Output is human readable by default. `LOG_FORMAT=json` switches to one
//! JSON object per event. The filter comes from `RUST_LOG`.

mod init_basic;

pub use init_basic::{init_telemetry, shutdown_telemetry};

use std::str::FromStr;

pub const DEFAULT_FILTER: &str = "psdforge=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "pretty" | "text" | "fmt" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => anyhow::bail!("Unknown log format: {}", other),
        }
    }
}

/// Where events are written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogTarget {
    #[default]
    Stdout,
    /// Keeps stdout free for machine-readable output
    Stderr,
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    /// Used when `RUST_LOG` is unset or invalid
    pub default_filter: String,
    pub format: LogFormat,
    pub target: LogTarget,
}

impl TelemetryConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            default_filter: DEFAULT_FILTER.to_string(),
            format: LogFormat::default(),
            target: LogTarget::default(),
        }
    }

    /// Read `LOG_FORMAT`. An unrecognised value falls back to the pretty format.
    pub fn from_env(service_name: impl Into<String>) -> Self {
        let format = std::env::var("LOG_FORMAT")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or_default();
        Self {
            format,
            ..Self::new(service_name)
        }
    }

    pub fn with_target(mut self, target: LogTarget) -> Self {
        self.target = target;
        self
    }

    pub fn with_default_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }
}
