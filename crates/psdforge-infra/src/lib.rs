//! psdforge Infrastructure Library
//!
//! Shared pieces used by the psdforge binaries:
//! - Telemetry initialization (tracing subscriber)
//! - Error reporting

#[cfg(feature = "observability-basic")]
pub mod telemetry;

pub mod error;

#[cfg(feature = "observability-basic")]
pub use telemetry::{init_telemetry, shutdown_telemetry, LogFormat, LogTarget, TelemetryConfig};

pub use error::ErrorResponse;
