use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use super::{LogFormat, LogTarget, TelemetryConfig};

/// Install the global subscriber. Fails if one is already installed.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match (config.format, config.target) {
        (LogFormat::Pretty, LogTarget::Stdout) => registry
            .with(tracing_subscriber::fmt::layer())
            .try_init(),
        (LogFormat::Pretty, LogTarget::Stderr) => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        (LogFormat::Json, LogTarget::Stdout) => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init(),
        (LogFormat::Json, LogTarget::Stderr) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))?;

    tracing::debug!(service = %config.service_name, format = ?config.format, "Telemetry initialized");
    Ok(())
}

/// Flush buffered telemetry. The fmt layers write synchronously, so there is
/// nothing to drain yet.
pub async fn shutdown_telemetry() {
    tracing::debug!("Telemetry shutdown");
}
