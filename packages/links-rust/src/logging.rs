//! Tracing subscriber setup for binaries built on the pipeline.

use tracing_subscriber::EnvFilter;

/// Output format of the installed subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Installs a global `fmt` subscriber filtered by `RUST_LOG` (default `info`).
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))
}
