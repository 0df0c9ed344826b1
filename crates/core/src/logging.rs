//! Tracing subscriber setup.
//!
//! Filter precedence: `QP_LOG`, then `RUST_LOG`, then the configured filter.
//! An unparsable directive falls through to the next source.

use anyhow::{anyhow, Result};
use tracing::Subscriber;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::models::{LogFormat, LoggingConfig};

/// Environment variable overriding every other filter source.
pub const LOG_ENV: &str = "QP_LOG";

/// Build the filter from the environment and `config`.
pub fn build_filter(config: &LoggingConfig) -> EnvFilter {
    filter_from_sources(
        std::env::var(LOG_ENV).ok(),
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
        &config.filter,
    )
}

fn filter_from_sources(custom: Option<String>, standard: Option<String>, configured: &str) -> EnvFilter {
    [custom, standard, Some(configured.to_string())]
        .into_iter()
        .flatten()
        .find_map(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Install the global subscriber. Logs go to stderr so stdout stays free for
/// command output.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    tracing_subscriber::registry()
        .with(build_filter(config))
        .with(output_layer(config.format, std::io::stderr))
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}

fn output_layer<S, W>(format: LogFormat, writer: W) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_target(false)
            .with_writer(writer)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(writer)
            .boxed(),
    }
}
