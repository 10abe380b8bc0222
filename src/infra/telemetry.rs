use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
///
/// Output goes to stderr: a worker's stdout carries protocol frames.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Environment overrides that carry these logging settings into a worker process.
pub fn worker_env(logging: &LoggingSettings) -> Vec<(String, String)> {
    vec![
        (
            "PRERENDER__LOGGING__LEVEL".to_string(),
            logging.level.to_string().to_ascii_lowercase(),
        ),
        (
            "PRERENDER__LOGGING__JSON".to_string(),
            matches!(logging.format, LogFormat::Json).to_string(),
        ),
    ]
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "prerender_routes_completed_total",
            Unit::Count,
            "Total number of routes rendered successfully."
        );
        describe_counter!(
            "prerender_routes_failed_total",
            Unit::Count,
            "Total number of routes that failed in the handler, relay or worker."
        );
        describe_counter!(
            "prerender_routes_skipped_total",
            Unit::Count,
            "Total number of routes their handler chose to skip."
        );
        describe_histogram!(
            "prerender_route_render_ms",
            Unit::Milliseconds,
            "Time from handler invocation to worker success per route."
        );
        describe_counter!(
            "prerender_worker_starts_total",
            Unit::Count,
            "Total number of worker start attempts."
        );
        describe_counter!(
            "prerender_protocol_errors_total",
            Unit::Count,
            "Total number of malformed, unknown or uncorrelated protocol messages."
        );
    });
}
