use std::io::{self, IsTerminal};
use std::sync::OnceLock;

use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::TelemetryError;

static TRACING_INITIALISED: OnceLock<Result<(), TelemetryError>> = OnceLock::new();

/// Initialises structured logging and OpenTelemetry tracing support.
///
/// Runs once per process; later calls return the first outcome. The log
/// filter comes from `RUST_LOG` and defaults to `warn`. Logs are pretty
/// printed on a terminal and emitted as JSON otherwise.
///
/// # Errors
///
/// Returns an error when another global subscriber is already installed.
pub fn initialise_tracing(service_name: &str) -> Result<(), &'static TelemetryError> {
    TRACING_INITIALISED
        .get_or_init(|| initialise_tracing_once(service_name))
        .as_ref()
        .copied()
}

fn initialise_tracing_once(service_name: &str) -> Result<(), TelemetryError> {
    let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder().build();
    let tracer = tracer_provider.tracer(service_name.to_owned());
    global::set_tracer_provider(tracer_provider);

    let log_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    if io::stderr().is_terminal() {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .pretty()
                    .with_writer(io::stderr)
                    .with_filter(log_filter),
            )
            .with(OpenTelemetryLayer::new(tracer))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .json()
                    .with_target(false)
                    .with_writer(io::stderr)
                    .with_filter(log_filter),
            )
            .with(OpenTelemetryLayer::new(tracer))
            .try_init()?;
    }

    Ok(())
}
