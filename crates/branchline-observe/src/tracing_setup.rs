//! Tracing subscriber construction for engine binaries and tests.
//!
//! [`build_subscriber`] assembles the layered subscriber without installing
//! it, so tests can scope it with `tracing::subscriber::with_default`;
//! [`init_tracing`] installs it globally. The optional OpenTelemetry bridge
//! uses a stdout exporter, suitable for local development.

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::Subscriber;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Keeps the OTel tracer provider reachable for a clean shutdown.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// How engine tracing output is shaped.
#[derive(Debug, Clone, Default)]
pub struct TracingConfig {
    /// Emit newline-delimited JSON instead of human-readable lines.
    pub json: bool,
    /// Bridge spans to OpenTelemetry with a stdout exporter.
    pub otel_stdout: bool,
    /// Filter directive applied when `RUST_LOG` is unset. `None` means
    /// `info`.
    pub default_directive: Option<String>,
}

/// Assemble the layered subscriber without installing it.
///
/// The filter honors `RUST_LOG` first, then the configured default. The fmt
/// layer records span close timing in the human-readable shape, so engine
/// message handling shows up with durations.
pub fn build_subscriber(config: &TracingConfig) -> impl Subscriber + Send + Sync {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.default_directive.as_deref().unwrap_or("info"))
    });

    let fmt_layer: Box<dyn Layer<_> + Send + Sync> = if config.json {
        Box::new(tracing_subscriber::fmt::layer().json().with_target(true))
    } else {
        Box::new(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_span_events(FmtSpan::CLOSE),
        )
    };

    let otel_layer = config.otel_stdout.then(|| {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("branchline");
        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);
        tracing_opentelemetry::layer().with_tracer(tracer)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
}

/// Install the subscriber globally.
///
/// # Errors
///
/// Returns an error if a global subscriber is already set.
pub fn init_tracing(
    config: &TracingConfig,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    build_subscriber(config).try_init()
}

/// Flush pending spans and shut down the OTel tracer provider. A no-op when
/// the bridge was never enabled.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(error) = provider.shutdown() {
            tracing::warn!(%error, "tracer provider shutdown failed");
        }
    }
}
