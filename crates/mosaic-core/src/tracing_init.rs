//! Shared tracing/logging initialization.
//!
//! The daemon and any embedding front-end use the same pattern for setting
//! up `tracing_subscriber` with an env-filter and optional JSON output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Keeps optional telemetry exporters alive for the process lifetime.
///
/// Without the `metrics` feature this is an empty marker.
#[derive(Default)]
pub struct TelemetryGuard {
    #[cfg(feature = "metrics")]
    metrics: Option<crate::metrics::MetricsGuard>,
}

impl TelemetryGuard {
    /// Whether an OTLP pipeline is attached.
    pub const fn has_metrics(&self) -> bool {
        #[cfg(feature = "metrics")]
        {
            self.metrics.is_some()
        }
        #[cfg(not(feature = "metrics"))]
        {
            false
        }
    }

    /// Flush and shut down any attached exporters.
    pub fn shutdown(self) {
        #[cfg(feature = "metrics")]
        if let Some(guard) = self.metrics
            && let Err(e) = guard.shutdown()
        {
            tracing::warn!(error = %e, "OpenTelemetry shutdown failed");
        }
    }
}

fn env_filter(default_filter: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    )
}

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"mosaic_daemon=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = env_filter(default_filter);
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Initialise tracing and, when an endpoint is given and the `metrics`
/// feature is compiled in, the OTLP trace/metric exporters.
///
/// Falls back to plain [`init_tracing`] if the exporter cannot be built.
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    metrics_endpoint: Option<&str>,
) -> TelemetryGuard {
    #[cfg(feature = "metrics")]
    if let Some(endpoint) = metrics_endpoint {
        match crate::metrics::init_metrics(endpoint) {
            Ok(guard) => {
                use opentelemetry::trace::TracerProvider as _;
                let tracer = guard.tracer_provider.tracer("mosaic");
                let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
                let env_filter = env_filter(default_filter);
                if log_json {
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(tracing_subscriber::fmt::layer().json())
                        .with(otel_layer)
                        .init();
                } else {
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(tracing_subscriber::fmt::layer())
                        .with(otel_layer)
                        .init();
                }
                tracing::info!(endpoint, "OpenTelemetry export enabled");
                return TelemetryGuard {
                    metrics: Some(guard),
                };
            }
            Err(e) => {
                init_tracing(default_filter, log_json);
                tracing::warn!(endpoint, error = %e, "OpenTelemetry disabled");
                return TelemetryGuard::default();
            }
        }
    }

    #[cfg(not(feature = "metrics"))]
    let _ = metrics_endpoint;

    init_tracing(default_filter, log_json);
    TelemetryGuard::default()
}
