//! Shared `OpenTelemetry` metrics initialisation and placement instruments.
//!
//! This module is only compiled when the `metrics` Cargo feature is enabled.
//! It sets up the OTLP exporter for both traces and metrics, sending
//! telemetry to a configurable endpoint (e.g. an `OpenTelemetry` Collector).

use std::sync::OnceLock;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;

/// Errors that can occur during metrics / tracing pipeline initialisation.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Failed to build an OTLP exporter.
    #[error("failed to build OTLP exporter: {0}")]
    ExporterBuild(#[from] opentelemetry_otlp::ExporterBuildError),

    /// Failed during `OTel` SDK shutdown or flush.
    #[error("OpenTelemetry SDK error: {0}")]
    Sdk(#[from] opentelemetry_sdk::error::OTelSdkError),
}

/// Opaque handle that keeps the `OpenTelemetry` providers alive.
///
/// When dropped, the providers are **not** shut down automatically -- call
/// [`MetricsGuard::shutdown`] for a graceful flush before exiting.
pub struct MetricsGuard {
    pub(crate) tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

impl MetricsGuard {
    /// Gracefully shut down both providers, flushing any buffered telemetry.
    ///
    /// # Errors
    ///
    /// Returns an error if either provider fails to shut down cleanly.
    pub fn shutdown(self) -> Result<(), MetricsError> {
        self.tracer_provider.shutdown()?;
        self.meter_provider.shutdown()?;
        Ok(())
    }
}

/// Initialise the `OpenTelemetry` OTLP pipeline for traces **and** metrics.
///
/// * `endpoint` -- OTLP receiver URL, e.g. `"http://localhost:4317"` (gRPC).
///
/// # Errors
///
/// Returns [`MetricsError`] if the OTLP exporters cannot be constructed.
pub fn init_metrics(endpoint: &str) -> Result<MetricsGuard, MetricsError> {
    // --- Traces ---
    let trace_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(trace_exporter)
        .build();

    global::set_tracer_provider(tracer_provider.clone());

    // --- Metrics ---
    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let meter_provider = SdkMeterProvider::builder()
        .with_periodic_exporter(metric_exporter)
        .build();

    global::set_meter_provider(meter_provider.clone());

    Ok(MetricsGuard {
        tracer_provider,
        meter_provider,
    })
}

struct Instruments {
    placements: Counter<u64>,
    evictions: Counter<u64>,
    branches: Counter<u64>,
    branch_latency: Histogram<u64>,
}

fn instruments() -> &'static Instruments {
    static INSTRUMENTS: OnceLock<Instruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("mosaic");
        Instruments {
            placements: meter
                .u64_counter("mosaic.placements")
                .with_description("Model placements committed to a device")
                .build(),
            evictions: meter
                .u64_counter("mosaic.evictions")
                .with_description("Idle placements evicted to free capacity")
                .build(),
            branches: meter
                .u64_counter("mosaic.branches")
                .with_description("Backend branch executions by terminal status")
                .build(),
            branch_latency: meter
                .u64_histogram("mosaic.branch.latency")
                .with_unit("ms")
                .build(),
        }
    })
}

/// Count a committed placement.
pub fn record_placement(strategy: &str, device_id: &str) {
    instruments().placements.add(
        1,
        &[
            KeyValue::new("strategy", strategy.to_string()),
            KeyValue::new("device", device_id.to_string()),
        ],
    );
}

/// Count an eviction.
pub fn record_eviction(device_id: &str) {
    instruments()
        .evictions
        .add(1, &[KeyValue::new("device", device_id.to_string())]);
}

/// Count a finished branch and record its latency.
pub fn record_branch(pattern: &str, status: &str, latency_ms: u64) {
    let attrs = [
        KeyValue::new("pattern", pattern.to_string()),
        KeyValue::new("status", status.to_string()),
    ];
    let inst = instruments();
    inst.branches.add(1, &attrs);
    inst.branch_latency.record(latency_ms, &attrs);
}
