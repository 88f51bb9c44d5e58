//! # Telemetry
//!
//! Console logging is always on: [`init_telemetry`] installs a
//! `tracing-subscriber` registry with an `EnvFilter` (`RUST_LOG`, default
//! `info`) and a pretty `fmt` layer. OpenTelemetry export is opt-in.
//!
//! ## Feature matrix
//!
//! - `otel`: exports spans through `tracing-opentelemetry`.
//! - `metrics`: records the pipeline instruments below.
//! - `otlp`: OTLP/gRPC exporter, configured from `OTEL_EXPORTER_OTLP_ENDPOINT`
//!   and optionally `OTEL_EXPORTER_OTLP_COMPRESSION`.
//! - `stdout`: stdout exporter, useful locally.
//!
//! Exporters require at least one of `otel` or `metrics`.
//!
//! ## Instruments
//!
//! | name | kind | attributes |
//! |------|------|------------|
//! | `rpc_calls` | counter | `rpc.method`, `rpc.kind`, `rpc.grpc.status_code` |
//! | `rpc_duration` | histogram (ms) | `rpc.method`, `rpc.kind` |
//! | `admission_rejected` | counter | `scope` (`global` or `caller`) |
//! | `streams_started` | counter | `rpc.method` |
//!
//! The recording functions compile to no-ops without the `metrics` feature.
//!
//! ## Example usage
//!
//! ```bash
//! cargo run -p grpc-framework-server --features otel,metrics,otlp
//! ```

#[cfg(all(feature = "otlp", not(any(feature = "otel", feature = "metrics"))))]
compile_error!("The 'otlp' feature requires at least one of 'otel' or 'metrics' to be enabled.");

#[cfg(all(feature = "stdout", not(any(feature = "otel", feature = "metrics"))))]
compile_error!("The 'stdout' feature requires at least one of 'otel' or 'metrics' to be enabled.");

use std::time::Duration;
use tonic::Code;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(all(feature = "otlp", any(feature = "metrics", feature = "otel")))]
use opentelemetry_otlp::{Compression, Protocol, WithExportConfig, WithTonicConfig};
#[cfg(all(feature = "otlp", feature = "metrics"))]
use opentelemetry_sdk::metrics::Temporality;
#[cfg(all(feature = "otlp", any(feature = "metrics", feature = "otel")))]
use tonic::transport::ClientTlsConfig;

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "otel")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "otel")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "otel")]
use opentelemetry_sdk::trace as sdktrace;

#[cfg(any(feature = "metrics", feature = "otel"))]
const SERVICE_NAME: &str = "grpc-framework";

/// Providers that must be flushed and shut down on exit.
#[derive(Debug)]
pub struct TelemetryProviders {
    #[cfg(feature = "otel")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes pending spans and metrics and shuts the providers down.
    pub fn shutdown(self) {
        #[cfg(feature = "otel")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

/// Installs the global subscriber and, when enabled, the OpenTelemetry
/// providers. Call once per process.
pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "otel")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "otel")]
    let tracer_provider = init_tracer()?;

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics()?;

    #[cfg(any(feature = "metrics", feature = "otel"))]
    let scope = InstrumentationScope::builder(SERVICE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    // Human-readable console output, independent of the stdout exporter.
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(true)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true)
                .pretty(),
        );

    #[cfg(feature = "otel")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let meter = opentelemetry::global::meter_with_scope(scope);
        init_metric_handles(meter);

        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.try_init()?;

    Ok(TelemetryProviders {
        #[cfg(feature = "otel")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(any(feature = "metrics", feature = "otel"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(all(feature = "otlp", any(feature = "metrics", feature = "otel")))]
fn otlp_settings() -> anyhow::Result<(String, Option<Compression>)> {
    use anyhow::Context;
    use std::str::FromStr;

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .context("missing `OTEL_EXPORTER_OTLP_ENDPOINT`")?;
    let compression = match std::env::var("OTEL_EXPORTER_OTLP_COMPRESSION") {
        Ok(raw) => Some(Compression::from_str(&raw.to_ascii_lowercase())?),
        Err(_) => None,
    };
    Ok((endpoint, compression))
}

#[cfg(feature = "metrics")]
fn init_metrics() -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::MetricExporter;
        let exporter = MetricExporter::default();
        let reader = sdkmetrics::PeriodicReader::builder(exporter)
            .with_interval(Duration::from_secs(5))
            .build();

        builder.with_reader(reader)
    };

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let (endpoint, compression) = otlp_settings()?;
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_timeout(Duration::from_secs(10))
            .with_endpoint(endpoint)
            .with_protocol(Protocol::Grpc)
            .with_temporality(Temporality::Delta);
        let exporter = match compression {
            Some(compression) => exporter.with_compression(compression),
            None => exporter,
        }
        .build()
        .context("failed to build metrics exporter")?;

        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

#[cfg(feature = "otel")]
fn init_tracer() -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::SpanExporter;
        let batch = sdktrace::BatchSpanProcessor::builder(SpanExporter::default())
            .with_batch_config(
                sdktrace::BatchConfigBuilder::default()
                    .with_scheduled_delay(Duration::from_secs(5))
                    .with_max_queue_size(2048)
                    .build(),
            )
            .build();
        builder.with_span_processor(batch)
    };

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let (endpoint, compression) = otlp_settings()?;
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_timeout(Duration::from_secs(10))
            .with_endpoint(endpoint)
            .with_protocol(Protocol::Grpc);
        let exporter = match compression {
            Some(compression) => exporter.with_compression(compression),
            None => exporter,
        }
        .build()
        .context("failed to build tracer exporter")?;

        let batch = sdktrace::BatchSpanProcessor::builder(exporter)
            .with_batch_config(
                sdktrace::BatchConfigBuilder::default()
                    .with_scheduled_delay(Duration::from_secs(5))
                    .with_max_queue_size(2048)
                    .build(),
            )
            .build();

        builder.with_span_processor(batch)
    };

    Ok(builder.build())
}

#[cfg(feature = "metrics")]
static RPC_CALLS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static RPC_DURATION_MS: OnceLock<Histogram<f64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static ADMISSION_REJECTED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static STREAMS_STARTED: OnceLock<Counter<u64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: Meter) {
    let _ = RPC_CALLS.set(
        meter
            .u64_counter("rpc_calls")
            .with_description("Completed gRPC calls by method and status")
            .build(),
    );

    let _ = RPC_DURATION_MS.set(
        meter
            .f64_histogram("rpc_duration")
            .with_unit("ms")
            .with_description("Time from admission to response headers")
            .build(),
    );

    let _ = ADMISSION_REJECTED.set(
        meter
            .u64_counter("admission_rejected")
            .with_description("Calls rejected by the admission gate")
            .build(),
    );

    let _ = STREAMS_STARTED.set(
        meter
            .u64_counter("streams_started")
            .with_description("Streams established through the pipeline")
            .build(),
    );
}

/// Which limiter rejected a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectionScope {
    Global,
    Caller,
}

impl RejectionScope {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectionScope::Global => "global",
            RejectionScope::Caller => "caller",
        }
    }
}

#[cfg(feature = "metrics")]
pub fn record_call(method: &str, kind: &'static str, code: Code, elapsed: Duration) {
    let attrs = [
        KeyValue::new("rpc.method", method.to_owned()),
        KeyValue::new("rpc.kind", kind),
    ];
    if let Some(counter) = RPC_CALLS.get() {
        let mut with_code = attrs.to_vec();
        with_code.push(KeyValue::new("rpc.grpc.status_code", code as i64));
        counter.add(1, &with_code);
    }
    if let Some(histogram) = RPC_DURATION_MS.get() {
        histogram.record(elapsed.as_secs_f64() * 1_000.0, &attrs);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_call(_method: &str, _kind: &'static str, _code: Code, _elapsed: Duration) {}

#[cfg(feature = "metrics")]
pub fn record_admission_rejected(scope: RejectionScope) {
    if let Some(counter) = ADMISSION_REJECTED.get() {
        counter.add(1, &[KeyValue::new("scope", scope.as_str())]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_admission_rejected(_scope: RejectionScope) {}

#[cfg(feature = "metrics")]
pub fn record_stream_started(method: &str) {
    if let Some(counter) = STREAMS_STARTED.get() {
        counter.add(1, &[KeyValue::new("rpc.method", method.to_owned())]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_stream_started(_method: &str) {}

/// Pre-registers the call counter for every service so dashboards show a
/// zero series before the first call arrives.
#[cfg(feature = "metrics")]
pub fn initialize_service_metrics<'a>(services: impl IntoIterator<Item = &'a str>) {
    if let Some(counter) = RPC_CALLS.get() {
        for service in services {
            counter.add(0, &[KeyValue::new("rpc.service", service.to_owned())]);
        }
    }
}

#[cfg(not(feature = "metrics"))]
pub fn initialize_service_metrics<'a>(_services: impl IntoIterator<Item = &'a str>) {}
