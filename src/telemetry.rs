//! Telemetry and structured logging for the dispatcher and backends.

use opentelemetry::trace::{Span, Tracer};
use opentelemetry::{global, KeyValue};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::capability::CapabilityClass;
use crate::consumer::JobOutcome;
use crate::job::JobRequest;

const TRACER_NAME: &str = "conversion-dispatch";

/// Jobs slower than this are logged as a warning.
pub const SLOW_JOB_THRESHOLD_MS: i64 = 30_000;

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` selects the filter (default `info`); `LOG_FORMAT=json`
/// switches to one JSON object per line.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Everything worth recording about one consumed job.
#[derive(Debug)]
pub struct JobReport<'a> {
    pub job: &'a JobRequest,
    pub class: CapabilityClass,
    pub outcome: JobOutcome,
    pub duration_ms: i64,
    pub error: Option<String>,
}

/// Records a `conversion_job` span and log line for a consumed job.
pub fn record_job_telemetry(report: &JobReport<'_>) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("conversion_job");

    let job = report.job;
    span.set_attribute(KeyValue::new("job_id", job.job_id.to_string()));
    span.set_attribute(KeyValue::new("capability", report.class.to_string()));
    span.set_attribute(KeyValue::new("source", job.request.source.to_string()));
    span.set_attribute(KeyValue::new("target", job.request.target.to_string()));
    span.set_attribute(KeyValue::new("outcome", report.outcome.as_str()));
    span.set_attribute(KeyValue::new("duration_ms", report.duration_ms));
    span.set_attribute(KeyValue::new("queue_age_ms", job.age_ms()));

    if let Some(ref error) = report.error {
        span.set_attribute(KeyValue::new("error", error.clone()));
        warn!(
            job_id = %job.job_id,
            capability = %report.class,
            outcome = %report.outcome,
            error = %error,
            "Conversion job did not complete"
        );
    } else {
        info!(
            job_id = %job.job_id,
            capability = %report.class,
            duration_ms = report.duration_ms,
            outcome = %report.outcome,
            "Conversion job completed"
        );
    }

    if report.duration_ms > SLOW_JOB_THRESHOLD_MS {
        warn!(
            job_id = %job.job_id,
            duration_ms = report.duration_ms,
            "Conversion job exceeded {}ms",
            SLOW_JOB_THRESHOLD_MS
        );
    }

    span.end();
}

/// Records a queue message that could not be decoded into a job.
pub fn record_malformed_message(queue: &str, error: &str) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("conversion_job");
    span.set_attribute(KeyValue::new("queue", queue.to_string()));
    span.set_attribute(KeyValue::new("outcome", JobOutcome::Malformed.as_str()));
    span.set_attribute(KeyValue::new("error", error.to_string()));
    span.end();

    warn!(queue = queue, error = error, "Dropped malformed queue message");
}

/// Records a `dispatch_request` span for one ingress call.
pub fn record_dispatch_telemetry(
    mode: &str,
    class: Option<CapabilityClass>,
    outcome: &str,
    duration_ms: i64,
) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("dispatch_request");

    span.set_attribute(KeyValue::new("mode", mode.to_string()));
    if let Some(class) = class {
        span.set_attribute(KeyValue::new("capability", class.to_string()));
    }
    span.set_attribute(KeyValue::new("outcome", outcome.to_string()));
    span.set_attribute(KeyValue::new("duration_ms", duration_ms));
    span.end();

    info!(
        mode = mode,
        capability = class.map(|c| c.tag()).unwrap_or("-"),
        outcome = outcome,
        duration_ms = duration_ms,
        "Dispatch finished"
    );
}

/// Initializes OpenTelemetry with the OTLP exporter.
///
/// Reads configuration from environment variables:
/// - `OTEL_EXPORTER_OTLP_ENDPOINT` - Collector endpoint (default: http://localhost:4317)
/// - `OTEL_SERVICE_NAME` - Service name (default: `default_service_name`)
pub fn init_telemetry(default_service_name: &str) -> Result<(), Box<dyn std::error::Error>> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::Config;

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| default_service_name.to_string());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(&endpoint),
        )
        .with_trace_config(Config::default().with_resource(
            opentelemetry_sdk::Resource::new(vec![
                KeyValue::new("service.name", service_name),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    if let Some(provider) = tracer.provider() {
        global::set_tracer_provider(provider);
    }

    info!("Telemetry initialized: endpoint={}", endpoint);
    Ok(())
}

/// Flushes pending spans; call once before exiting.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}
