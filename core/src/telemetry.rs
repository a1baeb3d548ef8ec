// Telemetry module for structured logging, metrics, and tracing

use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LogFormat, ObservabilityConfig};
use crate::models::{ExecutionResult, FiredStatus};

const SERVICE_NAME: &str = "job-scheduler";

/// Initialize structured logging and, when an endpoint is configured, OTLP
/// span export.
///
/// `RUST_LOG` takes precedence over the configured level. Production nodes
/// log JSON with span context; `pretty` is meant for a local terminal.
#[tracing::instrument(skip_all)]
pub fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let fmt_layer = match config.log_format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_names(true)
            .with_filter(env_filter)
            .boxed(),
    };

    let registry = tracing_subscriber::registry().with(fmt_layer);

    if let Some(endpoint) = config.tracing_endpoint.as_deref() {
        let tracer = init_tracer(endpoint, config.trace_sample_ratio)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        log_level = %config.log_level,
        log_format = ?config.log_format,
        tracing_endpoint = config.tracing_endpoint.as_deref(),
        "Structured logging initialized"
    );

    Ok(())
}

/// Sample every root span at ratio 1.0; below that, sample a share of new
/// traces and follow the caller's decision for propagated ones
fn sampler_for(ratio: f64) -> Sampler {
    if ratio >= 1.0 {
        Sampler::AlwaysOn
    } else {
        Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(ratio.max(0.0))))
    }
}

#[tracing::instrument(skip_all)]
fn init_tracer(endpoint: &str, sample_ratio: f64) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(sampler_for(sample_ratio))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer(SERVICE_NAME);

    tracing::info!(endpoint, sample_ratio, "OpenTelemetry tracer initialized");

    Ok(tracer)
}

/// Flush remaining spans on shutdown
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Initialize Prometheus metrics exporter and describe the scheduler metrics
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "scheduler_jobs_acquired_total",
        "Job definitions promoted from waiting to acquired"
    );
    describe_counter!(
        "scheduler_jobs_fired_total",
        "Firings classified by the trigger phase, by status"
    );
    describe_counter!(
        "scheduler_jobs_executed_total",
        "Executed firings, by result"
    );
    describe_histogram!(
        "scheduler_tick_duration_seconds",
        "Duration of a full scheduling tick in seconds"
    );
    describe_counter!(
        "scheduler_jobs_purged_total",
        "Soft-deleted job definitions physically removed"
    );

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_jobs_acquired(count: usize) {
    counter!("scheduler_jobs_acquired_total").increment(count as u64);
}

#[inline]
pub fn record_job_fired(status: FiredStatus) {
    counter!("scheduler_jobs_fired_total", "status" => status.as_str()).increment(1);
}

#[inline]
pub fn record_job_executed(result: &ExecutionResult) {
    counter!("scheduler_jobs_executed_total", "result" => result.as_str()).increment(1);
}

#[inline]
pub fn record_tick_duration(duration_seconds: f64) {
    histogram!("scheduler_tick_duration_seconds").record(duration_seconds);
}

#[inline]
pub fn record_jobs_purged(count: usize) {
    counter!("scheduler_jobs_purged_total").increment(count as u64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    #[test]
    fn test_invalid_log_level_is_rejected() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = ObservabilityConfig {
            log_level: "scheduler=loud".to_string(),
            ..Settings::default().observability
        };
        assert!(init_logging(&config).is_err());
    }

    #[test]
    fn test_sampler_follows_ratio() {
        assert!(matches!(sampler_for(1.0), Sampler::AlwaysOn));
        assert!(matches!(sampler_for(0.25), Sampler::ParentBased(_)));
        assert!(matches!(sampler_for(0.0), Sampler::ParentBased(_)));
    }

    #[test]
    fn test_metrics_recording_without_exporter() {
        record_jobs_acquired(3);
        record_job_fired(FiredStatus::Missed);
        record_job_executed(&ExecutionResult::failure("boom"));
        record_tick_duration(0.25);
        record_jobs_purged(0);
    }
}
