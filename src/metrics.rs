//! OpenTelemetry instruments for pools, dispatches and workflows.
//!
//! Instruments are created on the global meter. Unless [`init_provider`]
//! installs an OTLP-backed provider they are no-ops.

use std::time::{Duration, Instant};

use anyhow::Result;
use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};

use crate::config::TelemetryConfig;

/// Initialize the OpenTelemetry metrics provider.
///
/// Must be called before any [`Metrics`] is created so that instruments bind
/// to the exporting provider.
pub fn init_provider(config: &TelemetryConfig, instance_id: &str) -> Result<()> {
    if !config.enable_metrics {
        return Ok(());
    }

    let resource = Resource::builder()
        .with_attribute(KeyValue::new("service.name", "warmpool"))
        .with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
        .with_attribute(KeyValue::new(
            "warmpool.instance.id",
            instance_id.to_string(),
        ))
        .build();

    let mut exporter_builder = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = &config.endpoint {
        exporter_builder = exporter_builder.with_endpoint(endpoint.clone());
    }
    let exporter = exporter_builder.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(config.metrics_interval())
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider);

    tracing::info!(
        endpoint = ?config.endpoint,
        interval_secs = config.metrics_interval_secs,
        "Metrics provider initialized"
    );

    Ok(())
}

#[derive(Debug, Clone)]
pub struct Metrics {
    pub dispatches: Counter<u64>,
    pub dispatch_latency: Histogram<f64>,
    pub containers_provisioned: Counter<u64>,
    pub provision_failures: Counter<u64>,
    pub containers_reaped: Counter<u64>,
    pub container_leaks: Counter<u64>,
    pub workflow_runs: Counter<u64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Metrics {
        let meter = opentelemetry::global::meter("warmpool");
        let dispatches = meter
            .u64_counter("warmpool.dispatches")
            .with_description("number of dispatches by function and outcome")
            .build();
        let dispatch_latency = meter
            .f64_histogram("warmpool.dispatch.latency")
            .with_unit("s")
            .with_description("dispatch latency including container lease")
            .build();
        let containers_provisioned = meter
            .u64_counter("warmpool.containers.provisioned")
            .with_description("containers started and found ready")
            .build();
        let provision_failures = meter
            .u64_counter("warmpool.containers.provision_failures")
            .with_description("containers that failed to start or become ready")
            .build();
        let containers_reaped = meter
            .u64_counter("warmpool.containers.reaped")
            .with_description("idle containers removed by the reaper")
            .build();
        let container_leaks = meter
            .u64_counter("warmpool.containers.leaked")
            .with_description("containers the runtime failed to stop")
            .build();
        let workflow_runs = meter
            .u64_counter("warmpool.workflow.runs")
            .with_description("finished workflow runs by outcome")
            .build();
        Metrics {
            dispatches,
            dispatch_latency,
            containers_provisioned,
            provision_failures,
            containers_reaped,
            container_leaks,
            workflow_runs,
        }
    }
}

/// Records the elapsed time into a histogram when dropped.
pub struct Timer<'a> {
    start: Instant,
    metric: &'a Histogram<f64>,
    labels: Vec<KeyValue>,
}

impl<'a> Timer<'a> {
    pub fn start(metric: &'a Histogram<f64>, labels: Vec<KeyValue>) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Timer<'_> {
    fn drop(&mut self) {
        self.metric
            .record(self.start.elapsed().as_secs_f64(), &self.labels);
    }
}
