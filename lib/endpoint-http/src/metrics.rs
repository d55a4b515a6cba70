//! Prometheus metrics for the HTTP front door and the registry cache

use crate::middleware::{Middleware, MiddlewareContext};
use anyhow::Result;
use endpoint_api::RegistryVersion;
use endpoint_core::Freshness;
use prometheus::{Counter, CounterVec, Encoder, HistogramOpts, HistogramVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tracing::debug;

/// Prometheus metrics collector
#[derive(Clone)]
pub struct MetricsCollector {
    /// Total HTTP requests received
    pub http_requests_total: CounterVec,
    /// HTTP request duration in seconds
    pub http_request_duration_seconds: HistogramVec,
    /// HTTP responses by status code
    pub http_responses_total: CounterVec,
    /// HTTP errors total
    pub http_errors_total: Counter,
    /// Registry cache reloads
    pub registry_reloads_total: Counter,
    /// Version signal reads that failed
    pub registry_signal_failures_total: Counter,
    /// Rules whose handler descriptor did not resolve
    pub handler_resolution_errors_total: Counter,
    /// Version of the snapshot currently served
    pub registry_version: IntGauge,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        // Label by method only: paths carry captured parameters
        let http_requests_total = CounterVec::new(
            Opts::new("http_requests_total", "Total HTTP requests"),
            &["method"],
        )?;

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new("http_request_duration_seconds", "HTTP request latency in seconds"),
            &["method"],
        )?;

        let http_responses_total = CounterVec::new(
            Opts::new("http_responses_total", "Total HTTP responses by status"),
            &["status"],
        )?;

        let http_errors_total = Counter::new("http_errors_total", "Total HTTP errors")?;

        let registry_reloads_total = Counter::new("registry_reloads_total", "Registry cache reloads")?;

        let registry_signal_failures_total = Counter::new(
            "registry_signal_failures_total",
            "Failed reads of the registry version signal",
        )?;

        let handler_resolution_errors_total = Counter::new(
            "handler_resolution_errors_total",
            "Requests matching a rule whose handler could not be resolved",
        )?;

        let registry_version = IntGauge::new("registry_version", "Registry version currently served")?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(http_responses_total.clone()))?;
        registry.register(Box::new(http_errors_total.clone()))?;
        registry.register(Box::new(registry_reloads_total.clone()))?;
        registry.register(Box::new(registry_signal_failures_total.clone()))?;
        registry.register(Box::new(handler_resolution_errors_total.clone()))?;
        registry.register(Box::new(registry_version.clone()))?;

        Ok(Self {
            http_requests_total,
            http_request_duration_seconds,
            http_responses_total,
            http_errors_total,
            registry_reloads_total,
            registry_signal_failures_total,
            handler_resolution_errors_total,
            registry_version,
            registry,
        })
    }

    /// Record the outcome of a freshness check and the version now served
    pub fn record_freshness(&self, freshness: Freshness, served: RegistryVersion) {
        if freshness.reloaded() {
            self.registry_reloads_total.inc();
        }
        if freshness.signal_failed() {
            self.registry_signal_failures_total.inc();
        }
        self.registry_version
            .set(i64::try_from(served.get()).unwrap_or(i64::MAX));
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Prometheus metrics middleware
pub struct MetricsMiddleware {
    pub collector: MetricsCollector,
}

impl MetricsMiddleware {
    pub fn new(collector: MetricsCollector) -> Self {
        Self { collector }
    }
}

#[async_trait::async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &'static str {
        "MetricsMiddleware"
    }

    async fn on_request(&self, context: &MiddlewareContext) -> Result<()> {
        debug!("Recording request metrics for {} {}", context.method, context.path);
        self.collector
            .http_requests_total
            .with_label_values(&[context.method.as_str()])
            .inc();
        Ok(())
    }

    async fn on_response(&self, context: &MiddlewareContext, status: u16) -> Result<()> {
        debug!("Recording response metrics for {} {} -> {}", context.method, context.path, status);
        self.collector
            .http_responses_total
            .with_label_values(&[status.to_string().as_str()])
            .inc();
        self.collector
            .http_request_duration_seconds
            .with_label_values(&[context.method.as_str()])
            .observe(context.elapsed_secs());
        Ok(())
    }

    async fn on_error(&self, context: &MiddlewareContext, error: &str) -> Result<()> {
        debug!("Recording error metrics for {} {}: {}", context.method, context.path, error);
        self.collector.http_errors_total.inc();
        Ok(())
    }
}
