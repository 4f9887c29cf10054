//! Prometheus metrics for the broker's transport layer.
//!
//! Exposed at a `/metrics` HTTP endpoint by [`crate::server::GrpcServer`].

use prometheus::{CounterVec, HistogramOpts, HistogramVec, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Request counters, latency histograms, and connection/session gauges.
#[derive(Clone)]
pub struct ServiceMetrics {
    /// Total RPC streams opened (labeled by stream kind and outcome).
    pub streams_total: CounterVec,

    /// Stream lifetime distribution in seconds (labeled by stream kind).
    pub stream_duration_seconds: HistogramVec,

    /// Currently active host control streams.
    pub active_control_streams: IntGauge,

    /// Currently active sessions (guest stream + host data stream pairs).
    pub active_sessions: IntGauge,

    /// Currently registered terminals.
    pub registered_terminals: IntGauge,

    /// Errors returned to RPC callers, labeled by `ServiceError` kind.
    pub errors_total: CounterVec,

    pub registry: Arc<Registry>,
}

impl ServiceMetrics {
    pub fn new(registry: Registry) -> Result<Self, prometheus::Error> {
        let streams_total = CounterVec::new(
            Opts::new("broker_streams_total", "Total RPC streams opened"),
            &["kind", "outcome"],
        )?;

        let stream_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "broker_stream_duration_seconds",
                "Stream lifetime distribution in seconds",
            )
            .buckets(vec![1.0, 5.0, 30.0, 60.0, 300.0, 900.0, 3600.0]),
            &["kind"],
        )?;

        let active_control_streams = IntGauge::new(
            "broker_active_control_streams",
            "Number of currently connected hosts",
        )?;

        let active_sessions = IntGauge::new(
            "broker_active_sessions",
            "Number of currently proxied guest sessions",
        )?;

        let registered_terminals = IntGauge::new(
            "broker_registered_terminals",
            "Number of terminals currently in the registry",
        )?;

        let errors_total = CounterVec::new(
            Opts::new("broker_errors_total", "Total errors returned to RPC callers"),
            &["kind"],
        )?;

        registry.register(Box::new(streams_total.clone()))?;
        registry.register(Box::new(stream_duration_seconds.clone()))?;
        registry.register(Box::new(active_control_streams.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(registered_terminals.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;

        Ok(Self {
            streams_total,
            stream_duration_seconds,
            active_control_streams,
            active_sessions,
            registered_terminals,
            errors_total,
            registry: Arc::new(registry),
        })
    }

    pub fn with_default_registry() -> Result<Self, prometheus::Error> {
        Self::new(Registry::new())
    }

    pub fn record_stream_start(&self) -> std::time::Instant {
        std::time::Instant::now()
    }

    pub fn record_stream_end(&self, kind: &str, outcome: &str, start: std::time::Instant) {
        self.streams_total.with_label_values(&[kind, outcome]).inc();
        self.stream_duration_seconds
            .with_label_values(&[kind])
            .observe(start.elapsed().as_secs_f64());
    }

    pub fn record_error(&self, kind: &str) {
        self.errors_total.with_label_values(&[kind]).inc();
    }

    pub fn render(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}
