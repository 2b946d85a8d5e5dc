use std::time::Duration;

use prometheus::{
    opts, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct AppMetrics {
    registry: Registry,
    request_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
    inflight_requests: IntGauge,
    backend_errors_total: IntCounterVec,
    log_write_errors_total: IntCounter,
    stats_errors_total: IntCounter,
    stream_chunks_total: IntCounter,
    stream_cancellations_total: IntCounter,
    tokens_generated_total: IntCounterVec,
}

pub struct InflightGuard<'a> {
    metrics: &'a AppMetrics,
}

impl AppMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let request_total = IntCounterVec::new(
            opts!(
                "minivault_http_requests_total",
                "Total HTTP requests processed"
            ),
            &["path", "method", "status", "stream"],
        )
        .expect("valid request_total metric");

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "minivault_http_request_duration_seconds",
                "HTTP request latency in seconds",
            ),
            &["path", "method", "stream"],
        )
        .expect("valid request_duration_seconds metric");

        let inflight_requests = IntGauge::new(
            "minivault_inflight_requests",
            "Current in-flight requests",
        )
        .expect("valid inflight_requests metric");

        let backend_errors_total = IntCounterVec::new(
            opts!(
                "minivault_backend_errors_total",
                "Total backend errors by stage and kind"
            ),
            &["stage", "kind"],
        )
        .expect("valid backend_errors_total metric");

        let log_write_errors_total = IntCounter::new(
            "minivault_log_write_errors_total",
            "Interaction records that could not be persisted",
        )
        .expect("valid log_write_errors_total metric");

        let stats_errors_total = IntCounter::new(
            "minivault_stats_errors_total",
            "Statistics requests that failed to read the interaction log",
        )
        .expect("valid stats_errors_total metric");

        let stream_chunks_total = IntCounter::new(
            "minivault_stream_chunks_total",
            "Chunks delivered to streaming callers",
        )
        .expect("valid stream_chunks_total metric");

        let stream_cancellations_total = IntCounter::new(
            "minivault_stream_cancellations_total",
            "Streaming generations cut short by cancellation or disconnect",
        )
        .expect("valid stream_cancellations_total metric");

        let tokens_generated_total = IntCounterVec::new(
            opts!(
                "minivault_tokens_generated_total",
                "Generated tokens by backend kind"
            ),
            &["backend"],
        )
        .expect("valid tokens_generated_total metric");

        registry
            .register(Box::new(request_total.clone()))
            .expect("register request_total");
        registry
            .register(Box::new(request_duration_seconds.clone()))
            .expect("register request_duration_seconds");
        registry
            .register(Box::new(inflight_requests.clone()))
            .expect("register inflight_requests");
        registry
            .register(Box::new(backend_errors_total.clone()))
            .expect("register backend_errors_total");
        registry
            .register(Box::new(log_write_errors_total.clone()))
            .expect("register log_write_errors_total");
        registry
            .register(Box::new(stats_errors_total.clone()))
            .expect("register stats_errors_total");
        registry
            .register(Box::new(stream_chunks_total.clone()))
            .expect("register stream_chunks_total");
        registry
            .register(Box::new(stream_cancellations_total.clone()))
            .expect("register stream_cancellations_total");
        registry
            .register(Box::new(tokens_generated_total.clone()))
            .expect("register tokens_generated_total");

        Self {
            registry,
            request_total,
            request_duration_seconds,
            inflight_requests,
            backend_errors_total,
            log_write_errors_total,
            stats_errors_total,
            stream_chunks_total,
            stream_cancellations_total,
            tokens_generated_total,
        }
    }

    pub fn inflight_guard(&self) -> InflightGuard<'_> {
        self.inflight_requests.inc();
        InflightGuard { metrics: self }
    }

    pub fn observe_request(
        &self,
        path: &str,
        method: &str,
        stream: bool,
        status: u16,
        duration: Duration,
    ) {
        let stream_label = if stream { "true" } else { "false" };
        let status_label = status.to_string();
        self.request_total
            .with_label_values(&[path, method, &status_label, stream_label])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[path, method, stream_label])
            .observe(duration.as_secs_f64());
    }

    pub fn observe_backend_error(&self, stage: &str, kind: &str) {
        self.backend_errors_total
            .with_label_values(&[stage, kind])
            .inc();
    }

    pub fn observe_log_write_error(&self) {
        self.log_write_errors_total.inc();
    }

    pub fn log_write_errors(&self) -> u64 {
        self.log_write_errors_total.get()
    }

    pub fn observe_stats_error(&self) {
        self.stats_errors_total.inc();
    }

    pub fn observe_stream_chunk(&self) {
        self.stream_chunks_total.inc();
    }

    pub fn observe_stream_cancelled(&self) {
        self.stream_cancellations_total.inc();
    }

    pub fn observe_tokens(&self, backend: &str, tokens: u32) {
        self.tokens_generated_total
            .with_label_values(&[backend])
            .inc_by(u64::from(tokens));
    }

    pub fn render(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|error| error.to_string())?;
        String::from_utf8(buffer).map_err(|error| error.to_string())
    }
}

impl Default for AppMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.metrics.inflight_requests.dec();
    }
}
