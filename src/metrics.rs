//! Daemon self-metrics
//!
//! Prometheus counters and histograms over the daemon's own behavior,
//! served as text exposition on `/metrics`.

use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

use crate::error::{MadError, Result};

/// Metric registry plus the daemon's core instruments
pub struct DaemonMetrics {
    registry: Registry,

    /// Samples written to the store, per handler path
    samples_total: IntCounterVec,

    /// Failed poll ticks, per handler path
    poll_errors_total: IntCounterVec,

    /// HTTP requests served, per handler path
    http_requests_total: IntCounterVec,

    /// Poll tick duration
    poll_duration: HistogramVec,
}

impl DaemonMetrics {
    /// Create and register the daemon's instruments
    pub fn new() -> Result<Self> {
        let registration = |e: prometheus::Error| MadError::Metrics { reason: e.to_string() };

        let registry = Registry::new();

        let samples_total = IntCounterVec::new(
            Opts::new("mad_samples_total", "Samples written to the time-series store"),
            &["handler"],
        )
        .map_err(registration)?;
        registry.register(Box::new(samples_total.clone())).map_err(registration)?;

        let poll_errors_total = IntCounterVec::new(
            Opts::new("mad_poll_errors_total", "Poll ticks that failed"),
            &["handler"],
        )
        .map_err(registration)?;
        registry.register(Box::new(poll_errors_total.clone())).map_err(registration)?;

        let http_requests_total = IntCounterVec::new(
            Opts::new("mad_http_requests_total", "HTTP requests served"),
            &["handler"],
        )
        .map_err(registration)?;
        registry.register(Box::new(http_requests_total.clone())).map_err(registration)?;

        let poll_duration = HistogramVec::new(
            HistogramOpts::new("mad_poll_duration_seconds", "Poll tick duration")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["handler"],
        )
        .map_err(registration)?;
        registry.register(Box::new(poll_duration.clone())).map_err(registration)?;

        Ok(Self { registry, samples_total, poll_errors_total, http_requests_total, poll_duration })
    }

    /// Record a successful poll tick
    pub fn record_poll(&self, handler: &str, samples: usize, elapsed: Duration) {
        self.samples_total.with_label_values(&[handler]).inc_by(samples as u64);
        self.poll_duration.with_label_values(&[handler]).observe(elapsed.as_secs_f64());
    }

    /// Record a failed poll tick
    pub fn record_poll_error(&self, handler: &str) {
        self.poll_errors_total.with_label_values(&[handler]).inc();
    }

    /// Record one served HTTP request
    pub fn record_http_request(&self, handler: &str) {
        self.http_requests_total.with_label_values(&[handler]).inc();
    }

    /// Encode the registry in prometheus text exposition format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut out = Vec::new();
        encoder
            .encode(&families, &mut out)
            .map_err(|e| MadError::Metrics { reason: e.to_string() })?;
        String::from_utf8(out).map_err(|e| MadError::Metrics { reason: e.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_gather() {
        let metrics = DaemonMetrics::new().unwrap();
        metrics.record_poll("/vmstat", 3, Duration::from_millis(12));
        metrics.record_poll_error("/vmstat");
        metrics.record_http_request("/");

        let text = metrics.gather().unwrap();
        assert!(text.contains("mad_samples_total"));
        assert!(text.contains("mad_poll_errors_total"));
        assert!(text.contains("mad_http_requests_total"));
        assert!(text.contains("mad_poll_duration_seconds"));
    }
}
