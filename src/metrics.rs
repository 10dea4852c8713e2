//! Prometheus metrics for the image relay
//!
//! All collectors are registered on an explicit [`Registry`] so that several
//! relays (or several tests) can live in one process without clashing on the
//! global default registry.

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Metrics for request handling, the load cache and persistence
#[derive(Clone)]
pub struct RelayMetrics {
    registry: Registry,

    /// Requests served, by status class (2xx, 4xx, 5xx)
    pub requests_total: CounterVec,

    /// Duration of request handling in seconds, by status class
    pub request_duration_seconds: HistogramVec,

    /// Cache lookups by result (hit, miss, suppressed)
    pub cache_lookups_total: CounterVec,

    /// Cache entries evicted to make room
    pub cache_evictions_total: IntCounter,

    /// Loader stages that gave up with a hard error, by error kind
    pub loader_failures_total: CounterVec,

    /// Background saves by result (success, failure)
    pub saves_total: CounterVec,
}

impl RelayMetrics {
    /// Create metrics on a private registry
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(&Registry::new())
    }

    /// Create metrics with custom registry
    pub fn with_registry(registry: &Registry) -> Result<Self, prometheus::Error> {
        let requests_total = CounterVec::new(
            Opts::new("pixrelay_requests_total", "Total number of image requests"),
            &["status_class"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "pixrelay_request_duration_seconds",
                "Duration of image requests in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["status_class"],
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        let cache_lookups_total = CounterVec::new(
            Opts::new(
                "pixrelay_cache_lookups_total",
                "Load cache lookups by result",
            ),
            &["result"], // result: hit, miss, suppressed
        )?;
        registry.register(Box::new(cache_lookups_total.clone()))?;

        let cache_evictions_total = IntCounter::new(
            "pixrelay_cache_evictions_total",
            "Load cache entries evicted by the LRU policy",
        )?;
        registry.register(Box::new(cache_evictions_total.clone()))?;

        let loader_failures_total = CounterVec::new(
            Opts::new(
                "pixrelay_loader_failures_total",
                "Loader stages that failed with a hard error",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(loader_failures_total.clone()))?;

        let saves_total = CounterVec::new(
            Opts::new("pixrelay_saves_total", "Background saves by result"),
            &["result"],
        )?;
        registry.register(Box::new(saves_total.clone()))?;

        Ok(Self {
            registry: registry.clone(),
            requests_total,
            request_duration_seconds,
            cache_lookups_total,
            cache_evictions_total,
            loader_failures_total,
            saves_total,
        })
    }

    /// Record a finished request
    pub fn record_request(&self, status: u16, duration: Duration) {
        let class = status_class(status);
        self.requests_total.with_label_values(&[class]).inc();
        self.request_duration_seconds
            .with_label_values(&[class])
            .observe(duration.as_secs_f64());
    }

    pub fn record_cache_hit(&self) {
        self.cache_lookups_total.with_label_values(&["hit"]).inc();
    }

    pub fn record_cache_miss(&self) {
        self.cache_lookups_total.with_label_values(&["miss"]).inc();
    }

    pub fn record_cache_suppressed(&self) {
        self.cache_lookups_total
            .with_label_values(&["suppressed"])
            .inc();
    }

    pub fn record_eviction(&self) {
        self.cache_evictions_total.inc();
    }

    pub fn record_loader_failure(&self, kind: &str) {
        self.loader_failures_total.with_label_values(&[kind]).inc();
    }

    pub fn record_save(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.saves_total.with_label_values(&[result]).inc();
    }

    /// Render every collector on the registry in Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn status_class(status: u16) -> &'static str {
    match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let registry = Registry::new();
        let metrics = RelayMetrics::with_registry(&registry);
        assert!(metrics.is_ok());
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        RelayMetrics::with_registry(&registry).unwrap();
        assert!(RelayMetrics::with_registry(&registry).is_err());
    }

    #[test]
    fn test_record_request_by_class() {
        let metrics = RelayMetrics::new().unwrap();
        metrics.record_request(200, Duration::from_millis(5));
        metrics.record_request(404, Duration::from_millis(5));
        metrics.record_request(499, Duration::from_millis(5));

        assert_eq!(metrics.requests_total.with_label_values(&["2xx"]).get(), 1.0);
        assert_eq!(metrics.requests_total.with_label_values(&["4xx"]).get(), 2.0);
    }

    #[test]
    fn test_encode_contains_recorded_series() {
        let metrics = RelayMetrics::new().unwrap();
        metrics.record_cache_hit();
        metrics.record_cache_suppressed();
        metrics.record_save(false);

        let text = metrics.encode().unwrap();
        assert!(text.contains("pixrelay_cache_lookups_total{result=\"hit\"} 1"));
        assert!(text.contains("pixrelay_cache_lookups_total{result=\"suppressed\"} 1"));
        assert!(text.contains("pixrelay_saves_total{result=\"failure\"} 1"));
    }

    #[test]
    fn test_status_class() {
        assert_eq!(status_class(206), "2xx");
        assert_eq!(status_class(304), "3xx");
        assert_eq!(status_class(502), "5xx");
    }
}
