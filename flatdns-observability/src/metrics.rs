use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use tracing::debug;

/// Prometheus metrics collector for the resolver (spec.md §4 instrumentation
/// points implied by C2/C5/C8/C9; kept in one registry the admin surface
/// exposes at `/metrics`).
pub struct MetricsCollector {
    registry: Registry,

    /// Queries received, by record type and final response code.
    pub queries_total: IntCounterVec,

    /// Cache lookups, split into hit/miss.
    pub cache_lookups_total: IntCounterVec,

    /// Upstream query latency, by upstream name.
    pub upstream_latency: HistogramVec,

    /// Health-state transitions, by upstream name and resulting state.
    pub health_transitions_total: IntCounterVec,

    /// In-flight (coalesced) resolutions currently outstanding.
    pub in_flight_resolutions: IntGauge,

    /// Queries dropped by the per-IP rate limiter.
    pub rate_limit_drops_total: IntCounterVec,

    /// Current cache entry count, by kind (`positive`/`negative`).
    pub cache_entries: IntGaugeVec,
}

impl MetricsCollector {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let queries_total = IntCounterVec::new(
            Opts::new("flatdns_queries_total", "Total queries received")
                .namespace("flatdns"),
            &["record_type", "response_code"],
        )?;

        let cache_lookups_total = IntCounterVec::new(
            Opts::new("flatdns_cache_lookups_total", "Cache lookups by outcome")
                .namespace("flatdns"),
            &["outcome"],
        )?;

        let upstream_latency = HistogramVec::new(
            HistogramOpts::new("flatdns_upstream_latency_seconds", "Upstream query latency")
                .namespace("flatdns")
                .buckets(vec![
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
                ]),
            &["upstream"],
        )?;

        let health_transitions_total = IntCounterVec::new(
            Opts::new("flatdns_health_transitions_total", "Upstream health state transitions")
                .namespace("flatdns"),
            &["upstream", "to"],
        )?;

        let in_flight_resolutions = IntGauge::new(
            "flatdns_in_flight_resolutions",
            "Resolutions currently coalescing in-flight callers",
        )?;

        let rate_limit_drops_total = IntCounterVec::new(
            Opts::new("flatdns_rate_limit_drops_total", "Queries dropped by the per-IP rate limiter")
                .namespace("flatdns"),
            &["transport"],
        )?;

        let cache_entries = IntGaugeVec::new(
            Opts::new("flatdns_cache_entries", "Current cache entry count")
                .namespace("flatdns"),
            &["kind"],
        )?;

        registry.register(Box::new(queries_total.clone()))?;
        registry.register(Box::new(cache_lookups_total.clone()))?;
        registry.register(Box::new(upstream_latency.clone()))?;
        registry.register(Box::new(health_transitions_total.clone()))?;
        registry.register(Box::new(in_flight_resolutions.clone()))?;
        registry.register(Box::new(rate_limit_drops_total.clone()))?;
        registry.register(Box::new(cache_entries.clone()))?;

        Ok(Self {
            registry,
            queries_total,
            cache_lookups_total,
            upstream_latency,
            health_transitions_total,
            in_flight_resolutions,
            rate_limit_drops_total,
            cache_entries,
        })
    }

    /// Prometheus text exposition, served by the admin surface's `/metrics`.
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let metrics = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metrics, &mut buffer).unwrap_or_default();
        let text = String::from_utf8(buffer).unwrap_or_default();
        debug!(bytes = text.len(), "gathered metrics exposition");
        text
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("failed to create metrics collector")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_text_includes_registered_metric_names() {
        let collector = MetricsCollector::new().unwrap();
        collector
            .queries_total
            .with_label_values(&["A", "NOERROR"])
            .inc();
        let text = collector.gather_text();
        assert!(text.contains("flatdns_queries_total"));
    }
}
