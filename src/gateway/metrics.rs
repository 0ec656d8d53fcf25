//! Prometheus metrics for the gateway.
//!
//! Request counts, denial reasons, upstream latency, and in-flight gauge,
//! backed by a dedicated `prometheus::Registry` and rendered at `/metrics`.

use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// All gateway metrics.
///
/// Cheap to clone (all inner types are `Arc`-based).
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,

    /// Completed requests, by provider and outcome.
    pub requests_total: IntCounterVec,

    /// Denied requests, by pipeline reason code.
    pub denials_total: IntCounterVec,

    /// Upstream call latency in seconds, by provider.
    pub upstream_latency_seconds: HistogramVec,

    /// Requests currently in flight.
    pub requests_active: IntGauge,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("warden_requests_total", "Completed gateway requests"),
            &["provider", "outcome"],
        )
        .expect("metric can be created");
        registry
            .register(Box::new(requests_total.clone()))
            .expect("metric can be registered");

        let denials_total = IntCounterVec::new(
            Opts::new("warden_denials_total", "Requests denied by the pipeline"),
            &["reason"],
        )
        .expect("metric can be created");
        registry
            .register(Box::new(denials_total.clone()))
            .expect("metric can be registered");

        let upstream_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "warden_upstream_latency_seconds",
                "Upstream provider call latency",
            ),
            &["provider"],
        )
        .expect("metric can be created");
        registry
            .register(Box::new(upstream_latency_seconds.clone()))
            .expect("metric can be registered");

        let requests_active = IntGauge::with_opts(Opts::new(
            "warden_requests_active",
            "Requests currently in flight",
        ))
        .expect("metric can be created");
        registry
            .register(Box::new(requests_active.clone()))
            .expect("metric can be registered");

        Self {
            registry,
            requests_total,
            denials_total,
            upstream_latency_seconds,
            requests_active,
        }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        encoder
            .encode(&metric_families, &mut buf)
            .expect("encoding metrics");
        String::from_utf8(buf).expect("metrics are valid UTF-8")
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the in-flight gauge on drop.
pub struct RequestGuard {
    gauge: IntGauge,
}

impl RequestGuard {
    pub fn new(metrics: &GatewayMetrics) -> Self {
        metrics.requests_active.inc();
        Self {
            gauge: metrics.requests_active.clone(),
        }
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_tracks_in_flight_requests() {
        let metrics = GatewayMetrics::new();
        assert_eq!(metrics.requests_active.get(), 0);
        {
            let _a = RequestGuard::new(&metrics);
            let _b = RequestGuard::new(&metrics);
            assert_eq!(metrics.requests_active.get(), 2);
        }
        assert_eq!(metrics.requests_active.get(), 0);
    }

    #[test]
    fn render_includes_counters() {
        let metrics = GatewayMetrics::new();
        metrics
            .requests_total
            .with_label_values(&["openai", "allowed"])
            .inc();
        metrics
            .denials_total
            .with_label_values(&["rate_limited"])
            .inc();
        let text = metrics.render();
        assert!(text.contains("warden_requests_total"));
        assert!(text.contains("rate_limited"));
    }
}
