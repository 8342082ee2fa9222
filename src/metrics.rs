//! Request duration metrics
//!
//! One histogram, labelled by (endpoint, method), observed in
//! microseconds. Endpoint labels come from the path classifier so the
//! label set stays bounded no matter what clients request.

use crate::endpoints::{endpoint_for, UNKNOWN_PATH};
use prometheus::{Encoder, HistogramOpts, HistogramVec, Registry, TextEncoder};
use tracing::warn;

/// Manually curated list of expected request timings, in microseconds.
/// Ranges from <1ms to <2 minutes, plus the auto-generated +Inf bucket.
const DURATION_BUCKETS: &[f64] = &[
    // <1s
    1_000.0, 10_000.0, 25_000.0, 50_000.0, 75_000.0, 100_000.0,
    // <10s
    1_000_000.0, 1_250_000.0, 1_500_000.0, 1_750_000.0, 2_000_000.0, 3_000_000.0, 4_000_000.0,
    5_000_000.0,
    // <60s
    10_000_000.0, 20_000_000.0, 30_000_000.0, 45_000_000.0,
    // >= 60s
    60_000_000.0, 120_000_000.0,
];

/// Histogram of proxied request durations plus the registry that serves
/// the `/_dendron/metrics` exposition.
pub struct ProxyMetrics {
    registry: Registry,
    durations: HistogramVec,
}

impl ProxyMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let durations = HistogramVec::new(
            HistogramOpts::new(
                "synapse_proxy_request_durations_microseconds",
                "Histogram of microsecond durations of requests to the underlying \
                 synapse for proxied requests",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["path", "method"],
        )?;

        let registry = Registry::new();
        registry.register(Box::new(durations.clone()))?;

        Ok(Self { registry, durations })
    }

    /// Observe one request duration in microseconds against the
    /// canonical label for `path`.
    ///
    /// Measurement must never fail a request: errors obtaining the
    /// labelled child are logged and swallowed.
    pub fn observe(&self, path: &str, method: &str, micros: f64) {
        let endpoint = endpoint_for(path);
        if endpoint == UNKNOWN_PATH {
            warn!(path, "Proxying unknown path");
        }

        match self.durations.get_metric_with_label_values(&[endpoint, method]) {
            Ok(metric) => metric.observe(micros),
            Err(error) => {
                warn!(path, method, %error, "Error getting proxy metric");
            }
        }
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(error) = encoder.encode(&self.registry.gather(), &mut buffer) {
            warn!(%error, "Error encoding metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_and_render() {
        let metrics = ProxyMetrics::new().unwrap();
        metrics.observe("/_matrix/client/r0/sync", "GET", 1500.0);
        metrics.observe("/_matrix/client/r0/sync", "GET", 2500.0);

        let text = metrics.render();
        assert!(text.contains("synapse_proxy_request_durations_microseconds"));
        assert!(text.contains(r#"path="/_matrix/client/r0/sync""#));
        assert!(text.contains(r#"method="GET""#));
        // two observations recorded against the same child
        assert!(text.contains("_count{"));
    }

    #[test]
    fn test_unknown_path_uses_sentinel_label() {
        let metrics = ProxyMetrics::new().unwrap();
        metrics.observe("/not/a/matrix/path", "GET", 100.0);
        metrics.observe("/another/unknown", "GET", 100.0);

        let text = metrics.render();
        // both land on the single sentinel label
        assert!(text.contains(r#"path="<unknown>""#));
        assert!(!text.contains("/not/a/matrix/path"));
    }
}
