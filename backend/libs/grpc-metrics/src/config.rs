//! Measurement scope configuration

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

/// Options for a client or server measurement scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Record `*_handling_seconds` histograms (default: false)
    pub handling_time_histogram: bool,

    /// Use the process-wide scope attached to the default Prometheus
    /// registry instead of a private one (default: false)
    pub shared_scope: bool,

    /// Upper bounds for the handling-time histogram, in seconds
    pub histogram_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            handling_time_histogram: false,
            shared_scope: false,
            histogram_buckets: prometheus::DEFAULT_BUCKETS.to_vec(),
        }
    }
}

impl MetricsConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `GRPC_METRICS_HANDLING_HISTOGRAM`: Record handling time (true/false)
    /// - `GRPC_METRICS_SHARED_SCOPE`: Use the process-wide scope (true/false)
    /// - `GRPC_METRICS_HISTOGRAM_BUCKETS`: Comma-separated bucket bounds in seconds
    pub fn from_env() -> Self {
        let handling_time_histogram = std::env::var("GRPC_METRICS_HANDLING_HISTOGRAM")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(false);

        let shared_scope = std::env::var("GRPC_METRICS_SHARED_SCOPE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(false);

        let histogram_buckets = std::env::var("GRPC_METRICS_HISTOGRAM_BUCKETS")
            .ok()
            .and_then(|v| match parse_buckets(&v) {
                Ok(buckets) => Some(buckets),
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring GRPC_METRICS_HISTOGRAM_BUCKETS");
                    None
                }
            })
            .unwrap_or_else(|| prometheus::DEFAULT_BUCKETS.to_vec());

        Self {
            handling_time_histogram,
            shared_scope,
            histogram_buckets,
        }
    }

    pub fn with_handling_time_histogram(mut self, enabled: bool) -> Self {
        self.handling_time_histogram = enabled;
        self
    }

    pub fn with_shared_scope(mut self, enabled: bool) -> Self {
        self.shared_scope = enabled;
        self
    }

    pub fn with_histogram_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.histogram_buckets = buckets;
        self
    }

    /// Check that the histogram buckets are usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_buckets(&self.histogram_buckets)
    }
}

fn parse_buckets(raw: &str) -> Result<Vec<f64>, ConfigError> {
    let buckets = raw
        .split(',')
        .map(|b| {
            b.trim()
                .parse::<f64>()
                .map_err(|e| ConfigError::InvalidBuckets(format!("{b:?}: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    check_buckets(&buckets)?;
    Ok(buckets)
}

pub(crate) fn check_buckets(buckets: &[f64]) -> Result<(), ConfigError> {
    if buckets.is_empty() {
        return Err(ConfigError::InvalidBuckets("no buckets".to_string()));
    }
    if buckets.iter().any(|b| !b.is_finite()) {
        return Err(ConfigError::InvalidBuckets(
            "bounds must be finite".to_string(),
        ));
    }
    if buckets.windows(2).any(|w| w[0] >= w[1]) {
        return Err(ConfigError::InvalidBuckets(
            "bounds must be strictly increasing".to_string(),
        ));
    }
    Ok(())
}
