//! Error types for gRPC metrics

use thiserror::Error;

/// A full method name that does not have the `/service/method` shape.
///
/// This is a defect in the surrounding call framework rather than bad input,
/// so it is never recorded as a metric sample. Call sites that cannot recover
/// hand it to [`MalformedMethod::fatal`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed full method: {0:?}")]
#[must_use = "a malformed method must be handled as a fatal defect"]
pub struct MalformedMethod(pub String);

impl MalformedMethod {
    pub fn new(full_method: impl Into<String>) -> Self {
        Self(full_method.into())
    }

    /// The offending method string
    pub fn full_method(&self) -> &str {
        &self.0
    }

    /// Log the violation and abort the current call path.
    pub fn fatal(self) -> ! {
        tracing::error!(full_method = %self.0, "gRPC framework supplied a malformed full method");
        panic!("{self}")
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Histogram buckets must be non-empty and strictly increasing
    #[error("invalid histogram buckets: {0}")]
    InvalidBuckets(String),
}
