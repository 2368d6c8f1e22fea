//! Client-side call instrumentation

use crate::config::MetricsConfig;
use crate::labels::{derive_labels, MethodDescriptor};
use crate::metrics::{outcome, CallGuard, GrpcMetrics, CLIENT_FAMILIES};
use crate::registry::MetricsSet;
use crate::stream::{MessageStream, MeteredClientStream};
use std::future::Future;
use std::io;
use std::sync::Arc;
use tonic::Status;

/// Measurement scope for `grpc_client_*` metrics
#[derive(Clone)]
pub struct ClientMetrics {
    inner: Arc<GrpcMetrics>,
}

impl ClientMetrics {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            inner: Arc::new(GrpcMetrics::new(&CLIENT_FAMILIES, config)),
        }
    }

    /// Record into an explicitly shared scope
    pub fn with_set(set: Arc<MetricsSet>, config: MetricsConfig) -> Self {
        Self {
            inner: Arc::new(GrpcMetrics::with_set(&CLIENT_FAMILIES, set, config)),
        }
    }

    /// Create every client metric for the given methods at zero
    pub fn initialize<'a>(&self, descriptors: impl IntoIterator<Item = &'a MethodDescriptor>) {
        self.inner.initialize(descriptors);
    }

    pub fn set(&self) -> &Arc<MetricsSet> {
        self.inner.set()
    }

    pub fn encode(&self) -> String {
        self.inner.encode()
    }

    pub fn write_text<W: io::Write>(&self, w: &mut W) -> io::Result<()> {
        self.inner.set().write_text(w)
    }
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

/// Wraps unary invocations
#[derive(Clone)]
pub struct UnaryClientInterceptor {
    metrics: ClientMetrics,
}

pub fn unary_client_interceptor(metrics: &ClientMetrics) -> UnaryClientInterceptor {
    UnaryClientInterceptor {
        metrics: metrics.clone(),
    }
}

impl UnaryClientInterceptor {
    /// Run `invoker`, recording the call under `full_method`.
    ///
    /// # Panics
    ///
    /// If `full_method` is not of the form `/service/method`.
    pub async fn intercept<T, I, Fut>(&self, full_method: &str, invoker: I) -> Result<T, Status>
    where
        I: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        let labels = derive_labels(full_method, false, false).unwrap_or_else(|e| e.fatal());
        let guard = CallGuard::begin(&self.metrics.inner, labels);

        let result = invoker().await;

        guard.complete(outcome(&result));
        result
    }
}

/// Wraps stream establishment
#[derive(Clone)]
pub struct StreamClientInterceptor {
    metrics: ClientMetrics,
}

pub fn stream_client_interceptor(metrics: &ClientMetrics) -> StreamClientInterceptor {
    StreamClientInterceptor {
        metrics: metrics.clone(),
    }
}

impl StreamClientInterceptor {
    /// Open a stream through `streamer` and return a metered view of it.
    ///
    /// If the stream cannot be established the call is recorded as handled
    /// with the error's code. Otherwise the returned stream records the
    /// outcome when its receive half terminates.
    ///
    /// # Panics
    ///
    /// If the descriptor's method is not of the form `/service/method`.
    pub async fn intercept<S, F, Fut>(
        &self,
        descriptor: &MethodDescriptor,
        streamer: F,
    ) -> Result<MeteredClientStream<S>, Status>
    where
        S: MessageStream,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<S, Status>>,
    {
        let metrics = &self.metrics.inner;
        let labels = descriptor.labels().unwrap_or_else(|e| e.fatal());
        let handling = metrics.handling(&labels);
        let guard = CallGuard::begin(metrics, labels);

        match streamer().await {
            Ok(stream) => {
                let started = guard.hand_off();
                Ok(MeteredClientStream::new(
                    stream,
                    Arc::clone(metrics),
                    descriptor.clone(),
                    handling,
                    started,
                ))
            }
            Err(status) => {
                metrics.handled(&labels, status.code()).inc();
                guard.hand_off();
                Err(status)
            }
        }
    }
}
