//! Server-side call instrumentation

use crate::config::MetricsConfig;
use crate::labels::{derive_labels, MethodDescriptor};
use crate::metrics::{outcome, CallGuard, GrpcMetrics, SERVER_FAMILIES};
use crate::registry::MetricsSet;
use crate::stream::{MessageStream, MeteredServerStream};
use std::future::Future;
use std::io;
use std::sync::Arc;
use tonic::Status;

/// Measurement scope for `grpc_server_*` metrics
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<GrpcMetrics>,
}

impl ServerMetrics {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            inner: Arc::new(GrpcMetrics::new(&SERVER_FAMILIES, config)),
        }
    }

    /// Record into an explicitly shared scope
    pub fn with_set(set: Arc<MetricsSet>, config: MetricsConfig) -> Self {
        Self {
            inner: Arc::new(GrpcMetrics::with_set(&SERVER_FAMILIES, set, config)),
        }
    }

    /// Create every server metric for the given methods at zero, so the
    /// first scrape already lists them.
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

    pub(crate) fn core(&self) -> &Arc<GrpcMetrics> {
        &self.inner
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

/// Wraps unary handlers
#[derive(Clone)]
pub struct UnaryServerInterceptor {
    metrics: ServerMetrics,
}

pub fn unary_server_interceptor(metrics: &ServerMetrics) -> UnaryServerInterceptor {
    UnaryServerInterceptor {
        metrics: metrics.clone(),
    }
}

impl UnaryServerInterceptor {
    /// Run `handler` on `request`, recording the call under `full_method`.
    ///
    /// The handler's result is returned unchanged.
    ///
    /// # Panics
    ///
    /// If `full_method` is not of the form `/service/method`.
    pub async fn intercept<Req, Resp, H, Fut>(
        &self,
        full_method: &str,
        request: Req,
        handler: H,
    ) -> Result<Resp, Status>
    where
        H: FnOnce(Req) -> Fut,
        Fut: Future<Output = Result<Resp, Status>>,
    {
        let labels = derive_labels(full_method, false, false).unwrap_or_else(|e| e.fatal());
        let guard = CallGuard::begin(&self.metrics.inner, labels);

        let result = handler(request).await;

        guard.complete(outcome(&result));
        result
    }
}

/// Wraps streaming handlers
#[derive(Clone)]
pub struct StreamServerInterceptor {
    metrics: ServerMetrics,
}

pub fn stream_server_interceptor(metrics: &ServerMetrics) -> StreamServerInterceptor {
    StreamServerInterceptor {
        metrics: metrics.clone(),
    }
}

impl StreamServerInterceptor {
    /// Run `handler` over a metered view of `stream`.
    ///
    /// The handler future spans the whole stream, so the call is recorded as
    /// handled when it returns.
    ///
    /// # Panics
    ///
    /// If the descriptor's method is not of the form `/service/method`.
    pub async fn intercept<S, T, H, Fut>(
        &self,
        descriptor: &MethodDescriptor,
        stream: S,
        handler: H,
    ) -> Result<T, Status>
    where
        S: MessageStream,
        H: FnOnce(MeteredServerStream<S>) -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        let metrics = &self.metrics.inner;
        let labels = descriptor.labels().unwrap_or_else(|e| e.fatal());
        let guard = CallGuard::begin(metrics, labels);

        let stream = MeteredServerStream::new(
            stream,
            metrics.msg_sent(&labels),
            metrics.msg_received(&labels),
        );
        let result = handler(stream).await;

        guard.complete(outcome(&result));
        result
    }
}
