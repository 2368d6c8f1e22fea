//! Tower layer recording server call metrics at the HTTP level
//!
//! The layer sees one HTTP request per call, so it records `started`,
//! `handled` and handling time (plus `msg_received`/`msg_sent` for unary
//! methods). Only methods registered through
//! [`GrpcMetricsLayer::with_methods`] are measured, since the call type
//! cannot be read off the wire. Per-message counts of streaming calls need
//! the stream interceptors.
//!
//! The outcome is taken from `grpc-status`: from the response headers for
//! trailers-only responses, otherwise from the trailers at the end of the
//! response body. A response body dropped before its trailers counts as
//! `CANCELLED`.

use crate::labels::{derive_labels, CallType, MethodDescriptor};
use crate::metrics::GrpcMetrics;
use crate::server::ServerMetrics;
use http_body::{Body, Frame, SizeHint};
use pin_project::pin_project;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Instant;
use tonic::codegen::http::{HeaderMap, Request, Response};
use tonic::Code;
use tower::{Layer, Service};

/// Layer for tonic servers
#[derive(Clone)]
pub struct GrpcMetricsLayer {
    metrics: ServerMetrics,
    methods: Arc<HashMap<String, CallType>>,
}

impl GrpcMetricsLayer {
    pub fn new(metrics: ServerMetrics) -> Self {
        Self {
            metrics,
            methods: Arc::new(HashMap::new()),
        }
    }

    /// Methods to measure, with their streaming shape
    pub fn with_methods<'a>(mut self, descriptors: impl IntoIterator<Item = &'a MethodDescriptor>) -> Self {
        self.methods = Arc::new(
            descriptors
                .into_iter()
                .map(|d| (d.full_method.clone(), d.call_type()))
                .collect(),
        );
        self
    }
}

impl<S> Layer<S> for GrpcMetricsLayer {
    type Service = GrpcMetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GrpcMetricsService {
            inner,
            metrics: Arc::clone(self.metrics.core()),
            methods: Arc::clone(&self.methods),
        }
    }
}

#[derive(Clone)]
pub struct GrpcMetricsService<S> {
    inner: S,
    metrics: Arc<GrpcMetrics>,
    methods: Arc<HashMap<String, CallType>>,
}

impl<S> GrpcMetricsService<S> {
    fn begin(&self, path: &str) -> Option<InFlight> {
        let Some(&call_type) = self.methods.get(path) else {
            tracing::warn!(path, "not recording metrics for unregistered method");
            return None;
        };

        match derive_labels(path, call_type.server_streams(), call_type.client_streams()) {
            Ok(labels) => Some(InFlight {
                started: self.metrics.record_start(&labels),
                metrics: Arc::clone(&self.metrics),
                descriptor: MethodDescriptor::new(
                    path,
                    call_type.server_streams(),
                    call_type.client_streams(),
                ),
                done: false,
            }),
            Err(e) => {
                tracing::warn!(error = %e, "not recording metrics for request");
                None
            }
        }
    }
}

impl<S, B, C> Service<Request<B>> for GrpcMetricsService<S>
where
    S: Service<Request<B>, Response = Response<C>>,
{
    type Response = Response<GrpcMetricsBody<C>>;
    type Error = S::Error;
    type Future = GrpcMetricsFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let call = self.begin(req.uri().path());

        GrpcMetricsFuture {
            inner: self.inner.call(req),
            call,
        }
    }
}

/// Metrics of one call between its request and its final status.
///
/// Dropped unfinished, it records `CANCELLED`.
struct InFlight {
    metrics: Arc<GrpcMetrics>,
    descriptor: MethodDescriptor,
    started: Option<Instant>,
    done: bool,
}

impl InFlight {
    fn finish(mut self, code: Code) {
        self.record(code);
    }

    fn record(&mut self, code: Code) {
        if self.done {
            return;
        }
        self.done = true;
        if let Ok(labels) = self.descriptor.labels() {
            self.metrics.record_finish(&labels, code, self.started);
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            self.record(Code::Cancelled);
        }
    }
}

fn grpc_status(headers: &HeaderMap) -> Option<Code> {
    headers
        .get("grpc-status")
        .map(|status| Code::from_bytes(status.as_bytes()))
}

#[pin_project]
pub struct GrpcMetricsFuture<F> {
    #[pin]
    inner: F,
    call: Option<InFlight>,
}

impl<F, C, E> Future for GrpcMetricsFuture<F>
where
    F: Future<Output = Result<Response<C>, E>>,
{
    type Output = Result<Response<GrpcMetricsBody<C>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let result = ready!(this.inner.poll(cx));
        let call = this.call.take();

        Poll::Ready(match result {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                // Trailers-only responses carry the status in the headers
                let call = match (call, grpc_status(&parts.headers)) {
                    (Some(call), Some(code)) => {
                        call.finish(code);
                        None
                    }
                    (call, _) => call,
                };
                Ok(Response::from_parts(parts, GrpcMetricsBody { inner: body, call }))
            }
            Err(e) => {
                if let Some(call) = call {
                    call.finish(Code::Unknown);
                }
                Err(e)
            }
        })
    }
}

/// Response body that records the call outcome from its trailers
#[pin_project]
pub struct GrpcMetricsBody<B> {
    #[pin]
    inner: B,
    call: Option<InFlight>,
}

impl<B> GrpcMetricsBody<B> {
    pub fn get_ref(&self) -> &B {
        &self.inner
    }
}

impl<B: Body> Body for GrpcMetricsBody<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let frame = ready!(this.inner.poll_frame(cx));

        let code = match &frame {
            Some(Ok(frame)) => frame
                .trailers_ref()
                .map(|trailers| grpc_status(trailers).unwrap_or(Code::Ok)),
            Some(Err(_)) => Some(Code::Unknown),
            None => Some(Code::Ok),
        };
        if let Some(code) = code {
            if let Some(call) = this.call.take() {
                call.finish(code);
            }
        }

        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
