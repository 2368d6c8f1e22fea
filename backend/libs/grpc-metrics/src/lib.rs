//! gRPC Metrics - call and message instrumentation for clients and servers
//!
//! This library records Prometheus metrics around gRPC calls. For every
//! method it tracks:
//! - Calls started and calls handled, by outcome code
//! - Messages sent and received
//! - Handling time (optional histogram)
//!
//! Metrics live in a [`MetricsSet`] (one measurement scope), which hands out
//! exactly one counter or histogram per label combination and renders them
//! as Prometheus text.
//!
//! Usage:
//! ```ignore
//! use grpc_metrics::{unary_server_interceptor, MethodDescriptor, MetricsConfig, ServerMetrics};
//!
//! let metrics = ServerMetrics::new(MetricsConfig::from_env());
//! metrics.initialize(&[MethodDescriptor::unary("/grpc.health.v1.Health/Check")]);
//!
//! let interceptor = unary_server_interceptor(&metrics);
//! let reply = interceptor
//!     .intercept("/grpc.health.v1.Health/Check", request, |req| handler.check(req))
//!     .await?;
//!
//! // Serve `metrics.encode()` from the scrape endpoint
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod labels;
pub mod layer;
mod metrics;
pub mod registry;
pub mod server;
pub mod stream;

pub use client::{
    stream_client_interceptor, unary_client_interceptor, ClientMetrics, StreamClientInterceptor,
    UnaryClientInterceptor,
};
pub use config::MetricsConfig;
pub use error::{ConfigError, MalformedMethod};
pub use labels::{code_name, derive_labels, CallType, MethodDescriptor, MethodLabels, ALL_CODES};
pub use layer::{GrpcMetricsBody, GrpcMetricsFuture, GrpcMetricsLayer, GrpcMetricsService};
pub use metrics::{Families, Family, GrpcMetrics, CLIENT_FAMILIES, SERVER_FAMILIES};
pub use registry::{Counter, Histogram, MetricsSet};
pub use server::{
    stream_server_interceptor, unary_server_interceptor, ServerMetrics, StreamServerInterceptor,
    UnaryServerInterceptor,
};
pub use stream::{ChannelStream, MessageStream, MeteredClientStream, MeteredServerStream};
