//! Metric family definitions and the role-independent call bookkeeping
//!
//! Tracks started/handled calls, sent/received messages and handling time
//! per `grpc_type`, `grpc_service`, `grpc_method` and `grpc_code`.

use crate::config::MetricsConfig;
use crate::labels::{CallType, MethodDescriptor, MethodLabels, ALL_CODES};
use crate::registry::{Counter, Histogram, MetricsSet};
use lazy_static::lazy_static;
use std::sync::Arc;
use std::time::Instant;
use tonic::Code;

lazy_static! {
    /// Process-wide measurement scope, attached to the default Prometheus registry
    pub(crate) static ref SHARED_SET: Arc<MetricsSet> = Arc::new(MetricsSet::with_registry(
        prometheus::default_registry().clone()
    ));
}

/// A metric family name and its help text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Family {
    pub name: &'static str,
    pub help: &'static str,
}

/// The five families recorded for one role
#[derive(Debug)]
pub struct Families {
    pub started: Family,
    pub handled: Family,
    pub msg_sent: Family,
    pub msg_received: Family,
    pub handling: Family,
}

pub static SERVER_FAMILIES: Families = Families {
    started: Family {
        name: "grpc_server_started_total",
        help: "Total number of RPCs started on the server.",
    },
    handled: Family {
        name: "grpc_server_handled_total",
        help: "Total number of RPCs completed on the server, regardless of success or failure.",
    },
    msg_sent: Family {
        name: "grpc_server_msg_sent_total",
        help: "Total number of gRPC stream messages sent by the server.",
    },
    msg_received: Family {
        name: "grpc_server_msg_received_total",
        help: "Total number of RPC stream messages received on the server.",
    },
    handling: Family {
        name: "grpc_server_handling_seconds",
        help: "Histogram of response latency (seconds) of gRPC that had been application-level handled by the server.",
    },
};

pub static CLIENT_FAMILIES: Families = Families {
    started: Family {
        name: "grpc_client_started_total",
        help: "Total number of RPCs started on the client.",
    },
    handled: Family {
        name: "grpc_client_handled_total",
        help: "Total number of RPCs completed by the client, regardless of success or failure.",
    },
    msg_sent: Family {
        name: "grpc_client_msg_sent_total",
        help: "Total number of gRPC stream messages sent by the client.",
    },
    msg_received: Family {
        name: "grpc_client_msg_received_total",
        help: "Total number of RPC stream messages received by the client.",
    },
    handling: Family {
        name: "grpc_client_handling_seconds",
        help: "Histogram of response latency (seconds) of the gRPC until it is finished by the application.",
    },
};

/// Call metrics for one role over one measurement scope
pub struct GrpcMetrics {
    set: Arc<MetricsSet>,
    families: &'static Families,
    handling_histogram: bool,
    buckets: Vec<f64>,
}

impl GrpcMetrics {
    pub(crate) fn new(families: &'static Families, config: MetricsConfig) -> Self {
        let set = if config.shared_scope {
            MetricsSet::shared()
        } else {
            Arc::new(MetricsSet::new())
        };
        Self::with_set(families, set, config)
    }

    pub(crate) fn with_set(
        families: &'static Families,
        set: Arc<MetricsSet>,
        config: MetricsConfig,
    ) -> Self {
        let buckets = match config.validate() {
            Ok(()) => config.histogram_buckets,
            Err(e) => {
                tracing::warn!(error = %e, "falling back to default handling-time buckets");
                prometheus::DEFAULT_BUCKETS.to_vec()
            }
        };

        Self {
            set,
            families,
            handling_histogram: config.handling_time_histogram,
            buckets,
        }
    }

    pub fn set(&self) -> &Arc<MetricsSet> {
        &self.set
    }

    pub fn families(&self) -> &'static Families {
        self.families
    }

    pub fn handling_histogram_enabled(&self) -> bool {
        self.handling_histogram
    }

    pub(crate) fn counter(
        &self,
        family: &Family,
        labels: &MethodLabels<'_>,
        code: Option<Code>,
    ) -> Arc<Counter> {
        self.set.counter(family, labels, code)
    }

    pub(crate) fn started(&self, labels: &MethodLabels<'_>) -> Arc<Counter> {
        self.counter(&self.families.started, labels, None)
    }

    pub(crate) fn handled(&self, labels: &MethodLabels<'_>, code: Code) -> Arc<Counter> {
        self.counter(&self.families.handled, labels, Some(code))
    }

    pub(crate) fn msg_sent(&self, labels: &MethodLabels<'_>) -> Arc<Counter> {
        self.counter(&self.families.msg_sent, labels, None)
    }

    pub(crate) fn msg_received(&self, labels: &MethodLabels<'_>) -> Arc<Counter> {
        self.counter(&self.families.msg_received, labels, None)
    }

    /// Duration histogram, or `None` when handling time is not measured
    pub(crate) fn handling(&self, labels: &MethodLabels<'_>) -> Option<Arc<Histogram>> {
        self.handling_histogram
            .then(|| self.set.histogram(&self.families.handling, labels, &self.buckets))
    }

    /// Read the clock only when the histogram needs it
    pub(crate) fn start_clock(&self) -> Option<Instant> {
        self.handling_histogram.then(Instant::now)
    }

    /// Bookkeeping at call entry
    pub(crate) fn record_start(&self, labels: &MethodLabels<'_>) -> Option<Instant> {
        let started = self.start_clock();
        self.started(labels).inc();
        if labels.call_type == CallType::Unary {
            self.msg_received(labels).inc();
        }
        started
    }

    /// Terminal bookkeeping once the outcome code is known
    pub(crate) fn record_finish(
        &self,
        labels: &MethodLabels<'_>,
        code: Code,
        started: Option<Instant>,
    ) {
        self.handled(labels, code).inc();
        if code == Code::Ok && labels.call_type == CallType::Unary {
            self.msg_sent(labels).inc();
        }
        if let (Some(histogram), Some(started)) = (self.handling(labels), started) {
            histogram.observe_since(started);
        }
    }

    /// Create every metric the given methods can produce, at zero
    pub fn initialize<'a>(&self, descriptors: impl IntoIterator<Item = &'a MethodDescriptor>) {
        let mut methods = 0usize;
        for descriptor in descriptors {
            let labels = descriptor.labels().unwrap_or_else(|e| e.fatal());
            self.started(&labels);
            self.msg_sent(&labels);
            self.msg_received(&labels);
            for code in ALL_CODES {
                self.handled(&labels, code);
            }
            self.handling(&labels);
            methods += 1;
        }
        tracing::debug!(
            family = self.families.started.name,
            methods,
            "pre-registered gRPC metrics"
        );
    }

    pub fn encode(&self) -> String {
        self.set.encode()
    }
}

/// In-flight state of one unary or server-side call.
///
/// Dropping the guard before [`CallGuard::complete`] means the call future
/// was abandoned, which is recorded as `CANCELLED`. Unwinding records nothing.
pub(crate) struct CallGuard<'a> {
    metrics: &'a GrpcMetrics,
    labels: MethodLabels<'a>,
    started: Option<Instant>,
    done: bool,
}

impl<'a> CallGuard<'a> {
    pub(crate) fn begin(metrics: &'a GrpcMetrics, labels: MethodLabels<'a>) -> Self {
        let started = metrics.record_start(&labels);
        Self {
            metrics,
            labels,
            started,
            done: false,
        }
    }

    pub(crate) fn complete(mut self, code: Code) {
        self.done = true;
        self.metrics.record_finish(&self.labels, code, self.started);
    }

    /// Hand terminal bookkeeping to someone else, e.g. a client stream
    pub(crate) fn hand_off(mut self) -> Option<Instant> {
        self.done = true;
        self.started
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.done && !std::thread::panicking() {
            tracing::debug!(
                service = self.labels.service,
                method = self.labels.method,
                "gRPC call dropped before completion"
            );
            self.metrics
                .record_finish(&self.labels, Code::Cancelled, self.started);
        }
    }
}

/// Outcome code of a finished call
pub(crate) fn outcome<T>(result: &Result<T, tonic::Status>) -> Code {
    match result {
        Ok(_) => Code::Ok,
        Err(status) => status.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::derive_labels;

    fn metrics(handling_time_histogram: bool) -> GrpcMetrics {
        GrpcMetrics::new(
            &SERVER_FAMILIES,
            MetricsConfig {
                handling_time_histogram,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_families_are_prefixed_per_role() {
        assert!(SERVER_FAMILIES.handled.name.starts_with("grpc_server_"));
        assert!(CLIENT_FAMILIES.handled.name.starts_with("grpc_client_"));
        assert_eq!(CLIENT_FAMILIES.handling.name, "grpc_client_handling_seconds");
    }

    #[test]
    fn test_start_clock_only_when_enabled() {
        assert!(metrics(false).start_clock().is_none());
        assert!(metrics(true).start_clock().is_some());
    }

    #[test]
    fn test_unary_bookkeeping() {
        let m = metrics(true);
        let labels = derive_labels("/pkg.Health/Check", false, false).unwrap();

        let started = m.record_start(&labels);
        m.record_finish(&labels, Code::Ok, started);

        assert_eq!(m.started(&labels).get(), 1);
        assert_eq!(m.msg_received(&labels).get(), 1);
        assert_eq!(m.msg_sent(&labels).get(), 1);
        assert_eq!(m.handled(&labels, Code::Ok).get(), 1);
        assert_eq!(m.handling(&labels).unwrap().sample_count(), 1);
    }

    #[test]
    fn test_failed_unary_sends_nothing() {
        let m = metrics(false);
        let labels = derive_labels("/pkg.Health/Check", false, false).unwrap();

        let started = m.record_start(&labels);
        m.record_finish(&labels, Code::Internal, started);

        assert_eq!(m.msg_sent(&labels).get(), 0);
        assert_eq!(m.handled(&labels, Code::Internal).get(), 1);
        assert!(m.handling(&labels).is_none());
    }

    #[test]
    fn test_streaming_start_skips_message_counters() {
        let m = metrics(false);
        let labels = derive_labels("/pkg.Health/Watch", true, false).unwrap();

        let started = m.record_start(&labels);
        m.record_finish(&labels, Code::Ok, started);

        assert_eq!(m.started(&labels).get(), 1);
        assert_eq!(m.msg_received(&labels).get(), 0);
        assert_eq!(m.msg_sent(&labels).get(), 0);
    }

    #[test]
    fn test_dropped_guard_records_cancelled() {
        let m = metrics(false);
        let labels = derive_labels("/pkg.Health/Check", false, false).unwrap();

        drop(CallGuard::begin(&m, labels));

        assert_eq!(m.handled(&labels, Code::Cancelled).get(), 1);
        assert_eq!(m.handled(&labels, Code::Ok).get(), 0);
    }

    #[test]
    fn test_hand_off_skips_terminal_bookkeeping() {
        let m = metrics(true);
        let labels = derive_labels("/pkg.Health/Watch", true, false).unwrap();

        let started = CallGuard::begin(&m, labels).hand_off();

        assert!(started.is_some());
        assert_eq!(m.handled(&labels, Code::Cancelled).get(), 0);
    }

    #[test]
    fn test_invalid_buckets_fall_back_to_defaults() {
        let m = GrpcMetrics::new(
            &SERVER_FAMILIES,
            MetricsConfig {
                handling_time_histogram: true,
                histogram_buckets: vec![1.0, 0.5],
                ..Default::default()
            },
        );
        assert_eq!(m.buckets, prometheus::DEFAULT_BUCKETS.to_vec());
    }
}
