//! Metric identity registry
//!
//! A [`MetricsSet`] is one measurement scope. It hands out a single
//! long-lived counter or histogram per `(family, call type, service, method,
//! code)` identity and renders all of them as Prometheus text.
//!
//! Lookups take the shared lock and walk the nested map by borrowed keys, so
//! the steady state neither allocates nor writes. A miss drops the shared
//! lock, takes the exclusive one and walks again with the entry API; the
//! second walk re-checks every level because another thread may have created
//! the identity in between.

use crate::config::check_buckets;
use crate::labels::{code_name, CallType, MethodLabels};
use crate::metrics::Family;
use parking_lot::RwLock;
use prometheus::core::Metric as _;
use prometheus::{HistogramOpts, IntCounter, Opts, Registry};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tonic::Code;

/// Counter instance for one metric identity
pub struct Counter {
    name: String,
    inner: IntCounter,
}

impl Counter {
    /// Full label-encoded name, e.g. `grpc_server_started_total{grpc_type="unary",...}`
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inc(&self) {
        self.inner.inc();
    }

    pub fn get(&self) -> u64 {
        self.inner.get()
    }
}

/// Duration histogram for one metric identity
pub struct Histogram {
    name: String,
    family: &'static str,
    labels: String,
    inner: prometheus::Histogram,
}

impl Histogram {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn observe(&self, seconds: f64) {
        self.inner.observe(seconds);
    }

    /// Record the time elapsed since `started`
    pub fn observe_since(&self, started: Instant) {
        self.inner.observe(started.elapsed().as_secs_f64());
    }

    pub fn sample_count(&self) -> u64 {
        self.inner.get_sample_count()
    }

    pub fn sample_sum(&self) -> f64 {
        self.inner.get_sample_sum()
    }

    fn render(&self, out: &mut String) {
        let proto = self.inner.metric();
        let histogram = proto.get_histogram();
        for bucket in histogram.get_bucket() {
            let _ = writeln!(
                out,
                r#"{}_bucket{{{},le="{}"}} {}"#,
                self.family,
                self.labels,
                bucket.get_upper_bound(),
                bucket.get_cumulative_count()
            );
        }
        let count = histogram.get_sample_count();
        let _ = writeln!(
            out,
            r#"{}_bucket{{{},le="+Inf"}} {}"#,
            self.family, self.labels, count
        );
        let _ = writeln!(
            out,
            "{}_sum{{{}}} {}",
            self.family,
            self.labels,
            histogram.get_sample_sum()
        );
        let _ = writeln!(out, "{}_count{{{}}} {}", self.family, self.labels, count);
    }
}

/// `None` marks an identity without a `grpc_code` label
type CodeSlot = Option<i32>;

type Leaves<T> = HashMap<(CallType, CodeSlot), Arc<T>>;

/// family -> service -> method -> (call type, code) -> instance
struct Tree<T> {
    families: HashMap<&'static str, HashMap<String, HashMap<String, Leaves<T>>>>,
}

impl<T> Default for Tree<T> {
    fn default() -> Self {
        Self {
            families: HashMap::new(),
        }
    }
}

impl<T> Tree<T> {
    fn find(&self, family: &str, labels: &MethodLabels<'_>, code: CodeSlot) -> Option<&Arc<T>> {
        self.families
            .get(family)?
            .get(labels.service)?
            .get(labels.method)?
            .get(&(labels.call_type, code))
    }

    fn get_or_insert_with(
        &mut self,
        family: &'static str,
        labels: &MethodLabels<'_>,
        code: CodeSlot,
        make: impl FnOnce() -> T,
    ) -> Arc<T> {
        let leaf = self
            .families
            .entry(family)
            .or_default()
            .entry(labels.service.to_owned())
            .or_default()
            .entry(labels.method.to_owned())
            .or_default()
            .entry((labels.call_type, code))
            .or_insert_with(|| Arc::new(make()));
        Arc::clone(leaf)
    }

    fn leaves(&self) -> impl Iterator<Item = &Arc<T>> {
        self.families
            .values()
            .flat_map(|services| services.values())
            .flat_map(|methods| methods.values())
            .flat_map(|leaves| leaves.values())
    }
}

#[derive(Default)]
struct Instances {
    counters: Tree<Counter>,
    histograms: Tree<Histogram>,
}

/// One measurement scope: owns every counter and histogram it has created
#[derive(Default)]
pub struct MetricsSet {
    instances: RwLock<Instances>,
    registry: Option<Registry>,
}

impl MetricsSet {
    /// Create an isolated scope
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a scope that also registers every instance with `registry`
    pub fn with_registry(registry: Registry) -> Self {
        Self {
            instances: RwLock::default(),
            registry: Some(registry),
        }
    }

    /// Process-wide scope attached to `prometheus::default_registry()`
    pub fn shared() -> Arc<Self> {
        Arc::clone(&crate::metrics::SHARED_SET)
    }

    pub fn registry(&self) -> Option<&Registry> {
        self.registry.as_ref()
    }

    /// Get or create the counter for `(family, labels, code)`.
    ///
    /// Repeated calls with the same identity return the same instance.
    pub fn counter(
        &self,
        family: &Family,
        labels: &MethodLabels<'_>,
        code: Option<Code>,
    ) -> Arc<Counter> {
        let slot = code.map(|c| c as i32);

        if let Some(counter) = self.instances.read().counters.find(family.name, labels, slot) {
            return Arc::clone(counter);
        }

        let mut instances = self.instances.write();
        instances
            .counters
            .get_or_insert_with(family.name, labels, slot, || {
                self.new_counter(family, labels, code)
            })
    }

    /// Get or create the duration histogram for `(family, labels)`.
    ///
    /// `buckets` only applies when the histogram is created by this call.
    /// Unusable buckets are replaced by `prometheus::DEFAULT_BUCKETS`.
    pub fn histogram(
        &self,
        family: &Family,
        labels: &MethodLabels<'_>,
        buckets: &[f64],
    ) -> Arc<Histogram> {
        if let Some(histogram) = self.instances.read().histograms.find(family.name, labels, None) {
            return Arc::clone(histogram);
        }

        let mut instances = self.instances.write();
        instances
            .histograms
            .get_or_insert_with(family.name, labels, None, || {
                self.new_histogram(family, labels, buckets)
            })
    }

    /// Number of live counters and histograms
    pub fn len(&self) -> usize {
        let instances = self.instances.read();
        instances.counters.leaves().count() + instances.histograms.leaves().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Render every live metric as Prometheus text, sorted by name
    pub fn encode(&self) -> String {
        let (mut counters, mut histograms) = {
            let instances = self.instances.read();
            (
                instances.counters.leaves().cloned().collect::<Vec<_>>(),
                instances.histograms.leaves().cloned().collect::<Vec<_>>(),
            )
        };
        counters.sort_by(|a, b| a.name.cmp(&b.name));
        histograms.sort_by(|a, b| a.name.cmp(&b.name));

        let mut out = String::new();
        let mut counters = counters.into_iter().peekable();
        let mut histograms = histograms.into_iter().peekable();
        loop {
            let take_counter = match (counters.peek(), histograms.peek()) {
                (Some(c), Some(h)) => c.name <= h.name,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            if take_counter {
                if let Some(counter) = counters.next() {
                    let _ = writeln!(out, "{} {}", counter.name, counter.get());
                }
            } else if let Some(histogram) = histograms.next() {
                histogram.render(&mut out);
            }
        }
        out
    }

    /// Write the text exposition to `w`
    pub fn write_text<W: io::Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(self.encode().as_bytes())
    }

    fn new_counter(&self, family: &Family, labels: &MethodLabels<'_>, code: Option<Code>) -> Counter {
        let mut opts = Opts::new(family.name, family.help)
            .const_label("grpc_type", labels.call_type.as_str())
            .const_label("grpc_service", labels.service)
            .const_label("grpc_method", labels.method);
        if let Some(code) = code {
            opts = opts.const_label("grpc_code", code_name(code));
        }
        let inner = IntCounter::with_opts(opts).expect("grpc counter options are statically valid");
        let name = format!("{}{{{}}}", family.name, labels.encode(code));

        tracing::debug!(metric = %name, "created gRPC counter");
        self.register(&name, Box::new(inner.clone()));

        Counter { name, inner }
    }

    fn new_histogram(&self, family: &Family, labels: &MethodLabels<'_>, buckets: &[f64]) -> Histogram {
        let opts = HistogramOpts::new(family.name, family.help)
            .const_label("grpc_type", labels.call_type.as_str())
            .const_label("grpc_service", labels.service)
            .const_label("grpc_method", labels.method)
            .buckets(match check_buckets(buckets) {
                Ok(()) => buckets.to_vec(),
                Err(e) => {
                    tracing::warn!(family = family.name, error = %e, "falling back to default histogram buckets");
                    prometheus::DEFAULT_BUCKETS.to_vec()
                }
            });
        let inner = prometheus::Histogram::with_opts(opts)
            .expect("grpc histogram options are valid once buckets are checked");
        let encoded = labels.encode(None);
        let name = format!("{}{{{}}}", family.name, encoded);

        tracing::debug!(metric = %name, "created gRPC histogram");
        self.register(&name, Box::new(inner.clone()));

        Histogram {
            name,
            family: family.name,
            labels: encoded,
            inner,
        }
    }

    fn register(&self, name: &str, collector: Box<dyn prometheus::core::Collector>) {
        if let Some(registry) = &self.registry {
            if let Err(e) = registry.register(collector) {
                tracing::warn!(metric = %name, error = %e, "failed to register gRPC metric");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::derive_labels;
    use crate::metrics::SERVER_FAMILIES;

    fn check_labels() -> MethodLabels<'static> {
        derive_labels("/pkg.Health/Check", false, false).unwrap()
    }

    #[test]
    fn test_counter_is_idempotent() {
        let set = MetricsSet::new();
        let labels = check_labels();

        let first = set.counter(&SERVER_FAMILIES.started, &labels, None);
        let again = set.counter(&SERVER_FAMILIES.started, &labels, None);
        assert!(Arc::ptr_eq(&first, &again));

        first.inc();
        assert_eq!(again.get(), 1);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_histogram_is_idempotent() {
        let set = MetricsSet::new();
        let labels = check_labels();

        let first = set.histogram(&SERVER_FAMILIES.handling, &labels, &[0.1, 1.0]);
        let again = set.histogram(&SERVER_FAMILIES.handling, &labels, &[5.0]);
        assert!(Arc::ptr_eq(&first, &again));

        first.observe(0.5);
        assert_eq!(again.sample_count(), 1);
        assert_eq!(set.len(), 1);
        // Buckets of the first call win
        assert!(set.encode().contains(r#"le="0.1"} 0"#));
    }

    #[test]
    fn test_histogram_falls_back_on_unusable_buckets() {
        let set = MetricsSet::new();
        let labels = check_labels();

        let histogram = set.histogram(&SERVER_FAMILIES.handling, &labels, &[1.0, 0.5]);
        histogram.observe(0.2);

        let text = set.encode();
        assert!(text.contains(r#"grpc_method="Check",le="0.005"} 0"#), "{text}");
        assert!(text.contains(r#"grpc_method="Check",le="0.25"} 1"#), "{text}");
        assert_eq!(histogram.sample_count(), 1);
    }

    #[test]
    fn test_distinct_identities_get_distinct_instances() {
        let set = MetricsSet::new();
        let labels = check_labels();
        let streaming = derive_labels("/pkg.Health/Check", true, false).unwrap();

        let ok = set.counter(&SERVER_FAMILIES.handled, &labels, Some(Code::Ok));
        let not_found = set.counter(&SERVER_FAMILIES.handled, &labels, Some(Code::NotFound));
        let other_type = set.counter(&SERVER_FAMILIES.handled, &streaming, Some(Code::Ok));
        let no_code = set.counter(&SERVER_FAMILIES.handled, &labels, None);

        assert!(!Arc::ptr_eq(&ok, &not_found));
        assert!(!Arc::ptr_eq(&ok, &other_type));
        assert!(!Arc::ptr_eq(&ok, &no_code));
        assert_eq!(set.len(), 4);
    }

    #[test]
    fn test_concurrent_creation_yields_one_instance() {
        let registry = Registry::new();
        let set = MetricsSet::with_registry(registry.clone());
        let labels = check_labels();

        let counters: Vec<Arc<Counter>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..32)
                .map(|_| {
                    s.spawn(|| {
                        let counter = set.counter(&SERVER_FAMILIES.started, &labels, None);
                        counter.inc();
                        counter
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(set.len(), 1);
        assert!(counters.iter().all(|c| Arc::ptr_eq(c, &counters[0])));
        assert_eq!(counters[0].get(), 32);

        let families = registry.gather();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].get_metric().len(), 1);
    }

    #[test]
    fn test_concurrent_histogram_creation_yields_one_instance() {
        let registry = Registry::new();
        let set = MetricsSet::with_registry(registry.clone());
        let labels = check_labels();

        let histograms: Vec<Arc<Histogram>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..32)
                .map(|_| {
                    s.spawn(|| {
                        let histogram =
                            set.histogram(&SERVER_FAMILIES.handling, &labels, prometheus::DEFAULT_BUCKETS);
                        histogram.observe(0.01);
                        histogram
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(set.len(), 1);
        assert!(histograms.iter().all(|h| Arc::ptr_eq(h, &histograms[0])));
        assert_eq!(histograms[0].sample_count(), 32);

        let families = registry.gather();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].get_metric().len(), 1);
    }

    #[test]
    fn test_encode_counter_lines() {
        let set = MetricsSet::new();
        let labels = check_labels();

        set.counter(&SERVER_FAMILIES.started, &labels, None).inc();
        set.counter(&SERVER_FAMILIES.handled, &labels, Some(Code::Ok));

        assert_eq!(
            set.encode(),
            concat!(
                r#"grpc_server_handled_total{grpc_type="unary",grpc_service="/pkg.Health",grpc_method="Check",grpc_code="OK"} 0"#,
                "\n",
                r#"grpc_server_started_total{grpc_type="unary",grpc_service="/pkg.Health",grpc_method="Check"} 1"#,
                "\n",
            )
        );
    }

    #[test]
    fn test_encode_histogram_lines() {
        let set = MetricsSet::new();
        let labels = check_labels();

        let histogram = set.histogram(&SERVER_FAMILIES.handling, &labels, &[0.1, 1.0]);
        histogram.observe(0.5);
        assert_eq!(histogram.sample_count(), 1);

        let labels = r#"grpc_type="unary",grpc_service="/pkg.Health",grpc_method="Check""#;
        let expected = format!(
            "grpc_server_handling_seconds_bucket{{{labels},le=\"0.1\"}} 0\n\
             grpc_server_handling_seconds_bucket{{{labels},le=\"1\"}} 1\n\
             grpc_server_handling_seconds_bucket{{{labels},le=\"+Inf\"}} 1\n\
             grpc_server_handling_seconds_sum{{{labels}}} 0.5\n\
             grpc_server_handling_seconds_count{{{labels}}} 1\n"
        );
        assert_eq!(set.encode(), expected);
    }

    #[test]
    fn test_write_text_matches_encode() {
        let set = MetricsSet::new();
        set.counter(&SERVER_FAMILIES.msg_sent, &check_labels(), None);

        let mut buf = Vec::new();
        set.write_text(&mut buf).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), set.encode());
    }

    #[test]
    fn test_unattached_set_has_no_registry() {
        let set = MetricsSet::new();
        assert!(set.registry().is_none());
        assert!(set.is_empty());
    }
}
