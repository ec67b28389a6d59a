//! Metric registry backed by `prometheus-client`.
//!
//! Families are declared up front with [`MetricRegistry::describe`] and then
//! mutated through a [`RegistryWriter`]. The `prometheus-client` registry and
//! its families sit behind one `parking_lot::RwLock`. A writer holds the write
//! half for its whole lifetime, so a clear followed by a repopulate is never
//! observed half-done by [`MetricRegistry::render`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use parking_lot::{RwLock, RwLockWriteGuard};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::{Family, MetricConstructor};
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use thiserror::Error;
use tracing::trace;

use crate::mapping::{MetricKind, is_valid_metric_name};

/// Registry errors. All of them indicate a programming mistake in the
/// caller (wrong family name, wrong label count), not bad appliance data.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("Unknown metric family: {0}")]
    UnknownFamily(String),

    #[error("Metric {name} is a {actual}, not a {expected}")]
    KindMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Metric {name} expects {expected} label values, got {actual}")]
    LabelArity {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Counter {name} cannot be decreased (delta {delta})")]
    NegativeIncrement { name: String, delta: f64 },

    #[error("Metric {0} is already registered with a different description")]
    Conflict(String),

    #[error("Invalid metric name: {0}")]
    InvalidName(String),

    #[error("Histogram {0} needs strictly increasing, finite buckets")]
    InvalidBuckets(String),
}

/// Result type alias using [`RegistryError`].
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Static description of one metric family.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDesc {
    /// Full metric name. Counter names carry their `_total` suffix.
    pub name: String,
    /// HELP text.
    pub help: String,
    /// Metric type.
    pub kind: MetricKind,
    /// Ordered label names; label values are passed in the same order.
    pub label_names: Vec<String>,
    /// Histogram bucket upper bounds (ignored for other kinds).
    pub buckets: Vec<f64>,
}

impl MetricDesc {
    /// Describe a gauge or counter.
    pub fn new(
        name: impl Into<String>,
        help: impl Into<String>,
        kind: MetricKind,
        label_names: &[&str],
    ) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            kind,
            label_names: label_names.iter().map(|s| s.to_string()).collect(),
            buckets: Vec::new(),
        }
    }

    /// Describe a histogram.
    pub fn histogram(
        name: impl Into<String>,
        help: impl Into<String>,
        label_names: &[&str],
        buckets: &[f64],
    ) -> Self {
        Self {
            buckets: buckets.to_vec(),
            ..Self::new(name, help, MetricKind::Histogram, label_names)
        }
    }

    /// Name handed to the encoder, which appends `_total` to counters itself.
    fn exposition_name(&self) -> &str {
        match self.kind {
            MetricKind::Counter => self.name.strip_suffix("_total").unwrap_or(&self.name),
            _ => &self.name,
        }
    }
}

type Labels = Vec<(String, String)>;

/// Builds every histogram of a family with the family's buckets.
#[derive(Debug, Clone)]
struct Buckets(Arc<[f64]>);

impl MetricConstructor<Histogram> for Buckets {
    fn new_metric(&self) -> Histogram {
        Histogram::new(self.0.iter().copied())
    }
}

#[derive(Debug)]
enum Series {
    Gauge(Family<Labels, Gauge<f64, AtomicU64>>),
    Counter(Family<Labels, Counter<f64, AtomicU64>>),
    Histogram(Family<Labels, Histogram, Buckets>),
}

#[derive(Debug)]
struct Entry {
    desc: MetricDesc,
    series: Series,
    /// Label values of every series currently in the family.
    live: BTreeSet<Vec<String>>,
}

impl Entry {
    fn mismatch(&self, expected: MetricKind) -> RegistryError {
        RegistryError::KindMismatch {
            name: self.desc.name.clone(),
            expected: expected.as_str(),
            actual: self.desc.kind.as_str(),
        }
    }

    fn check_arity<S: AsRef<str>>(&self, values: &[S]) -> Result<()> {
        if self.desc.label_names.len() != values.len() {
            return Err(RegistryError::LabelArity {
                name: self.desc.name.clone(),
                expected: self.desc.label_names.len(),
                actual: values.len(),
            });
        }
        Ok(())
    }

    fn label_set<S: AsRef<str>>(&self, values: &[S]) -> Labels {
        self.desc
            .label_names
            .iter()
            .cloned()
            .zip(values.iter().map(|v| v.as_ref().to_string()))
            .collect()
    }
}

fn key<S: AsRef<str>>(values: &[S]) -> Vec<String> {
    values.iter().map(|v| v.as_ref().to_string()).collect()
}

#[derive(Debug, Default)]
struct Inner {
    registry: Registry,
    families: HashMap<String, Entry>,
}

/// Thread-safe metric registry.
#[derive(Debug, Default)]
pub struct MetricRegistry {
    inner: RwLock<Inner>,
}

/// Create a shareable registry handle.
pub type SharedRegistry = Arc<MetricRegistry>;

impl MetricRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a family. Re-registering an identical description is a no-op.
    pub fn describe(&self, desc: MetricDesc) -> Result<()> {
        if !is_valid_metric_name(&desc.name) {
            return Err(RegistryError::InvalidName(desc.name));
        }
        if desc.kind == MetricKind::Histogram {
            let increasing = desc.buckets.windows(2).all(|w| w[0] < w[1]);
            let finite = desc.buckets.iter().all(|b| b.is_finite());
            if desc.buckets.is_empty() || !increasing || !finite {
                return Err(RegistryError::InvalidBuckets(desc.name));
            }
        }

        let mut inner = self.inner.write();
        if let Some(existing) = inner.families.get(&desc.name) {
            return if existing.desc == desc {
                Ok(())
            } else {
                Err(RegistryError::Conflict(desc.name))
            };
        }
        // `foo_total` as a counter and `foo` as a gauge would encode to the same family.
        let clash = inner
            .families
            .values()
            .any(|e| e.desc.exposition_name() == desc.exposition_name());
        if clash {
            return Err(RegistryError::Conflict(desc.name));
        }

        let name = desc.exposition_name().to_string();
        let help = desc.help.clone();
        let series = match desc.kind {
            MetricKind::Gauge => {
                let family = Family::<Labels, Gauge<f64, AtomicU64>>::default();
                inner.registry.register(name, help, family.clone());
                Series::Gauge(family)
            }
            MetricKind::Counter => {
                let family = Family::<Labels, Counter<f64, AtomicU64>>::default();
                inner.registry.register(name, help, family.clone());
                Series::Counter(family)
            }
            MetricKind::Histogram => {
                let family = Family::<Labels, Histogram, Buckets>::new_with_constructor(Buckets(
                    desc.buckets.iter().copied().collect(),
                ));
                inner.registry.register(name, help, family.clone());
                Series::Histogram(family)
            }
        };

        trace!(name = %desc.name, kind = desc.kind.as_str(), "Registered metric family");
        inner.families.insert(
            desc.name.clone(),
            Entry {
                desc,
                series,
                live: BTreeSet::new(),
            },
        );
        Ok(())
    }

    /// Begin a write transaction. Readers block until the writer is dropped.
    pub fn write(&self) -> RegistryWriter<'_> {
        RegistryWriter {
            inner: self.inner.write(),
        }
    }

    /// Set a gauge series.
    pub fn set_gauge(&self, name: &str, labels: &[&str], value: f64) -> Result<()> {
        self.write().set_gauge(name, labels, value)
    }

    /// Increment a counter series by a non-negative delta.
    pub fn inc_counter(&self, name: &str, labels: &[&str], delta: f64) -> Result<()> {
        self.write().inc_counter(name, labels, delta)
    }

    /// Record a histogram observation.
    pub fn observe(&self, name: &str, labels: &[&str], value: f64) -> Result<()> {
        self.write().observe(name, labels, value)
    }

    /// Drop every series of a family.
    pub fn reset_family(&self, name: &str) -> Result<()> {
        self.write().reset_family(name)
    }

    /// Current value of a gauge or counter series.
    pub fn value(&self, name: &str, labels: &[&str]) -> Option<f64> {
        let inner = self.inner.read();
        let entry = inner.families.get(name)?;
        if !entry.live.contains(&key(labels)) {
            return None;
        }
        let labels = entry.label_set(labels);
        match &entry.series {
            Series::Gauge(family) => Some(family.get_or_create(&labels).get()),
            Series::Counter(family) => Some(family.get_or_create(&labels).get()),
            Series::Histogram(_) => None,
        }
    }

    /// All gauge or counter series of a family as `(label values, value)`,
    /// sorted by label values.
    pub fn series(&self, name: &str) -> Vec<(Vec<String>, f64)> {
        let inner = self.inner.read();
        let Some(entry) = inner.families.get(name) else {
            return Vec::new();
        };
        entry
            .live
            .iter()
            .filter_map(|values| {
                let labels = entry.label_set(values);
                let value = match &entry.series {
                    Series::Gauge(family) => family.get_or_create(&labels).get(),
                    Series::Counter(family) => family.get_or_create(&labels).get(),
                    Series::Histogram(_) => return None,
                };
                Some((values.clone(), value))
            })
            .collect()
    }

    /// Number of registered families.
    pub fn family_count(&self) -> usize {
        self.inner.read().families.len()
    }

    /// Number of live series across all families.
    pub fn series_count(&self) -> usize {
        self.inner.read().families.values().map(|e| e.live.len()).sum()
    }

    /// Encode every family in the OpenMetrics text format.
    pub fn render(&self) -> std::result::Result<String, std::fmt::Error> {
        let inner = self.inner.read();
        let mut buffer = String::new();
        encode(&mut buffer, &inner.registry)?;
        Ok(buffer)
    }
}

/// Exclusive write access to the registry.
///
/// Every mutation made through one writer becomes visible to readers at
/// once, when the writer is dropped.
pub struct RegistryWriter<'a> {
    inner: RwLockWriteGuard<'a, Inner>,
}

impl RegistryWriter<'_> {
    fn entry(&mut self, name: &str) -> Result<&mut Entry> {
        self.inner
            .families
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownFamily(name.to_string()))
    }

    /// Set a gauge series.
    pub fn set_gauge(&mut self, name: &str, labels: &[&str], value: f64) -> Result<()> {
        let entry = self.entry(name)?;
        let Series::Gauge(family) = &entry.series else {
            return Err(entry.mismatch(MetricKind::Gauge));
        };
        entry.check_arity(labels)?;

        family.get_or_create(&entry.label_set(labels)).set(value);
        entry.live.insert(key(labels));
        Ok(())
    }

    /// Increment a counter series. Negative or NaN deltas are rejected.
    ///
    /// A zero delta creates the series without changing its value.
    pub fn inc_counter(&mut self, name: &str, labels: &[&str], delta: f64) -> Result<()> {
        let entry = self.entry(name)?;
        let Series::Counter(family) = &entry.series else {
            return Err(entry.mismatch(MetricKind::Counter));
        };
        entry.check_arity(labels)?;
        if !(delta >= 0.0) {
            return Err(RegistryError::NegativeIncrement {
                name: name.to_string(),
                delta,
            });
        }

        family.get_or_create(&entry.label_set(labels)).inc_by(delta);
        entry.live.insert(key(labels));
        Ok(())
    }

    /// Record a histogram observation.
    pub fn observe(&mut self, name: &str, labels: &[&str], value: f64) -> Result<()> {
        let entry = self.entry(name)?;
        let Series::Histogram(family) = &entry.series else {
            return Err(entry.mismatch(MetricKind::Histogram));
        };
        entry.check_arity(labels)?;

        family.get_or_create(&entry.label_set(labels)).observe(value);
        entry.live.insert(key(labels));
        Ok(())
    }

    /// Drop every series of a family; the family itself stays registered.
    pub fn reset_family(&mut self, name: &str) -> Result<()> {
        let entry = self.entry(name)?;
        match &entry.series {
            Series::Gauge(family) => family.clear(),
            Series::Counter(family) => family.clear(),
            Series::Histogram(family) => family.clear(),
        }
        entry.live.clear();
        Ok(())
    }

    /// Replace a gauge family's series with exactly `entries`.
    ///
    /// Equivalent to [`reset_family`](Self::reset_family) followed by one
    /// [`set_gauge`](Self::set_gauge) per entry, validated before anything
    /// is cleared.
    pub fn replace_gauges<'e, I>(&mut self, name: &str, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (Vec<&'e str>, f64)>,
    {
        let entry = self.entry(name)?;
        let Series::Gauge(family) = &entry.series else {
            return Err(entry.mismatch(MetricKind::Gauge));
        };

        let mut staged = Vec::new();
        for (labels, value) in entries {
            entry.check_arity(&labels)?;
            staged.push((key(&labels), value));
        }

        family.clear();
        entry.live.clear();
        for (values, value) in staged {
            family.get_or_create(&entry.label_set(&values)).set(value);
            entry.live.insert(values);
        }
        Ok(())
    }
}

/// Value of the sample `name{labels}` in an encoded exposition, ignoring
/// label order.
#[cfg(test)]
pub(crate) fn sample(exposition: &str, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
    use std::collections::BTreeMap;

    let wanted: BTreeMap<&str, &str> = labels.iter().copied().collect();
    exposition
        .lines()
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| {
            let (series, value) = line.rsplit_once(' ')?;
            let (series_name, label_block) = match series.split_once('{') {
                Some((n, rest)) => (n, rest.strip_suffix('}')?),
                None => (series, ""),
            };
            let found: BTreeMap<&str, &str> = label_block
                .split(',')
                .filter(|pair| !pair.is_empty())
                .filter_map(|pair| {
                    let (k, v) = pair.split_once('=')?;
                    Some((k, v.trim_matches('"')))
                })
                .collect();
            (series_name == name && found == wanted)
                .then(|| value.parse().ok())
                .flatten()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> MetricRegistry {
        let registry = MetricRegistry::new();
        registry
            .describe(MetricDesc::new("dns_queries", "Total queries", MetricKind::Gauge, &[]))
            .unwrap();
        registry
            .describe(MetricDesc::new(
                "top_domain",
                "Top domains",
                MetricKind::Gauge,
                &["domain"],
            ))
            .unwrap();
        registry
            .describe(MetricDesc::new(
                "query_reason_total",
                "Queries by reason",
                MetricKind::Counter,
                &["client", "reason"],
            ))
            .unwrap();
        registry
            .describe(MetricDesc::histogram(
                "elapsed_seconds",
                "Elapsed",
                &["client"],
                &[0.001, 0.01, 0.1],
            ))
            .unwrap();
        registry
    }

    #[test]
    fn test_set_gauge_and_value() {
        let registry = registry();
        registry.set_gauge("dns_queries", &[], 100.0).unwrap();
        registry.set_gauge("dns_queries", &[], 120.0).unwrap();

        assert_eq!(registry.value("dns_queries", &[]), Some(120.0));
        assert_eq!(registry.series_count(), 1);
    }

    #[test]
    fn test_unknown_family() {
        let registry = registry();
        let err = registry.set_gauge("nope", &[], 1.0).unwrap_err();
        assert_eq!(err, RegistryError::UnknownFamily("nope".to_string()));
    }

    #[test]
    fn test_kind_mismatch() {
        let registry = registry();
        let err = registry
            .inc_counter("dns_queries", &[], 1.0)
            .unwrap_err();
        assert!(matches!(err, RegistryError::KindMismatch { .. }));
    }

    #[test]
    fn test_label_arity() {
        let registry = registry();
        let err = registry
            .inc_counter("query_reason_total", &["10.0.0.5"], 1.0)
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::LabelArity {
                name: "query_reason_total".to_string(),
                expected: 2,
                actual: 1,
            }
        );
    }

    #[test]
    fn test_counter_accumulates_and_rejects_negative() {
        let registry = registry();
        let labels = ["10.0.0.5", "FilteredBlackList"];
        registry.inc_counter("query_reason_total", &labels, 1.0).unwrap();
        registry.inc_counter("query_reason_total", &labels, 2.0).unwrap();

        assert!(registry.inc_counter("query_reason_total", &labels, -1.0).is_err());
        assert!(
            registry
                .inc_counter("query_reason_total", &labels, f64::NAN)
                .is_err()
        );
        assert_eq!(registry.value("query_reason_total", &labels), Some(3.0));
    }

    #[test]
    fn test_zero_increment_creates_series() {
        let registry = registry();
        let labels = ["10.0.0.5", "NotFiltered"];
        assert_eq!(registry.value("query_reason_total", &labels), None);

        registry.inc_counter("query_reason_total", &labels, 0.0).unwrap();

        assert_eq!(registry.value("query_reason_total", &labels), Some(0.0));
    }

    #[test]
    fn test_reset_family_keeps_registration() {
        let registry = registry();
        registry.set_gauge("top_domain", &["a"], 5.0).unwrap();
        registry.reset_family("top_domain").unwrap();

        assert!(registry.series("top_domain").is_empty());
        assert_eq!(registry.value("top_domain", &["a"]), None);
        registry.set_gauge("top_domain", &["b"], 1.0).unwrap();
        assert_eq!(registry.series("top_domain").len(), 1);
    }

    #[test]
    fn test_replace_gauges_drops_stale_labels() {
        let registry = registry();
        {
            let mut w = registry.write();
            w.replace_gauges("top_domain", [(vec!["a"], 5.0), (vec!["b"], 3.0)])
                .unwrap();
        }
        {
            let mut w = registry.write();
            w.replace_gauges("top_domain", [(vec!["b"], 7.0), (vec!["c"], 2.0)])
                .unwrap();
        }

        assert_eq!(
            registry.series("top_domain"),
            vec![(vec!["b".to_string()], 7.0), (vec!["c".to_string()], 2.0)]
        );
        let output = registry.render().unwrap();
        assert_eq!(sample(&output, "top_domain", &[("domain", "a")]), None);
        assert_eq!(sample(&output, "top_domain", &[("domain", "b")]), Some(7.0));
    }

    #[test]
    fn test_replace_gauges_validates_before_clearing() {
        let registry = registry();
        registry.set_gauge("top_domain", &["a"], 5.0).unwrap();

        let result = registry
            .write()
            .replace_gauges("top_domain", [(vec!["b", "extra"], 1.0)]);

        assert!(result.is_err());
        assert_eq!(registry.value("top_domain", &["a"]), Some(5.0));
    }

    #[test]
    fn test_histogram_buckets() {
        let registry = registry();
        for v in [0.0005, 0.005, 0.05, 5.0] {
            registry.observe("elapsed_seconds", &["10.0.0.5"], v).unwrap();
        }

        let output = registry.render().unwrap();
        let bucket = |le: &str| {
            sample(
                &output,
                "elapsed_seconds_bucket",
                &[("client", "10.0.0.5"), ("le", le)],
            )
        };
        assert_eq!(bucket("0.001"), Some(1.0));
        assert_eq!(bucket("0.01"), Some(2.0));
        assert_eq!(bucket("0.1"), Some(3.0));
        assert_eq!(bucket("+Inf"), Some(4.0));
        assert_eq!(
            sample(&output, "elapsed_seconds_count", &[("client", "10.0.0.5")]),
            Some(4.0)
        );
        let sum = sample(&output, "elapsed_seconds_sum", &[("client", "10.0.0.5")]).unwrap();
        assert!((sum - 5.0555).abs() < 1e-9);
        // Histograms have no single value.
        assert_eq!(registry.value("elapsed_seconds", &["10.0.0.5"]), None);
    }

    #[test]
    fn test_describe_is_idempotent_but_detects_conflicts() {
        let registry = registry();
        registry
            .describe(MetricDesc::new("dns_queries", "Total queries", MetricKind::Gauge, &[]))
            .unwrap();

        let err = registry
            .describe(MetricDesc::new("dns_queries", "Other", MetricKind::Counter, &[]))
            .unwrap_err();
        assert_eq!(err, RegistryError::Conflict("dns_queries".to_string()));

        // Would encode as a second `query_reason` family.
        let err = registry
            .describe(MetricDesc::new("query_reason", "Other", MetricKind::Gauge, &[]))
            .unwrap_err();
        assert_eq!(err, RegistryError::Conflict("query_reason".to_string()));
        assert_eq!(registry.family_count(), 4);
    }

    #[test]
    fn test_describe_rejects_bad_input() {
        let registry = MetricRegistry::new();
        assert!(matches!(
            registry.describe(MetricDesc::new("bad-name", "x", MetricKind::Gauge, &[])),
            Err(RegistryError::InvalidName(_))
        ));
        assert!(matches!(
            registry.describe(MetricDesc::histogram("h", "x", &[], &[0.5, 0.1])),
            Err(RegistryError::InvalidBuckets(_))
        ));
    }

    #[test]
    fn test_render_format() {
        let registry = registry();
        registry.set_gauge("dns_queries", &[], 100.0).unwrap();
        registry.set_gauge("top_domain", &["ex\"ample"], 0.25).unwrap();
        registry
            .inc_counter("query_reason_total", &["10.0.0.5", "NotFiltered"], 2.0)
            .unwrap();
        registry.observe("elapsed_seconds", &["10.0.0.5"], 0.005).unwrap();

        let output = registry.render().unwrap();

        assert!(output.contains("# HELP dns_queries Total queries"));
        assert!(output.contains("# TYPE dns_queries gauge"));
        assert_eq!(sample(&output, "dns_queries", &[]), Some(100.0));
        assert!(output.contains("domain=\"ex\\\"ample\""));
        assert!(output.contains("# TYPE query_reason counter"));
        assert_eq!(
            sample(
                &output,
                "query_reason_total",
                &[("client", "10.0.0.5"), ("reason", "NotFiltered")]
            ),
            Some(2.0)
        );
        assert!(!output.contains("_total_total"));
        assert!(output.contains("# TYPE elapsed_seconds histogram"));
        assert!(output.trim_end().ends_with("# EOF"));
    }

    #[test]
    fn test_render_omits_series_never_set() {
        let registry = registry();
        registry.set_gauge("top_domain", &["b"], 1.0).unwrap();

        let output = registry.render().unwrap();

        assert_eq!(sample(&output, "dns_queries", &[]), None);
        assert_eq!(sample(&output, "top_domain", &[("domain", "b")]), Some(1.0));
    }

    #[test]
    fn test_concurrent_readers_never_see_partial_replace() {
        use std::thread;

        let registry = Arc::new(registry());
        registry
            .write()
            .replace_gauges("top_domain", [(vec!["a"], 1.0), (vec!["b"], 1.0)])
            .unwrap();

        let writer = {
            let registry = registry.clone();
            thread::spawn(move || {
                for i in 0..500 {
                    let mut w = registry.write();
                    w.reset_family("top_domain").unwrap();
                    w.set_gauge("top_domain", &["a"], i as f64).unwrap();
                    w.set_gauge("top_domain", &["b"], i as f64).unwrap();
                }
            })
        };

        for _ in 0..500 {
            assert_eq!(registry.series("top_domain").len(), 2);
            let output = registry.render().unwrap();
            let a = sample(&output, "top_domain", &[("domain", "a")]);
            let b = sample(&output, "top_domain", &[("domain", "b")]);
            assert!(a.is_some() && a == b);
        }
        writer.join().unwrap();
    }
}
