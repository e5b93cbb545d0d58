//! Metric descriptors and telemetry instances.

use crate::domain::distribution::{BucketError, BucketSpec, DistributionBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Value type of a counter metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    /// Integer deltas
    Int64,
    /// Floating point deltas
    Double,
}

/// How instances of a metric are aggregated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Deltas are summed
    Counter(ValueType),
    /// Samples are folded into a histogram
    Distribution(BucketSpec),
}

/// Declaration of one reportable metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDescriptor {
    /// Remote metric name
    pub name: String,
    /// Aggregation kind
    pub kind: MetricKind,
}

impl MetricDescriptor {
    /// Integer counter.
    pub fn int64_counter(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: MetricKind::Counter(ValueType::Int64),
        }
    }

    /// Floating point counter.
    pub fn double_counter(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: MetricKind::Counter(ValueType::Double),
        }
    }

    /// Distribution with the given bucket layout.
    pub fn distribution(name: impl Into<String>, buckets: BucketSpec) -> Self {
        Self {
            name: name.into(),
            kind: MetricKind::Distribution(buckets),
        }
    }
}

/// Well-known consumer metrics of the service control backend.
pub mod names {
    pub const REQUEST_COUNT: &str = "serviceruntime.googleapis.com/api/consumer/request_count";
    pub const ERROR_COUNT: &str = "serviceruntime.googleapis.com/api/consumer/error_count";
    pub const REQUEST_SIZES: &str = "serviceruntime.googleapis.com/api/consumer/request_sizes";
    pub const RESPONSE_SIZES: &str = "serviceruntime.googleapis.com/api/consumer/response_sizes";
    pub const TOTAL_LATENCIES: &str =
        "serviceruntime.googleapis.com/api/consumer/total_latencies";
    pub const BACKEND_LATENCIES: &str =
        "serviceruntime.googleapis.com/api/consumer/backend_latencies";
}

/// Set of metrics the report builder accepts, indexed by name.
///
/// Distribution layouts are validated once, when the catalog is built, and
/// kept as empty builders that new accumulators are cloned from.
#[derive(Debug, Clone)]
pub struct MetricCatalog {
    descriptors: Arc<HashMap<String, MetricDescriptor>>,
    templates: Arc<HashMap<String, DistributionBuilder>>,
}

impl MetricCatalog {
    /// Build a catalog, validating every distribution layout up front.
    ///
    /// # Errors
    /// Returns the name of the first invalid descriptor with its bucket error.
    pub fn new(
        descriptors: impl IntoIterator<Item = MetricDescriptor>,
    ) -> Result<Self, (String, BucketError)> {
        let mut map = HashMap::new();
        let mut templates = HashMap::new();
        for descriptor in descriptors {
            if let MetricKind::Distribution(spec) = &descriptor.kind {
                let template = DistributionBuilder::new(spec.clone())
                    .map_err(|e| (descriptor.name.clone(), e))?;
                templates.insert(descriptor.name.clone(), template);
            }
            map.insert(descriptor.name.clone(), descriptor);
        }
        Ok(Self {
            descriptors: Arc::new(map),
            templates: Arc::new(templates),
        })
    }

    /// Consumer request/error counts plus size and latency distributions.
    ///
    /// Sizes use 8 exponential buckets with growth 10 starting at 1 byte;
    /// latencies use 29 exponential buckets with growth 2 starting at 1µs.
    pub fn standard() -> Self {
        let sizes = BucketSpec::exponential(8, 10.0, 1.0);
        let latencies = BucketSpec::exponential(29, 2.0, 1e-6);
        Self::new([
            MetricDescriptor::int64_counter(names::REQUEST_COUNT),
            MetricDescriptor::int64_counter(names::ERROR_COUNT),
            MetricDescriptor::distribution(names::REQUEST_SIZES, sizes.clone()),
            MetricDescriptor::distribution(names::RESPONSE_SIZES, sizes),
            MetricDescriptor::distribution(names::TOTAL_LATENCIES, latencies.clone()),
            MetricDescriptor::distribution(names::BACKEND_LATENCIES, latencies),
        ])
        .expect("standard bucket layouts are always valid")
    }

    /// Look up a descriptor.
    pub fn get(&self, name: &str) -> Option<&MetricDescriptor> {
        self.descriptors.get(name)
    }

    /// Empty builder for a distribution metric.
    pub fn distribution_template(&self, name: &str) -> Option<&DistributionBuilder> {
        self.templates.get(name)
    }

    /// Number of declared metrics.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

impl Default for MetricCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

/// Raw value carried by a telemetry instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    /// Integer delta (counters)
    Int64(i64),
    /// Floating point delta or sample
    Double(f64),
}

impl MetricValue {
    /// Value as a distribution sample.
    pub fn as_sample(&self) -> f64 {
        match self {
            MetricValue::Int64(v) => *v as f64,
            MetricValue::Double(v) => *v,
        }
    }
}

/// One telemetry event for one metric.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricInstance {
    /// Metric name, looked up in the catalog
    pub name: String,
    /// Dimension values
    pub labels: BTreeMap<String, String>,
    /// Delta or sample
    pub value: MetricValue,
}

impl MetricInstance {
    /// Instance without labels.
    pub fn new(name: impl Into<String>, value: MetricValue) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
            value,
        }
    }

    /// Add a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}
