//! Report builder: aggregation of telemetry between flushes.
//!
//! Instances are folded into one accumulator per `ReportKey` without any
//! I/O. A flush drains every accumulator, turns them into metric value
//! sets and sends one batch per backend service (chunked), retrying a
//! failed batch with the same snapshot before giving up on it.

use crate::application::metrics::AdapterMetrics;
use crate::application::ports::{RemoteServiceClient, Storage};
use crate::domain::distribution::DistributionBuilder;
use crate::domain::key::ReportKey;
use crate::domain::metric::{MetricCatalog, MetricInstance, MetricKind, MetricValue, ValueType};
use crate::domain::remote::{MetricValueSet, RemoteError, ReportRequest, ReportedValue};
use crate::domain::setting::ServiceIndex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Error returned when report configuration validation fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReportConfigError {
    /// Flush interval must be greater than zero
    #[error("flush interval must be greater than 0")]
    ZeroFlushInterval,
    /// Pending key watermark must be greater than zero
    #[error("max_pending_keys must be greater than 0")]
    ZeroMaxPendingKeys,
    /// Batch size must be greater than zero
    #[error("max_batch_size must be greater than 0")]
    ZeroMaxBatchSize,
    /// Report call timeout must be greater than zero
    #[error("report timeout must be greater than 0")]
    ZeroReportTimeout,
}

/// Configuration for aggregation and flushing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// How often the background task flushes
    #[serde(with = "crate::domain::setting::serde_dur")]
    pub flush_interval: Duration,
    /// Pending accumulator count that triggers an early flush
    pub max_pending_keys: usize,
    /// Maximum value sets per remote Report call
    pub max_batch_size: usize,
    /// Extra attempts for a failed batch before it is dropped
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry
    #[serde(with = "crate::domain::setting::serde_dur")]
    pub retry_backoff: Duration,
    /// Upper bound on each remote Report call
    #[serde(with = "crate::domain::setting::serde_dur")]
    pub report_timeout: Duration,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(10),
            max_pending_keys: 10_000,
            max_batch_size: 100,
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
            report_timeout: Duration::from_secs(5),
        }
    }
}

impl ReportConfig {
    /// Create a report config with the specified flush interval.
    ///
    /// # Errors
    /// Returns `ReportConfigError::ZeroFlushInterval` if `flush_interval` is zero.
    pub fn new(flush_interval: Duration) -> Result<Self, ReportConfigError> {
        let config = Self {
            flush_interval,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Set the pending key watermark.
    pub fn with_max_pending_keys(mut self, max_pending_keys: usize) -> Self {
        self.max_pending_keys = max_pending_keys;
        self
    }

    /// Set the maximum batch size.
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Set the retry policy.
    pub fn with_retries(mut self, max_retries: u32, retry_backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = retry_backoff;
        self
    }

    /// Set the report call timeout.
    pub fn with_report_timeout(mut self, report_timeout: Duration) -> Self {
        self.report_timeout = report_timeout;
        self
    }

    /// Check every field.
    pub fn validate(&self) -> Result<(), ReportConfigError> {
        if self.flush_interval.is_zero() {
            return Err(ReportConfigError::ZeroFlushInterval);
        }
        if self.max_pending_keys == 0 {
            return Err(ReportConfigError::ZeroMaxPendingKeys);
        }
        if self.max_batch_size == 0 {
            return Err(ReportConfigError::ZeroMaxBatchSize);
        }
        if self.report_timeout.is_zero() {
            return Err(ReportConfigError::ZeroReportTimeout);
        }
        Ok(())
    }
}

/// Why a single instance was not aggregated.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InstanceError {
    /// The metric is not in the catalog
    #[error("unknown metric {0:?}")]
    UnknownMetric(String),
    /// The value kind does not fit the metric
    #[error("metric {metric:?} does not accept {value:?}")]
    KindMismatch { metric: String, value: MetricValue },
    /// NaN or infinite value
    #[error("metric {0:?} value is not finite")]
    NonFinite(String),
}

/// An instance rejected during ingest, by position in the call.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedInstance {
    /// Index in the ingested slice
    pub index: usize,
    /// Why it was rejected
    pub error: InstanceError,
}

/// Why an ingest call was not fully applied.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IngestError {
    /// The service is not configured; nothing was applied
    #[error("unknown service {0:?}")]
    UnknownService(String),
    /// Some instances were rejected; the others were applied
    #[error("{} instance(s) rejected, {accepted} accepted", .rejected.len())]
    Rejected {
        accepted: usize,
        rejected: Vec<RejectedInstance>,
    },
}

/// Result of a fully applied ingest call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Instances folded in
    pub accepted: usize,
    /// Accumulators waiting for the next flush
    pub pending_keys: usize,
}

/// What a flush did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    /// Value sets drained from the accumulators
    pub value_sets: usize,
    /// Batches accepted by the remote service
    pub batches_sent: usize,
    /// Retry attempts across all batches
    pub retries: usize,
    /// Batches dropped after exhausting retries
    pub batches_dropped: usize,
    /// Value sets lost with dropped batches
    pub value_sets_dropped: usize,
}

/// Per-key running aggregate.
#[derive(Debug, Clone)]
pub enum Accumulator {
    /// Sum of integer deltas.
    ///
    /// Clamps at `i64::MIN`/`i64::MAX` instead of wrapping. Each clamped
    /// delta is logged at WARN.
    Int64Sum(i64),
    /// Sum of floating point deltas
    DoubleSum(f64),
    /// Histogram of samples
    Distribution(DistributionBuilder),
}

impl Accumulator {
    fn into_reported(self) -> ReportedValue {
        match self {
            Accumulator::Int64Sum(sum) => ReportedValue::Int64(sum),
            Accumulator::DoubleSum(sum) => ReportedValue::Double(sum),
            Accumulator::Distribution(mut builder) => ReportedValue::Distribution(builder.take()),
        }
    }
}

/// A validated instance value, ready to fold in.
#[derive(Clone, Copy)]
enum Delta<'a> {
    Int64(i64),
    Double(f64),
    Sample(f64, &'a DistributionBuilder),
}

impl Delta<'_> {
    fn empty_accumulator(&self) -> Accumulator {
        match self {
            Delta::Int64(_) => Accumulator::Int64Sum(0),
            Delta::Double(_) => Accumulator::DoubleSum(0.0),
            Delta::Sample(_, template) => Accumulator::Distribution((*template).clone()),
        }
    }

    fn apply(self, accumulator: &mut Accumulator) {
        match (accumulator, self) {
            (Accumulator::Int64Sum(sum), Delta::Int64(v)) => match sum.checked_add(v) {
                Some(total) => *sum = total,
                None => {
                    tracing::warn!(sum = *sum, delta = v, "int64 counter saturated, clamping");
                    *sum = sum.saturating_add(v);
                }
            },
            (Accumulator::DoubleSum(sum), Delta::Double(v)) => *sum += v,
            (Accumulator::Distribution(builder), Delta::Sample(v, _)) => builder.add(v),
            // Keys embed the metric name and the catalog is immutable, so the
            // accumulator kind always matches.
            (accumulator, _) => {
                tracing::error!(?accumulator, "accumulator kind changed under a key");
            }
        }
    }
}

/// Aggregates telemetry and flushes it to the remote service.
///
/// Generic over the storage implementation; in production this is
/// `Arc<ShardedStorage<ReportKey, Accumulator>>`.
#[derive(Debug)]
pub struct ReportBuilder<S>
where
    S: Storage<ReportKey, Accumulator> + Clone,
{
    inner: Arc<BuilderInner<S>>,
}

impl<S> Clone for ReportBuilder<S>
where
    S: Storage<ReportKey, Accumulator> + Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[derive(Debug)]
struct BuilderInner<S>
where
    S: Storage<ReportKey, Accumulator> + Clone,
{
    services: ServiceIndex,
    catalog: MetricCatalog,
    storage: S,
    client: Arc<dyn RemoteServiceClient>,
    config: ReportConfig,
    metrics: AdapterMetrics,
    flush_signal: Arc<Notify>,
}

impl<S> ReportBuilder<S>
where
    S: Storage<ReportKey, Accumulator> + Clone,
{
    /// Create a new report builder.
    pub fn new(
        services: ServiceIndex,
        catalog: MetricCatalog,
        storage: S,
        client: Arc<dyn RemoteServiceClient>,
        config: ReportConfig,
        metrics: AdapterMetrics,
    ) -> Self {
        Self {
            inner: Arc::new(BuilderInner {
                services,
                catalog,
                storage,
                client,
                config,
                metrics,
                flush_signal: Arc::new(Notify::new()),
            }),
        }
    }

    /// Fold telemetry instances of `service` into the accumulators.
    ///
    /// Never blocks on I/O. Instances are validated one by one: a bad
    /// instance is rejected and the rest of the call is still applied.
    ///
    /// # Errors
    /// `IngestError::UnknownService` if the service is not configured
    /// (nothing applied), `IngestError::Rejected` if any instance was
    /// rejected.
    pub fn ingest(
        &self,
        service: &str,
        instances: &[MetricInstance],
    ) -> Result<IngestOutcome, IngestError> {
        let inner = &self.inner;
        let setting = inner
            .services
            .get(service)
            .ok_or_else(|| IngestError::UnknownService(service.to_string()))?;
        let backend = setting.backend_service_name.as_str();

        let mut accepted = 0;
        let mut rejected = Vec::new();
        for (index, instance) in instances.iter().enumerate() {
            let delta = match inner.validate(instance) {
                Ok(delta) => delta,
                Err(error) => {
                    tracing::debug!(service, metric = %instance.name, %error, "rejecting metric instance");
                    rejected.push(RejectedInstance { index, error });
                    continue;
                }
            };
            let key = ReportKey::new(backend, &instance.name, instance.labels.clone());
            inner
                .storage
                .with_entry_mut(key, || delta.empty_accumulator(), |acc| delta.apply(acc));
            accepted += 1;
        }

        inner.metrics.record_ingested(accepted as u64);
        inner.metrics.record_rejected(rejected.len() as u64);

        let pending_keys = inner.storage.len();
        if pending_keys >= inner.config.max_pending_keys {
            inner.flush_signal.notify_one();
        }

        if rejected.is_empty() {
            Ok(IngestOutcome {
                accepted,
                pending_keys,
            })
        } else {
            Err(IngestError::Rejected { accepted, rejected })
        }
    }

    /// Drain every accumulator and send the aggregates.
    ///
    /// Each backend service gets its own batches of at most
    /// `max_batch_size` value sets. A failed batch is retried with the
    /// same contents up to `max_retries` times; after that it is dropped,
    /// logged at ERROR level and counted. Dropped data is never put back,
    /// so the next window starts from zero.
    pub async fn flush(&self) -> FlushSummary {
        let inner = &self.inner;
        let mut drained = inner.storage.drain();
        let mut summary = FlushSummary::default();
        if drained.is_empty() {
            return summary;
        }
        drained.sort_by(|(a, _), (b, _)| a.cmp(b));
        summary.value_sets = drained.len();

        let mut by_service: BTreeMap<String, Vec<MetricValueSet>> = BTreeMap::new();
        for (key, accumulator) in drained {
            by_service
                .entry(key.service().to_string())
                .or_default()
                .push(MetricValueSet {
                    metric_name: key.metric().to_string(),
                    labels: key.labels().clone(),
                    value: accumulator.into_reported(),
                });
        }

        for (service, value_sets) in by_service {
            for chunk in value_sets.chunks(inner.config.max_batch_size) {
                let request = ReportRequest {
                    service_name: service.clone(),
                    metric_value_sets: chunk.to_vec(),
                };
                match inner.send_with_retry(request).await {
                    Ok(retries) => {
                        summary.retries += retries;
                        summary.batches_sent += 1;
                        inner.metrics.record_batch_sent();
                    }
                    Err((error, retries)) => {
                        summary.retries += retries;
                        summary.batches_dropped += 1;
                        summary.value_sets_dropped += chunk.len();
                        inner.metrics.record_batch_dropped(chunk.len() as u64);
                        tracing::error!(
                            service = %service,
                            value_sets = chunk.len(),
                            attempts = retries + 1,
                            error = %error,
                            "dropping report batch after exhausting retries"
                        );
                    }
                }
            }
        }

        tracing::debug!(
            value_sets = summary.value_sets,
            batches_sent = summary.batches_sent,
            batches_dropped = summary.batches_dropped,
            "flushed report aggregates"
        );
        summary
    }

    /// Number of accumulators waiting for the next flush.
    pub fn pending_keys(&self) -> usize {
        self.inner.storage.len()
    }

    /// Get the report configuration.
    pub fn config(&self) -> &ReportConfig {
        &self.inner.config
    }

    /// Get the metric catalog.
    pub fn catalog(&self) -> &MetricCatalog {
        &self.inner.catalog
    }

    /// Signal raised when the pending key watermark is reached.
    pub(crate) fn flush_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.inner.flush_signal)
    }
}

impl<S> BuilderInner<S>
where
    S: Storage<ReportKey, Accumulator> + Clone,
{
    fn validate<'a>(&'a self, instance: &MetricInstance) -> Result<Delta<'a>, InstanceError> {
        let descriptor = self
            .catalog
            .get(&instance.name)
            .ok_or_else(|| InstanceError::UnknownMetric(instance.name.clone()))?;

        if let MetricValue::Double(v) = instance.value {
            if !v.is_finite() {
                return Err(InstanceError::NonFinite(instance.name.clone()));
            }
        }

        match (&descriptor.kind, instance.value) {
            (MetricKind::Counter(ValueType::Int64), MetricValue::Int64(v)) => Ok(Delta::Int64(v)),
            (MetricKind::Counter(ValueType::Double), value) => Ok(Delta::Double(value.as_sample())),
            (MetricKind::Distribution(_), value) => self
                .catalog
                .distribution_template(&instance.name)
                .map(|template| Delta::Sample(value.as_sample(), template))
                .ok_or_else(|| InstanceError::UnknownMetric(instance.name.clone())),
            (MetricKind::Counter(ValueType::Int64), value) => Err(InstanceError::KindMismatch {
                metric: instance.name.clone(),
                value,
            }),
        }
    }

    /// Returns the number of retries used, with the final error on failure.
    async fn send_with_retry(&self, request: ReportRequest) -> Result<usize, (RemoteError, usize)> {
        let mut retries = 0;
        let mut backoff = self.config.retry_backoff;
        loop {
            let attempt = tokio::time::timeout(
                self.config.report_timeout,
                self.client.report(request.clone()),
            )
            .await
            .unwrap_or(Err(RemoteError::Timeout(self.config.report_timeout)));

            match attempt {
                Ok(()) => return Ok(retries),
                Err(error) if retries < self.config.max_retries as usize => {
                    retries += 1;
                    self.metrics.record_batch_retried();
                    tracing::warn!(
                        service = %request.service_name,
                        attempt = retries,
                        error = %error,
                        "report failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(error) => return Err((error, retries)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::distribution::BucketSpec;
    use crate::domain::metric::{names, MetricDescriptor};
    use crate::domain::setting::{AdapterConfig, ServiceSetting};
    use crate::infrastructure::mocks::{MockCaptureLayer, MockRemoteClient};
    use crate::infrastructure::storage::ShardedStorage;
    use tracing::Level;
    use tracing_subscriber::layer::SubscriberExt;

    type Builder = ReportBuilder<Arc<ShardedStorage<ReportKey, Accumulator>>>;

    const BACKEND: &str = "catalog.endpoints.example.cloud.goog";

    fn catalog() -> MetricCatalog {
        MetricCatalog::new([
            MetricDescriptor::int64_counter(names::REQUEST_COUNT),
            MetricDescriptor::double_counter("cost"),
            MetricDescriptor::distribution("latency", BucketSpec::explicit(vec![0.0, 10.0, 100.0])),
        ])
        .unwrap()
    }

    fn builder_with(client: MockRemoteClient, config: ReportConfig) -> Builder {
        let services = ServiceIndex::from_config(&AdapterConfig::new(
            Duration::from_secs(5),
            vec![
                ServiceSetting::new("catalog", BACKEND),
                ServiceSetting::new("orders", "orders.endpoints.example.cloud.goog"),
            ],
        ))
        .unwrap();
        ReportBuilder::new(
            services,
            catalog(),
            Arc::new(ShardedStorage::new()),
            Arc::new(client),
            config,
            AdapterMetrics::new(),
        )
    }

    fn builder(client: MockRemoteClient) -> Builder {
        builder_with(
            client,
            ReportConfig::default().with_retries(2, Duration::from_millis(1)),
        )
    }

    fn requests(method: &str, n: i64) -> MetricInstance {
        MetricInstance::new(names::REQUEST_COUNT, MetricValue::Int64(n)).with_label("method", method)
    }

    #[test]
    fn test_report_config_validation() {
        assert_eq!(
            ReportConfig::new(Duration::ZERO),
            Err(ReportConfigError::ZeroFlushInterval)
        );
        let config = ReportConfig::new(Duration::from_secs(1)).unwrap();
        assert_eq!(
            config.clone().with_max_batch_size(0).validate(),
            Err(ReportConfigError::ZeroMaxBatchSize)
        );
        assert_eq!(
            config.with_max_pending_keys(0).validate(),
            Err(ReportConfigError::ZeroMaxPendingKeys)
        );
    }

    #[test]
    fn test_report_config_deserializes() {
        let config: ReportConfig = serde_json::from_str(
            r#"{"flush_interval": "2s", "max_retries": 5, "retry_backoff": "250ms"}"#,
        )
        .unwrap();
        assert_eq!(config.flush_interval, Duration::from_secs(2));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_backoff, Duration::from_millis(250));
        assert_eq!(config.max_batch_size, ReportConfig::default().max_batch_size);
    }

    #[test]
    fn test_unknown_service_applies_nothing() {
        let builder = builder(MockRemoteClient::new());
        let err = builder.ingest("inventory", &[requests("GET", 1)]).unwrap_err();
        assert_eq!(err, IngestError::UnknownService("inventory".to_string()));
        assert_eq!(builder.pending_keys(), 0);
    }

    #[test]
    fn test_counters_sum_per_key() {
        let builder = builder(MockRemoteClient::new());
        let outcome = builder
            .ingest("catalog", &[requests("GET", 1), requests("GET", 2), requests("POST", 1)])
            .unwrap();
        assert_eq!(outcome.accepted, 3);
        assert_eq!(outcome.pending_keys, 2);
    }

    #[test]
    fn test_bad_instances_rejected_others_applied() {
        let builder = builder(MockRemoteClient::new());
        let err = builder
            .ingest(
                "catalog",
                &[
                    requests("GET", 1),
                    MetricInstance::new("unknown", MetricValue::Int64(1)),
                    MetricInstance::new(names::REQUEST_COUNT, MetricValue::Double(1.5)),
                    MetricInstance::new("cost", MetricValue::Double(f64::NAN)),
                    MetricInstance::new("latency", MetricValue::Double(12.0)),
                ],
            )
            .unwrap_err();

        match err {
            IngestError::Rejected { accepted, rejected } => {
                assert_eq!(accepted, 2);
                let indexes: Vec<usize> = rejected.iter().map(|r| r.index).collect();
                assert_eq!(indexes, vec![1, 2, 3]);
                assert!(matches!(rejected[0].error, InstanceError::UnknownMetric(_)));
                assert!(matches!(rejected[1].error, InstanceError::KindMismatch { .. }));
                assert!(matches!(rejected[2].error, InstanceError::NonFinite(_)));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(builder.pending_keys(), 2);
    }

    #[tokio::test]
    async fn test_int64_counter_clamps_and_warns_on_overflow() {
        let client = MockRemoteClient::new();
        let builder = builder(client.clone());
        let capture = MockCaptureLayer::new();
        let _guard = tracing::subscriber::set_default(
            tracing_subscriber::registry().with(capture.clone()),
        );

        builder
            .ingest("catalog", &[requests("GET", i64::MAX), requests("GET", 1)])
            .unwrap();
        builder.flush().await;

        let sets = &client.reports()[0].metric_value_sets;
        assert_eq!(sets[0].value, ReportedValue::Int64(i64::MAX));
        let warnings = capture.events_at(Level::WARN);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].message, "int64 counter saturated, clamping");
        assert_eq!(warnings[0].field("delta"), Some("1"));
    }

    #[tokio::test]
    async fn test_flush_sends_aggregates_and_empties() {
        let client = MockRemoteClient::new();
        let builder = builder(client.clone());

        builder
            .ingest("catalog", &[requests("GET", 2), requests("GET", 3)])
            .unwrap();
        for sample in [1.0, 5.0, 5.0, 20.0] {
            builder
                .ingest("catalog", &[MetricInstance::new("latency", MetricValue::Double(sample))])
                .unwrap();
        }

        let summary = builder.flush().await;
        assert_eq!(summary.value_sets, 2);
        assert_eq!(summary.batches_sent, 1);
        assert_eq!(builder.pending_keys(), 0);

        let reports = client.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].service_name, BACKEND);
        let sets = &reports[0].metric_value_sets;
        let count = sets
            .iter()
            .find(|s| s.metric_name == names::REQUEST_COUNT)
            .unwrap();
        assert_eq!(count.value, ReportedValue::Int64(5));
        let latency = sets.iter().find(|s| s.metric_name == "latency").unwrap();
        match &latency.value {
            ReportedValue::Distribution(snapshot) => {
                assert_eq!(snapshot.bucket_counts, vec![0, 3, 1, 0]);
                assert_eq!(snapshot.count, 4);
            }
            other => panic!("expected distribution, got {:?}", other),
        }

        // Nothing left: the next flush sends nothing.
        assert_eq!(builder.flush().await, FlushSummary::default());
        assert_eq!(client.report_calls(), 1);
    }

    #[tokio::test]
    async fn test_flush_groups_by_service_and_chunks() {
        let client = MockRemoteClient::new();
        let builder = builder_with(
            client.clone(),
            ReportConfig::default().with_max_batch_size(2),
        );

        builder
            .ingest(
                "catalog",
                &[requests("GET", 1), requests("POST", 1), requests("PUT", 1)],
            )
            .unwrap();
        builder.ingest("orders", &[requests("GET", 1)]).unwrap();

        let summary = builder.flush().await;
        assert_eq!(summary.value_sets, 4);
        assert_eq!(summary.batches_sent, 3);

        let mut sizes: Vec<(String, usize)> = client
            .reports()
            .into_iter()
            .map(|r| (r.service_name, r.metric_value_sets.len()))
            .collect();
        sizes.sort();
        assert_eq!(
            sizes,
            vec![
                (BACKEND.to_string(), 1),
                (BACKEND.to_string(), 2),
                ("orders.endpoints.example.cloud.goog".to_string(), 1),
            ]
        );
    }

    #[tokio::test]
    async fn test_retry_then_success_resends_same_snapshot() {
        let client = MockRemoteClient::new();
        client.fail_reports(1);
        let builder = builder(client.clone());

        builder.ingest("catalog", &[requests("GET", 4)]).unwrap();
        let summary = builder.flush().await;
        assert_eq!(summary.retries, 1);
        assert_eq!(summary.batches_sent, 1);

        let reports = client.reports();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0], reports[1]);
    }

    #[tokio::test]
    async fn test_exhausted_retries_drop_batch() {
        let client = MockRemoteClient::new();
        client.fail_reports(usize::MAX);
        let builder = builder(client.clone());

        builder.ingest("catalog", &[requests("GET", 4)]).unwrap();
        let summary = builder.flush().await;
        assert_eq!(summary.batches_dropped, 1);
        assert_eq!(summary.value_sets_dropped, 1);
        assert_eq!(client.report_calls(), 3);
        assert_eq!(builder.pending_keys(), 0);
    }

    #[tokio::test]
    async fn test_watermark_raises_flush_signal() {
        let builder = builder_with(
            MockRemoteClient::new(),
            ReportConfig::default().with_max_pending_keys(2),
        );
        let signal = builder.flush_signal();

        builder.ingest("catalog", &[requests("GET", 1)]).unwrap();
        let below = tokio::time::timeout(Duration::from_millis(20), signal.notified()).await;
        assert!(below.is_err());

        builder.ingest("catalog", &[requests("POST", 1)]).unwrap();
        let reached = tokio::time::timeout(Duration::from_millis(20), signal.notified()).await;
        assert!(reached.is_ok());
    }
}
