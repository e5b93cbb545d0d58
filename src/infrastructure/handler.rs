//! Handler façade wiring the processor, the report builder and the flush task.
//!
//! This is the surface the request pipeline talks to. `check` never fails:
//! any error becomes a deny carrying a status code, so an authorization
//! question always gets an answer.

use crate::application::aggregator::{
    Accumulator, FlushSummary, IngestError, IngestOutcome, ReportBuilder, ReportConfig,
    ReportConfigError,
};
use crate::application::cache::{CacheEntry, CheckCache};
use crate::application::circuit_breaker::CircuitBreaker;
use crate::application::metrics::AdapterMetrics;
use crate::application::ports::{Clock, RemoteServiceClient};
use crate::application::processor::{CheckError, CheckProcessor, ProcessorConfig};
use crate::application::scheduler::{start_flush_task, FlushHandle, ShutdownError};
use crate::domain::decision::{DecisionSource, DenialReason};
use crate::domain::key::{CheckKey, QuotaRequest, ReportKey};
use crate::domain::metric::{MetricCatalog, MetricInstance};
use crate::domain::setting::{AdapterConfig, ConfigErrors, ServiceIndex};
use crate::infrastructure::clock::SystemClock;
use crate::infrastructure::config::HandlerSettings;
use crate::infrastructure::storage::ShardedStorage;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Storage backing the check cache.
pub type CheckStorage = Arc<ShardedStorage<CheckKey, CacheEntry>>;

/// Storage backing the report accumulators.
pub type ReportStorage = Arc<ShardedStorage<ReportKey, Accumulator>>;

/// Error returned when building a handler with invalid configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    /// The adapter configuration did not validate
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    /// The report settings did not validate
    #[error("invalid report settings: {0}")]
    Report(#[from] ReportConfigError),
    /// Remote calls would time out immediately
    #[error("remote_timeout must be greater than zero")]
    ZeroRemoteTimeout,
    /// The breaker would open before the first failure
    #[error("circuit breaker failure_threshold must be greater than zero")]
    ZeroFailureThreshold,
    /// No remote client was supplied
    #[error("a remote service client is required")]
    MissingClient,
}

/// Status attached to every check result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// The request may proceed
    Ok,
    /// The remote service denied the principal or operation
    PermissionDenied,
    /// A requested quota could not be allocated
    ResourceExhausted,
    /// The service is not configured
    NotFound,
    /// The request named an unknown quota or a bad amount
    InvalidArgument,
    /// No decision could be obtained from the remote service
    Unavailable,
}

impl StatusCode {
    /// Whether the status allows the request.
    pub fn is_ok(&self) -> bool {
        matches!(self, StatusCode::Ok)
    }
}

impl From<&CheckError> for StatusCode {
    fn from(error: &CheckError) -> Self {
        match error {
            CheckError::UnknownService(_) => StatusCode::NotFound,
            CheckError::UnknownQuota { .. } | CheckError::InvalidQuotaAmount { .. } => {
                StatusCode::InvalidArgument
            }
            CheckError::Remote(_) | CheckError::Unavailable | CheckError::FlightAbandoned => {
                StatusCode::Unavailable
            }
        }
    }
}

impl From<&DenialReason> for StatusCode {
    fn from(reason: &DenialReason) -> Self {
        match reason {
            DenialReason::PermissionDenied(_) => StatusCode::PermissionDenied,
            DenialReason::QuotaExhausted { .. } => StatusCode::ResourceExhausted,
        }
    }
}

/// One authorization question from the request pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckInput {
    /// Mesh service name
    pub service: String,
    /// Caller identity, usually an API key
    pub principal: String,
    /// Operation being invoked
    pub operation: String,
    /// Quota dimensions to allocate
    pub quotas: Vec<QuotaRequest>,
}

impl CheckInput {
    /// Input for a pure authorization check.
    pub fn new(
        service: impl Into<String>,
        principal: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            principal: principal.into(),
            operation: operation.into(),
            quotas: Vec::new(),
        }
    }

    /// Request an amount of one quota dimension.
    pub fn with_quota(mut self, name: impl Into<String>, amount: i64) -> Self {
        self.quotas.push(QuotaRequest::new(name, amount));
        self
    }
}

/// Answer returned to the request pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    /// Status; only `StatusCode::Ok` allows the request
    pub status: StatusCode,
    /// How long the pipeline may reuse this answer, zero for errors
    pub valid_duration: Duration,
    /// Granted amount per quota dimension
    pub quotas: BTreeMap<String, i64>,
    /// Operator-readable detail for non-OK results
    pub message: Option<String>,
    /// Where the decision came from, `None` for errors
    pub source: Option<DecisionSource>,
}

impl CheckResult {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        self.status.is_ok()
    }

    fn from_error(error: &CheckError) -> Self {
        Self {
            status: StatusCode::from(error),
            valid_duration: Duration::ZERO,
            quotas: BTreeMap::new(),
            message: Some(error.to_string()),
            source: None,
        }
    }
}

/// Builder for [`ServiceControlHandler`].
#[derive(Debug)]
pub struct ServiceControlHandlerBuilder {
    config: AdapterConfig,
    client: Option<Arc<dyn RemoteServiceClient>>,
    clock: Option<Arc<dyn Clock>>,
    processor: ProcessorConfig,
    report: ReportConfig,
    catalog: MetricCatalog,
    flush_task: bool,
}

impl ServiceControlHandlerBuilder {
    /// Set the service settings.
    pub fn with_config(mut self, config: AdapterConfig) -> Self {
        self.config = config;
        self
    }

    /// Apply a whole settings document, as returned by
    /// [`parse_settings`](crate::infrastructure::config::parse_settings).
    pub fn with_settings(mut self, settings: HandlerSettings) -> Self {
        self.config = settings.adapter;
        self.processor = settings.processor;
        self.report = settings.report;
        self
    }

    /// Set the remote service client. Required.
    pub fn with_client(mut self, client: Arc<dyn RemoteServiceClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Set a custom clock (mainly for tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the processor tunables.
    pub fn with_processor_config(mut self, processor: ProcessorConfig) -> Self {
        self.processor = processor;
        self
    }

    /// Set the report tunables.
    pub fn with_report_config(mut self, report: ReportConfig) -> Self {
        self.report = report;
        self
    }

    /// Replace the metric catalog.
    pub fn with_catalog(mut self, catalog: MetricCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Start the background flush task on build.
    ///
    /// Enabled by default. When enabled, `build` must run inside a tokio
    /// runtime. With the task disabled, telemetry is only sent by explicit
    /// [`flush`](ServiceControlHandler::flush) calls.
    pub fn with_flush_task(mut self, enabled: bool) -> Self {
        self.flush_task = enabled;
        self
    }

    /// Build the handler.
    ///
    /// # Errors
    /// Returns `BuildError` if the service settings or tunables are invalid,
    /// or if no client was supplied.
    pub fn build(self) -> Result<ServiceControlHandler, BuildError> {
        let services = ServiceIndex::from_config(&self.config)?;
        self.report.validate()?;
        if self.processor.remote_timeout.is_zero() {
            return Err(BuildError::ZeroRemoteTimeout);
        }
        if self.processor.circuit_breaker.failure_threshold == 0 {
            return Err(BuildError::ZeroFailureThreshold);
        }
        let client = self.client.ok_or(BuildError::MissingClient)?;

        let metrics = AdapterMetrics::new();
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let circuit_breaker = Arc::new(CircuitBreaker::new(
            self.processor.circuit_breaker.clone(),
            Arc::clone(&clock),
        ));

        let cache = CheckCache::new(Arc::new(ShardedStorage::new()), Arc::clone(&clock));
        let processor = CheckProcessor::new(
            services.clone(),
            Arc::clone(&client),
            cache,
            circuit_breaker,
            clock,
            metrics.clone(),
            self.processor.remote_timeout,
        );

        let report_builder = ReportBuilder::new(
            services,
            self.catalog,
            Arc::new(ShardedStorage::new()),
            client,
            self.report,
            metrics,
        );

        let flush_handle = if self.flush_task {
            Some(start_flush_task(report_builder.clone()))
        } else {
            None
        };

        tracing::debug!(
            services = processor.services().len(),
            flush_task = flush_handle.is_some(),
            "service control handler built"
        );

        Ok(ServiceControlHandler {
            processor,
            report_builder,
            flush_handle: Arc::new(Mutex::new(flush_handle)),
        })
    }
}

/// Entry point for Check and Report calls of the request pipeline.
///
/// Cheap to clone; clones share caches, accumulators and the flush task.
#[derive(Debug, Clone)]
pub struct ServiceControlHandler {
    processor: CheckProcessor<CheckStorage>,
    report_builder: ReportBuilder<ReportStorage>,
    flush_handle: Arc<Mutex<Option<FlushHandle>>>,
}

impl ServiceControlHandler {
    /// Create a builder.
    ///
    /// Defaults:
    /// - Processor: 5s remote timeout, breaker opening after 5 failures for 30s
    /// - Report: 10s flush interval, 10,000 pending keys, batches of 100, 3 retries
    /// - Catalog: [`MetricCatalog::standard`]
    /// - Background flush task: enabled
    pub fn builder() -> ServiceControlHandlerBuilder {
        ServiceControlHandlerBuilder {
            config: AdapterConfig::default(),
            client: None,
            clock: None,
            processor: ProcessorConfig::default(),
            report: ReportConfig::default(),
            catalog: MetricCatalog::standard(),
            flush_task: true,
        }
    }

    /// Answer an authorization question.
    ///
    /// Never fails: configuration problems, remote failures and an open
    /// circuit breaker all come back as a deny with a non-OK status.
    pub async fn check(&self, input: CheckInput) -> CheckResult {
        let evaluation = self
            .processor
            .evaluate(
                &input.service,
                &input.principal,
                &input.operation,
                &input.quotas,
            )
            .await;

        match evaluation {
            Ok(evaluation) => {
                let decision = evaluation.decision;
                let (status, message) = match decision.denial() {
                    None => (StatusCode::Ok, None),
                    Some(reason) => (StatusCode::from(reason), Some(reason.to_string())),
                };
                CheckResult {
                    status,
                    valid_duration: evaluation.valid_for,
                    quotas: decision
                        .quotas
                        .into_iter()
                        .map(|grant| (grant.name, grant.granted))
                        .collect(),
                    message,
                    source: Some(evaluation.source),
                }
            }
            Err(error) => {
                if error.is_transient() {
                    tracing::warn!(
                        service = %input.service,
                        operation = %input.operation,
                        error = %error,
                        "check failed, denying request"
                    );
                } else {
                    tracing::debug!(
                        service = %input.service,
                        error = %error,
                        "check rejected"
                    );
                }
                CheckResult::from_error(&error)
            }
        }
    }

    /// Fold telemetry of `service` into the pending report.
    ///
    /// # Errors
    /// See [`ReportBuilder::ingest`].
    pub fn report(
        &self,
        service: &str,
        instances: &[MetricInstance],
    ) -> Result<IngestOutcome, IngestError> {
        self.report_builder.ingest(service, instances)
    }

    /// Send everything pending now.
    pub async fn flush(&self) -> FlushSummary {
        self.report_builder.flush().await
    }

    /// Stop the background flush task after a final flush.
    ///
    /// Without a running task this flushes directly. Calling it twice is
    /// harmless; the second call only flushes what arrived in between.
    ///
    /// # Errors
    /// Returns an error if the flush task panicked or was cancelled.
    pub async fn shutdown(&self) -> Result<FlushSummary, ShutdownError> {
        // Take the handle under the lock, then release it before awaiting
        let handle = self
            .flush_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match handle {
            Some(handle) => handle.shutdown().await,
            None => Ok(self.report_builder.flush().await),
        }
    }

    /// Observability counters shared by checks and reports.
    pub fn metrics(&self) -> &AdapterMetrics {
        self.processor.metrics()
    }

    /// Breaker guarding remote checks.
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        self.processor.circuit_breaker()
    }

    /// The underlying check processor.
    pub fn processor(&self) -> &CheckProcessor<CheckStorage> {
        &self.processor
    }

    /// The underlying report builder.
    pub fn report_builder(&self) -> &ReportBuilder<ReportStorage> {
        &self.report_builder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::remote::{AllocateQuotaResponse, CheckResponse, QuotaDenial, RemoteError};
    use crate::domain::setting::{QuotaSetting, ServiceSetting};
    use crate::infrastructure::mocks::{MockClock, MockRemoteClient};
    use std::time::Instant;

    fn config() -> AdapterConfig {
        AdapterConfig::new(
            Duration::from_secs(5),
            vec![ServiceSetting::new("catalog", "catalog.endpoints.example.cloud.goog")
                .with_quota(QuotaSetting::new("writes", Duration::from_secs(2)))],
        )
    }

    fn handler(client: &MockRemoteClient, clock: &MockClock) -> ServiceControlHandler {
        ServiceControlHandler::builder()
            .with_config(config())
            .with_client(Arc::new(client.clone()))
            .with_clock(Arc::new(clock.clone()))
            .with_flush_task(false)
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let result = ServiceControlHandler::builder()
            .with_client(Arc::new(MockRemoteClient::new()))
            .with_flush_task(false)
            .build();
        assert!(matches!(result, Err(BuildError::Config(_))));
    }

    #[test]
    fn test_build_requires_client() {
        let result = ServiceControlHandler::builder()
            .with_config(config())
            .with_flush_task(false)
            .build();
        assert!(matches!(result, Err(BuildError::MissingClient)));
    }

    #[test]
    fn test_build_rejects_bad_tunables() {
        let mut processor = ProcessorConfig::default();
        processor.remote_timeout = Duration::ZERO;
        let result = ServiceControlHandler::builder()
            .with_config(config())
            .with_client(Arc::new(MockRemoteClient::new()))
            .with_processor_config(processor)
            .with_flush_task(false)
            .build();
        assert!(matches!(result, Err(BuildError::ZeroRemoteTimeout)));

        let mut processor = ProcessorConfig::default();
        processor.circuit_breaker.failure_threshold = 0;
        let result = ServiceControlHandler::builder()
            .with_config(config())
            .with_client(Arc::new(MockRemoteClient::new()))
            .with_processor_config(processor)
            .with_flush_task(false)
            .build();
        assert!(matches!(result, Err(BuildError::ZeroFailureThreshold)));

        let mut report = ReportConfig::default();
        report.max_batch_size = 0;
        let result = ServiceControlHandler::builder()
            .with_config(config())
            .with_client(Arc::new(MockRemoteClient::new()))
            .with_report_config(report)
            .with_flush_task(false)
            .build();
        assert_eq!(
            result.unwrap_err(),
            BuildError::Report(ReportConfigError::ZeroMaxBatchSize)
        );
    }

    #[tokio::test]
    async fn test_allowed_check_reports_remaining_validity() {
        let client = MockRemoteClient::new();
        let clock = MockClock::new(Instant::now());
        let handler = handler(&client, &clock);

        let first = handler
            .check(CheckInput::new("catalog", "key123", "GetItem"))
            .await;
        assert_eq!(first.status, StatusCode::Ok);
        assert_eq!(first.valid_duration, Duration::from_secs(5));
        assert_eq!(first.source, Some(DecisionSource::Remote));

        clock.advance(Duration::from_secs(3));
        let second = handler
            .check(CheckInput::new("catalog", "key123", "GetItem"))
            .await;
        assert!(second.is_allowed());
        assert_eq!(second.valid_duration, Duration::from_secs(2));
        assert_eq!(second.source, Some(DecisionSource::Cache));
        assert_eq!(client.check_calls(), 1);
    }

    #[tokio::test]
    async fn test_status_codes() {
        let client = MockRemoteClient::new();
        let clock = MockClock::new(Instant::now());
        let handler = handler(&client, &clock);

        let unknown_service = handler.check(CheckInput::new("billing", "k", "Get")).await;
        assert_eq!(unknown_service.status, StatusCode::NotFound);
        assert_eq!(unknown_service.valid_duration, Duration::ZERO);

        let unknown_quota = handler
            .check(CheckInput::new("catalog", "k", "Put").with_quota("reads", 1))
            .await;
        assert_eq!(unknown_quota.status, StatusCode::InvalidArgument);

        client.set_check_response(Ok(CheckResponse::denied("API key not valid")));
        let denied = handler.check(CheckInput::new("catalog", "bad", "Get")).await;
        assert_eq!(denied.status, StatusCode::PermissionDenied);
        assert_eq!(denied.valid_duration, Duration::from_secs(5));
        assert!(denied.message.unwrap().contains("API key not valid"));

        client.set_check_response(Err(RemoteError::Unavailable("down".to_string())));
        let failed = handler.check(CheckInput::new("catalog", "other", "Get")).await;
        assert_eq!(failed.status, StatusCode::Unavailable);
        assert!(!failed.is_allowed());
        assert_eq!(failed.valid_duration, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_quota_grants_and_exhaustion() {
        let client = MockRemoteClient::new();
        let clock = MockClock::new(Instant::now());
        let handler = handler(&client, &clock);

        let granted = handler
            .check(CheckInput::new("catalog", "k", "Put").with_quota("writes", 3))
            .await;
        assert!(granted.is_allowed());
        assert_eq!(granted.quotas.get("writes"), Some(&3));
        assert_eq!(granted.valid_duration, Duration::from_secs(2));

        client.set_quota_response(Ok(AllocateQuotaResponse {
            granted: BTreeMap::new(),
            denials: vec![QuotaDenial {
                name: "writes".to_string(),
                detail: "limit reached".to_string(),
            }],
        }));
        let exhausted = handler
            .check(CheckInput::new("catalog", "k", "Put").with_quota("writes", 5))
            .await;
        assert_eq!(exhausted.status, StatusCode::ResourceExhausted);
    }

    #[tokio::test]
    async fn test_shutdown_without_task_flushes() {
        let client = MockRemoteClient::new();
        let clock = MockClock::new(Instant::now());
        let handler = handler(&client, &clock);

        handler
            .report(
                "catalog",
                &[MetricInstance::new(
                    crate::domain::metric::names::REQUEST_COUNT,
                    crate::domain::metric::MetricValue::Int64(1),
                )],
            )
            .unwrap();
        let summary = handler.shutdown().await.unwrap();
        assert_eq!(summary.value_sets, 1);
        assert_eq!(client.report_calls(), 1);
        assert_eq!(handler.metrics().instances_ingested(), 1);
    }
}
