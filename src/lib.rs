//! # service-control-adapter
//!
//! Check caching and report aggregation in front of a remote service
//! control backend.
//!
//! A policy-enforcement pipeline asks one question per request ("may this
//! principal call this operation, and can it have this much quota?") and
//! emits telemetry for every request. Forwarding either stream one-to-one
//! would put the backend on the hot path of every call. This crate turns
//! both into low-frequency remote traffic:
//!
//! - **Checks** are answered from a cache of recent decisions. Identical
//!   misses that arrive together share one remote exchange.
//! - **Reports** are folded into per-metric accumulators (sums and
//!   histograms) and sent in batches by a background task.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use service_control_adapter::{
//!     AdapterConfig, CheckInput, QuotaSetting, RemoteServiceClient, ServiceControlHandler,
//!     ServiceSetting,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example(client: Arc<dyn RemoteServiceClient>) {
//! let config = AdapterConfig::new(
//!     Duration::from_secs(5),
//!     vec![ServiceSetting::new("catalog", "catalog.endpoints.example.cloud.goog")
//!         .with_quota(QuotaSetting::new("writes", Duration::from_secs(2)))],
//! );
//!
//! let handler = ServiceControlHandler::builder()
//!     .with_config(config)
//!     .with_client(client)
//!     .build()
//!     .expect("valid configuration");
//!
//! let result = handler
//!     .check(CheckInput::new("catalog", "key123", "GetItem").with_quota("writes", 1))
//!     .await;
//! if !result.is_allowed() {
//!     println!("denied: {:?} {:?}", result.status, result.message);
//! }
//!
//! // Stop the flush task and send what is still pending
//! handler.shutdown().await.expect("flush task stopped");
//! # }
//! ```
//!
//! ## Check Semantics
//!
//! - A cached decision is served only while `now - acquired_at < ttl`.
//!   The TTL is the service's `check_result_expiration`, shortened to the
//!   smallest expiration of any quota the check requested.
//! - Remote denials are cached like grants. Remote failures, timeouts and
//!   an open circuit breaker are never cached and always deny.
//! - The requested quota set is part of the cache key, so a decision for
//!   one amount is never served to a request for another.
//!
//! ## Report Semantics
//!
//! Instances are aggregated per (backend service, metric, label set).
//! Counters sum their deltas; distributions count samples into fixed
//! buckets with underflow and overflow buckets at either end. A batch that
//! still fails after the configured retries is dropped and logged at ERROR.
//!
//! ## Observability
//!
//! ```rust,no_run
//! # use service_control_adapter::ServiceControlHandler;
//! # fn example(handler: &ServiceControlHandler) {
//! let snapshot = handler.metrics().snapshot();
//! println!("cache hit rate: {:.2}%", snapshot.cache_hit_rate() * 100.0);
//! println!("batches dropped: {}", snapshot.batches_dropped);
//! # }
//! ```

// Domain layer - pure data and algorithms
pub mod domain;

// Application layer - orchestration
pub mod application;

// Infrastructure layer - adapters and wiring
pub mod infrastructure;

// Re-export commonly used types for convenience
pub use domain::{
    decision::{CheckDecision, DecisionSource, DenialReason, QuotaGrant, Verdict},
    distribution::{BucketError, BucketSpec, DistributionBuilder, DistributionSnapshot},
    key::{CheckKey, QuotaRequest, ReportKey},
    metric::{MetricCatalog, MetricDescriptor, MetricInstance, MetricKind, MetricValue},
    remote::RemoteError,
    setting::{
        AdapterConfig, ConfigError, ConfigErrors, QuotaSetting, RuntimeConfig, ServiceIndex,
        ServiceSetting,
    },
};

pub use application::{
    aggregator::{
        FlushSummary, IngestError, IngestOutcome, InstanceError, ReportBuilder, ReportConfig,
        ReportConfigError,
    },
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState},
    metrics::{AdapterMetrics, MetricsSnapshot},
    ports::{Clock, RemoteServiceClient, Storage},
    processor::{CheckError, CheckProcessor, Evaluation, ProcessorConfig},
    scheduler::{start_flush_task, FlushHandle, ShutdownError},
};

pub use infrastructure::{
    clock::SystemClock,
    config::{load_settings, parse_settings, ConfigLoadError, HandlerSettings},
    handler::{
        BuildError, CheckInput, CheckResult, ServiceControlHandler, ServiceControlHandlerBuilder,
        StatusCode,
    },
    storage::ShardedStorage,
};
