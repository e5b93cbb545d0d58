//! Check processor: cached, coalesced authorization and quota decisions.
//!
//! A check resolves the service settings, serves a fresh cached decision if
//! there is one, and otherwise joins or starts a single remote exchange for
//! its key. The exchange runs in its own task and lives as long as at least
//! one caller waits on it: a caller giving up never cancels work others are
//! waiting on, and the last one giving up aborts the exchange.

use crate::application::cache::{CacheEntry, CheckCache};
use crate::application::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::application::metrics::AdapterMetrics;
use crate::application::ports::{Clock, RemoteServiceClient, Storage};
use crate::application::singleflight::{Flight, Role, SingleFlight};
use crate::domain::decision::{CheckDecision, DecisionSource, DenialReason, QuotaGrant};
use crate::domain::key::{CheckKey, QuotaRequest};
use crate::domain::remote::{consumer_id, AllocateQuotaRequest, CheckRequest, RemoteError};
use crate::domain::setting::ServiceIndex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Why a check could not produce a decision.
///
/// Every error means the request is denied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckError {
    /// The service is not configured
    #[error("unknown service {0:?}")]
    UnknownService(String),
    /// The service has no quota dimension with this name
    #[error("service {service:?} has no quota {quota:?}")]
    UnknownQuota { service: String, quota: String },
    /// A quota was requested with a zero or negative amount
    #[error("quota {quota:?} requested with non-positive amount {amount}")]
    InvalidQuotaAmount { quota: String, amount: i64 },
    /// The remote exchange failed
    #[error("remote exchange failed: {0}")]
    Remote(#[from] RemoteError),
    /// The circuit breaker refused to call the remote service
    #[error("remote service unavailable: circuit breaker open")]
    Unavailable,
    /// The exchange this caller waited on ended without a result
    #[error("remote exchange ended without a result")]
    FlightAbandoned,
}

impl CheckError {
    /// Whether retrying the same check later may succeed.
    ///
    /// Configuration errors are permanent; remote trouble is not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CheckError::Remote(_) | CheckError::Unavailable | CheckError::FlightAbandoned
        )
    }
}

/// Tunables of the check processor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Upper bound on each remote Check or AllocateQuota call
    #[serde(with = "crate::domain::setting::serde_dur")]
    pub remote_timeout: Duration,
    /// Breaker guarding remote calls
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            remote_timeout: Duration::from_secs(5),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// A decision together with where it came from and how long it stays valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    /// The decision
    pub decision: CheckDecision,
    /// Cache, own remote exchange, or a shared one
    pub source: DecisionSource,
    /// Remaining freshness; callers may reuse the decision this long
    pub valid_for: Duration,
}

type FlightOutcome = Result<CacheEntry, CheckError>;

/// Coordinates cache lookups, coalescing and remote exchanges.
#[derive(Debug)]
pub struct CheckProcessor<S>
where
    S: Storage<CheckKey, CacheEntry> + Clone,
{
    inner: Arc<ProcessorInner<S>>,
}

impl<S> Clone for CheckProcessor<S>
where
    S: Storage<CheckKey, CacheEntry> + Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[derive(Debug)]
struct ProcessorInner<S>
where
    S: Storage<CheckKey, CacheEntry> + Clone,
{
    services: ServiceIndex,
    client: Arc<dyn RemoteServiceClient>,
    cache: CheckCache<S>,
    flights: Arc<SingleFlight<CheckKey, FlightOutcome>>,
    circuit_breaker: Arc<CircuitBreaker>,
    clock: Arc<dyn Clock>,
    metrics: AdapterMetrics,
    remote_timeout: Duration,
}

/// A key resolved against the service settings.
struct Resolved {
    key: CheckKey,
    backend_service: String,
    ttl: Duration,
}

impl<S> CheckProcessor<S>
where
    S: Storage<CheckKey, CacheEntry> + Clone + 'static,
{
    /// Create a new check processor.
    ///
    /// # Arguments
    /// * `services` - Validated service settings
    /// * `client` - Remote service client shared by every exchange
    /// * `cache` - Check-result cache (which shares `clock`)
    /// * `circuit_breaker` - Breaker guarding remote calls
    /// * `clock` - Time source for freshness
    /// * `metrics` - Counters
    /// * `remote_timeout` - Bound on each remote call
    pub fn new(
        services: ServiceIndex,
        client: Arc<dyn RemoteServiceClient>,
        cache: CheckCache<S>,
        circuit_breaker: Arc<CircuitBreaker>,
        clock: Arc<dyn Clock>,
        metrics: AdapterMetrics,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ProcessorInner {
                services,
                client,
                cache,
                flights: Arc::new(SingleFlight::new()),
                circuit_breaker,
                clock,
                metrics,
                remote_timeout,
            }),
        }
    }

    /// Decide whether `principal` may invoke `operation` on `service`,
    /// reserving `quotas` if any are requested.
    ///
    /// # Arguments
    /// * `service` - Mesh service name, as configured
    /// * `principal` - Caller identity (API key)
    /// * `operation` - Operation being invoked
    /// * `quotas` - Quota dimensions to allocate, possibly empty
    ///
    /// # Returns
    /// The decision with its source and remaining validity, or an error.
    /// Callers must treat every error as a deny.
    ///
    /// # Fail-Closed Behavior
    /// Remote failures, timeouts and an open circuit breaker all surface as
    /// transient errors. Nothing about them is cached, and the next call
    /// for the same key tries again.
    ///
    /// # Cancellation
    /// Dropping the returned future withdraws this caller from its exchange.
    /// The exchange keeps running while other callers wait on it; once the
    /// last one is gone it is aborted and nothing is cached.
    pub async fn evaluate(
        &self,
        service: &str,
        principal: &str,
        operation: &str,
        quotas: &[QuotaRequest],
    ) -> Result<Evaluation, CheckError> {
        let inner = &self.inner;
        let resolved = inner.resolve(service, principal, operation, quotas)?;

        if let Some((decision, valid_for)) = inner.cache.lookup(&resolved.key) {
            inner.metrics.record_cache_hit();
            tracing::debug!(key = %resolved.key, "check cache hit");
            return Ok(Evaluation {
                decision,
                source: DecisionSource::Cache,
                valid_for,
            });
        }
        inner.metrics.record_cache_miss();

        let key = &resolved.key;
        let role = inner.flights.join(key.clone(), || {
            // A flight may have finished between the lookup above and now.
            if let Some(hit) = inner.cache.lookup(key) {
                return Some(Ok(hit));
            }
            if !inner.circuit_breaker.allow_request() {
                return Some(Err(CheckError::Unavailable));
            }
            None
        });

        let (waiter, source) = match role {
            Role::Ready(Ok((decision, valid_for))) => {
                return Ok(Evaluation {
                    decision,
                    source: DecisionSource::Cache,
                    valid_for,
                });
            }
            Role::Ready(Err(error)) => {
                tracing::warn!(key = %resolved.key, "circuit breaker open, denying check");
                return Err(error);
            }
            Role::Follower(waiter) => {
                inner.metrics.record_coalesced_wait();
                tracing::debug!(key = %resolved.key, "joining in-flight check");
                (waiter, DecisionSource::Coalesced)
            }
            Role::Leader(flight, waiter) => {
                tracing::debug!(key = %resolved.key, "check cache miss, calling remote service");
                let task = self.spawn_exchange(flight, resolved);
                waiter.abort_on_abandon(task.abort_handle());
                (waiter, DecisionSource::Remote)
            }
        };

        let entry = waiter
            .wait()
            .await
            .ok_or(CheckError::FlightAbandoned)??;
        let valid_for = entry
            .remaining(inner.clock.now())
            .unwrap_or(Duration::ZERO);
        Ok(Evaluation {
            decision: entry.decision().clone(),
            source,
            valid_for,
        })
    }

    fn spawn_exchange(
        &self,
        flight: Flight<CheckKey, FlightOutcome>,
        resolved: Resolved,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut guard = BreakerGuard {
                circuit_breaker: &inner.circuit_breaker,
                settled: false,
            };
            let outcome = match inner.exchange(&resolved).await {
                Ok(decision) => {
                    guard.settle(true);
                    let entry = CacheEntry::new(decision, inner.clock.now(), resolved.ttl);
                    inner.cache.store(resolved.key.clone(), entry.clone());
                    Ok(entry)
                }
                Err(error) => {
                    guard.settle(false);
                    inner.metrics.record_remote_failure();
                    tracing::warn!(
                        key = %resolved.key,
                        service = %resolved.backend_service,
                        error = %error,
                        "remote check failed, denying"
                    );
                    Err(error)
                }
            };
            flight.complete(outcome);
        })
    }

    /// Drop the cached decision for `key`. Returns true if one was present.
    pub fn invalidate(&self, key: &CheckKey) -> bool {
        self.inner.cache.invalidate(key)
    }

    /// Number of stored cache entries, fresh or not.
    pub fn cached_entries(&self) -> usize {
        self.inner.cache.len()
    }

    /// Remove cache entries that can no longer be served.
    pub fn purge_expired(&self) -> usize {
        let removed = self.inner.cache.purge_expired();
        if removed > 0 {
            tracing::debug!(removed, "purged expired check results");
        }
        removed
    }

    /// Number of remote exchanges currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.flights.len()
    }

    /// Get the circuit breaker.
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.inner.circuit_breaker
    }

    /// Get the counters.
    pub fn metrics(&self) -> &AdapterMetrics {
        &self.inner.metrics
    }

    /// Get the service settings.
    pub fn services(&self) -> &ServiceIndex {
        &self.inner.services
    }
}

impl<S> ProcessorInner<S>
where
    S: Storage<CheckKey, CacheEntry> + Clone,
{
    fn resolve(
        &self,
        service: &str,
        principal: &str,
        operation: &str,
        quotas: &[QuotaRequest],
    ) -> Result<Resolved, CheckError> {
        let setting = self
            .services
            .get(service)
            .ok_or_else(|| CheckError::UnknownService(service.to_string()))?;

        let mut ttl = self.services.check_result_expiration();
        for request in quotas {
            let quota = setting
                .quota(&request.name)
                .ok_or_else(|| CheckError::UnknownQuota {
                    service: service.to_string(),
                    quota: request.name.clone(),
                })?;
            if request.amount <= 0 {
                return Err(CheckError::InvalidQuotaAmount {
                    quota: request.name.clone(),
                    amount: request.amount,
                });
            }
            ttl = ttl.min(quota.expiration);
        }

        Ok(Resolved {
            key: CheckKey::new(service, principal, operation, quotas),
            backend_service: setting.backend_service_name.clone(),
            ttl,
        })
    }

    /// Check, then allocate quota if the check allowed and quota was asked for.
    async fn exchange(&self, resolved: &Resolved) -> Result<CheckDecision, CheckError> {
        let key = &resolved.key;
        let consumer = consumer_id(key.principal());

        self.metrics.record_remote_check();
        let response = self
            .bounded(self.client.check(CheckRequest {
                service_name: resolved.backend_service.clone(),
                consumer_id: consumer.clone(),
                operation_name: key.operation().to_string(),
            }))
            .await?;

        if !response.allowed {
            self.metrics.record_denial();
            let detail = response
                .reason
                .unwrap_or_else(|| "denied by remote service".to_string());
            return Ok(CheckDecision::deny(DenialReason::PermissionDenied(detail)));
        }

        if !key.is_quota_bearing() {
            return Ok(CheckDecision::allow());
        }

        let mut amounts = BTreeMap::new();
        for request in key.quotas() {
            let amount: &mut i64 = amounts.entry(request.name.clone()).or_insert(0);
            *amount = amount.saturating_add(request.amount);
        }

        self.metrics.record_quota_allocation();
        let allocation = self
            .bounded(self.client.allocate_quota(AllocateQuotaRequest {
                service_name: resolved.backend_service.clone(),
                consumer_id: consumer,
                operation_name: key.operation().to_string(),
                quotas: amounts,
            }))
            .await?;

        if let Some(denial) = allocation.denials.into_iter().next() {
            self.metrics.record_denial();
            return Ok(CheckDecision::deny(DenialReason::QuotaExhausted {
                quota: denial.name,
                detail: denial.detail,
            }));
        }

        let grants = allocation
            .granted
            .into_iter()
            .map(|(name, granted)| QuotaGrant { name, granted })
            .collect();
        Ok(CheckDecision::allow().with_quotas(grants))
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        tokio::time::timeout(self.remote_timeout, call)
            .await
            .unwrap_or(Err(RemoteError::Timeout(self.remote_timeout)))
    }
}

/// Reports the exchange outcome to the breaker.
///
/// An exchange that ends without an outcome (aborted, panicked, runtime shut
/// down) counts as a failure only while the breaker is half-open, so the
/// trial call always resolves and abandoned calls never trip a closed breaker.
struct BreakerGuard<'a> {
    circuit_breaker: &'a CircuitBreaker,
    settled: bool,
}

impl BreakerGuard<'_> {
    fn settle(&mut self, success: bool) {
        self.settled = true;
        if success {
            self.circuit_breaker.record_success();
        } else {
            self.circuit_breaker.record_failure();
        }
    }
}

impl Drop for BreakerGuard<'_> {
    fn drop(&mut self) {
        if !self.settled && self.circuit_breaker.state() == CircuitState::HalfOpen {
            self.circuit_breaker.record_failure();
        }
    }
}
