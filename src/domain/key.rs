//! Cache and aggregation keys.
//!
//! A `CheckKey` identifies one class of authorization decisions: the same
//! principal calling the same operation on the same service with the same
//! quota request. A `ReportKey` identifies one aggregation bucket: a metric
//! of a backend service with a fixed set of label values.
//!
//! Keys hold the full identities rather than a digest. Two different
//! principals must never share a cached decision, so a hash collision is not
//! an acceptable failure mode here.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A single quota dimension requested by a check.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QuotaRequest {
    /// Quota dimension name, as configured in `QuotaSetting::name`
    pub name: String,
    /// Amount to allocate
    pub amount: i64,
}

impl QuotaRequest {
    /// Create a quota request.
    pub fn new(name: impl Into<String>, amount: i64) -> Self {
        Self {
            name: name.into(),
            amount,
        }
    }
}

/// Composite key of the check-result cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckKey {
    service: Arc<str>,
    principal: Arc<str>,
    operation: Arc<str>,
    quotas: Arc<[QuotaRequest]>,
}

impl CheckKey {
    /// Build a key. Quota requests are sorted so that request order does not
    /// split the cache.
    pub fn new(
        service: &str,
        principal: &str,
        operation: &str,
        quotas: &[QuotaRequest],
    ) -> Self {
        let mut quotas = quotas.to_vec();
        quotas.sort();
        Self {
            service: Arc::from(service),
            principal: Arc::from(principal),
            operation: Arc::from(operation),
            quotas: Arc::from(quotas),
        }
    }

    /// Key for a pure authorization check (no quota dimensions).
    pub fn simple(service: &str, principal: &str, operation: &str) -> Self {
        Self::new(service, principal, operation, &[])
    }

    /// Local (mesh) service identity.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Principal identity, e.g. an API key.
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Operation identity.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Requested quota dimensions, sorted.
    pub fn quotas(&self) -> &[QuotaRequest] {
        &self.quotas
    }

    /// Whether this key carries quota dimensions.
    pub fn is_quota_bearing(&self) -> bool {
        !self.quotas.is_empty()
    }
}

impl fmt::Display for CheckKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.operation)?;
        for quota in self.quotas.iter() {
            write!(f, " {}={}", quota.name, quota.amount)?;
        }
        Ok(())
    }
}

/// Key of one report accumulator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReportKey {
    service: Arc<str>,
    metric: Arc<str>,
    labels: BTreeMap<String, String>,
}

impl ReportKey {
    /// Build a key. `service` is the backend service name the batch is sent to.
    pub fn new(service: &str, metric: &str, labels: BTreeMap<String, String>) -> Self {
        Self {
            service: Arc::from(service),
            metric: Arc::from(metric),
            labels,
        }
    }

    /// Backend service name.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Metric name.
    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// Label values, sorted by label name.
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }
}

impl fmt::Display for ReportKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service, self.metric)?;
        if !self.labels.is_empty() {
            write!(f, "{{")?;
            for (i, (k, v)) in self.labels.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{}={}", k, v)?;
            }
            write!(f, "}}")?;
        }
        Ok(())
    }
}
