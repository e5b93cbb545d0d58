//! Messages exchanged with the remote service control backend.
//!
//! These are transport-neutral. Wire encoding belongs to the client
//! implementation behind `RemoteServiceClient`.

use crate::domain::distribution::DistributionSnapshot;
use std::collections::BTreeMap;
use std::time::Duration;

/// Error returned by a remote call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// The call did not complete within the configured timeout
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),
    /// Connectivity or server-side availability failure
    #[error("remote service unavailable: {0}")]
    Unavailable(String),
    /// The remote service refused the request itself
    #[error("remote service rejected request ({code}): {message}")]
    Rejected {
        /// Backend status code
        code: String,
        /// Backend message
        message: String,
    },
}

/// Authorization check for one principal and operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRequest {
    /// Backend service name
    pub service_name: String,
    /// Consumer identity, `api_key:<key>`
    pub consumer_id: String,
    /// Operation being invoked
    pub operation_name: String,
}

/// Response to a `CheckRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResponse {
    /// Whether the consumer may invoke the operation
    pub allowed: bool,
    /// Denial detail when not allowed
    pub reason: Option<String>,
}

impl CheckResponse {
    /// Allowing response.
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    /// Denying response.
    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Quota allocation for one principal and operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocateQuotaRequest {
    /// Backend service name
    pub service_name: String,
    /// Consumer identity, `api_key:<key>`
    pub consumer_id: String,
    /// Operation being invoked
    pub operation_name: String,
    /// Quota dimension name to amount
    pub quotas: BTreeMap<String, i64>,
}

/// One quota dimension that could not be allocated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaDenial {
    /// Quota dimension name
    pub name: String,
    /// Detail returned by the backend
    pub detail: String,
}

/// Response to an `AllocateQuotaRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AllocateQuotaResponse {
    /// Granted amounts by dimension
    pub granted: BTreeMap<String, i64>,
    /// Dimensions that were denied
    pub denials: Vec<QuotaDenial>,
}

/// Aggregated value of one metric key.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportedValue {
    /// Summed integer deltas
    Int64(i64),
    /// Summed floating point deltas
    Double(f64),
    /// Histogram of samples
    Distribution(DistributionSnapshot),
}

/// One metric key's aggregate, as sent in a report batch.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricValueSet {
    /// Metric name
    pub metric_name: String,
    /// Dimension values
    pub labels: BTreeMap<String, String>,
    /// Aggregated value
    pub value: ReportedValue,
}

/// A batch of aggregated metrics for one backend service.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRequest {
    /// Backend service name
    pub service_name: String,
    /// Aggregated metrics
    pub metric_value_sets: Vec<MetricValueSet>,
}

/// Consumer identity for an API key principal.
pub fn consumer_id(principal: &str) -> String {
    format!("api_key:{}", principal)
}
