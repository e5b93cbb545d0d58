//! Authorization decisions.

/// Why a check was denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    /// The remote service rejected the principal or operation
    PermissionDenied(String),
    /// At least one quota dimension could not be allocated
    QuotaExhausted {
        /// Name of the first exhausted dimension
        quota: String,
        /// Detail returned by the remote service
        detail: String,
    },
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenialReason::PermissionDenied(detail) => write!(f, "permission denied: {}", detail),
            DenialReason::QuotaExhausted { quota, detail } => {
                write!(f, "quota {} exhausted: {}", quota, detail)
            }
        }
    }
}

/// Outcome of a check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The request may proceed
    Allow,
    /// The request must be rejected
    Deny(DenialReason),
}

/// Amount granted for one quota dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaGrant {
    /// Quota dimension name
    pub name: String,
    /// Amount granted by the remote service
    pub granted: i64,
}

/// A decision as returned to callers and stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckDecision {
    /// Allow or deny
    pub verdict: Verdict,
    /// Quota grants folded in from the allocation, empty for pure checks
    pub quotas: Vec<QuotaGrant>,
}

impl CheckDecision {
    /// Allow with no quota grants.
    pub fn allow() -> Self {
        Self {
            verdict: Verdict::Allow,
            quotas: Vec::new(),
        }
    }

    /// Deny with a reason.
    pub fn deny(reason: DenialReason) -> Self {
        Self {
            verdict: Verdict::Deny(reason),
            quotas: Vec::new(),
        }
    }

    /// Attach quota grants.
    pub fn with_quotas(mut self, quotas: Vec<QuotaGrant>) -> Self {
        self.quotas = quotas;
        self
    }

    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self.verdict, Verdict::Allow)
    }

    /// Denial reason, if denied.
    pub fn denial(&self) -> Option<&DenialReason> {
        match &self.verdict {
            Verdict::Allow => None,
            Verdict::Deny(reason) => Some(reason),
        }
    }
}

/// Where a decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    /// Served from the check cache
    Cache,
    /// Produced by a remote exchange this caller started
    Remote,
    /// Shared from a remote exchange another caller started
    Coalesced,
}
