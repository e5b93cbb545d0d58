//! Static service and quota settings.
//!
//! Settings are loaded once, validated, and then shared read-only by every
//! request through a `ServiceIndex`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// One configuration problem.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// `runtime_config.check_result_expiration` missing or zero
    #[error("expect positive check_result_expiration, but got {0:?}")]
    NonPositiveCheckResultExpiration(Duration),
    /// No service settings at all
    #[error("service_configs is empty")]
    NoServices,
    /// A service setting without a mesh or backend name
    #[error("service #{0}: mesh_service_name and backend_service_name must be non-empty")]
    EmptyServiceName(usize),
    /// Two settings for the same mesh service
    #[error("duplicate mesh service name {0:?}")]
    DuplicateService(String),
    /// A quota setting without a name
    #[error("service {0:?}: quota name is empty")]
    EmptyQuotaName(String),
    /// A quota setting without a positive expiration
    #[error("service {service:?}: quota {quota:?} must have positive expiration, but got {expiration:?}")]
    NonPositiveQuotaExpiration {
        service: String,
        quota: String,
        expiration: Duration,
    },
    /// Two quota settings with the same name in one service
    #[error("service {service:?}: duplicate quota {quota:?}")]
    DuplicateQuota { service: String, quota: String },
}

/// Every problem found while validating a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid configuration: {}", join(.0))]
pub struct ConfigErrors(pub Vec<ConfigError>);

fn join(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ConfigErrors {
    /// The individual errors.
    pub fn errors(&self) -> &[ConfigError] {
        &self.0
    }
}

/// Global runtime knobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Maximum age of a cached authorization decision
    #[serde(default, with = "serde_dur")]
    pub check_result_expiration: Duration,
}

/// One quota dimension of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSetting {
    /// Quota dimension name
    pub name: String,
    /// Maximum age of a cached decision carrying this quota
    #[serde(default, with = "serde_dur")]
    pub expiration: Duration,
}

impl QuotaSetting {
    /// Create a quota setting.
    pub fn new(name: impl Into<String>, expiration: Duration) -> Self {
        Self {
            name: name.into(),
            expiration,
        }
    }
}

/// Mapping of one protected service to its backend identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSetting {
    /// Local service identity used by the request pipeline
    pub mesh_service_name: String,
    /// Service name known to the remote backend
    pub backend_service_name: String,
    /// Quota dimensions of this service
    #[serde(default)]
    pub quotas: Vec<QuotaSetting>,
}

impl ServiceSetting {
    /// Create a service setting without quotas.
    pub fn new(mesh_service_name: impl Into<String>, backend_service_name: impl Into<String>) -> Self {
        Self {
            mesh_service_name: mesh_service_name.into(),
            backend_service_name: backend_service_name.into(),
            quotas: Vec::new(),
        }
    }

    /// Add a quota dimension.
    pub fn with_quota(mut self, quota: QuotaSetting) -> Self {
        self.quotas.push(quota);
        self
    }

    /// Look up a quota dimension by name.
    pub fn quota(&self, name: &str) -> Option<&QuotaSetting> {
        self.quotas.iter().find(|q| q.name == name)
    }
}

/// Adapter configuration as loaded from the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Global runtime knobs
    #[serde(default)]
    pub runtime_config: RuntimeConfig,
    /// Protected services
    #[serde(default)]
    pub service_configs: Vec<ServiceSetting>,
}

impl AdapterConfig {
    /// Create a configuration.
    pub fn new(check_result_expiration: Duration, service_configs: Vec<ServiceSetting>) -> Self {
        Self {
            runtime_config: RuntimeConfig {
                check_result_expiration,
            },
            service_configs,
        }
    }

    /// Collect every problem with this configuration.
    ///
    /// # Errors
    /// Returns all errors found, not only the first.
    pub fn validate(&self) -> Result<(), ConfigErrors> {
        let mut errors = Vec::new();

        let expiration = self.runtime_config.check_result_expiration;
        if expiration.is_zero() {
            errors.push(ConfigError::NonPositiveCheckResultExpiration(expiration));
        }

        if self.service_configs.is_empty() {
            errors.push(ConfigError::NoServices);
        }

        let mut seen_services = std::collections::HashSet::new();
        for (index, setting) in self.service_configs.iter().enumerate() {
            if setting.mesh_service_name.is_empty() || setting.backend_service_name.is_empty() {
                errors.push(ConfigError::EmptyServiceName(index));
            } else if !seen_services.insert(setting.mesh_service_name.as_str()) {
                errors.push(ConfigError::DuplicateService(
                    setting.mesh_service_name.clone(),
                ));
            }

            let mut seen_quotas = std::collections::HashSet::new();
            for quota in &setting.quotas {
                if quota.name.is_empty() {
                    errors.push(ConfigError::EmptyQuotaName(
                        setting.mesh_service_name.clone(),
                    ));
                } else if !seen_quotas.insert(quota.name.as_str()) {
                    errors.push(ConfigError::DuplicateQuota {
                        service: setting.mesh_service_name.clone(),
                        quota: quota.name.clone(),
                    });
                }
                if quota.expiration.is_zero() {
                    errors.push(ConfigError::NonPositiveQuotaExpiration {
                        service: setting.mesh_service_name.clone(),
                        quota: quota.name.clone(),
                        expiration: quota.expiration,
                    });
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigErrors(errors))
        }
    }
}

/// Read-only lookup of service settings by mesh service name.
#[derive(Debug, Clone)]
pub struct ServiceIndex {
    services: Arc<HashMap<String, Arc<ServiceSetting>>>,
    check_result_expiration: Duration,
}

impl ServiceIndex {
    /// Validate a configuration and index it.
    ///
    /// # Errors
    /// Returns every validation error of `config`.
    pub fn from_config(config: &AdapterConfig) -> Result<Self, ConfigErrors> {
        config.validate()?;
        let services = config
            .service_configs
            .iter()
            .map(|s| (s.mesh_service_name.clone(), Arc::new(s.clone())))
            .collect();
        Ok(Self {
            services: Arc::new(services),
            check_result_expiration: config.runtime_config.check_result_expiration,
        })
    }

    /// Look up a service. Never falls back to a default.
    pub fn get(&self, mesh_service_name: &str) -> Option<&Arc<ServiceSetting>> {
        self.services.get(mesh_service_name)
    }

    /// Global decision TTL.
    pub fn check_result_expiration(&self) -> Duration {
        self.check_result_expiration
    }

    /// Number of configured services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether no services are configured.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Parse a duration written as a sequence of `<integer><unit>` parts,
/// e.g. `"5s"`, `"250ms"`, `"1m30s"`. Units: `ns`, `us`, `ms`, `s`, `m`, `h`.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("empty duration".to_string());
    }

    let invalid = || format!("invalid duration {:?}", input);
    let mut total = Duration::ZERO;
    let mut rest = trimmed;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits == 0 {
            return Err(invalid());
        }
        let value: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ns" => Duration::from_nanos(value),
            "us" | "µs" => Duration::from_micros(value),
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.checked_mul(60).ok_or_else(invalid)?),
            "h" => Duration::from_secs(value.checked_mul(3600).ok_or_else(invalid)?),
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];
        total = total.checked_add(part).ok_or_else(invalid)?;
    }
    Ok(total)
}

/// Format a duration in the form accepted by `parse_duration`.
pub fn format_duration(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        format!("{}s", duration.as_secs())
    } else if duration.subsec_nanos() % 1_000_000 == 0 {
        format!("{}ms", duration.as_millis())
    } else {
        format!("{}ns", duration.as_nanos())
    }
}

pub(crate) mod serde_dur {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(de::Error::custom)
    }
}
