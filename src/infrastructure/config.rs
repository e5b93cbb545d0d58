//! Loading handler settings from JSON.
//!
//! The document carries the adapter configuration at its top level, next
//! to optional `processor` and `report` sections:
//!
//! ```json
//! {
//!   "runtime_config": { "check_result_expiration": "5s" },
//!   "service_configs": [{
//!     "mesh_service_name": "catalog",
//!     "backend_service_name": "catalog.endpoints.example.cloud.goog",
//!     "quotas": [{ "name": "writes", "expiration": "2s" }]
//!   }],
//!   "processor": { "remote_timeout": "1s" },
//!   "report": { "flush_interval": "10s", "max_retries": 3 }
//! }
//! ```

use crate::application::aggregator::ReportConfig;
use crate::application::processor::ProcessorConfig;
use crate::domain::setting::{AdapterConfig, ConfigErrors};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Everything needed to build a handler, as read from a settings file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HandlerSettings {
    /// Service and quota settings
    #[serde(flatten)]
    pub adapter: AdapterConfig,
    /// Check processor tunables
    #[serde(default)]
    pub processor: ProcessorConfig,
    /// Report aggregation tunables
    #[serde(default)]
    pub report: ReportConfig,
}

/// Error returned when settings cannot be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    /// The file could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The document is not valid JSON or has the wrong shape
    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),
    /// The adapter configuration did not validate
    #[error(transparent)]
    Invalid(#[from] ConfigErrors),
}

/// Parse and validate settings from a JSON string.
///
/// # Errors
/// `ConfigLoadError::Parse` for malformed input, `ConfigLoadError::Invalid`
/// with every validation problem of the adapter configuration.
pub fn parse_settings(input: &str) -> Result<HandlerSettings, ConfigLoadError> {
    let settings: HandlerSettings = serde_json::from_str(input)?;
    settings.adapter.validate()?;
    Ok(settings)
}

/// Read, parse and validate settings from a JSON file.
///
/// # Errors
/// See [`parse_settings`]; additionally `ConfigLoadError::Io` if the file
/// cannot be read.
pub fn load_settings(path: impl AsRef<Path>) -> Result<HandlerSettings, ConfigLoadError> {
    let path = path.as_ref();
    let input = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let settings = parse_settings(&input)?;
    tracing::debug!(
        path = %path.display(),
        services = settings.adapter.service_configs.len(),
        "loaded adapter settings"
    );
    Ok(settings)
}
