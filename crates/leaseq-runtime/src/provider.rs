//! Provider types and configuration.

use crate::error::ConfigurationError;
use crate::message::{DEFAULT_VISIBILITY_TIMEOUT_SECS, MIN_VISIBILITY_TIMEOUT_SECS};
use crate::providers::file::DEFAULT_LOG_FILE_NAME;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Prefix for configuration environment variables, e.g.
/// `LEASEQ__PROVIDER__BASE_PATH`
pub const ENV_PREFIX: &str = "LEASEQ";

/// Enumeration of supported queue providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderType {
    InMemory,
    File,
    AwsSqs,
}

impl ProviderType {
    /// Whether queue state outlives the process and is visible to others
    pub fn is_shared(&self) -> bool {
        match self {
            Self::InMemory => false,
            Self::File => true,
            Self::AwsSqs => true,
        }
    }
}

/// Configuration for queue client initialization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub provider: ProviderConfig,
    /// Lease length used when a pull does not specify one
    pub default_visibility_timeout_secs: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::File(FileConfig::default()),
            default_visibility_timeout_secs: DEFAULT_VISIBILITY_TIMEOUT_SECS,
        }
    }
}

impl QueueConfig {
    /// Load from built-in defaults, then `path` (YAML, TOML or JSON by
    /// extension), then `LEASEQ__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        Self::load_from(path, None)
    }

    /// As [`load`](Self::load), reading variables from `env` instead of the
    /// process environment when given
    pub fn load_from(
        path: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigurationError> {
        let parsing = |e: config::ConfigError| ConfigurationError::Parsing {
            message: e.to_string(),
        };

        let mut builder = config::Config::builder()
            .set_default("provider.type", "file")
            .map_err(parsing)?
            .set_default(
                "default_visibility_timeout_secs",
                i64::from(DEFAULT_VISIBILITY_TIMEOUT_SECS),
            )
            .map_err(parsing)?;

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: QueueConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .map_err(parsing)?
            .try_deserialize()
            .map_err(parsing)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.default_visibility_timeout_secs < MIN_VISIBILITY_TIMEOUT_SECS {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "default_visibility_timeout_secs must be at least {}",
                    MIN_VISIBILITY_TIMEOUT_SECS
                ),
            });
        }

        match &self.provider {
            ProviderConfig::InMemory => Ok(()),
            ProviderConfig::File(file) => file.validate(),
            ProviderConfig::AwsSqs(sqs) => sqs.validate(),
        }
    }

    pub fn provider_type(&self) -> ProviderType {
        match self.provider {
            ProviderConfig::InMemory => ProviderType::InMemory,
            ProviderConfig::File(_) => ProviderType::File,
            ProviderConfig::AwsSqs(_) => ProviderType::AwsSqs,
        }
    }
}

/// Provider-specific configuration, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfig {
    InMemory,
    File(FileConfig),
    AwsSqs(AwsSqsConfig),
}

/// Durable log configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Directory holding the log file
    pub base_path: PathBuf,
    pub file_name: String,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("."),
            file_name: DEFAULT_LOG_FILE_NAME.to_string(),
        }
    }
}

impl FileConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.base_path.as_os_str().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "provider.base_path".to_string(),
            });
        }
        if self.file_name.is_empty() {
            return Err(ConfigurationError::Missing {
                key: "provider.file_name".to_string(),
            });
        }
        if self.file_name.contains(['/', '\\']) {
            return Err(ConfigurationError::Invalid {
                message: format!("file_name '{}' must not contain a path", self.file_name),
            });
        }
        Ok(())
    }

    /// Full path of the log file
    pub fn log_path(&self) -> PathBuf {
        self.base_path.join(&self.file_name)
    }
}

/// AWS SQS configuration
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct AwsSqsConfig {
    pub region: String,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    /// Override the regional endpoint, e.g. for LocalStack
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl AwsSqsConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.region.is_empty() {
            return Err(ConfigurationError::Missing {
                key: "provider.region".to_string(),
            });
        }
        if self.access_key_id.is_some() != self.secret_access_key.is_some() {
            return Err(ConfigurationError::Invalid {
                message: "access_key_id and secret_access_key must be set together".to_string(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for AwsSqsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsSqsConfig")
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;
