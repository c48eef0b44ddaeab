//! Server configuration.
//!
//! Settings are layered: built-in defaults, then an optional YAML file,
//! then `TESSERA_`-prefixed environment variables with `__` between
//! section and key (`TESSERA_STORAGE__URL` sets `storage.url`).

use std::path::Path;

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::observability::parse_level;

/// Longest accepted pagination nonce lifetime, one day.
pub const MAX_TOKEN_VALIDITY_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub storage: BackendSettings,
    pub permission: BackendSettings,
    pub cache: CacheSettings,
    pub pagination: PaginationSettings,
    pub logging: LoggingSettings,
}

/// Connection settings of a storage or permission backend.
///
/// The scheme of `url` selects the backend. Pool settings only reach
/// PostgreSQL connection strings, and query parameters already present in
/// `url` win over them.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BackendSettings {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
    pub query_timeout_secs: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            url: MEMORY_DSN.to_string(),
            max_connections: 10,
            connect_timeout_secs: 5,
            query_timeout_secs: 30,
        }
    }
}

const MEMORY_DSN: &str = "memory:";

/// Backend holding pagination nonces.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CacheSettings {
    pub url: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            url: MEMORY_DSN.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PaginationSettings {
    /// Upper bound applied to `_limit`.
    pub max_limit: usize,
    /// Lifetime of a pagination nonce.
    pub token_validity_secs: u64,
}

impl Default for PaginationSettings {
    fn default() -> Self {
        Self {
            max_limit: 10_000,
            token_validity_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default level when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
    /// Emit an event when a span closes.
    pub spans: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            spans: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ConfigError),

    #[error("configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigLoadError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

impl ServerConfig {
    /// Loads `path` over the defaults, then applies the environment.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigLoadError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigLoadError::FileNotFound {
                path: path.display().to_string(),
            });
        }
        Self::layered(Some(path))
    }

    /// Applies the environment over the defaults.
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        Self::layered(None)
    }

    fn layered(file: Option<&Path>) -> Result<Self, ConfigLoadError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);
        if let Some(file) = file {
            builder = builder.add_source(File::from(file).format(FileFormat::Yaml));
        }
        let config: Self = builder
            .add_source(
                Environment::with_prefix("TESSERA")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        self.storage.validate("storage")?;
        self.permission.validate("permission")?;
        validate_dsn("cache.url", &self.cache.url)?;

        let pagination = &self.pagination;
        if pagination.max_limit == 0 {
            return Err(ConfigLoadError::invalid(
                "pagination.max_limit must be greater than 0",
            ));
        }
        if !(1..=MAX_TOKEN_VALIDITY_SECS).contains(&pagination.token_validity_secs) {
            return Err(ConfigLoadError::invalid(format!(
                "pagination.token_validity_secs must be between 1 and {MAX_TOKEN_VALIDITY_SECS}, got {}",
                pagination.token_validity_secs
            )));
        }

        parse_level(&self.logging.level)?;
        Ok(())
    }
}

impl BackendSettings {
    fn validate(&self, section: &str) -> Result<(), ConfigLoadError> {
        validate_dsn(&format!("{section}.url"), &self.url)?;
        if self.max_connections == 0 {
            return Err(ConfigLoadError::invalid(format!(
                "{section}.max_connections must be greater than 0"
            )));
        }
        Ok(())
    }
}

fn validate_dsn(key: &str, dsn: &str) -> Result<(), ConfigLoadError> {
    if dsn.trim().is_empty() {
        return Err(ConfigLoadError::invalid(format!("{key} is required")));
    }
    Url::parse(dsn)
        .map(drop)
        .map_err(|e| ConfigLoadError::invalid(format!("{key} is not a connection string: {e}")))
}
