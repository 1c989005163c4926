//! Coordinator configuration.
//!
//! Loaded from YAML files and environment variables, layered the usual way:
//! later sources override earlier ones.

mod locator;

pub use locator::{parse_query_string, MediatorUrl, BACKUP_KEY};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "txchain.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "TXCHAIN_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "TXCHAIN";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "TXCHAIN_LOG";

/// Default lease after which an unfinished transaction is rolled back.
pub const DEFAULT_LEASE_TTL_SECS: u64 = 600;
/// Default interval between lease sweeps.
pub const DEFAULT_LEASE_INTERVAL_SECS: u64 = 60;

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(String),

    #[error("mediator locator is required")]
    MissingMediator,

    #[error("group is required")]
    MissingGroup,

    #[error("peer is required")]
    MissingPeer,

    #[error("Invalid mediator locator '{locator}': {reason}")]
    InvalidLocator { locator: String, reason: String },

    #[error("Unsupported mediator scheme: {0}")]
    UnsupportedScheme(String),
}

impl From<::config::ConfigError> for ConfigError {
    fn from(e: ::config::ConfigError) -> Self {
        ConfigError::Load(e.to_string())
    }
}

/// Lease policy for abandoned transactions.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Age after which a transaction is expired. 0 disables expiry.
    pub ttl_secs: u64,
    /// How often to sweep.
    pub interval_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_LEASE_TTL_SECS,
            interval_secs: DEFAULT_LEASE_INTERVAL_SECS,
        }
    }
}

impl LeaseConfig {
    pub fn enabled(&self) -> bool {
        self.ttl_secs > 0
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TxConfig {
    /// Coordination service locator, e.g. `nats://user:pw@host:4222?backup=host2:4222`.
    pub mediator: String,
    /// Logical service group of this process.
    pub group: String,
    /// Address identifying this process within its group.
    pub peer: String,
    pub lease: LeaseConfig,
}

impl TxConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `txchain.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: TxConfig = config.try_deserialize()?;
        Ok(config)
    }

    /// Create a standalone config with an in-memory coordination store.
    pub fn standalone(group: impl Into<String>, peer: impl Into<String>) -> Self {
        Self {
            mediator: "memory://local".to_string(),
            group: group.into(),
            peer: peer.into(),
            lease: LeaseConfig::default(),
        }
    }

    /// Check required fields and parse the locator.
    pub fn validate(&self) -> Result<MediatorUrl, ConfigError> {
        if self.mediator.trim().is_empty() {
            return Err(ConfigError::MissingMediator);
        }
        if self.group.trim().is_empty() {
            return Err(ConfigError::MissingGroup);
        }
        if self.peer.trim().is_empty() {
            return Err(ConfigError::MissingPeer);
        }
        MediatorUrl::parse(&self.mediator)
    }
}
