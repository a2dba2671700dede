//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub instance: InstanceConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
    /// Maximum pooled connections
    pub max_connections: u32,
    /// Driver-level busy timeout in milliseconds.
    ///
    /// Defaults to 0 so that busy errors surface immediately and the
    /// executor's own backoff decides how long to wait.
    pub sqlite_busy_timeout_ms: u64,
    /// First busy backoff delay in milliseconds; doubles per attempt
    pub busy_backoff_base_ms: u64,
    /// Give up once the next backoff would reach this many milliseconds
    pub busy_backoff_ceiling_ms: u64,
}

impl DatabaseConfig {
    pub fn busy_backoff_base(&self) -> Duration {
        Duration::from_millis(self.busy_backoff_base_ms)
    }

    pub fn busy_backoff_ceiling(&self) -> Duration {
        Duration::from_millis(self.busy_backoff_ceiling_ms)
    }
}

/// Instance identity and federation policy
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    /// Host this instance is served on (e.g., "social.example.com")
    pub host: String,
    /// Optional separate domain used in account handles
    pub account_domain: Option<String>,
    /// "blocklist" (default) or "allowlist"
    pub federation_mode: String,
}

impl InstanceConfig {
    /// Parse the configured federation mode
    ///
    /// # Errors
    /// Returns `AppError::Config` for anything but blocklist/allowlist.
    /// Never falls back to a default.
    pub fn federation_mode(&self) -> Result<FederationMode, AppError> {
        self.federation_mode.parse()
    }
}

/// Whether unknown domains default to allowed or blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FederationMode {
    /// Everything federates unless explicitly blocked; allows override blocks
    Blocklist,
    /// Nothing federates unless explicitly allowed; blocks override allows
    Allowlist,
}

impl FromStr for FederationMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blocklist" => Ok(Self::Blocklist),
            "allowlist" => Ok(Self::Allowlist),
            other => Err(AppError::Config(format!(
                "unrecognized instance.federation_mode: {:?}",
                other
            ))),
        }
    }
}

/// Cache capacities (entries per cache)
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub account_max_items: usize,
    pub status_max_items: usize,
    pub conversation_max_items: usize,
    pub conversation_ids_max_items: u64,
    pub marker_max_items: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            account_max_items: 2000,
            status_max_items: 2000,
            conversation_max_items: 1000,
            conversation_ids_max_items: 500,
            marker_max_items: 500,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FEDISTORE__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, AppError> {
        use config::{Config, Environment, File};

        let defaults = CacheConfig::default();
        let config = Config::builder()
            .set_default("database.path", "data/fedistore.db")?
            .set_default("database.max_connections", 8)?
            .set_default("database.sqlite_busy_timeout_ms", 0)?
            .set_default("database.busy_backoff_base_ms", 2)?
            .set_default("database.busy_backoff_ceiling_ms", 300_000)?
            .set_default("instance.host", "localhost")?
            .set_default("instance.federation_mode", "blocklist")?
            .set_default("cache.account_max_items", defaults.account_max_items as i64)?
            .set_default("cache.status_max_items", defaults.status_max_items as i64)?
            .set_default(
                "cache.conversation_max_items",
                defaults.conversation_max_items as i64,
            )?
            .set_default(
                "cache.conversation_ids_max_items",
                defaults.conversation_ids_max_items as i64,
            )?
            .set_default("cache.marker_max_items", defaults.marker_max_items as i64)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("FEDISTORE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let app_config: Self = config.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub(crate) fn validate(&self) -> Result<(), AppError> {
        self.instance.federation_mode()?;

        if self.instance.host.trim().is_empty() {
            return Err(AppError::Config("instance.host must not be empty".to_string()));
        }

        if self.database.max_connections == 0 {
            return Err(AppError::Config(
                "database.max_connections must be greater than 0".to_string(),
            ));
        }

        if self.database.busy_backoff_base_ms == 0
            || self.database.busy_backoff_ceiling_ms <= self.database.busy_backoff_base_ms
        {
            return Err(AppError::Config(
                "database.busy_backoff_ceiling_ms must exceed a non-zero busy_backoff_base_ms"
                    .to_string(),
            ));
        }

        Ok(())
    }
}
