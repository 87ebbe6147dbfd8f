//! NFS server configuration
//!
//! Configuration is assembled from, in increasing priority:
//! 1. Default values
//! 2. A TOML file
//! 3. Environment variables (`<PREFIX>_LEASE_TIME=45s`, ...)

use std::path::Path;
use std::time::Duration;

use humantime_serde::re::humantime::parse_duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::LoggingConfig;

/// Default number of open/lock states a single client may hold
pub const DEFAULT_MAX_STATES_PER_CLIENT: usize = 16384;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("parse error: {0}")]
    Parse(String),

    /// Validation error
    #[error("validation error: {0}")]
    Validation(String),

    /// Invalid value
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        /// Field name
        field: String,
        /// Error message
        message: String,
    },

    /// Environment variable error
    #[error("environment variable error: {0}")]
    EnvVar(String),
}

/// NFS server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NfsConfig {
    /// Lease time (how long a client's state survives without renewal)
    #[serde(with = "humantime_serde")]
    pub lease_time: Duration,
    /// Grace period (time for clients to reclaim state after server restart)
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
    /// Highest NFSv4 minor version accepted
    pub max_minor_version: u32,
    /// Maximum COMPOUND operations per request
    pub max_compound_ops: u32,
    /// Maximum number of session slots
    pub max_session_slots: u32,
    /// Maximum open/lock states per client
    pub max_states_per_client: usize,
    /// Maximum number of sessions kept in the session lookup cache
    pub session_cache_capacity: u64,
    /// Maximum read size
    pub max_read_size: u32,
    /// Maximum write size
    pub max_write_size: u32,
    /// Server owner major id reported by EXCHANGE_ID
    pub server_owner: String,
    /// Server scope reported by EXCHANGE_ID
    pub server_scope: String,
    /// Logging
    pub logging: LoggingConfig,
}

impl Default for NfsConfig {
    fn default() -> Self {
        Self {
            lease_time: Duration::from_secs(90),
            grace_period: Duration::from_secs(90),
            max_minor_version: 1,
            max_compound_ops: 16,
            max_session_slots: 16,
            max_states_per_client: DEFAULT_MAX_STATES_PER_CLIENT,
            session_cache_capacity: 5000,
            max_read_size: 1024 * 1024,  // 1 MB
            max_write_size: 1024 * 1024, // 1 MB
            server_owner: "nfs4d".to_string(),
            server_scope: "nfs4d".to_string(),
            logging: LoggingConfig::default(),
        }
    }
}

impl NfsConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load a configuration file, then apply `prefix` environment overrides
    pub fn load(path: impl AsRef<Path>, env_prefix: Option<&str>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        if let Some(prefix) = env_prefix {
            config.apply_env_overrides(prefix)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Apply `<prefix>_*` environment variable overrides
    pub fn apply_env_overrides(&mut self, prefix: &str) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var(format!("{prefix}_LEASE_TIME")) {
            self.lease_time = parse_duration(&val)
                .map_err(|_| ConfigError::EnvVar(format!("invalid lease_time value: {val}")))?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_GRACE_PERIOD")) {
            self.grace_period = parse_duration(&val)
                .map_err(|_| ConfigError::EnvVar(format!("invalid grace_period value: {val}")))?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_MAX_SESSION_SLOTS")) {
            self.max_session_slots = val.parse().map_err(|_| {
                ConfigError::EnvVar(format!("invalid max_session_slots value: {val}"))
            })?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_MAX_COMPOUND_OPS")) {
            self.max_compound_ops = val.parse().map_err(|_| {
                ConfigError::EnvVar(format!("invalid max_compound_ops value: {val}"))
            })?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_LOG_LEVEL")) {
            self.logging.level = val.parse()?;
        }
        Ok(())
    }

    /// Reject configurations the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_time.is_zero() {
            return Err(ConfigError::Validation("lease_time must be non-zero".into()));
        }
        if self.max_session_slots == 0 {
            return Err(ConfigError::Validation(
                "max_session_slots must be at least 1".into(),
            ));
        }
        if self.max_compound_ops == 0 {
            return Err(ConfigError::Validation(
                "max_compound_ops must be at least 1".into(),
            ));
        }
        if self.max_minor_version > 1 {
            return Err(ConfigError::InvalidValue {
                field: "max_minor_version".into(),
                message: format!("minor version {} is not implemented", self.max_minor_version),
            });
        }
        Ok(())
    }

    /// Set lease time
    pub fn lease_time(mut self, lease: Duration) -> Self {
        self.lease_time = lease;
        self
    }

    /// Set grace period
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Set maximum session slots
    pub fn max_session_slots(mut self, slots: u32) -> Self {
        self.max_session_slots = slots;
        self
    }

    /// Set maximum states per client
    pub fn max_states_per_client(mut self, max: usize) -> Self {
        self.max_states_per_client = max;
        self
    }
}
