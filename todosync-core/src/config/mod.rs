//! Configuration management for todosync
//!
//! Defaults, TOML files and `TODOSYNC_<SECTION>_<KEY>` environment overrides.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

mod error;

pub use error::ConfigError;

use crate::core_crypto::{self, PublicKey};

/// Smallest RSA modulus accepted for device and server keys
pub const MIN_RSA_KEY_BITS: usize = 1024;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Who this device is
    pub identity: IdentityConfig,

    /// The relay server
    pub server: ServerConfig,

    pub crypto: CryptoConfig,

    /// Protocol engine tuning
    pub sync: SyncConfig,

    pub logging: LoggingConfig,

    pub metrics: MetricsConfig,
}

/// Device identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Account email, used as the peer identifier on the wire
    pub email: String,

    /// Push-notification token of this device
    pub token: String,
}

/// Relay server endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Upstream address handed to the transport
    pub address: String,

    /// Server public key, base64 SPKI DER
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// RSA modulus size for the device identity key
    pub rsa_key_bits: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long a server request may stay unanswered
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Keep waiting for server responses indefinitely
    pub wait_forever: bool,

    /// How long an update may sit in a pending buffer before it is discarded
    #[serde(with = "humantime_serde")]
    pub pending_max_age: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    pub json_format: bool,

    pub with_timestamp: bool,

    pub with_target: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Describe and record sync metrics
    pub enabled: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self { email: "me@example.com".to_string(), token: String::new() }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { address: "relay.todosync.local".to_string(), public_key: None }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self { rsa_key_bits: 2048 }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            wait_forever: false,
            pending_max_age: Duration::from_secs(300),
        }
    }
}

impl SyncConfig {
    /// Timeout applied to waiting requests, `None` when disabled
    pub fn effective_timeout(&self) -> Option<Duration> {
        if self.wait_forever {
            None
        } else {
            Some(self.request_timeout)
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Variables follow the pattern `TODOSYNC_<SECTION>_<KEY>`, for example
    /// `TODOSYNC_IDENTITY_EMAIL=alice@example.com`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(email) = env::var("TODOSYNC_IDENTITY_EMAIL") {
            config.identity.email = email;
        }
        if let Ok(token) = env::var("TODOSYNC_IDENTITY_TOKEN") {
            config.identity.token = token;
        }

        if let Ok(address) = env::var("TODOSYNC_SERVER_ADDRESS") {
            config.server.address = address;
        }
        if let Ok(key) = env::var("TODOSYNC_SERVER_PUBLIC_KEY") {
            config.server.public_key = Some(key);
        }

        if let Ok(bits) = env::var("TODOSYNC_CRYPTO_RSA_KEY_BITS") {
            config.crypto.rsa_key_bits = bits
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid RSA key size: {}", e)))?;
        }

        if let Ok(secs) = env::var("TODOSYNC_SYNC_REQUEST_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|e| {
                ConfigError::InvalidValue(format!("Invalid request timeout: {}", e))
            })?;
            config.sync.request_timeout = Duration::from_secs(secs);
        }
        if let Ok(wait) = env::var("TODOSYNC_SYNC_WAIT_FOREVER") {
            config.sync.wait_forever = wait
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid wait flag: {}", e)))?;
        }

        if let Ok(secs) = env::var("TODOSYNC_SYNC_PENDING_MAX_AGE_SECS") {
            let secs: u64 = secs.parse().map_err(|e| {
                ConfigError::InvalidValue(format!("Invalid pending max age: {}", e))
            })?;
            config.sync.pending_max_age = Duration::from_secs(secs);
        }

        if let Ok(level) = env::var("TODOSYNC_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(json) = env::var("TODOSYNC_LOG_JSON") {
            config.logging.json_format = json
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid JSON flag: {}", e)))?;
        }

        if let Ok(enabled) = env::var("TODOSYNC_METRICS_ENABLED") {
            config.metrics.enabled = enabled
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid metrics flag: {}", e)))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.identity.email.contains('@') {
            return Err(ConfigError::ValidationFailed(format!(
                "identity.email is not an email address: {}",
                self.identity.email
            )));
        }

        if self.server.address.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "server.address must not be empty".to_string(),
            ));
        }

        if self.server.public_key.is_some() {
            self.server_public_key()?;
        }

        if self.crypto.rsa_key_bits < MIN_RSA_KEY_BITS {
            return Err(ConfigError::ValidationFailed(format!(
                "rsa_key_bits must be at least {}",
                MIN_RSA_KEY_BITS
            )));
        }

        if !self.sync.wait_forever && self.sync.request_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "request_timeout must be greater than 0".to_string(),
            ));
        }

        if self.sync.pending_max_age.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "pending_max_age must be greater than 0".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Decode the configured server key, `None` if not set
    pub fn server_public_key(&self) -> Result<Option<PublicKey>, ConfigError> {
        self.server
            .public_key
            .as_deref()
            .map(|encoded| {
                core_crypto::string_to_public_key(encoded)
                    .map_err(|e| ConfigError::InvalidValue(format!("server.public_key: {}", e)))
            })
            .transpose()
    }

    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))?;

        Ok(())
    }
}
