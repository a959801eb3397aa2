//! Errors raised while loading or checking a todosync configuration

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file: {0}")]
    FileReadError(String),

    #[error("Cannot write config file: {0}")]
    FileWriteError(String),

    #[error("Config file is not valid TOML: {0}")]
    ParseError(String),

    #[error("Cannot encode config as TOML: {0}")]
    SerializeError(String),

    /// A value could not be decoded (number, flag, key)
    #[error("Bad config value: {0}")]
    InvalidValue(String),

    /// Decoded fine but outside what the sync engine accepts
    #[error("Rejected config: {0}")]
    ValidationFailed(String),
}
