//! Configuration file parsing
//!
//! Parses TOML configuration files describing the listening socket and
//! the backend chain, plus the helpers modules use to interpret their
//! `key=value` parameters.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("unknown parameter '{0}'")]
    UnknownKey(String),

    #[error("invalid value for '{key}': '{value}' ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("required parameter '{0}' is missing")]
    MissingKey(String),

    #[error("this plugin does not need any parameters (got '{key}')")]
    NoParameters { key: String },

    #[error("parameter '{value}' has no key and the plugin has no magic config key")]
    NoMagicKey { value: String },
}

impl ConfigError {
    pub fn invalid_value(key: &str, value: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result of delivering one configuration step to a module
pub type ConfigResult = Result<(), ConfigError>;

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Backend chain
    pub chain: ChainConfig,
}

/// Server settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Export name announced to clients
    #[serde(default)]
    pub export_name: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Open every connection read-only
    #[serde(default)]
    pub readonly: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            export_name: String::new(),
            log_level: default_log_level(),
            readonly: false,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:10809".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Backend chain description
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// Plugin at the bottom of the chain
    pub plugin: String,

    /// Filters, outermost first
    #[serde(default)]
    pub filters: Vec<String>,

    /// `key=value` parameters, or bare values for the plugin's magic key
    #[serde(default)]
    pub params: Vec<String>,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> ConfigResult {
        if self.chain.plugin.trim().is_empty() {
            return Err(ConfigError::Invalid("chain.plugin must not be empty".to_string()));
        }
        if let Some(filter) = self.chain.filters.iter().find(|f| f.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "empty filter name in chain.filters: {:?}",
                filter
            )));
        }
        for param in &self.chain.params {
            parse_param(param)?;
        }
        Ok(())
    }
}

/// Split a command-line style parameter into key and value.
///
/// `key=value` yields `(Some(key), value)`; a parameter without `=`
/// is a bare value meant for the plugin's magic config key.
pub fn parse_param(param: &str) -> Result<(Option<&str>, &str), ConfigError> {
    if param.is_empty() {
        return Err(ConfigError::Invalid("empty parameter".to_string()));
    }
    match param.split_once('=') {
        Some(("", _)) => Err(ConfigError::Invalid(format!(
            "parameter '{}' has an empty key",
            param
        ))),
        Some((key, value)) => Ok((Some(key), value)),
        None => Ok((None, param)),
    }
}

/// Parse a size such as `512`, `64M`, `1G` or `2048s` (512-byte sectors).
pub fn parse_size(key: &str, value: &str) -> Result<u64, ConfigError> {
    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);
    if digits.is_empty() {
        return Err(ConfigError::invalid_value(key, value, "expected a number"));
    }

    let number: u64 = digits
        .parse()
        .map_err(|e: std::num::ParseIntError| ConfigError::invalid_value(key, value, e.to_string()))?;
    let shift = match suffix {
        "" | "b" | "B" => 0,
        "s" | "S" => 9,
        "k" | "K" => 10,
        "m" | "M" => 20,
        "g" | "G" => 30,
        "t" | "T" => 40,
        "p" | "P" => 50,
        "e" | "E" => 60,
        _ => return Err(ConfigError::invalid_value(key, value, "unknown size suffix")),
    };

    number
        .checked_mul(1u64 << shift)
        .filter(|size| *size <= i64::MAX as u64)
        .ok_or_else(|| ConfigError::invalid_value(key, value, "size is too large"))
}

/// Parse a boolean such as `true`, `on`, `1`, `no`.
pub fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid_value(key, value, "expected a boolean")),
    }
}
