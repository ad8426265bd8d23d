//! Configuration management for imbridge
//!
//! Environment-based configuration with TOML file support, defaults and
//! validation. Connection parameters for the account live here; the
//! persisted state blob (see [`crate::state`]) can fill in what is missing.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::logging::LogLevel;

mod error;

pub use error::ConfigError;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Account and server parameters
    #[serde(default)]
    pub account: AccountConfig,

    /// Session limits and retry policy
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Persisted state location
    #[serde(default)]
    pub state: StateConfig,
}

/// Account configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    /// Own phone number in international format
    pub phone: Option<String>,

    /// Server address override (engine default when unset)
    pub server_address: Option<String>,

    /// Server port
    pub server_port: u16,

    /// Server public key file
    pub server_key_file: Option<PathBuf>,

    /// Keep-alive ping interval
    #[serde(with = "humantime_serde")]
    pub keep_alive_interval: Duration,
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Automatic reconnects after unexpected drops before giving up
    pub max_reconnect_attempts: u32,

    /// Auth code submissions before the sign-in is abandoned
    pub max_code_attempts: u32,

    /// Password submissions before the sign-in is abandoned
    pub max_password_attempts: u32,

    /// Sent-message correlation entries kept per conversation
    pub sent_messages_per_peer: usize,

    /// Bound for pending sends and avatar fetches
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,

    /// How often pending operations are checked against the timeout
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Capacity of the protocol event, command and framework event queues
    pub queue_capacity: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include timestamps
    pub with_timestamp: bool,

    /// Include target module
    pub with_target: bool,
}

/// Persisted state configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// State blob path; in-memory only when unset
    pub path: Option<PathBuf>,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            phone: None,
            server_address: None,
            server_port: 443,
            server_key_file: None,
            keep_alive_interval: Duration::from_secs(15),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 3,
            max_code_attempts: 3,
            max_password_attempts: 3,
            sent_messages_per_peer: 512,
            operation_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5),
            queue_capacity: 256,
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

fn parse_env<T>(key: &str, what: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(format!("Invalid {}: {}", what, e))),
        Err(_) => Ok(None),
    }
}

fn parse_env_duration(key: &str, what: &str) -> Result<Option<Duration>, ConfigError> {
    match env::var(key) {
        Ok(raw) => humantime_serde::re::humantime::parse_duration(&raw)
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(format!("Invalid {}: {}", what, e))),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern: IMBRIDGE_<SECTION>_<KEY>
    /// Example: IMBRIDGE_ACCOUNT_PHONE=+15550100
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Account config
        if let Ok(phone) = env::var("IMBRIDGE_ACCOUNT_PHONE") {
            config.account.phone = Some(phone);
        }
        if let Ok(address) = env::var("IMBRIDGE_ACCOUNT_SERVER_ADDRESS") {
            config.account.server_address = Some(address);
        }
        if let Some(port) = parse_env("IMBRIDGE_ACCOUNT_SERVER_PORT", "server port")? {
            config.account.server_port = port;
        }
        if let Ok(key_file) = env::var("IMBRIDGE_ACCOUNT_SERVER_KEY_FILE") {
            config.account.server_key_file = Some(PathBuf::from(key_file));
        }
        if let Some(interval) =
            parse_env_duration("IMBRIDGE_ACCOUNT_KEEP_ALIVE_INTERVAL", "keep-alive interval")?
        {
            config.account.keep_alive_interval = interval;
        }

        // Session config
        if let Some(n) = parse_env("IMBRIDGE_SESSION_MAX_RECONNECT_ATTEMPTS", "reconnect bound")? {
            config.session.max_reconnect_attempts = n;
        }
        if let Some(n) = parse_env("IMBRIDGE_SESSION_MAX_CODE_ATTEMPTS", "code attempt bound")? {
            config.session.max_code_attempts = n;
        }
        if let Some(n) =
            parse_env("IMBRIDGE_SESSION_MAX_PASSWORD_ATTEMPTS", "password attempt bound")?
        {
            config.session.max_password_attempts = n;
        }
        if let Some(n) =
            parse_env("IMBRIDGE_SESSION_SENT_MESSAGES_PER_PEER", "sent message retention")?
        {
            config.session.sent_messages_per_peer = n;
        }
        if let Some(timeout) =
            parse_env_duration("IMBRIDGE_SESSION_OPERATION_TIMEOUT", "operation timeout")?
        {
            config.session.operation_timeout = timeout;
        }
        if let Some(interval) =
            parse_env_duration("IMBRIDGE_SESSION_SWEEP_INTERVAL", "sweep interval")?
        {
            config.session.sweep_interval = interval;
        }
        if let Some(n) = parse_env("IMBRIDGE_SESSION_QUEUE_CAPACITY", "queue capacity")? {
            config.session.queue_capacity = n;
        }

        // Logging config
        if let Ok(level) = env::var("IMBRIDGE_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(json) = parse_env("IMBRIDGE_LOG_JSON", "JSON flag")? {
            config.logging.json_format = json;
        }

        // State config
        if let Ok(path) = env::var("IMBRIDGE_STATE_PATH") {
            config.state.path = Some(PathBuf::from(path));
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(phone) = &self.account.phone {
            let digits = phone.strip_prefix('+').unwrap_or(phone);
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ConfigError::ValidationFailed(format!(
                    "phone must be digits with an optional leading '+': {}",
                    phone
                )));
            }
        }

        if self.account.server_port == 0 {
            return Err(ConfigError::ValidationFailed(
                "server_port must be greater than 0".to_string(),
            ));
        }

        if self.session.max_code_attempts == 0 || self.session.max_password_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "auth attempt bounds must be greater than 0".to_string(),
            ));
        }

        if self.session.sent_messages_per_peer == 0 {
            return Err(ConfigError::ValidationFailed(
                "sent_messages_per_peer must be greater than 0".to_string(),
            ));
        }

        if self.session.queue_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "queue_capacity must be greater than 0".to_string(),
            ));
        }

        if self.session.operation_timeout.is_zero() || self.session.sweep_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "operation_timeout and sweep_interval must be non-zero".to_string(),
            ));
        }

        if let Err(e) = self.logging.level.parse::<LogLevel>() {
            return Err(ConfigError::ValidationFailed(e.to_string()));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))?;

        Ok(())
    }
}
