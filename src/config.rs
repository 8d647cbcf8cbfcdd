//! Configuration for the pairing service.
//!
//! Every setting is optional. Values come from `BRIDGE_AUTH_*` environment
//! variables (a `.env` file is honoured) and fall back to the defaults below.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Default pairing code length.
pub const DEFAULT_CODE_LENGTH: usize = 6;
/// Default pairing code alphabet.
pub const DEFAULT_CODE_CHARSET: &str = "0123456789";
/// Default pairing code lifetime (5 minutes).
pub const DEFAULT_CODE_TTL: Duration = Duration::from_secs(5 * 60);
/// Default credential lifetime (30 days).
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
/// Default ceiling on simultaneously bound devices.
pub const DEFAULT_MAX_ACTIVE_DEVICES: usize = 5;
/// Default sweeper wake interval (10 minutes).
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Settings for [`PairingService`](crate::pairing::PairingService).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    /// Number of symbols in a pairing code.
    pub code_length: usize,
    /// Alphabet pairing codes are drawn from.
    pub code_charset: String,
    /// How long a pairing code stays redeemable.
    pub code_ttl: Duration,
    /// How long a credential stays valid after issue or refresh.
    pub token_ttl: Duration,
    /// Maximum number of devices with a live credential.
    pub max_active_devices: usize,
    /// How often the background sweeper runs.
    pub sweep_interval: Duration,
    /// Where credentials are persisted. `None` disables persistence.
    pub storage_path: Option<PathBuf>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            code_length: DEFAULT_CODE_LENGTH,
            code_charset: DEFAULT_CODE_CHARSET.to_string(),
            code_ttl: DEFAULT_CODE_TTL,
            token_ttl: DEFAULT_TOKEN_TTL,
            max_active_devices: DEFAULT_MAX_ACTIVE_DEVICES,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            storage_path: None,
        }
    }
}

impl AuthConfig {
    /// Load configuration from the environment (and `.env`, if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let code_length = parse_var(&lookup, "BRIDGE_AUTH_CODE_LENGTH")?
            .unwrap_or(defaults.code_length);
        let code_charset = lookup("BRIDGE_AUTH_CODE_CHARSET")
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.code_charset);
        let code_ttl = parse_var(&lookup, "BRIDGE_AUTH_CODE_TTL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.code_ttl);
        let token_ttl = parse_var(&lookup, "BRIDGE_AUTH_TOKEN_TTL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.token_ttl);
        let max_active_devices = parse_var(&lookup, "BRIDGE_AUTH_MAX_DEVICES")?
            .unwrap_or(defaults.max_active_devices);
        let sweep_interval = parse_var(&lookup, "BRIDGE_AUTH_SWEEP_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.sweep_interval);
        let storage_path = lookup("BRIDGE_AUTH_STORAGE_PATH")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            code_length,
            code_charset,
            code_ttl,
            token_ttl,
            max_active_devices,
            sweep_interval,
            storage_path,
        }
        .normalized())
    }

    /// Replace zero or empty settings with their defaults.
    pub fn normalized(mut self) -> Self {
        if self.code_length == 0 {
            self.code_length = DEFAULT_CODE_LENGTH;
        }
        if self.code_charset.is_empty() {
            self.code_charset = DEFAULT_CODE_CHARSET.to_string();
        }
        if self.code_ttl.is_zero() {
            self.code_ttl = DEFAULT_CODE_TTL;
        }
        if self.token_ttl.is_zero() {
            self.token_ttl = DEFAULT_TOKEN_TTL;
        }
        if self.max_active_devices == 0 {
            self.max_active_devices = DEFAULT_MAX_ACTIVE_DEVICES;
        }
        if self.sweep_interval.is_zero() {
            self.sweep_interval = DEFAULT_SWEEP_INTERVAL;
        }
        if self
            .storage_path
            .as_ref()
            .is_some_and(|p| p.as_os_str().is_empty())
        {
            self.storage_path = None;
        }
        self
    }

    /// Set the persistence path.
    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    /// Return the default persistence path (`~/.echohelix/auth.json`).
    pub fn default_storage_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".echohelix")
            .join("auth.json")
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
    }
}
