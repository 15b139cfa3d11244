//! Daemon configuration
//!
//! Read once from the environment at startup and handed to each component.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::sweeper::{
    CapacityPolicy, DEFAULT_MAX_BYTES, DEFAULT_SWEEP_INTERVAL, DEFAULT_TARGET_FRACTION,
};
use crate::fetch::ytdlp::{DEFAULT_FETCH_TIMEOUT, DEFAULT_PROGRAM};

/// Socket file name placed in the runtime directory
const SOCKET_NAME: &str = "clipcache.sock";

/// Configuration errors; all are fatal at startup
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Process-wide settings
#[derive(Debug, Clone)]
pub struct Config {
    /// Bot token for the chat platform; only needed by `run`
    pub discord_token: Option<String>,
    /// Directory holding preview clips
    pub preview_dir: PathBuf,
    /// Public address prefix joined with clip names
    pub preview_base_url: String,
    /// Store size budget
    pub capacity: CapacityPolicy,
    /// Time between eviction sweeps
    pub sweep_interval: Duration,
    /// Wall-clock limit for one fetch
    pub fetch_timeout: Duration,
    /// Fetch tool executable
    pub ytdlp_program: PathBuf,
    /// Inbound event socket
    pub socket_path: PathBuf,
}

impl Config {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load using `lookup` to resolve variables
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| lookup(name).ok_or(ConfigError::Missing(name));

        let preview_dir = PathBuf::from(required("PREVIEW_DIR")?);
        let preview_base_url = required("PREVIEW_BASE_URL")?;

        let max_bytes = parse_or(&lookup, "PREVIEW_MAX_BYTES", DEFAULT_MAX_BYTES)?;
        let target_fraction =
            parse_or(&lookup, "PREVIEW_TARGET_FRACTION", DEFAULT_TARGET_FRACTION)?;
        if !(target_fraction > 0.0 && target_fraction <= 1.0) {
            return Err(ConfigError::Invalid {
                name: "PREVIEW_TARGET_FRACTION",
                value: target_fraction.to_string(),
                reason: "must be in (0, 1]".to_string(),
            });
        }

        let sweep_secs = parse_or(
            &lookup,
            "PREVIEW_SWEEP_INTERVAL_SECS",
            DEFAULT_SWEEP_INTERVAL.as_secs(),
        )?;
        if sweep_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "PREVIEW_SWEEP_INTERVAL_SECS",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        let fetch_secs = parse_or(
            &lookup,
            "PREVIEW_FETCH_TIMEOUT_SECS",
            DEFAULT_FETCH_TIMEOUT.as_secs(),
        )?;
        if fetch_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "PREVIEW_FETCH_TIMEOUT_SECS",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        let socket_path = lookup("PREVIEW_SOCKET").map(PathBuf::from).unwrap_or_else(|| {
            dirs::runtime_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(SOCKET_NAME)
        });

        Ok(Self {
            discord_token: lookup("DISCORD_TOKEN"),
            preview_dir,
            preview_base_url,
            capacity: CapacityPolicy {
                max_bytes,
                target_fraction,
            },
            sweep_interval: Duration::from_secs(sweep_secs),
            fetch_timeout: Duration::from_secs(fetch_secs),
            ytdlp_program: lookup("PREVIEW_YTDLP_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PROGRAM)),
            socket_path,
        })
    }

    /// Bot token, required when connecting to the chat platform
    pub fn require_token(&self) -> Result<&str, ConfigError> {
        self.discord_token
            .as_deref()
            .ok_or(ConfigError::Missing("DISCORD_TOKEN"))
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => match value.trim().parse::<T>() {
            Ok(parsed) => Ok(parsed),
            Err(e) => Err(ConfigError::Invalid {
                name,
                reason: e.to_string(),
                value,
            }),
        },
    }
}
