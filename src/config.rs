//! Configuration for the polling engine
//!
//! Engine settings are loaded from environment variables following the
//! pattern `MAIL_BIFF_<KEY>`. The refresh interval is additionally exposed
//! as a live handle so it can be changed while the scheduler runs.

use std::env;
use std::env::VarError;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::watch;

use crate::errors::{AppError, AppResult};

/// Interval used when the configured refresh interval is unset or zero
pub const DEFAULT_REFRESH_MINUTES: u32 = 10;

/// Directory under the user config dir that holds the account list
const APP_DIR: &str = "mail-biff";
/// File name of the persisted account list
const ACCOUNTS_FILE: &str = "mailboxes.json";
/// Keyring service under which accepted secrets are saved
pub const DEFAULT_KEYRING_SERVICE: &str = "mail-biff-rs";

/// Network timeouts applied to every checker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetTimeouts {
    /// TCP connect
    pub connect: Duration,
    /// TLS handshake, server greeting and authentication
    pub greeting: Duration,
    /// Any other command round-trip
    pub socket: Duration,
}

/// Engine-wide configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Location of the persisted account list
    pub accounts_file: PathBuf,
    /// Refresh interval in minutes (0 means the default)
    pub refresh_minutes: u32,
    /// Delay between activation and the first tick, in seconds
    pub initial_delay_seconds: u64,
    /// TCP connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Greeting/TLS handshake/authentication timeout in milliseconds
    pub greeting_timeout_ms: u64,
    /// Socket I/O timeout in milliseconds
    pub socket_timeout_ms: u64,
    /// System keyring service name for saved secrets
    pub keyring_service: String,
}

impl EngineConfig {
    /// Load all configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if a variable is set but malformed, or if no
    /// accounts file is configured and the platform has no config directory.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// MAIL_BIFF_ACCOUNTS_FILE=/home/bob/.config/mail-biff/mailboxes.json
    /// MAIL_BIFF_REFRESH_MINUTES=5
    /// MAIL_BIFF_SOCKET_TIMEOUT_MS=20000
    /// MAIL_BIFF_KEYRING_SERVICE=mail-biff-rs
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        let accounts_file = match optional_env("MAIL_BIFF_ACCOUNTS_FILE")? {
            Some(path) => PathBuf::from(path),
            None => default_accounts_file()?,
        };

        Ok(Self {
            accounts_file,
            refresh_minutes: parse_u32_env("MAIL_BIFF_REFRESH_MINUTES", DEFAULT_REFRESH_MINUTES)?,
            initial_delay_seconds: parse_u64_env("MAIL_BIFF_INITIAL_DELAY_SECONDS", 10)?,
            connect_timeout_ms: parse_u64_env("MAIL_BIFF_CONNECT_TIMEOUT_MS", 30_000)?,
            greeting_timeout_ms: parse_u64_env("MAIL_BIFF_GREETING_TIMEOUT_MS", 15_000)?,
            socket_timeout_ms: parse_u64_env("MAIL_BIFF_SOCKET_TIMEOUT_MS", 60_000)?,
            keyring_service: optional_env("MAIL_BIFF_KEYRING_SERVICE")?
                .unwrap_or_else(|| DEFAULT_KEYRING_SERVICE.to_owned()),
        })
    }

    /// Timeouts for checker connections
    pub fn timeouts(&self) -> NetTimeouts {
        NetTimeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            greeting: Duration::from_millis(self.greeting_timeout_ms),
            socket: Duration::from_millis(self.socket_timeout_ms),
        }
    }

    /// Delay before the first tick after activation
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_seconds)
    }
}

/// Default account list location: `<config_dir>/mail-biff/mailboxes.json`
fn default_accounts_file() -> AppResult<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR).join(ACCOUNTS_FILE))
        .ok_or_else(|| {
            AppError::invalid("no user config directory; set MAIL_BIFF_ACCOUNTS_FILE")
        })
}

/// Live refresh interval with change notification
///
/// Cloning yields another handle to the same value. Every `set` wakes all
/// subscribers, which is how the scheduler learns that it must cancel and
/// re-arm its timer.
#[derive(Debug, Clone)]
pub struct RefreshInterval {
    tx: watch::Sender<u32>,
}

impl RefreshInterval {
    /// Create a handle holding `minutes`
    pub fn new(minutes: u32) -> Self {
        let (tx, _rx) = watch::channel(minutes);
        Self { tx }
    }

    /// Configured value in minutes, exactly as stored (may be 0)
    pub fn get(&self) -> u32 {
        *self.tx.borrow()
    }

    /// Store a new value and notify subscribers
    pub fn set(&self, minutes: u32) {
        self.tx.send_replace(minutes);
    }

    /// Subscribe to changes
    pub fn subscribe(&self) -> watch::Receiver<u32> {
        self.tx.subscribe()
    }
}

/// Convert a configured minute value into a timer duration
///
/// Zero falls back to [`DEFAULT_REFRESH_MINUTES`].
pub fn effective_interval(minutes: u32) -> Duration {
    let minutes = if minutes == 0 {
        DEFAULT_REFRESH_MINUTES
    } else {
        minutes
    };
    Duration::from_secs(u64::from(minutes) * 60)
}

/// Read an optional environment variable, treating empty values as unset
fn optional_env(key: &str) -> AppResult<Option<String>> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(Some(v)),
        Ok(_) | Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a boolean value with flexible spellings
///
/// Accepts: `1`, `true`, `yes`, `y`, `on` (truthy) or `0`, `false`, `no`,
/// `n`, `off` (falsy). Case-insensitive.
pub fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a `u32` environment variable with default fallback
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but not a valid `u32`.
fn parse_u32_env(key: &str, default: u32) -> AppResult<u32> {
    match optional_env(key)? {
        Some(v) => v.trim().parse::<u32>().map_err(|_| {
            AppError::InvalidInput(format!("invalid u32 environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

/// Parse a `u64` environment variable with default fallback
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but not a valid `u64`.
fn parse_u64_env(key: &str, default: u64) -> AppResult<u64> {
    match optional_env(key)? {
        Some(v) => v.trim().parse::<u64>().map_err(|_| {
            AppError::InvalidInput(format!("invalid u64 environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}
