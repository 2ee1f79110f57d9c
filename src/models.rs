//! Account, endpoint and check-result types
//!
//! Accounts are persisted by the store; everything else here is computed
//! fresh on every tick.

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::parse_bool_value;
use crate::errors::{AppError, AppResult};

/// Property key: `host[:port]`
pub const PROP_SERVER: &str = "server";
/// Property key: login name
pub const PROP_USERNAME: &str = "username";
/// Property key: implicit TLS (`"true"`/`"false"`)
pub const PROP_SSL: &str = "ssl";
/// Property key: IMAP folder to query
pub const PROP_FOLDER: &str = "folder";

/// Folder queried when an IMAP account does not name one
pub const DEFAULT_FOLDER: &str = "INBOX";

/// Supported mail protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Pop3,
    Imap,
}

impl AccountType {
    /// Lowercase protocol name, also used as the credential key scheme
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pop3 => "pop3",
            Self::Imap => "imap",
        }
    }

    /// Well-known port for the protocol, with or without implicit TLS
    pub fn default_port(self, ssl: bool) -> u16 {
        match (self, ssl) {
            (Self::Pop3, false) => 110,
            (Self::Pop3, true) => 995,
            (Self::Imap, false) => 143,
            (Self::Imap, true) => 993,
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountType {
    type Err = AppError;

    fn from_str(s: &str) -> AppResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pop3" => Ok(Self::Pop3),
            "imap" => Ok(Self::Imap),
            other => Err(AppError::invalid(format!(
                "unsupported account type '{other}' (expected pop3 or imap)"
            ))),
        }
    }
}

/// A configured mailbox to poll
///
/// The name is the unique key within the store. All protocol-specific
/// settings live in `properties`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub name: String,
    #[serde(rename = "type")]
    pub account_type: AccountType,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Account {
    /// Create an account with no properties
    pub fn new(name: impl Into<String>, account_type: AccountType) -> Self {
        Self {
            name: name.into(),
            account_type,
            properties: BTreeMap::new(),
        }
    }

    /// Builder-style property setter
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Property value, if set
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Whether implicit TLS is enabled
    ///
    /// Unrecognized or missing values mean plaintext.
    pub fn ssl(&self) -> bool {
        self.property(PROP_SSL)
            .and_then(parse_bool_value)
            .unwrap_or(false)
    }

    /// IMAP folder to query, `INBOX` when unset or empty
    pub fn folder(&self) -> &str {
        match self.property(PROP_FOLDER) {
            Some(folder) if !folder.trim().is_empty() => folder,
            _ => DEFAULT_FOLDER,
        }
    }
}

/// Resolved connection target for one account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    pub username: String,
}

impl Endpoint {
    /// Resolve host, port, TLS mode and username from account properties
    ///
    /// - host: part of `server` before `:`, `localhost` when empty
    /// - port: part after `:`, else the protocol default for the TLS mode
    /// - username: `username` property, else `$LOGNAME`, else `$USER`
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the port is not a valid `u16` or no
    /// username can be determined.
    pub fn resolve(account: &Account) -> AppResult<Self> {
        let ssl = account.ssl();
        let server = account.property(PROP_SERVER).unwrap_or("").trim();
        let (host, port) = match server.split_once(':') {
            Some((host, port)) => {
                let port = port.trim().parse::<u16>().map_err(|_| {
                    AppError::invalid(format!(
                        "account '{}' has invalid port in server '{server}'",
                        account.name
                    ))
                })?;
                (host, port)
            }
            None => (server, account.account_type.default_port(ssl)),
        };
        let host = if host.is_empty() { "localhost" } else { host };

        let username = match account.property(PROP_USERNAME) {
            Some(user) if !user.trim().is_empty() => user.trim().to_owned(),
            _ => login_name().ok_or_else(|| {
                AppError::invalid(format!(
                    "account '{}' has no username and LOGNAME/USER are unset",
                    account.name
                ))
            })?,
        };

        Ok(Self {
            host: host.to_owned(),
            port,
            ssl,
            username,
        })
    }
}

/// Login name of the current user from the environment
fn login_name() -> Option<String> {
    ["LOGNAME", "USER"]
        .into_iter()
        .filter_map(|key| env::var(key).ok())
        .find(|v| !v.trim().is_empty())
}

/// Key under which an account's secret is stored
///
/// # Format
///
/// `<type>://<username>@<host>:<port>`, e.g. `pop3://bob@mail.example.com:110`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialKey(String);

impl CredentialKey {
    /// Build the key for a protocol and resolved endpoint
    pub fn new(account_type: AccountType, endpoint: &Endpoint) -> Self {
        Self(format!(
            "{}://{}@{}:{}",
            account_type.as_str(),
            endpoint.username,
            endpoint.host,
            endpoint.port
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of checking one account
///
/// A failed check always reports a zero count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub unread: u32,
    pub error: Option<AppError>,
}

impl CheckResult {
    pub fn ok(unread: u32) -> Self {
        Self {
            unread,
            error: None,
        }
    }

    pub fn failed(error: AppError) -> Self {
        Self {
            unread: 0,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of one account within a tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountStatus {
    pub name: String,
    pub result: CheckResult,
}

/// Attention level derived from an aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attention {
    /// Nothing waiting, no failures
    Quiet,
    /// At least one unread message and no failures
    NewMail,
    /// At least one account failed
    Error,
}

/// Totals over all accounts for one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateStatus {
    pub total_unread: u64,
    pub total_errors: usize,
}

impl AggregateStatus {
    /// Fold per-account results into totals
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a CheckResult>) -> Self {
        results
            .into_iter()
            .fold(Self::default(), |mut acc, result| {
                if result.is_ok() {
                    acc.total_unread += u64::from(result.unread);
                } else {
                    acc.total_errors += 1;
                }
                acc
            })
    }

    /// Errors outrank new mail
    pub fn attention(&self) -> Attention {
        if self.total_errors > 0 {
            Attention::Error
        } else if self.total_unread > 0 {
            Attention::NewMail
        } else {
            Attention::Quiet
        }
    }
}
