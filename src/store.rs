//! Persisted account list
//!
//! Accounts are stored as a single JSON document. Every mutation is
//! write-through: load, change, save. Saves go to a sibling temp file that
//! is renamed over the target, so readers never see a partial document.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::models::{Account, AccountType};

/// Current document format version
const DOCUMENT_VERSION: u32 = 1;

/// On-disk document
#[derive(Debug, Serialize, Deserialize)]
struct AccountsDocument {
    version: u32,
    #[serde(default)]
    mailboxes: Vec<Account>,
}

/// Account store backed by one file
///
/// The store is the sole writer of the file. It assumes a single writer and
/// does no locking of its own.
#[derive(Debug, Clone)]
pub struct AccountStore {
    path: PathBuf,
}

impl AccountStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all accounts in persisted order
    ///
    /// When no file exists the parent directory is created (the file is not)
    /// and an empty list is returned.
    ///
    /// # Errors
    ///
    /// - `StateCorrupt` if the file exists but is not a valid document, or
    ///   contains empty or duplicate account names
    /// - `PersistenceIo` if the file or its directory cannot be accessed
    pub fn load(&self) -> AppResult<Vec<Account>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.ensure_parent_dir()?;
                tracing::debug!(path = %self.path.display(), "no account list yet");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(AppError::PersistenceIo(format!(
                    "cannot read {}: {e}",
                    self.path.display()
                )));
            }
        };

        let document: AccountsDocument = serde_json::from_str(&raw).map_err(|e| {
            AppError::StateCorrupt(format!("cannot parse {}: {e}", self.path.display()))
        })?;
        if document.version != DOCUMENT_VERSION {
            tracing::warn!(
                path = %self.path.display(),
                expected = DOCUMENT_VERSION,
                found = document.version,
                "account list version mismatch, loading anyway"
            );
        }
        validate_names(&document.mailboxes).map_err(|msg| {
            AppError::StateCorrupt(format!("{}: {msg}", self.path.display()))
        })?;

        tracing::debug!(count = document.mailboxes.len(), "loaded accounts");
        Ok(document.mailboxes)
    }

    /// Replace the persisted list with `accounts`
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if names are empty or duplicated
    /// - `PersistenceIo` if the document cannot be written
    pub fn save(&self, accounts: &[Account]) -> AppResult<()> {
        validate_names(accounts).map_err(AppError::InvalidInput)?;

        let document = AccountsDocument {
            version: DOCUMENT_VERSION,
            mailboxes: accounts.to_vec(),
        };
        let body = serde_json::to_string_pretty(&document)
            .map_err(|e| AppError::Internal(format!("serialization failure: {e}")))?;

        self.ensure_parent_dir()?;
        let tmp = self.temp_path();
        let written = fs::write(&tmp, body).and_then(|()| fs::rename(&tmp, &self.path));
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(AppError::PersistenceIo(format!(
                "cannot write {}: {e}",
                self.path.display()
            )));
        }

        tracing::debug!(count = accounts.len(), path = %self.path.display(), "saved accounts");
        Ok(())
    }

    /// Look up an account by name
    pub fn find_by_name(&self, name: &str) -> AppResult<Option<Account>> {
        Ok(self.load()?.into_iter().find(|a| a.name == name))
    }

    /// Append a new account
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the name is empty or already taken.
    pub fn add(&self, account: Account) -> AppResult<()> {
        let mut accounts = self.load()?;
        if account.name.trim().is_empty() {
            return Err(AppError::invalid("account name must not be empty"));
        }
        if accounts.iter().any(|a| a.name == account.name) {
            return Err(AppError::invalid(format!(
                "account '{}' already exists",
                account.name
            )));
        }
        accounts.push(account);
        self.save(&accounts)
    }

    /// Remove an account, returning it
    pub fn remove(&self, name: &str) -> AppResult<Account> {
        let mut accounts = self.load()?;
        let index = position(&accounts, name)?;
        let removed = accounts.remove(index);
        self.save(&accounts)?;
        Ok(removed)
    }

    /// Rename an account in place, keeping its position
    pub fn rename(&self, from: &str, to: &str) -> AppResult<()> {
        if to.trim().is_empty() {
            return Err(AppError::invalid("account name must not be empty"));
        }
        self.update(from, |account| account.name = to.to_owned())
    }

    /// Switch an account to another protocol
    pub fn set_type(&self, name: &str, account_type: AccountType) -> AppResult<()> {
        self.update(name, |account| account.account_type = account_type)
    }

    /// Set one protocol property
    pub fn set_property(&self, name: &str, key: &str, value: &str) -> AppResult<()> {
        self.update(name, |account| {
            account.properties.insert(key.to_owned(), value.to_owned());
        })
    }

    fn update(&self, name: &str, change: impl FnOnce(&mut Account)) -> AppResult<()> {
        let mut accounts = self.load()?;
        let index = position(&accounts, name)?;
        change(&mut accounts[index]);
        self.save(&accounts)
    }

    fn ensure_parent_dir(&self) -> AppResult<()> {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => fs::create_dir_all(dir).map_err(|e| {
                AppError::PersistenceIo(format!("cannot create {}: {e}", dir.display()))
            }),
            _ => Ok(()),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mailboxes.json".to_owned());
        self.path
            .with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()))
    }
}

fn position(accounts: &[Account], name: &str) -> AppResult<usize> {
    accounts
        .iter()
        .position(|a| a.name == name)
        .ok_or_else(|| AppError::NotFound(format!("account '{name}' does not exist")))
}

/// Check that names are non-empty and unique
fn validate_names(accounts: &[Account]) -> Result<(), String> {
    let mut seen = HashSet::new();
    for account in accounts {
        if account.name.trim().is_empty() {
            return Err("account with empty name".to_owned());
        }
        if !seen.insert(account.name.as_str()) {
            return Err(format!("duplicate account name '{}'", account.name));
        }
    }
    Ok(())
}
