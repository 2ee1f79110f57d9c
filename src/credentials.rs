//! Credential resolution and interactive prompting
//!
//! The checkers only see [`CredentialProvider`]. The production provider,
//! [`RendezvousCredentials`], looks secrets up in a [`SecretStore`] and falls
//! back to asking a UI collaborator through a single-slot request channel.
//! Accepted secrets are saved to the system keyring ([`KeyringSecretStore`])
//! under the credential key, so they survive restarts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use keyring::{Entry, Error as KeyringError};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};

use crate::models::{Account, CredentialKey};

/// Source of account secrets
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Best-effort, non-interactive lookup
    async fn resolve(&self, key: &CredentialKey) -> Option<SecretString>;

    /// Ask the user; a supplied secret is persisted under `key`
    ///
    /// Returns `None` if the user cancels.
    async fn prompt_and_store(
        &self,
        account: &Account,
        username: &str,
        key: &CredentialKey,
    ) -> Option<SecretString>;

    /// Persist a secret the server has just accepted
    async fn store(&self, key: &CredentialKey, secret: &SecretString);
}

/// Opaque secret persistence
pub trait SecretStore: Send + Sync {
    fn get(&self, key: &CredentialKey) -> Option<SecretString>;
    fn set(&self, key: &CredentialKey, secret: SecretString);
}

/// Process-lifetime secret store
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    entries: Mutex<HashMap<CredentialKey, SecretString>>,
}

impl SecretStore for MemorySecretStore {
    fn get(&self, key: &CredentialKey) -> Option<SecretString> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(key).cloned())
    }

    fn set(&self, key: &CredentialKey, secret: SecretString) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.clone(), secret);
        }
    }
}

/// Secret store backed by the system keyring
///
/// One entry per [`CredentialKey`] under a fixed service name. Secrets are
/// also kept in memory for the process lifetime, so an unavailable keyring
/// costs one prompt per account rather than one per tick.
#[derive(Debug)]
pub struct KeyringSecretStore {
    service: String,
    cache: MemorySecretStore,
}

impl KeyringSecretStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            cache: MemorySecretStore::default(),
        }
    }

    fn entry(&self, key: &CredentialKey) -> Result<Entry, KeyringError> {
        Entry::new(&self.service, key.as_str())
    }

    fn load(&self, key: &CredentialKey) -> Option<SecretString> {
        match self.entry(key).and_then(|entry| entry.get_password()) {
            Ok(secret) => Some(SecretString::from(secret)),
            Err(KeyringError::NoEntry) => None,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "keyring lookup failed");
                None
            }
        }
    }
}

impl SecretStore for KeyringSecretStore {
    fn get(&self, key: &CredentialKey) -> Option<SecretString> {
        if let Some(secret) = self.cache.get(key) {
            return Some(secret);
        }
        let secret = self.load(key)?;
        self.cache.set(key, secret.clone());
        Some(secret)
    }

    fn set(&self, key: &CredentialKey, secret: SecretString) {
        let saved = self
            .entry(key)
            .and_then(|entry| entry.set_password(secret.expose_secret()));
        if let Err(err) = saved {
            tracing::warn!(
                key = %key,
                error = %err,
                "keyring save failed; keeping secret in memory"
            );
        }
        self.cache.set(key, secret);
    }
}

/// A pending request for a secret
///
/// The UI collaborator answers through [`PromptRequest::reply`]; dropping the
/// request without replying counts as cancellation.
#[derive(Debug)]
pub struct PromptRequest {
    pub account_name: String,
    pub username: String,
    pub key: CredentialKey,
    reply: oneshot::Sender<Option<SecretString>>,
}

impl PromptRequest {
    /// Answer the prompt; `None` or an empty secret cancels
    pub fn reply(self, secret: Option<SecretString>) {
        // Receiver gone means the check was abandoned; nothing to do.
        let _ = self.reply.send(secret);
    }
}

/// Create the single-slot prompt channel
///
/// The receiver belongs to the UI collaborator.
pub fn prompt_channel() -> (PromptSender, mpsc::Receiver<PromptRequest>) {
    let (tx, rx) = mpsc::channel(1);
    (
        PromptSender {
            tx,
            outstanding: Arc::new(AsyncMutex::new(())),
        },
        rx,
    )
}

/// Sending half of the prompt channel
///
/// At most one prompt is outstanding at a time; concurrent callers queue on
/// an async mutex until the previous prompt resolves.
#[derive(Debug, Clone)]
pub struct PromptSender {
    tx: mpsc::Sender<PromptRequest>,
    outstanding: Arc<AsyncMutex<()>>,
}

impl PromptSender {
    /// Ask for a secret and wait for the answer
    pub async fn ask(
        &self,
        account_name: &str,
        username: &str,
        key: &CredentialKey,
    ) -> Option<SecretString> {
        let _slot = self.outstanding.lock().await;
        let (reply, answer) = oneshot::channel();
        let request = PromptRequest {
            account_name: account_name.to_owned(),
            username: username.to_owned(),
            key: key.clone(),
            reply,
        };
        if self.tx.send(request).await.is_err() {
            tracing::warn!(
                account = %account_name,
                "no prompt handler attached; treating as cancelled"
            );
            return None;
        }
        answer.await.ok().flatten()
    }
}

/// Credential provider backed by a secret store and a prompt channel
pub struct RendezvousCredentials<S> {
    secrets: S,
    prompts: PromptSender,
}

impl<S: SecretStore> RendezvousCredentials<S> {
    pub fn new(secrets: S, prompts: PromptSender) -> Self {
        Self { secrets, prompts }
    }
}

#[async_trait]
impl<S: SecretStore> CredentialProvider for RendezvousCredentials<S> {
    async fn resolve(&self, key: &CredentialKey) -> Option<SecretString> {
        self.secrets.get(key)
    }

    async fn prompt_and_store(
        &self,
        account: &Account,
        username: &str,
        key: &CredentialKey,
    ) -> Option<SecretString> {
        let secret = self.prompts.ask(&account.name, username, key).await?;
        if secret.expose_secret().is_empty() {
            return None;
        }
        self.secrets.set(key, secret.clone());
        Some(secret)
    }

    async fn store(&self, key: &CredentialKey, secret: &SecretString) {
        self.secrets.set(key, secret.clone());
        tracing::debug!(key = %key, "stored credential");
    }
}
