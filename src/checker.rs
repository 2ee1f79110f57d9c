//! Per-account unread checks
//!
//! [`Checker`] is the protocol variant. Both variants share
//! [`run_credential_rounds`], which owns the credential retry policy and
//! calls a protocol-specific attempt function once per round.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::config::NetTimeouts;
use crate::credentials::CredentialProvider;
use crate::errors::{AppError, AppResult};
use crate::imap;
use crate::models::{Account, AccountType, CheckResult, CredentialKey, Endpoint};
use crate::pop3;

/// Credential rounds per check
pub const CREDENTIAL_ROUNDS: usize = 3;

/// Outcome of one connect + authenticate + query round
#[derive(Debug)]
pub struct Attempt {
    /// The server accepted the secret at some point during the round
    pub authenticated: bool,
    pub outcome: AppResult<u32>,
}

impl Attempt {
    /// Failure before the server accepted the secret
    pub fn unauthenticated(error: AppError) -> Self {
        Self {
            authenticated: false,
            outcome: Err(error),
        }
    }

    /// Authentication succeeded; `outcome` is the query result
    pub fn authenticated(outcome: AppResult<u32>) -> Self {
        Self {
            authenticated: true,
            outcome,
        }
    }
}

/// Drive up to [`CREDENTIAL_ROUNDS`] attempts with credential resolution
///
/// Round 0 tries a silent lookup before prompting; later rounds always
/// prompt, treating the previous secret as wrong. A missing or empty secret
/// ends the check with `AuthCancelled`. A secret the server accepted is
/// stored before the query result is inspected. Non-retryable errors (e.g.
/// `ProtocolParse`) end the check at once; otherwise the last error is
/// reported after the final round. Failures never escape: the result always
/// carries a count, zero on failure.
pub async fn run_credential_rounds<P, F, Fut>(
    account: &Account,
    endpoint: &Endpoint,
    key: &CredentialKey,
    credentials: &P,
    mut attempt: F,
) -> CheckResult
where
    P: CredentialProvider + ?Sized,
    F: FnMut(SecretString) -> Fut,
    Fut: Future<Output = Attempt>,
{
    let mut last_error = None;
    for round in 0..CREDENTIAL_ROUNDS {
        let Some(secret) = obtain_secret(credentials, account, &endpoint.username, key, round).await
        else {
            tracing::info!(account = %account.name, attempt = round, "authentication cancelled");
            return CheckResult::failed(AppError::AuthCancelled(format!(
                "no secret supplied for {key}"
            )));
        };

        let Attempt {
            authenticated,
            outcome,
        } = attempt(secret.clone()).await;
        if authenticated {
            credentials.store(key, &secret).await;
        }

        match outcome {
            Ok(unread) => return CheckResult::ok(unread),
            Err(err) if !err.is_retryable() => {
                tracing::warn!(
                    account = %account.name,
                    attempt = round,
                    code = err.code(),
                    error = %err,
                    "check failed"
                );
                return CheckResult::failed(err);
            }
            Err(err) => {
                tracing::warn!(
                    account = %account.name,
                    attempt = round,
                    code = err.code(),
                    error = %err,
                    "attempt failed"
                );
                last_error = Some(err);
            }
        }
    }

    CheckResult::failed(last_error.unwrap_or_else(|| {
        AppError::AuthFailed(format!("no attempt succeeded for {key}"))
    }))
}

async fn obtain_secret<P>(
    credentials: &P,
    account: &Account,
    username: &str,
    key: &CredentialKey,
    round: usize,
) -> Option<SecretString>
where
    P: CredentialProvider + ?Sized,
{
    if round == 0 {
        if let Some(secret) = credentials.resolve(key).await.filter(not_empty) {
            return Some(secret);
        }
    }
    credentials
        .prompt_and_store(account, username, key)
        .await
        .filter(not_empty)
}

fn not_empty(secret: &SecretString) -> bool {
    !secret.expose_secret().is_empty()
}

/// Protocol variant performing the check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checker {
    Pop3,
    Imap,
}

impl Checker {
    pub fn for_type(account_type: AccountType) -> Self {
        match account_type {
            AccountType::Pop3 => Self::Pop3,
            AccountType::Imap => Self::Imap,
        }
    }

    /// Check one account, never failing outright
    pub async fn check<P>(
        self,
        account: &Account,
        credentials: &P,
        timeouts: &NetTimeouts,
    ) -> CheckResult
    where
        P: CredentialProvider + ?Sized,
    {
        let endpoint = match Endpoint::resolve(account) {
            Ok(endpoint) => endpoint,
            Err(err) => return CheckResult::failed(err),
        };
        let key = CredentialKey::new(account.account_type, &endpoint);
        tracing::debug!(account = %account.name, key = %key, checker = ?self, "checking account");

        match self {
            Self::Pop3 => {
                run_credential_rounds(account, &endpoint, &key, credentials, |secret| {
                    pop3::attempt(&endpoint, timeouts, secret)
                })
                .await
            }
            Self::Imap => {
                let folder = account.folder();
                run_credential_rounds(account, &endpoint, &key, credentials, |secret| {
                    imap::attempt(&endpoint, folder, timeouts, secret)
                })
                .await
            }
        }
    }
}

/// Anything that can produce a result for an account
///
/// The scheduler depends on this seam rather than on the protocol checkers
/// directly.
#[async_trait]
pub trait AccountChecker: Send + Sync {
    async fn check(&self, account: &Account) -> CheckResult;
}

/// Production checker: dispatches on account type
pub struct MailCheckers<P> {
    credentials: P,
    timeouts: NetTimeouts,
}

impl<P: CredentialProvider> MailCheckers<P> {
    pub fn new(credentials: P, timeouts: NetTimeouts) -> Self {
        Self {
            credentials,
            timeouts,
        }
    }
}

#[async_trait]
impl<P: CredentialProvider> AccountChecker for MailCheckers<P> {
    async fn check(&self, account: &Account) -> CheckResult {
        Checker::for_type(account.account_type)
            .check(account, &self.credentials, &self.timeouts)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use secrecy::{ExposeSecret, SecretString};

    use super::{Attempt, CREDENTIAL_ROUNDS, Checker, run_credential_rounds};
    use crate::errors::AppError;
    use crate::models::{Account, AccountType, CredentialKey, Endpoint, PROP_SERVER, PROP_USERNAME};
    use crate::testing::{FakeCredentials, fast_timeouts};

    fn account() -> (Account, Endpoint, CredentialKey) {
        let account = Account::new("home", AccountType::Pop3)
            .with_property(PROP_SERVER, "mail.example.com")
            .with_property(PROP_USERNAME, "bob");
        let endpoint = Endpoint::resolve(&account).expect("endpoint");
        let key = CredentialKey::new(account.account_type, &endpoint);
        (account, endpoint, key)
    }

    #[tokio::test]
    async fn cancelled_without_any_attempt() {
        let (account, endpoint, key) = account();
        let credentials = FakeCredentials::cancelling();
        let attempts = AtomicUsize::new(0);

        let result = run_credential_rounds(&account, &endpoint, &key, &credentials, |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Attempt::authenticated(Ok(1)) }
        })
        .await;

        assert_eq!(result.unread, 0);
        assert!(matches!(result.error, Some(AppError::AuthCancelled(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        assert_eq!(credentials.resolve_calls(), 1);
        assert_eq!(credentials.prompt_calls(), 1);
    }

    #[tokio::test]
    async fn wrong_secret_exhausts_three_rounds() {
        let (account, endpoint, key) = account();
        let credentials = FakeCredentials::always("wrong");
        let attempts = AtomicUsize::new(0);

        let result = run_credential_rounds(&account, &endpoint, &key, &credentials, |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Attempt::unauthenticated(AppError::AuthFailed("-ERR bad password".to_owned())) }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), CREDENTIAL_ROUNDS);
        assert_eq!(result.unread, 0);
        assert!(matches!(result.error, Some(AppError::AuthFailed(_))));
        assert_eq!(credentials.resolve_calls(), 1);
        assert_eq!(credentials.prompt_calls(), 2);
        assert!(credentials.stored().is_empty());
    }

    #[tokio::test]
    async fn later_round_success_stores_prompted_secret() {
        let (account, endpoint, key) = account();
        let credentials = FakeCredentials::resolving("stale").with_prompt("fresh");

        let attempt = |secret: SecretString| async move {
            if secret.expose_secret() == "fresh" {
                Attempt::authenticated(Ok(4))
            } else {
                Attempt::unauthenticated(AppError::AuthFailed("rejected".to_owned()))
            }
        };
        let result = run_credential_rounds(&account, &endpoint, &key, &credentials, attempt).await;

        assert_eq!(result.unread, 4);
        assert!(result.is_ok());
        assert_eq!(
            credentials.stored(),
            vec![(key.as_str().to_owned(), "fresh".to_owned())]
        );
    }

    #[tokio::test]
    async fn parse_error_after_auth_is_not_retried() {
        let (account, endpoint, key) = account();
        let credentials = FakeCredentials::resolving("pw1");
        let attempts = AtomicUsize::new(0);

        let result = run_credential_rounds(&account, &endpoint, &key, &credentials, |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Attempt::authenticated(Err(AppError::ProtocolParse("no count".to_owned()))) }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(result.error, Some(AppError::ProtocolParse(_))));
        assert_eq!(credentials.stored().len(), 1);
        assert_eq!(credentials.prompt_calls(), 0);
    }

    #[tokio::test]
    async fn transient_failure_then_success() {
        let (account, endpoint, key) = account();
        let credentials = FakeCredentials::always("pw1");
        let attempts = AtomicUsize::new(0);

        let result = run_credential_rounds(&account, &endpoint, &key, &credentials, |_| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Attempt::unauthenticated(AppError::Timeout("greeting".to_owned()))
                } else {
                    Attempt::authenticated(Ok(2))
                }
            }
        })
        .await;

        assert_eq!(result.unread, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalid_port_fails_before_credentials() {
        let account = Account::new("broken", AccountType::Imap)
            .with_property(PROP_SERVER, "imap.example.com:notaport")
            .with_property(PROP_USERNAME, "bob");
        let credentials = FakeCredentials::always("pw1");

        let result = Checker::Imap
            .check(&account, &credentials, &fast_timeouts())
            .await;

        assert!(matches!(result.error, Some(AppError::InvalidInput(_))));
        assert_eq!(credentials.resolve_calls(), 0);
    }
}
