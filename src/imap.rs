//! IMAP transport and per-round attempt
//!
//! Provides timeout-bounded wrappers around `async-imap` operations. Each
//! round tries `LOGIN` first and then `AUTHENTICATE PLAIN`, each mechanism on
//! its own connection, and queries the folder with `STATUS (UNSEEN)`.

use async_imap::error::Error as ImapError;
use async_imap::{Authenticator, Client, Session};
use secrecy::{ExposeSecret, SecretString};
use tokio::time::timeout;

use crate::checker::Attempt;
use crate::config::NetTimeouts;
use crate::errors::{AppError, AppResult};
use crate::models::Endpoint;
use crate::net::{self, MailStream, bounded};

/// Authenticated IMAP session over a plain or TLS stream
pub type ImapSession = Session<MailStream>;

/// Mechanisms tried in order within one round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    Login,
    Plain,
}

impl AuthMechanism {
    pub const ORDER: [Self; 2] = [Self::Login, Self::Plain];

    fn as_str(self) -> &'static str {
        match self {
            Self::Login => "LOGIN",
            Self::Plain => "AUTHENTICATE PLAIN",
        }
    }
}

/// SASL PLAIN (RFC 4616) initial response
///
/// `async-imap` base64-encodes whatever `process` returns.
struct PlainAuthenticator {
    response: Vec<u8>,
}

impl PlainAuthenticator {
    fn new(username: &str, secret: &SecretString) -> Self {
        Self {
            response: format!("\0{username}\0{}", secret.expose_secret()).into_bytes(),
        }
    }
}

impl Authenticator for PlainAuthenticator {
    type Response = Vec<u8>;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        std::mem::take(&mut self.response)
    }
}

/// Classify a failed authentication command
fn auth_error(mechanism: AuthMechanism, err: ImapError) -> AppError {
    match err {
        ImapError::No(msg) | ImapError::Bad(msg) => {
            AppError::AuthFailed(format!("IMAP {} rejected: {msg}", mechanism.as_str()))
        }
        other => AppError::Connection(format!("IMAP {} failed: {other}", mechanism.as_str())),
    }
}

/// Classify a failed command inside an authenticated session
fn session_error(what: &str, err: ImapError) -> AppError {
    match err {
        ImapError::No(msg) | ImapError::Bad(msg) => {
            AppError::ProtocolParse(format!("{what} refused: {msg}"))
        }
        ImapError::Parse(e) => AppError::ProtocolParse(format!("{what} response unparseable: {e}")),
        other => AppError::Connection(format!("{what} failed: {other}")),
    }
}

/// Connect and read the server greeting
///
/// The greeting must be consumed before `AUTHENTICATE`, whose handshake loop
/// would otherwise mistake it for the continuation.
///
/// # Timeouts
///
/// - TCP connect: `connect`
/// - TLS handshake and greeting read: `greeting`
async fn open_client(endpoint: &Endpoint, timeouts: &NetTimeouts) -> AppResult<Client<MailStream>> {
    let stream = net::connect(endpoint, timeouts).await?;
    let mut client = Client::new(stream);
    let greeting = bounded(timeouts.greeting, "IMAP greeting", client.read_response(), |e| {
        AppError::Connection(format!("IMAP greeting failed: {e}"))
    })
    .await?;

    if greeting.is_none() {
        return Err(AppError::Connection(
            "IMAP server closed connection before greeting".to_owned(),
        ));
    }
    Ok(client)
}

/// Connect and authenticate with one mechanism
///
/// A refused connection is logged out before the error is returned.
///
/// # Errors
///
/// - `Timeout` if any connection phase times out
/// - `AuthFailed` if the server answers `NO`/`BAD`
/// - `Connection` for transport failures
pub async fn connect_authenticated(
    endpoint: &Endpoint,
    timeouts: &NetTimeouts,
    mechanism: AuthMechanism,
    secret: &SecretString,
) -> AppResult<ImapSession> {
    let client = open_client(endpoint, timeouts).await?;
    let user = endpoint.username.as_str();

    let exchange = async {
        match mechanism {
            AuthMechanism::Login => client.login(user, secret.expose_secret()).await,
            AuthMechanism::Plain => {
                let authenticator = PlainAuthenticator::new(user, secret);
                client.authenticate("PLAIN", authenticator).await
            }
        }
    };
    let outcome = timeout(timeouts.greeting, exchange)
        .await
        .map_err(|_| AppError::Timeout(format!("IMAP {} timed out", mechanism.as_str())))?;

    match outcome {
        Ok(session) => Ok(session),
        Err((err, client)) => {
            logout_refused(timeouts, client).await;
            Err(auth_error(mechanism, err))
        }
    }
}

/// Best-effort LOGOUT on a connection that never authenticated
async fn logout_refused(timeouts: &NetTimeouts, mut client: Client<MailStream>) {
    let result = bounded(
        timeouts.socket,
        "IMAP LOGOUT",
        client.run_command_and_check_ok("LOGOUT", None),
        |e| session_error("IMAP LOGOUT", e),
    )
    .await;
    if let Err(err) = result {
        tracing::debug!(error = %err, "IMAP logout after refusal failed");
    }
}

/// Unseen count for `folder` via `STATUS (UNSEEN)`
///
/// The folder name is sent in modified UTF-7.
pub async fn unseen_count(
    timeouts: &NetTimeouts,
    session: &mut ImapSession,
    folder: &str,
) -> AppResult<u32> {
    let mailbox = utf7_imap::encode_utf7_imap(folder.to_owned());
    let status = bounded(
        timeouts.socket,
        "IMAP STATUS",
        session.status(&mailbox, "(UNSEEN)"),
        |e| session_error("IMAP STATUS", e),
    )
    .await?;

    status.unseen.ok_or_else(|| {
        AppError::ProtocolParse(format!("STATUS response for '{folder}' carries no UNSEEN count"))
    })
}

/// Best-effort LOGOUT
async fn logout(timeouts: &NetTimeouts, mut session: ImapSession) {
    let result = bounded(timeouts.socket, "IMAP LOGOUT", session.logout(), |e| {
        session_error("IMAP LOGOUT", e)
    })
    .await;
    if let Err(err) = result {
        tracing::debug!(error = %err, "IMAP logout failed");
    }
}

/// One IMAP round: every mechanism in [`AuthMechanism::ORDER`] on a fresh
/// connection until one yields a count or a non-retryable error
pub async fn attempt(
    endpoint: &Endpoint,
    folder: &str,
    timeouts: &NetTimeouts,
    secret: SecretString,
) -> Attempt {
    let mut authenticated = false;
    let mut last_error = None;

    for mechanism in AuthMechanism::ORDER {
        let session = connect_authenticated(endpoint, timeouts, mechanism, &secret).await;
        let mut session = match session {
            Ok(session) => session,
            Err(err) => {
                tracing::debug!(
                    host = %endpoint.host,
                    mechanism = mechanism.as_str(),
                    error = %err,
                    "IMAP authentication failed"
                );
                last_error = Some(err);
                continue;
            }
        };
        authenticated = true;

        let outcome = unseen_count(timeouts, &mut session, folder).await;
        logout(timeouts, session).await;

        match outcome {
            Ok(unseen) => {
                tracing::debug!(host = %endpoint.host, folder, unseen, "IMAP STATUS");
                return Attempt::authenticated(Ok(unseen));
            }
            Err(err) if !err.is_retryable() => return Attempt::authenticated(Err(err)),
            Err(err) => last_error = Some(err),
        }
    }

    let error = last_error.unwrap_or_else(|| {
        AppError::Internal("no IMAP authentication mechanism attempted".to_owned())
    });
    Attempt {
        authenticated,
        outcome: Err(error),
    }
}

#[cfg(test)]
mod tests {
    use async_imap::Authenticator;
    use secrecy::SecretString;

    use super::PlainAuthenticator;
    use crate::checker::Checker;
    use crate::errors::AppError;
    use crate::models::{Account, AccountType, PROP_FOLDER, PROP_SERVER, PROP_USERNAME};
    use crate::testing::{FakeCredentials, FakeImap, FakeServer, fast_timeouts, spawn_imap};

    fn account_for(server: &FakeServer) -> Account {
        Account::new("work", AccountType::Imap)
            .with_property(PROP_SERVER, server.server())
            .with_property(PROP_USERNAME, "bob")
    }

    #[test]
    fn plain_response_is_nul_separated() {
        let mut auth = PlainAuthenticator::new("bob", &SecretString::from("pw1".to_owned()));
        assert_eq!(auth.process(b""), b"\0bob\0pw1".to_vec());
    }

    #[tokio::test]
    async fn zero_unseen_is_success() {
        let server = spawn_imap(FakeImap::new("pw1", "* STATUS INBOX (UNSEEN 0)")).await;
        let credentials = FakeCredentials::resolving("pw1");

        let result = Checker::Imap
            .check(&account_for(&server), &credentials, &fast_timeouts())
            .await;

        assert_eq!(result.unread, 0);
        assert_eq!(result.error, None);
        assert_eq!(server.connections(), 1);
        assert!(server.verbs().contains(&"LOGOUT".to_owned()));
    }

    #[tokio::test]
    async fn custom_folder_count() {
        let server = spawn_imap(FakeImap::new("pw1", "* STATUS Lists (UNSEEN 7)")).await;
        let credentials = FakeCredentials::resolving("pw1");
        let account = account_for(&server).with_property(PROP_FOLDER, "Lists");

        let result = Checker::Imap
            .check(&account, &credentials, &fast_timeouts())
            .await;

        assert_eq!(result.unread, 7);
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn missing_unseen_is_parse_error_without_retry() {
        let mut script = FakeImap::new("pw1", "");
        script.status_line = None;
        let server = spawn_imap(script).await;
        let credentials = FakeCredentials::always("pw1");

        let result = Checker::Imap
            .check(&account_for(&server), &credentials, &fast_timeouts())
            .await;

        assert_eq!(result.unread, 0);
        assert!(matches!(result.error, Some(AppError::ProtocolParse(_))));
        assert_eq!(server.connections(), 1);
        assert_eq!(credentials.prompt_calls(), 0);
    }

    #[tokio::test]
    async fn falls_back_to_authenticate_plain() {
        let mut script = FakeImap::new("pw1", "* STATUS INBOX (UNSEEN 2)");
        script.accept_login = false;
        let server = spawn_imap(script).await;
        let credentials = FakeCredentials::resolving("pw1");

        let result = Checker::Imap
            .check(&account_for(&server), &credentials, &fast_timeouts())
            .await;

        assert_eq!(result.unread, 2);
        assert!(result.is_ok());
        assert_eq!(server.connections(), 2);
        assert_eq!(credentials.stored().len(), 1);
        assert_eq!(server.verbs(), ["LOGIN", "LOGOUT", "AUTHENTICATE", "STATUS", "LOGOUT"]);
    }

    #[tokio::test]
    async fn wrong_secret_uses_six_connections() {
        let server = spawn_imap(FakeImap::new("right", "* STATUS INBOX (UNSEEN 2)")).await;
        let credentials = FakeCredentials::always("wrong");

        let result = Checker::Imap
            .check(&account_for(&server), &credentials, &fast_timeouts())
            .await;

        assert_eq!(result.unread, 0);
        assert!(matches!(result.error, Some(AppError::AuthFailed(_))));
        assert_eq!(server.connections(), 6);
        assert_eq!(credentials.prompt_calls(), 2);
        let logouts = server.verbs().iter().filter(|verb| *verb == "LOGOUT").count();
        assert_eq!(logouts, server.connections());
    }

    #[tokio::test]
    async fn cancelled_prompt_never_connects() {
        let server = spawn_imap(FakeImap::new("pw1", "* STATUS INBOX (UNSEEN 2)")).await;
        let credentials = FakeCredentials::cancelling();

        let result = Checker::Imap
            .check(&account_for(&server), &credentials, &fast_timeouts())
            .await;

        assert!(matches!(result.error, Some(AppError::AuthCancelled(_))));
        assert_eq!(server.connections(), 0);
    }
}
