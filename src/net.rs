//! TCP and implicit-TLS connections for the mail checkers
//!
//! Both protocols share one connection path: timeout-bounded TCP connect,
//! then an optional TLS handshake against the webpki root store.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::config::NetTimeouts;
use crate::errors::{AppError, AppResult};
use crate::models::Endpoint;

/// A plaintext or TLS-wrapped server connection
pub enum MailStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl fmt::Debug for MailStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain(_) => f.write_str("MailStream::Plain"),
            Self::Tls(_) => f.write_str("MailStream::Tls"),
        }
    }
}

impl AsyncRead for MailStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MailStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Open a connection to `endpoint`
///
/// # Timeouts
///
/// - TCP connect: `timeouts.connect`
/// - TLS handshake: `timeouts.greeting`
///
/// # Errors
///
/// - `Timeout` if either phase times out
/// - `Connection` for TCP or TLS failures
/// - `InvalidInput` if the hostname is invalid for TLS SNI
pub async fn connect(endpoint: &Endpoint, timeouts: &NetTimeouts) -> AppResult<MailStream> {
    let tcp = timeout(
        timeouts.connect,
        TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
    )
    .await
    .map_err(|_| AppError::Timeout(format!("tcp connect to {} timed out", endpoint.host)))
    .and_then(|r| {
        r.map_err(|e| AppError::Connection(format!("tcp connect to {} failed: {e}", endpoint.host)))
    })?;

    if !endpoint.ssl {
        return Ok(MailStream::Plain(tcp));
    }

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let server_name = ServerName::try_from(endpoint.host.clone())
        .map_err(|_| AppError::invalid(format!("invalid host '{}' for TLS SNI", endpoint.host)))?;
    let tls_stream = timeout(timeouts.greeting, connector.connect(server_name, tcp))
        .await
        .map_err(|_| AppError::Timeout("TLS handshake timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Connection(format!("TLS handshake failed: {e}"))))?;

    Ok(MailStream::Tls(Box::new(tls_stream)))
}

/// Run `fut` under `limit`, mapping both failure modes onto `AppError`
///
/// `what` names the operation in error messages; `on_error` classifies the
/// inner error.
pub async fn bounded<T, E, F>(
    limit: Duration,
    what: &str,
    fut: F,
    on_error: impl FnOnce(E) -> AppError,
) -> AppResult<T>
where
    F: Future<Output = Result<T, E>>,
{
    timeout(limit, fut)
        .await
        .map_err(|_| AppError::Timeout(format!("{what} timed out")))
        .and_then(|r| r.map_err(on_error))
}
