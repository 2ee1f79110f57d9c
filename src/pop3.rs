//! POP3 client and per-round attempt
//!
//! Minimal line-oriented client: greeting, USER/PASS with an `APOP`
//! (RFC 1939 digest) fallback, `STAT`, `QUIT`. Every read and write is
//! bounded by the configured timeouts.

use std::time::Duration;

use md5::{Digest, Md5};
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

use crate::checker::Attempt;
use crate::config::NetTimeouts;
use crate::errors::{AppError, AppResult};
use crate::models::Endpoint;
use crate::net::{self, MailStream, bounded};

/// Upper bound on a single reply line
const MAX_LINE_BYTES: usize = 8 * 1024;

/// One status reply from the server
#[derive(Debug, Clone, PartialEq, Eq)]
enum Reply {
    Ok(String),
    Err(String),
    /// `+ <challenge>` continuation; never expected by this client
    Continue,
}

fn parse_reply(line: &str) -> AppResult<Reply> {
    let line = line.trim_end_matches(['\r', '\n']);
    if let Some(rest) = line.strip_prefix("+OK") {
        Ok(Reply::Ok(rest.trim().to_owned()))
    } else if let Some(rest) = line.strip_prefix("-ERR") {
        Ok(Reply::Err(rest.trim().to_owned()))
    } else if line == "+" || line.starts_with("+ ") {
        Ok(Reply::Continue)
    } else {
        Err(AppError::ProtocolParse(format!(
            "unexpected POP3 reply: {}",
            truncate(line)
        )))
    }
}

/// Parse the message count from a `STAT` reply body (`<count> <octets>`)
fn parse_stat(body: &str) -> AppResult<u32> {
    let mut fields = body.split_whitespace();
    let count = match (fields.next(), fields.next()) {
        (Some(count), Some(octets)) if octets.parse::<u64>().is_ok() => count.parse().ok(),
        _ => None,
    };
    count.ok_or_else(|| {
        AppError::ProtocolParse(format!("malformed STAT reply: {}", truncate(body)))
    })
}

/// The `<...>` banner timestamp of an APOP-capable greeting
fn greeting_timestamp(body: &str) -> Option<String> {
    let start = body.find('<')?;
    let len = body[start..].find('>')?;
    Some(body[start..=start + len].to_owned())
}

/// `APOP` digest: lowercase hex MD5 of the timestamp followed by the secret
fn apop_digest(timestamp: &str, secret: &SecretString) -> String {
    let mut hasher = Md5::new();
    hasher.update(timestamp.as_bytes());
    hasher.update(secret.expose_secret().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Decode one raw reply line
fn decode_line(raw: Vec<u8>, what: &str) -> AppResult<String> {
    String::from_utf8(raw)
        .map_err(|_| AppError::ProtocolParse(format!("{what} reply is not valid UTF-8")))
}

fn truncate(line: &str) -> &str {
    match line.char_indices().nth(80) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

/// An open POP3 connection past the greeting
struct Pop3Connection {
    stream: BufReader<MailStream>,
    socket_timeout: Duration,
    /// APOP challenge from the greeting, if the server offered one
    timestamp: Option<String>,
}

impl Pop3Connection {
    /// Connect and consume the `+OK` greeting
    async fn open(endpoint: &Endpoint, timeouts: &NetTimeouts) -> AppResult<Self> {
        let stream = net::connect(endpoint, timeouts).await?;
        let mut conn = Self {
            stream: BufReader::new(stream),
            socket_timeout: timeouts.socket,
            timestamp: None,
        };
        match conn.read_reply(timeouts.greeting, "POP3 greeting").await? {
            Reply::Ok(banner) => {
                conn.timestamp = greeting_timestamp(&banner);
                Ok(conn)
            }
            Reply::Err(msg) => {
                Err(AppError::Connection(format!("POP3 server refused session: {msg}")))
            }
            Reply::Continue => {
                Err(AppError::ProtocolParse("POP3 greeting was a continuation".to_owned()))
            }
        }
    }

    /// Read one reply line, never buffering more than [`MAX_LINE_BYTES`]
    async fn read_reply(&mut self, limit: Duration, what: &str) -> AppResult<Reply> {
        let mut raw = Vec::new();
        let mut reader = (&mut self.stream).take(MAX_LINE_BYTES as u64 + 1);
        let read = bounded(limit, what, reader.read_until(b'\n', &mut raw), |e| {
            AppError::Connection(format!("{what} failed: {e}"))
        })
        .await?;
        if read == 0 {
            return Err(AppError::Connection(format!(
                "POP3 server closed connection during {what}"
            )));
        }
        if raw.len() > MAX_LINE_BYTES {
            return Err(AppError::ProtocolParse(format!("{what} reply too long")));
        }
        parse_reply(&decode_line(raw, what)?)
    }

    /// Send one line and read the status reply
    async fn command(&mut self, line: &str, what: &str) -> AppResult<Reply> {
        let payload = format!("{line}\r\n");
        let stream = &mut self.stream;
        bounded(
            self.socket_timeout,
            what,
            async {
                stream.write_all(payload.as_bytes()).await?;
                stream.flush().await
            },
            |e| AppError::Connection(format!("{what} write failed: {e}")),
        )
        .await?;
        self.read_reply(self.socket_timeout, what).await
    }

    /// USER/PASS, then `APOP` if the server rejected either step
    async fn authenticate(&mut self, username: &str, secret: &SecretString) -> AppResult<()> {
        let plain_error = match self.user_pass(username, secret).await? {
            None => return Ok(()),
            Some(msg) => msg,
        };
        let Some(timestamp) = self.timestamp.clone() else {
            return Err(AppError::AuthFailed(format!(
                "POP3 login rejected: {plain_error}; server offers no APOP timestamp"
            )));
        };
        tracing::debug!(
            user = %username,
            reason = %plain_error,
            "USER/PASS rejected, trying APOP"
        );

        let digest = apop_digest(&timestamp, secret);
        match self.command(&format!("APOP {username} {digest}"), "APOP").await? {
            Reply::Ok(_) => Ok(()),
            Reply::Err(msg) => Err(AppError::AuthFailed(format!("POP3 APOP rejected: {msg}"))),
            Reply::Continue => {
                Err(AppError::ProtocolParse("unexpected continuation after APOP".to_owned()))
            }
        }
    }

    /// Returns the rejection message, or `None` when logged in
    async fn user_pass(
        &mut self,
        username: &str,
        secret: &SecretString,
    ) -> AppResult<Option<String>> {
        match self.command(&format!("USER {username}"), "USER").await? {
            Reply::Ok(_) => {}
            Reply::Err(msg) => return Ok(Some(msg)),
            Reply::Continue => {
                return Err(AppError::ProtocolParse(
                    "unexpected continuation after USER".to_owned(),
                ));
            }
        }
        match self
            .command(&format!("PASS {}", secret.expose_secret()), "PASS")
            .await?
        {
            Reply::Ok(_) => Ok(None),
            Reply::Err(msg) => Ok(Some(msg)),
            Reply::Continue => Err(AppError::ProtocolParse(
                "unexpected continuation after PASS".to_owned(),
            )),
        }
    }

    async fn stat(&mut self) -> AppResult<u32> {
        match self.command("STAT", "STAT").await? {
            Reply::Ok(body) => parse_stat(&body),
            Reply::Err(msg) => Err(AppError::ProtocolParse(format!("STAT refused: {msg}"))),
            Reply::Continue => {
                Err(AppError::ProtocolParse("unexpected continuation after STAT".to_owned()))
            }
        }
    }

    /// Best-effort QUIT; the connection is dropped either way
    async fn quit(mut self) {
        if let Err(err) = self.command("QUIT", "QUIT").await {
            tracing::debug!(error = %err, "POP3 QUIT failed");
        }
    }
}

/// One POP3 round: connect, authenticate, `STAT`, `QUIT`
pub async fn attempt(
    endpoint: &Endpoint,
    timeouts: &NetTimeouts,
    secret: SecretString,
) -> Attempt {
    let mut conn = match Pop3Connection::open(endpoint, timeouts).await {
        Ok(conn) => conn,
        Err(err) => return Attempt::unauthenticated(err),
    };

    if let Err(err) = conn.authenticate(&endpoint.username, &secret).await {
        conn.quit().await;
        return Attempt::unauthenticated(err);
    }

    let outcome = conn.stat().await;
    conn.quit().await;
    if let Ok(count) = &outcome {
        tracing::debug!(host = %endpoint.host, count, "POP3 STAT");
    }
    Attempt::authenticated(outcome)
}
