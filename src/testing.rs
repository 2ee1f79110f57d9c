//! Test doubles: a counting credential provider and scripted mail servers

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use md5::{Digest, Md5};
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::config::NetTimeouts;
use crate::credentials::CredentialProvider;
use crate::models::{Account, CredentialKey};

pub fn fast_timeouts() -> NetTimeouts {
    NetTimeouts {
        connect: Duration::from_secs(2),
        greeting: Duration::from_secs(1),
        socket: Duration::from_secs(2),
    }
}

/// Credential provider with fixed answers and call counters
#[derive(Default)]
pub struct FakeCredentials {
    resolve_answer: Option<String>,
    prompt_answer: Option<String>,
    resolves: AtomicUsize,
    prompts: AtomicUsize,
    stored: Mutex<Vec<(String, String)>>,
}

impl FakeCredentials {
    /// Nothing stored, user cancels every prompt
    pub fn cancelling() -> Self {
        Self::default()
    }

    /// Lookup and prompt both yield `secret`
    pub fn always(secret: &str) -> Self {
        Self::resolving(secret).with_prompt(secret)
    }

    /// Lookup yields `secret`, prompts are cancelled
    pub fn resolving(secret: &str) -> Self {
        Self {
            resolve_answer: Some(secret.to_owned()),
            ..Self::default()
        }
    }

    pub fn with_prompt(mut self, secret: &str) -> Self {
        self.prompt_answer = Some(secret.to_owned());
        self
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }

    pub fn prompt_calls(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }

    pub fn stored(&self) -> Vec<(String, String)> {
        self.stored.lock().expect("stored lock").clone()
    }
}

#[async_trait]
impl CredentialProvider for FakeCredentials {
    async fn resolve(&self, _key: &CredentialKey) -> Option<SecretString> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        self.resolve_answer.clone().map(SecretString::from)
    }

    async fn prompt_and_store(
        &self,
        _account: &Account,
        _username: &str,
        _key: &CredentialKey,
    ) -> Option<SecretString> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        self.prompt_answer.clone().map(SecretString::from)
    }

    async fn store(&self, key: &CredentialKey, secret: &SecretString) {
        self.stored
            .lock()
            .expect("stored lock")
            .push((key.as_str().to_owned(), secret.expose_secret().to_owned()));
    }
}

/// Handle to a running fake server
pub struct FakeServer {
    pub port: u16,
    connections: Arc<AtomicUsize>,
    commands: Arc<Mutex<Vec<String>>>,
}

impl FakeServer {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Command verbs received across all connections, uppercased
    pub fn verbs(&self) -> Vec<String> {
        self.commands.lock().expect("commands lock").clone()
    }

    /// `host:port` value for an account's `server` property
    pub fn server(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }
}

async fn serve<H, Fut>(handler: H) -> FakeServer
where
    H: Fn(TcpStream, Arc<Mutex<Vec<String>>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    let connections = Arc::new(AtomicUsize::new(0));
    let commands = Arc::new(Mutex::new(Vec::new()));

    let counter = connections.clone();
    let log = commands.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(handler(socket, log.clone()));
        }
    });

    FakeServer {
        port,
        connections,
        commands,
    }
}

/// Decode a SASL PLAIN token into (user, password)
fn decode_plain(token: &str) -> Option<(String, String)> {
    let raw = STANDARD.decode(token.trim()).ok()?;
    let text = String::from_utf8(raw).ok()?;
    let mut parts = text.split('\0');
    let _authzid = parts.next()?;
    Some((parts.next()?.to_owned(), parts.next()?.to_owned()))
}

/// APOP banner timestamp used by the fake POP3 server (RFC 1939 example)
pub const POP3_TIMESTAMP: &str = "<1896.697170952@dbc.mtview.ca.us>";

/// Scripted POP3 server behaviour
#[derive(Debug, Clone)]
pub struct FakePop3 {
    pub password: String,
    pub messages: u32,
    pub accept_user_pass: bool,
    pub accept_apop: bool,
    /// Raw greeting bytes, terminator included
    pub greeting: Vec<u8>,
    /// Accept the connection but never send a greeting
    pub silent: bool,
    /// Replaces the normal `+OK <count> <size>` STAT reply
    pub stat_reply: Option<String>,
}

impl FakePop3 {
    pub fn new(password: &str, messages: u32) -> Self {
        Self {
            password: password.to_owned(),
            messages,
            accept_user_pass: true,
            accept_apop: true,
            greeting: format!("+OK POP3 ready {POP3_TIMESTAMP}\r\n").into_bytes(),
            silent: false,
            stat_reply: None,
        }
    }

    fn apop_matches(&self, arg: &str) -> bool {
        let Some((_user, digest)) = arg.split_once(' ') else {
            return false;
        };
        let expected = Md5::digest(format!("{POP3_TIMESTAMP}{}", self.password).as_bytes());
        let expected: String = expected.iter().map(|b| format!("{b:02x}")).collect();
        digest.trim() == expected
    }
}

pub async fn spawn_pop3(script: FakePop3) -> FakeServer {
    let script = Arc::new(script);
    serve(move |socket, log| pop3_session(socket, log, script.clone())).await
}

async fn pop3_session(socket: TcpStream, log: Arc<Mutex<Vec<String>>>, script: Arc<FakePop3>) {
    if script.silent {
        tokio::time::sleep(Duration::from_secs(30)).await;
        return;
    }
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();
    let _ = write.write_all(&script.greeting).await;

    let mut authed = false;
    while let Ok(Some(line)) = lines.next_line().await {
        let mut parts = line.splitn(2, ' ');
        let verb = parts.next().unwrap_or("").to_ascii_uppercase();
        let arg = parts.next().unwrap_or("").to_owned();
        log.lock().expect("log").push(verb.clone());

        let reply = match verb.as_str() {
            "USER" => "+OK user accepted".to_owned(),
            "PASS" => {
                authed = script.accept_user_pass && arg == script.password;
                if authed {
                    "+OK logged in".to_owned()
                } else {
                    "-ERR invalid password".to_owned()
                }
            }
            "APOP" => {
                authed = script.accept_apop && script.apop_matches(&arg);
                if authed {
                    "+OK maildrop locked".to_owned()
                } else {
                    "-ERR permission denied".to_owned()
                }
            }
            "STAT" if authed => script
                .stat_reply
                .clone()
                .unwrap_or_else(|| format!("+OK {} {}", script.messages, script.messages * 512)),
            "QUIT" => {
                let _ = write.write_all(b"+OK bye\r\n").await;
                break;
            }
            _ => "-ERR not allowed".to_owned(),
        };
        if write.write_all(format!("{reply}\r\n").as_bytes()).await.is_err() {
            break;
        }
    }
}

/// Scripted IMAP server behaviour
#[derive(Debug, Clone)]
pub struct FakeImap {
    pub password: String,
    pub accept_login: bool,
    pub accept_authenticate: bool,
    /// Untagged line sent in reply to STATUS, e.g. `* STATUS INBOX (UNSEEN 2)`
    pub status_line: Option<String>,
}

impl FakeImap {
    pub fn new(password: &str, status_line: &str) -> Self {
        Self {
            password: password.to_owned(),
            accept_login: true,
            accept_authenticate: true,
            status_line: Some(status_line.to_owned()),
        }
    }
}

pub async fn spawn_imap(script: FakeImap) -> FakeServer {
    let script = Arc::new(script);
    serve(move |socket, log| imap_session(socket, log, script.clone())).await
}

async fn imap_session(socket: TcpStream, log: Arc<Mutex<Vec<String>>>, script: Arc<FakeImap>) {
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();
    let _ = write
        .write_all(b"* OK [CAPABILITY IMAP4rev1 AUTH=PLAIN] fake ready\r\n")
        .await;

    let mut authed = false;
    while let Ok(Some(line)) = lines.next_line().await {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let (Some(tag), Some(verb)) = (tokens.first(), tokens.get(1)) else {
            break;
        };
        let tag = (*tag).to_owned();
        let verb = verb.to_ascii_uppercase();
        log.lock().expect("log").push(verb.clone());

        let reply = match verb.as_str() {
            "CAPABILITY" => format!("* CAPABILITY IMAP4rev1 AUTH=PLAIN\r\n{tag} OK done"),
            "LOGIN" => {
                let pass = tokens.get(3).map(|p| p.trim_matches('"')).unwrap_or("");
                authed = script.accept_login && pass == script.password;
                if authed {
                    format!("{tag} OK LOGIN completed")
                } else {
                    format!("{tag} NO [AUTHENTICATIONFAILED] invalid credentials")
                }
            }
            "AUTHENTICATE" if !script.accept_authenticate => {
                format!("{tag} NO [AUTHENTICATIONFAILED] mechanism refused")
            }
            "AUTHENTICATE" => {
                let _ = write.write_all(b"+ \r\n").await;
                let Ok(Some(token)) = lines.next_line().await else {
                    break;
                };
                authed = decode_plain(&token).is_some_and(|(_, pass)| pass == script.password);
                if authed {
                    format!("{tag} OK AUTHENTICATE completed")
                } else {
                    format!("{tag} NO [AUTHENTICATIONFAILED] invalid credentials")
                }
            }
            "STATUS" if authed => match &script.status_line {
                Some(status) => format!("{status}\r\n{tag} OK STATUS completed"),
                None => format!("{tag} OK STATUS completed"),
            },
            "LOGOUT" => {
                let farewell = format!("* BYE logging out\r\n{tag} OK LOGOUT completed\r\n");
                let _ = write.write_all(farewell.as_bytes()).await;
                break;
            }
            _ => format!("{tag} BAD unexpected command"),
        };
        if write.write_all(format!("{reply}\r\n").as_bytes()).await.is_err() {
            break;
        }
    }
}
