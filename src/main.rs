//! mail-biff-rs: scheduled POP3/IMAP unread-mail polling
//!
//! Periodically checks every configured mailbox for unread mail, retrying
//! authentication with freshly prompted secrets and isolating per-account
//! failures so one broken mailbox never stalls the others.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point, CLI and wiring
//! - [`config`]: Environment-driven engine settings and the live refresh interval
//! - [`errors`]: Application error model
//! - [`models`]: Accounts, endpoints, credential keys, results and aggregates
//! - [`store`]: Write-through JSON account store
//! - [`credentials`]: Credential provider seam, secret store and prompt rendezvous
//! - [`net`]: Timeout-bounded TCP/TLS connections
//! - [`pop3`]: POP3 client and per-round attempt
//! - [`imap`]: IMAP session operations and per-round attempt
//! - [`checker`]: Credential retry rounds and protocol dispatch
//! - [`scheduler`]: Idle/Checking loop and tick
//! - [`notify`]: Status sinks
//! - [`console`]: Stdin collaborator for prompts and interval changes

mod checker;
mod config;
mod console;
mod credentials;
mod errors;
mod imap;
mod models;
mod net;
mod notify;
mod pop3;
mod scheduler;
mod store;
#[cfg(test)]
mod testing;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use checker::MailCheckers;
use config::{EngineConfig, RefreshInterval};
use console::Console;
use credentials::{KeyringSecretStore, RendezvousCredentials, prompt_channel};
use errors::{AppError, AppResult};
use models::{Account, AccountType, PROP_FOLDER, PROP_SERVER, PROP_SSL, PROP_USERNAME};
use notify::LogSink;
use scheduler::Scheduler;
use store::AccountStore;

#[derive(Debug, Parser)]
#[command(name = "mail-biff-rs", version)]
#[command(about = "Polls POP3 and IMAP mailboxes for unread mail")]
struct Cli {
    /// Account list location (overrides MAIL_BIFF_ACCOUNTS_FILE)
    #[arg(long, global = true)]
    accounts_file: Option<PathBuf>,

    /// Refresh interval in minutes; 0 means the default of 10
    #[arg(long, global = true)]
    refresh_minutes: Option<u32>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Poll on a schedule until interrupted (default)
    ///
    /// Reads console commands from stdin: `interval <minutes>`, `quit`.
    Run,
    /// Check every account once and print the results
    Check,
    /// List configured accounts
    List,
    /// Add an account
    Add {
        name: String,
        #[arg(long = "type")]
        account_type: AccountType,
        /// host[:port]
        #[arg(long)]
        server: Option<String>,
        #[arg(long)]
        username: Option<String>,
        /// Use implicit TLS
        #[arg(long)]
        ssl: bool,
        /// IMAP folder to watch
        #[arg(long)]
        folder: Option<String>,
    },
    /// Remove an account
    Remove { name: String },
    /// Rename an account
    Rename { from: String, to: String },
    /// Set a property; the key `type` changes the account type
    Set {
        name: String,
        key: String,
        value: String,
    },
}

/// Application entry point
///
/// Initializes tracing from environment, loads config, and dispatches the
/// selected command.
///
/// # Environment Variables
///
/// See [`EngineConfig::load_from_env`] for full configuration options.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = EngineConfig::load_from_env()?;
    if let Some(path) = cli.accounts_file {
        config.accounts_file = path;
    }
    if let Some(minutes) = cli.refresh_minutes {
        config.refresh_minutes = minutes;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(dispatch(cli.command.unwrap_or(Command::Run), config));
    // A pending stdin read sits on the blocking pool and never returns on its own.
    runtime.shutdown_background();
    Ok(result?)
}

async fn dispatch(command: Command, config: EngineConfig) -> AppResult<()> {
    let store = AccountStore::new(&config.accounts_file);
    match command {
        Command::Run => run(config, store).await,
        Command::Check => check(config, store).await,
        Command::List => {
            for account in store.load()? {
                println!("{}", describe(&account));
            }
            Ok(())
        }
        Command::Add {
            name,
            account_type,
            server,
            username,
            ssl,
            folder,
        } => {
            let mut account =
                Account::new(name, account_type).with_property(PROP_SSL, ssl.to_string());
            if let Some(server) = server {
                account = account.with_property(PROP_SERVER, server);
            }
            if let Some(username) = username {
                account = account.with_property(PROP_USERNAME, username);
            }
            if let Some(folder) = folder {
                if account_type != AccountType::Imap {
                    return Err(AppError::invalid("--folder only applies to IMAP accounts"));
                }
                account = account.with_property(PROP_FOLDER, folder);
            }
            store.add(account)
        }
        Command::Remove { name } => store.remove(&name).map(|_| ()),
        Command::Rename { from, to } => store.rename(&from, &to),
        Command::Set { name, key, value } if key == "type" => {
            store.set_type(&name, value.parse()?)
        }
        Command::Set { name, key, value } => store.set_property(&name, &key, &value),
    }
}

type Engine = Scheduler<MailCheckers<RendezvousCredentials<KeyringSecretStore>>, LogSink>;

/// Wire scheduler, checkers and console around one prompt channel
fn assemble(
    config: &EngineConfig,
    store: AccountStore,
    interval: &RefreshInterval,
    shutdown: &CancellationToken,
) -> (Engine, Console) {
    let (prompts, requests) = prompt_channel();
    let secrets = KeyringSecretStore::new(config.keyring_service.as_str());
    let credentials = RendezvousCredentials::new(secrets, prompts);
    let checkers = MailCheckers::new(credentials, config.timeouts());
    let scheduler = Scheduler::new(store, checkers, LogSink, interval);
    let console = Console::new(requests, interval.clone(), shutdown.clone());
    (scheduler, console)
}

async fn run(config: EngineConfig, store: AccountStore) -> AppResult<()> {
    let interval = RefreshInterval::new(config.refresh_minutes);
    let shutdown = CancellationToken::new();
    let (scheduler, console) = assemble(&config, store, &interval, &shutdown);
    tracing::info!(
        refresh_minutes = interval.get(),
        "polling mailboxes; type 'help' for commands"
    );

    let console_task = tokio::spawn(console.run(
        BufReader::new(tokio::io::stdin()),
        tokio::io::stderr(),
    ));

    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received");
        }
        interrupt.cancel();
    });

    scheduler.run(config.initial_delay(), shutdown.clone()).await;
    shutdown.cancel();
    match console_task.await {
        Ok(result) => result,
        Err(e) => Err(AppError::Internal(format!("console task failed: {e}"))),
    }
}

async fn check(config: EngineConfig, store: AccountStore) -> AppResult<()> {
    let interval = RefreshInterval::new(config.refresh_minutes);
    let shutdown = CancellationToken::new();
    let (scheduler, console) = assemble(&config, store, &interval, &shutdown);
    tokio::spawn(console.run(BufReader::new(tokio::io::stdin()), tokio::io::stderr()));

    let report = scheduler.tick().await;
    shutdown.cancel();
    let report = report?;

    for status in &report.results {
        match &status.result.error {
            Some(err) => println!("{}\terror\t{err}", status.name),
            None => println!("{}\t{}", status.name, status.result.unread),
        }
    }
    println!(
        "total\t{}\terrors\t{}\t{:?}",
        report.aggregate.total_unread,
        report.aggregate.total_errors,
        report.aggregate.attention()
    );
    Ok(())
}

fn describe(account: &Account) -> String {
    let properties = account
        .properties
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(" ");
    format!("{}\t{}\t{properties}", account.name, account.account_type)
}
