//! Line-oriented console collaborator
//!
//! Answers secret prompts raised by the checkers and accepts a few commands
//! while the scheduler runs. While a prompt is outstanding the next input
//! line is taken as the secret; an empty line cancels it.

use secrecy::SecretString;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::RefreshInterval;
use crate::credentials::PromptRequest;
use crate::errors::{AppError, AppResult};

/// Parsed console command
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Interval(u32),
    Quit,
    Help,
}

fn parse_command(line: &str) -> AppResult<Command> {
    let mut words = line.split_whitespace();
    match (words.next(), words.next(), words.next()) {
        (Some("interval"), Some(minutes), None) => minutes
            .parse::<u32>()
            .map(Command::Interval)
            .map_err(|_| AppError::invalid(format!("interval expects minutes, got '{minutes}'"))),
        (Some("quit" | "exit"), None, None) => Ok(Command::Quit),
        (Some("help"), None, None) => Ok(Command::Help),
        _ => Err(AppError::invalid(format!("unknown command '{}'", line.trim()))),
    }
}

const HELP: &str = "commands: interval <minutes> | quit | help\n";

pub struct Console {
    prompts: mpsc::Receiver<PromptRequest>,
    interval: RefreshInterval,
    shutdown: CancellationToken,
}

impl Console {
    pub fn new(
        prompts: mpsc::Receiver<PromptRequest>,
        interval: RefreshInterval,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            prompts,
            interval,
            shutdown,
        }
    }

    /// Serve prompts and commands until `quit` or shutdown
    ///
    /// `quit` cancels the shared shutdown token. When `input` reaches EOF,
    /// later prompts are cancelled as they arrive.
    pub async fn run<R, W>(mut self, input: R, mut output: W) -> AppResult<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        let mut pending: Option<PromptRequest> = None;
        let mut input_open = true;
        let mut prompts_open = true;

        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                request = self.prompts.recv(), if prompts_open && pending.is_none() => {
                    let Some(request) = request else {
                        prompts_open = false;
                        continue;
                    };
                    if !input_open {
                        tracing::warn!(
                            account = %request.account_name,
                            "console input closed; cancelling prompt"
                        );
                        request.reply(None);
                        continue;
                    }
                    let text = prompt_text(&request);
                    write_out(&mut output, &text).await?;
                    pending = Some(request);
                }
                line = lines.next_line(), if input_open => {
                    let line = line
                        .map_err(|e| AppError::Internal(format!("console read failed: {e}")))?;
                    let Some(line) = line else {
                        tracing::debug!("console input closed");
                        input_open = false;
                        if let Some(request) = pending.take() {
                            request.reply(None);
                        }
                        continue;
                    };

                    if let Some(request) = pending.take() {
                        let secret = line.trim_end_matches('\r');
                        if secret.is_empty() {
                            tracing::info!(account = %request.account_name, "prompt cancelled");
                            request.reply(None);
                        } else {
                            request.reply(Some(SecretString::from(secret.to_owned())));
                        }
                        continue;
                    }

                    if line.trim().is_empty() {
                        continue;
                    }
                    match parse_command(&line) {
                        Ok(Command::Interval(minutes)) => {
                            self.interval.set(minutes);
                            let note = format!("refresh interval set to {minutes} minutes\n");
                            write_out(&mut output, &note).await?;
                        }
                        Ok(Command::Quit) => {
                            self.shutdown.cancel();
                            break;
                        }
                        Ok(Command::Help) => write_out(&mut output, HELP).await?,
                        Err(err) => write_out(&mut output, &format!("{err}\n{HELP}")).await?,
                    }
                }
            }
        }

        if let Some(request) = pending.take() {
            request.reply(None);
        }
        Ok(())
    }
}

/// Secret prompt; stdin echoes, so the user is told the input is visible
fn prompt_text(request: &PromptRequest) -> String {
    format!(
        "Password for {} on '{}' ({}); input is visible, empty line cancels: ",
        request.username, request.account_name, request.key
    )
}

async fn write_out<W: AsyncWrite + Unpin>(output: &mut W, text: &str) -> AppResult<()> {
    output
        .write_all(text.as_bytes())
        .await
        .map_err(|e| AppError::Internal(format!("console write failed: {e}")))?;
    output
        .flush()
        .await
        .map_err(|e| AppError::Internal(format!("console write failed: {e}")))
}
