//! Polling scheduler
//!
//! A single task alternates between `Idle` (one armed deadline) and
//! `Checking` (one tick over all accounts, strictly sequential). A change to
//! the refresh interval while idle cancels the armed deadline and re-arms it
//! from now. A change during a tick is picked up when the tick finishes.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::checker::AccountChecker;
use crate::config::{RefreshInterval, effective_interval};
use crate::errors::{AppError, AppResult};
use crate::models::{AccountStatus, AggregateStatus, CheckResult};
use crate::notify::StatusSink;
use crate::store::AccountStore;

/// Observable scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Checking,
}

/// Everything one tick produced
#[derive(Debug, Clone)]
pub struct TickReport {
    pub completed_at: DateTime<Utc>,
    pub results: Vec<AccountStatus>,
    pub aggregate: AggregateStatus,
}

pub struct Scheduler<C, S> {
    store: AccountStore,
    checker: C,
    sink: S,
    interval: watch::Receiver<u32>,
    state: watch::Sender<SchedulerState>,
}

impl<C: AccountChecker, S: StatusSink> Scheduler<C, S> {
    pub fn new(store: AccountStore, checker: C, sink: S, interval: &RefreshInterval) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            store,
            checker,
            sink,
            interval: interval.subscribe(),
            state,
        }
    }

    /// Subscribe to `Idle`/`Checking` transitions
    pub fn state(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    /// Run one full check cycle
    ///
    /// The account list is reloaded first, so additions and removals since
    /// the last tick are honoured. Each account's result is published as it
    /// completes and the aggregate once at the end. A checker that panics is
    /// recorded as an `Internal` failure for that account only.
    ///
    /// # Errors
    ///
    /// Store errors (`StateCorrupt`, `PersistenceIo`); nothing is published
    /// for a tick whose account list cannot be loaded.
    pub async fn tick(&self) -> AppResult<TickReport> {
        self.state.send_replace(SchedulerState::Checking);
        let accounts = match self.store.load() {
            Ok(accounts) => accounts,
            Err(err) => {
                self.state.send_replace(SchedulerState::Idle);
                return Err(err);
            }
        };
        tracing::debug!(accounts = accounts.len(), "tick started");

        let mut results = Vec::with_capacity(accounts.len());
        for account in &accounts {
            let result = AssertUnwindSafe(self.checker.check(account))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    CheckResult::failed(AppError::Internal(format!(
                        "checker for '{}' panicked: {}",
                        account.name,
                        panic_message(panic.as_ref())
                    )))
                });
            self.sink
                .notify_result(&account.name, result.unread, result.error.as_ref());
            results.push(AccountStatus {
                name: account.name.clone(),
                result,
            });
        }

        let aggregate = AggregateStatus::from_results(results.iter().map(|status| &status.result));
        self.sink.notify_aggregate(&aggregate);
        self.state.send_replace(SchedulerState::Idle);

        Ok(TickReport {
            completed_at: Utc::now(),
            results,
            aggregate,
        })
    }

    /// Drive ticks until `shutdown` fires
    ///
    /// The first tick is armed `initial_delay` after start. Shutdown only
    /// interrupts the wait between ticks, never a tick in progress.
    pub async fn run(mut self, initial_delay: Duration, shutdown: CancellationToken) {
        let mut deadline = Instant::now() + initial_delay;
        let mut watching = true;
        tracing::info!(
            store = %self.store.path().display(),
            first_tick_in = ?initial_delay,
            "scheduler started"
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    tracing::info!("scheduler stopping");
                    break;
                }
                changed = self.interval.changed(), if watching => {
                    if changed.is_err() {
                        // All interval handles dropped; keep the current value.
                        watching = false;
                        continue;
                    }
                    let minutes = *self.interval.borrow_and_update();
                    deadline = Instant::now() + effective_interval(minutes);
                    tracing::info!(minutes, "refresh interval changed, timer re-armed");
                }
                () = sleep_until(deadline) => {
                    match self.tick().await {
                        Ok(report) => tracing::debug!(
                            total_unread = report.aggregate.total_unread,
                            total_errors = report.aggregate.total_errors,
                            at = %report.completed_at,
                            "tick finished"
                        ),
                        Err(err) => tracing::error!(
                            code = err.code(),
                            error = %err,
                            "tick skipped: account list unavailable"
                        ),
                    }
                    let minutes = *self.interval.borrow_and_update();
                    let next = effective_interval(minutes);
                    deadline = Instant::now() + next;
                    tracing::debug!(next_tick_in = ?next, "next tick scheduled");
                }
            }
        }
        self.state.send_replace(SchedulerState::Idle);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}
