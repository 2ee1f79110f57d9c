//! Status consumers
//!
//! The scheduler publishes each account's result and the per-tick aggregate
//! through [`StatusSink`]. Rendering belongs to the sink.

use crate::errors::AppError;
use crate::models::{AggregateStatus, Attention};

/// Receiver of check results
pub trait StatusSink: Send + Sync {
    /// One account finished checking
    fn notify_result(&self, account: &str, unread: u32, error: Option<&AppError>);

    /// All accounts finished; called once per tick, after every result
    fn notify_aggregate(&self, aggregate: &AggregateStatus);
}

/// Sink that reports through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl StatusSink for LogSink {
    fn notify_result(&self, account: &str, unread: u32, error: Option<&AppError>) {
        match error {
            Some(err) => {
                tracing::warn!(account, code = err.code(), error = %err, "mailbox check failed")
            }
            None => tracing::info!(account, unread, "mailbox checked"),
        }
    }

    fn notify_aggregate(&self, aggregate: &AggregateStatus) {
        let attention = aggregate.attention();
        let total_unread = aggregate.total_unread;
        let total_errors = aggregate.total_errors;
        match attention {
            Attention::Error => tracing::warn!(total_unread, total_errors, "some mailboxes failed"),
            Attention::NewMail => tracing::info!(total_unread, "new mail"),
            Attention::Quiet => tracing::info!("no new mail"),
        }
    }
}
