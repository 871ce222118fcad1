//! Delivery of the end-of-run report.
//!
//! - [Sendmail]: Mail through the local mail transfer agent.
//! - [LogNotifier]: Writes the report to the log only.

use std::io;

use derive_more::{Display, Error, From};

use crate::config::EmailConfig;
use crate::report::RunSummary;

mod sendmail;

pub use sendmail::Sendmail;

#[derive(Debug, Display, Error, From)]
/// Errors on sending a notification.
pub enum NotifyError {
    /// The transport couldn't be run.
    #[display("Running the mail transport failed: {_0}")]
    Io(io::Error),
    /// The transport refused the message.
    #[display("The mail transport refused the message: {_0}")]
    Rejected(#[error(ignore)] String),
}

/// Transport of the report.
pub trait Notifier {
    fn notify(&self, subject: &str, body: &str) -> Result<(), NotifyError>;
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, subject: &str, body: &str) -> Result<(), NotifyError> {
        log::info!(target: "notify", "{subject}");
        for line in body.lines() {
            log::info!(target: "notify", "{line}");
        }
        Ok(())
    }
}

/// Sends a notification, a failure is logged but doesn't propagate.
pub fn dispatch(notifier: &dyn Notifier, subject: &str, body: &str) {
    if let Err(e) = notifier.notify(subject, body) {
        log::error!(target: "notify", "Sending the notification failed: {e}");
    }
}

/// Reports the outcome of a completed run, honoring the "error only" mode.
pub fn report(notifier: &dyn Notifier, summary: &RunSummary, email: &EmailConfig) {
    if email.error_only && summary.success {
        log::info!(target: "notify", "Backup successful, error only mode active, no notification sent.");
        return;
    }
    dispatch(notifier, &summary.subject(&email.subject_tag), &summary.body());
}
