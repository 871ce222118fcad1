//! Summary of a finished run, rendered for the notification.

use std::fmt::Write;

use chrono::{DateTime, Local, TimeDelta};

use crate::ledger::FailureLedger;

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub success: bool,
    pub reasons: Vec<String>,
    pub started: DateTime<Local>,
    pub finished: DateTime<Local>,
}

impl RunSummary {
    pub fn new(ledger: &FailureLedger, started: DateTime<Local>, finished: DateTime<Local>) -> Self {
        let (success, reasons) = ledger.summary();
        Self {
            success,
            reasons,
            started,
            finished,
        }
    }

    pub fn duration(&self) -> TimeDelta {
        self.finished - self.started
    }

    /// Subject line, failures list all reasons.
    pub fn subject(&self, tag: &str) -> String {
        if self.success {
            format!("{tag} Backup successful")
        } else {
            format!("{tag} Backup FAILED - {}", self.reasons.join(", "))
        }
    }

    pub fn body(&self) -> String {
        let mut body = String::new();
        // writing into a String can't fail
        let _ = writeln!(body, "Backup success: {}", self.success);
        let _ = writeln!(body, "Start: {}", self.started.format("%Y-%m-%d %H:%M:%S"));
        let _ = writeln!(body, "End:   {}", self.finished.format("%Y-%m-%d %H:%M:%S"));
        let _ = write!(body, "Duration: {}", format_duration(self.duration()));

        if !self.success {
            let _ = write!(body, "\nFailure reasons:");
            for reason in &self.reasons {
                let _ = write!(body, "\n- {reason}");
            }
        }

        body
    }
}

fn format_duration(duration: TimeDelta) -> String {
    let secs = duration.num_seconds().max(0);
    format!("{}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn summary(reasons: &[&str]) -> RunSummary {
        let mut ledger = FailureLedger::new();
        for reason in reasons {
            ledger.record(*reason);
        }
        let started = Local.with_ymd_and_hms(2025, 1, 1, 3, 0, 0).unwrap();
        let finished = Local.with_ymd_and_hms(2025, 1, 1, 4, 2, 5).unwrap();
        RunSummary::new(&ledger, started, finished)
    }

    #[test]
    fn successful_run() {
        let summary = summary(&[]);

        assert_eq!(summary.subject("[BorgBackup]"), "[BorgBackup] Backup successful");
        assert_eq!(
            summary.body(),
            "Backup success: true\n\
             Start: 2025-01-01 03:00:00\n\
             End:   2025-01-01 04:02:05\n\
             Duration: 1:02:05"
        );
    }

    #[test]
    fn failed_run() {
        let summary = summary(&["Backup failed for /a", "Prune failed for /b"]);

        assert_eq!(
            summary.subject("[BorgBackup]"),
            "[BorgBackup] Backup FAILED - Backup failed for /a, Prune failed for /b"
        );
        assert!(summary.body().starts_with("Backup success: false\n"));
        assert!(summary
            .body()
            .ends_with("Failure reasons:\n- Backup failed for /a\n- Prune failed for /b"));
    }
}
