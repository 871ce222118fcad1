use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use chrono::{DateTime, Local};

use super::{Notifier, NotifyError};
use crate::config::EmailConfig;

/// Mails notifications through a `sendmail` compatible binary.
#[derive(Debug, Clone)]
pub struct Sendmail {
    config: EmailConfig,
    log_file: Option<PathBuf>,
    dry_run: bool,
}

impl Sendmail {
    /// The content of `log_file` is appended to every mail if enabled in `config`.
    pub fn new(config: EmailConfig, log_file: Option<PathBuf>, dry_run: bool) -> Self {
        Self {
            config,
            log_file,
            dry_run,
        }
    }

    /// Complete message including headers.
    pub fn message(&self, subject: &str, body: &str, date: DateTime<Local>) -> String {
        // header values must stay on one line
        let subject = subject.replace(['\r', '\n'], " ");
        let mut message = format!(
            "From: {} <{}>\n\
             To: {}\n\
             Subject: {subject}\n\
             Date: {}\n\
             MIME-Version: 1.0\n\
             Content-Type: text/plain; charset=utf-8\n\
             Content-Transfer-Encoding: 8bit\n\
             \n\
             {body}",
            self.config.from_name,
            self.config.from_address,
            self.config.recipients.join(", "),
            date.to_rfc2822(),
        );

        if self.config.attach_log {
            if let Some(log_file) = &self.log_file {
                let log_content = fs::read_to_string(log_file)
                    .unwrap_or_else(|e| format!("Unable to read log file {}: {e}", log_file.display()));
                message.push_str("\n\n--- Full log ---\n\n");
                message.push_str(&log_content);
            }
        }
        message.push('\n');

        message
    }
}

impl Notifier for Sendmail {
    fn notify(&self, subject: &str, body: &str) -> Result<(), NotifyError> {
        if self.dry_run {
            log::info!(target: "notify::sendmail", "Dry run, not sending mail: {subject}");
            return Ok(());
        }

        let message = self.message(subject, body, Local::now());
        log::trace!(
            target: "notify::sendmail",
            "Running: {} -t -oi",
            self.config.sendmail.display()
        );
        let mut sendmail = Command::new(&self.config.sendmail)
            .arg("-t") // recipients from the headers
            .arg("-oi") // a lone dot doesn't end the message
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        // stdin is closed when dropped, the child is waited on even if writing failed
        let written = match sendmail.stdin.take() {
            Some(mut stdin) => stdin.write_all(message.as_bytes()),
            None => Ok(()),
        };

        let output = sendmail.wait_with_output()?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(NotifyError::Rejected(stderr.trim().to_string()));
        }
        written?;
        if !stderr.is_empty() {
            log::warn!(target: "notify::sendmail", "{stderr}");
        }

        log::info!(
            target: "notify::sendmail",
            "Mail sent to {}",
            self.config.recipients.join(", ")
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use chrono::TimeZone;

    use super::*;

    fn config() -> EmailConfig {
        EmailConfig {
            enabled: true,
            from_address: "from@example.com".to_string(),
            recipients: vec!["to@example.com".to_string(), "to2@example.com".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn headers_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let log_file = dir.path().join("run.log");
        fs::write(&log_file, "line one\nline two\n").unwrap();
        let sendmail = Sendmail::new(config(), Some(log_file), false);
        let date = Local.with_ymd_and_hms(2025, 1, 1, 3, 0, 0).unwrap();

        let message = sendmail.message("[BorgBackup] Backup\nsuccessful", "Backup success: true", date);

        assert!(message.starts_with(
            "From: Backup Script <from@example.com>\n\
             To: to@example.com, to2@example.com\n\
             Subject: [BorgBackup] Backup successful\n"
        ));
        assert!(message.contains(&format!("Date: {}\n", date.to_rfc2822())));
        assert!(message.contains("\n\nBackup success: true\n\n--- Full log ---\n\nline one\nline two\n"));
    }

    #[test]
    fn log_not_attached() {
        let dir = tempfile::tempdir().unwrap();
        let log_file = dir.path().join("run.log");
        fs::write(&log_file, "secret details").unwrap();
        let sendmail = Sendmail::new(
            EmailConfig {
                attach_log: false,
                ..config()
            },
            Some(log_file),
            false,
        );

        let message = sendmail.message("subject", "body", Local::now());

        assert!(message.ends_with("\n\nbody\n"));
        assert!(!message.contains("secret details"));
    }

    #[test]
    fn transport_receives_message() {
        let dir = tempfile::tempdir().unwrap();
        let spool = dir.path().join("spool");
        let sendmail = Sendmail::new(
            EmailConfig {
                sendmail: fake_sendmail(dir.path(), &format!("cat > '{}'", spool.display())),
                ..config()
            },
            None,
            false,
        );

        notify(&sendmail, "body").unwrap();

        let spooled = fs::read_to_string(&spool).unwrap();
        assert!(spooled.contains("Subject: subject\n"));
        assert!(spooled.ends_with("\n\nbody\n"));
    }

    #[test]
    fn refused_message() {
        let dir = tempfile::tempdir().unwrap();
        let sendmail = Sendmail::new(
            EmailConfig {
                sendmail: fake_sendmail(dir.path(), "cat > /dev/null; echo refused >&2; exit 75"),
                ..config()
            },
            None,
            false,
        );

        let err = notify(&sendmail, "body").unwrap_err();

        assert!(matches!(err, NotifyError::Rejected(ref stderr) if stderr == "refused"));
    }

    #[test]
    fn transport_exiting_before_reading() {
        let dir = tempfile::tempdir().unwrap();
        let sendmail = Sendmail::new(
            EmailConfig {
                sendmail: fake_sendmail(dir.path(), "echo refused >&2; exit 75"),
                ..config()
            },
            None,
            false,
        );
        // larger than a pipe buffer, writing fails once the transport is gone
        let body = "x".repeat(1 << 20);

        let err = notify(&sendmail, &body).unwrap_err();

        assert!(matches!(err, NotifyError::Rejected(ref stderr) if stderr == "refused"));
    }

    #[test]
    fn dry_run_sends_nothing() {
        let sendmail = Sendmail::new(
            EmailConfig {
                sendmail: PathBuf::from("/nonexistent/sendmail"),
                ..config()
            },
            None,
            true,
        );

        sendmail.notify("subject", "body").unwrap();
    }

    fn fake_sendmail(dir: &Path, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("sendmail");
        fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        let mut permissions = fs::metadata(&path).unwrap().permissions();
        permissions.set_mode(0o755);
        fs::set_permissions(&path, permissions).unwrap();
        path
    }

    /// Retries while a concurrently forked test process still holds the
    /// freshly written script open (ETXTBSY).
    fn notify(sendmail: &Sendmail, body: &str) -> Result<(), NotifyError> {
        for _ in 0..10 {
            match sendmail.notify("subject", body) {
                Err(NotifyError::Io(e)) if e.raw_os_error() == Some(26) => {
                    std::thread::sleep(std::time::Duration::from_millis(50))
                }
                other => return other,
            }
        }
        sendmail.notify("subject", body)
    }
}
