use std::process::ExitCode;

use borg_backup_lib::cli::{Action, Cli};
use borg_backup_lib::command::{CommandRunner, DryRunner, SystemRunner};
use borg_backup_lib::config::BackupConfig;
use borg_backup_lib::cycle::{BackupCycle, RunContext};
use borg_backup_lib::logging;
use borg_backup_lib::notify::{LogNotifier, Notifier, Sendmail};

use clap::Parser;

/// A run completed, but the backup failed and the config asks to signal it.
const EXIT_BACKUP_FAILED: u8 = 2;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let Action::Backup = cli.action.unwrap_or_default();

    // init logger, the log file is attached once the config is known
    let log_handle = logging::init(cli.verbose);

    let ctx = match BackupConfig::load_or_init(&cli.config) {
        Ok(config) => RunContext::new(config),
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let general = &ctx.config.general;
    let log_file = logging::log_file_path(
        &ctx.config.logging.dir,
        &general.script_name,
        &ctx.timestamp(),
    );
    let log_file = match log_handle.attach(&log_file) {
        Ok(()) => Some(log_file),
        Err(e) => {
            log::warn!("Unable to create log file {}: {e}", log_file.display());
            None
        }
    };
    log::info!("==============================================");
    log::info!("Backup starting...");
    if let Some(log_file) = &log_file {
        log::info!("Log file: {}", log_file.display());
    }

    let dry_run = cli.dry_run;
    if dry_run {
        log::warn!("Running in dry-run mode");
    }

    let runner: Box<dyn CommandRunner> = if dry_run {
        Box::new(DryRunner)
    } else {
        Box::new(SystemRunner::with_timeout(general.command_timeout()))
    };

    let email = &ctx.config.email;
    let notifier: Box<dyn Notifier> = if !cli.notification || !email.enabled {
        Box::new(LogNotifier)
    } else if email.recipients.is_empty() {
        log::warn!("Email notification enabled without recipients, only logging the report");
        Box::new(LogNotifier)
    } else {
        Box::new(Sendmail::new(email.clone(), log_file, dry_run))
    };

    match BackupCycle::new(&ctx, runner.as_ref(), notifier.as_ref()).run() {
        Ok(summary) if !summary.success && general.failure_exit_code => {
            ExitCode::from(EXIT_BACKUP_FAILED)
        }
        Ok(_) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}
