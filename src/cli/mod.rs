use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use log::LevelFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbosity of the command output.
    #[arg(long)]
    pub verbose: Option<LevelFilter>,

    /// Configuration file. Created with default values if missing.
    #[arg(
        long,
        short = 'c',
        env = "BORG_BACKUP_CONFIG",
        default_value = "/etc/borg_backup.toml"
    )]
    pub config: PathBuf,

    /// Log the commands instead of running them.
    #[arg(long)]
    pub dry_run: bool,

    /// Only log the summary instead of mailing it.
    #[arg(
        long = "no-notification",
        action = ArgAction::SetFalse
    )]
    pub notification: bool,

    #[command(subcommand)]
    pub action: Option<Action>,
}

#[derive(Subcommand, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Snapshot, archive, verify, prune and compact. (Default)
    #[default]
    Backup,
}
