//! TOML configuration of a backup run.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_more::{Display, Error, From};

use crate::util::retention::RetentionConfig;

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
/// Configuration of a complete backup run.
pub struct BackupConfig {
    pub general: GeneralConfig,
    pub logging: LoggingConfig,
    pub email: EmailConfig,
    /// What gets backed up.
    pub sources: SourcesConfig,
    /// Options of the archive tool.
    pub archive: ArchiveConfig,
    /// Retention applied by `borg prune`.
    pub prune: RetentionConfig,
    /// Every repository receives the same archive.
    pub repositories: Vec<RepositoryConfig>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Name used for log files.
    pub script_name: String,

    /// Scratch directory holding the lock file and the snapshot mounts.
    ///
    /// Must be empty when no backup is running.
    pub tmp_dir: PathBuf,

    /// Archives are named `<prefix>-<YYYYMMDD_HH-MM-SS>`.
    pub backup_name_prefix: String,

    /// Kill external commands running longer than this many seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_timeout_secs: Option<u64>,

    /// Exit with a non-zero code if the backup failed.
    ///
    /// Otherwise failures are only signaled through the notification.
    pub failure_exit_code: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            script_name: "automated_borg_backup".to_string(),
            tmp_dir: PathBuf::from("/tmp/my_backup_tempdir"),
            backup_name_prefix: "linux-backup".to_string(),
            command_timeout_secs: None,
            failure_exit_code: false,
        }
    }
}

impl GeneralConfig {
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory receiving one log file per run.
    pub dir: PathBuf,

    /// Number of log files to keep. `0` keeps all of them.
    pub keep: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/log/automated_borg_backup"),
            keep: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub enabled: bool,

    /// `sendmail` compatible binary of the local mail transfer agent.
    pub sendmail: PathBuf,

    pub from_address: String,
    pub from_name: String,
    pub recipients: Vec<String>,

    /// Only send a mail if the backup failed.
    pub error_only: bool,

    /// Prefix of every subject line.
    pub subject_tag: String,

    /// Append the log of the run to the mail.
    pub attach_log: bool,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sendmail: PathBuf::from("/usr/sbin/sendmail"),
            from_address: "backup@localhost".to_string(),
            from_name: "Backup Script".to_string(),
            recipients: Vec::new(),
            error_only: false,
            subject_tag: "[BorgBackup]".to_string(),
            attach_log: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    /// Plain directories, backed up as they are.
    pub directories: Vec<PathBuf>,

    /// ZFS datasets backed up through a read-only snapshot (not recursive).
    pub zfs_pools: Vec<String>,
}

impl SourcesConfig {
    pub fn is_empty(&self) -> bool {
        self.directories.is_empty() && self.zfs_pools.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Compression passed to `borg create --compression`.
    pub compression: String,

    /// Run `borg check` with `--verify-data`.
    pub verify_data: bool,

    /// Run `borg compact` after pruning.
    pub compact: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            compression: "lz4".to_string(),
            verify_data: true,
            compact: true,
        }
    }
}

#[derive(Clone, PartialEq, serde::Serialize, serde::Deserialize)]
/// A borg repository.
pub struct RepositoryConfig {
    /// Location as understood by borg, e.g. `ssh://user@host:23/./backup`.
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,

    /// SSH key used for this repository only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<PathBuf>,
}

impl fmt::Debug for RepositoryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryConfig")
            .field("url", &self.url)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<masked>"))
            .field("ssh_key", &self.ssh_key)
            .finish()
    }
}

#[derive(Debug, Display, Error, From)]
/// Errors on loading the [BackupConfig].
pub enum ConfigError {
    /// Reading the config file failed.
    #[display("Reading the config file failed: {_0}")]
    Read(io::Error),
    /// The config file isn't valid.
    #[display("Parsing the config file failed: {_0}")]
    Parse(toml::de::Error),
}

impl BackupConfig {
    /// Reads the configuration from `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&config_str)?)
    }

    /// Reads the configuration from `path` and writes the default
    /// configuration there if the file doesn't exist yet.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::Read(e)) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!(
                    target: "config",
                    "Writing default config to {} because it doesn't exist yet",
                    path.display()
                );
                let default_config = Self::default();
                match toml::to_string_pretty(&default_config) {
                    Ok(config_str) => {
                        if let Err(e) = std::fs::write(path, config_str) {
                            log::warn!(
                                target: "config",
                                "Writing default config to {} failed {e}",
                                path.display()
                            );
                        }
                    }
                    Err(e) => log::warn!(target: "config", "Serializing default config failed: {e}"),
                }

                Ok(default_config)
            }
            other => other,
        }
    }
}
