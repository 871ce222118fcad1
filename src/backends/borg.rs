//! Implements archiving into borg repositories using [Borg].

use std::path::PathBuf;

use chrono::{DateTime, Local};
use derive_more::Display;

use super::{run_checked, CommandError};
use crate::command::{CommandRunner, Invocation};
use crate::config::{ArchiveConfig, RepositoryConfig};
use crate::util::retention::RetentionConfig;

const PASSPHRASE_ENV: &str = "BORG_PASSPHRASE";
const RSH_ENV: &str = "BORG_RSH";

/// Steps applied to every repository, in this order.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum Stage {
    /// `borg create`
    #[display("Backup")]
    Create,
    /// `borg check`
    #[display("Check")]
    Verify,
    /// `borg prune`
    #[display("Prune")]
    Prune,
    /// `borg compact`
    #[display("Compact")]
    Compact,
}

impl Stage {
    /// Reason recorded when the stage fails for `repo`.
    pub fn failure_reason(&self, repo: &RepositoryConfig) -> String {
        format!("{self} failed for {}", repo.url)
    }
}

/// Name of an archive created at `time`.
pub fn archive_name(prefix: &str, time: &DateTime<Local>) -> String {
    format!("{prefix}-{}", time.format("%Y%m%d_%H-%M-%S"))
}

/// Runs borg against the configured repositories.
pub struct Borg<'a> {
    runner: &'a dyn CommandRunner,
    archive: &'a ArchiveConfig,
    retention: &'a RetentionConfig,
}

impl<'a> Borg<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        archive: &'a ArchiveConfig,
        retention: &'a RetentionConfig,
    ) -> Self {
        Self {
            runner,
            archive,
            retention,
        }
    }

    /// Borg subcommand with the credentials of `repo`.
    ///
    /// `BORG_RSH` is removed when the repository has no key of its own,
    /// so the default ssh configuration applies.
    fn borg(&self, repo: &RepositoryConfig, subcommand: &str) -> Invocation {
        let mut invocation = Invocation::new("borg").arg(subcommand);
        if let Some(passphrase) = &repo.passphrase {
            invocation = invocation.env(PASSPHRASE_ENV, passphrase.as_str());
        }
        match &repo.ssh_key {
            Some(key) => invocation.env(RSH_ENV, format!("ssh -i {}", key.display())),
            None => invocation.env_remove(RSH_ENV),
        }
    }

    /// Archives `targets` into `repo` as `archive_name`.
    pub fn create(
        &self,
        repo: &RepositoryConfig,
        archive_name: &str,
        targets: &[PathBuf],
    ) -> Result<(), CommandError> {
        if targets.is_empty() {
            log::warn!(target: "backend::borg", "No directories to back up given.");
            return Ok(());
        }

        log::info!(target: "backend::borg", "Creating backup in repository: {}", repo.url);
        log::info!(target: "backend::borg", "  -> archive name: {archive_name}");

        let invocation = self
            .borg(repo, "create")
            .args(["--stats", "--compression", self.archive.compression.as_str()])
            .arg(format!("{}::{archive_name}", repo.url))
            .args(targets.iter().map(|t| t.to_string_lossy().into_owned()));
        run_checked(self.runner, &invocation).map(drop)
    }

    /// Checks the consistency of `repo`.
    pub fn check(&self, repo: &RepositoryConfig) -> Result<(), CommandError> {
        log::info!(target: "backend::borg", "Checking repository: {}", repo.url);

        let mut invocation = self.borg(repo, "check").arg(repo.url.as_str());
        if self.archive.verify_data {
            invocation = invocation.arg("--verify-data");
        }
        run_checked(self.runner, &invocation).map(drop)
    }

    /// Deletes archives of `repo` exceeding the retention.
    pub fn prune(&self, repo: &RepositoryConfig) -> Result<(), CommandError> {
        log::info!(
            target: "backend::borg",
            "Pruning repository {} ({})",
            repo.url,
            self.retention
        );

        if self.retention.is_empty() {
            log::warn!(
                target: "backend::borg",
                "No keep rule configured, borg will refuse to prune {}",
                repo.url
            );
        }

        let invocation = self
            .borg(repo, "prune")
            .args(["-v", "--list", repo.url.as_str()])
            .args(self.retention.prune_args());
        run_checked(self.runner, &invocation).map(drop)
    }

    /// Frees space of `repo` occupied by deleted archives.
    pub fn compact(&self, repo: &RepositoryConfig) -> Result<(), CommandError> {
        log::info!(target: "backend::borg", "Compacting repository: {}", repo.url);

        let invocation = self.borg(repo, "compact").arg(repo.url.as_str());
        run_checked(self.runner, &invocation).map(drop)
    }

    /// Runs a single `stage` for `repo`.
    pub fn run_stage(
        &self,
        stage: Stage,
        repo: &RepositoryConfig,
        archive_name: &str,
        targets: &[PathBuf],
    ) -> Result<(), CommandError> {
        match stage {
            Stage::Create => self.create(repo, archive_name, targets),
            Stage::Verify => self.check(repo),
            Stage::Prune => self.prune(repo),
            Stage::Compact => self.compact(repo),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::command::testing::ScriptedRunner;
    use crate::command::EnvChange;

    fn repo(url: &str, key: Option<&str>) -> RepositoryConfig {
        RepositoryConfig {
            url: url.to_string(),
            passphrase: Some("secret".to_string()),
            ssh_key: key.map(PathBuf::from),
        }
    }

    #[test]
    fn archive_names() {
        let time = Local.with_ymd_and_hms(2025, 3, 9, 4, 5, 6).unwrap();

        assert_eq!(archive_name("linux-backup", &time), "linux-backup-20250309_04-05-06");
    }

    #[test]
    fn create_command() {
        let runner = ScriptedRunner::new();
        let archive = ArchiveConfig::default();
        let retention = RetentionConfig::default();
        let borg = Borg::new(&runner, &archive, &retention);

        borg.create(
            &repo("/srv/borg", None),
            "host-20250101_00-00-00",
            &[PathBuf::from("/etc"), PathBuf::from("/tmp/backup/zfs")],
        )
        .unwrap();

        assert_eq!(
            runner.lines(),
            ["borg create --stats --compression lz4 /srv/borg::host-20250101_00-00-00 /etc /tmp/backup/zfs"]
        );
    }

    #[test]
    fn create_without_targets_is_skipped() {
        let runner = ScriptedRunner::new();
        let archive = ArchiveConfig::default();
        let retention = RetentionConfig::default();
        let borg = Borg::new(&runner, &archive, &retention);

        borg.create(&repo("/srv/borg", None), "a", &[]).unwrap();

        assert!(runner.lines().is_empty());
    }

    #[test]
    fn check_prune_compact_commands() {
        let runner = ScriptedRunner::new();
        let archive = ArchiveConfig {
            verify_data: false,
            ..Default::default()
        };
        let retention = RetentionConfig {
            weekly: None,
            ..Default::default()
        };
        let borg = Borg::new(&runner, &archive, &retention);
        let repo = repo("ssh://u@h:23/./b", None);

        borg.run_stage(Stage::Verify, &repo, "a", &[]).unwrap();
        borg.run_stage(Stage::Prune, &repo, "a", &[]).unwrap();
        borg.run_stage(Stage::Compact, &repo, "a", &[]).unwrap();

        assert_eq!(
            runner.lines(),
            [
                "borg check ssh://u@h:23/./b",
                "borg prune -v --list ssh://u@h:23/./b --keep-daily=7 --keep-monthly=6 --keep-yearly=2",
                "borg compact ssh://u@h:23/./b",
            ]
        );
    }

    #[test]
    fn verify_data_flag() {
        let runner = ScriptedRunner::new();
        let archive = ArchiveConfig::default();
        let retention = RetentionConfig::default();
        let borg = Borg::new(&runner, &archive, &retention);

        borg.check(&repo("/srv/borg", None)).unwrap();

        assert_eq!(runner.lines(), ["borg check /srv/borg --verify-data"]);
    }

    #[test]
    fn ssh_key_does_not_leak_into_next_repository() {
        let runner = ScriptedRunner::new();
        let archive = ArchiveConfig::default();
        let retention = RetentionConfig::default();
        let borg = Borg::new(&runner, &archive, &retention);

        borg.compact(&repo("ssh://a/./r", Some("/root/.ssh/key_a"))).unwrap();
        borg.compact(&repo("ssh://b/./r", None)).unwrap();

        let calls = runner.invocations();
        assert_eq!(
            calls[0].env_overlay(),
            [
                ("BORG_PASSPHRASE".to_string(), EnvChange::Set("secret".to_string())),
                ("BORG_RSH".to_string(), EnvChange::Set("ssh -i /root/.ssh/key_a".to_string())),
            ]
        );
        assert_eq!(
            calls[1].env_overlay(),
            [
                ("BORG_PASSPHRASE".to_string(), EnvChange::Set("secret".to_string())),
                ("BORG_RSH".to_string(), EnvChange::Remove),
            ]
        );
    }

    #[test]
    fn failure_reasons() {
        let repo = repo("/srv/borg", None);

        assert_eq!(Stage::Create.failure_reason(&repo), "Backup failed for /srv/borg");
        assert_eq!(Stage::Verify.failure_reason(&repo), "Check failed for /srv/borg");
        assert_eq!(Stage::Prune.failure_reason(&repo), "Prune failed for /srv/borg");
        assert_eq!(Stage::Compact.failure_reason(&repo), "Compact failed for /srv/borg");
    }

    #[test]
    fn non_zero_exit_is_an_error() {
        let runner = ScriptedRunner::new().fail_on("borg prune");
        let archive = ArchiveConfig::default();
        let retention = RetentionConfig::default();
        let borg = Borg::new(&runner, &archive, &retention);

        let err = borg.prune(&repo("/srv/borg", None)).unwrap_err();

        assert!(matches!(err, CommandError::Failed { .. }));
    }

    #[test]
    fn missing_borg_is_an_error() {
        let runner = ScriptedRunner::new().unspawnable("borg");
        let archive = ArchiveConfig::default();
        let retention = RetentionConfig::default();
        let borg = Borg::new(&runner, &archive, &retention);

        let err = borg.compact(&repo("/srv/borg", None)).unwrap_err();

        assert!(matches!(err, CommandError::Spawn { ref command, .. } if command == "borg compact /srv/borg"));
    }

    #[test]
    fn prune_without_keep_rules_still_runs() {
        let runner = ScriptedRunner::new();
        let archive = ArchiveConfig::default();
        let retention = RetentionConfig {
            daily: None,
            weekly: None,
            monthly: None,
            yearly: None,
        };
        let borg = Borg::new(&runner, &archive, &retention);

        assert!(retention.is_empty());
        borg.prune(&repo("/srv/borg", None)).unwrap();

        assert_eq!(runner.lines(), ["borg prune -v --list /srv/borg"]);
    }
}
