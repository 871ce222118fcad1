//! A single backup run, from acquiring the lock to sending the report.
//!
//! Resources are acquired in the order lock, snapshot root, mounted
//! snapshots and released in reverse. Failures of individual stages are
//! recorded in a [FailureLedger] and never stop the run; only problems
//! before any backup work started abort it with a [RunError].

use std::any::Any;
use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use derive_more::{Display, Error};

use crate::backends::borg::archive_name;
use crate::backends::{Borg, Stage, Zfs};
use crate::command::CommandRunner;
use crate::config::BackupConfig;
use crate::ledger::FailureLedger;
use crate::lock::{LockError, RunLock};
use crate::logging;
use crate::notify::{self, Notifier};
use crate::report::RunSummary;

/// Format of the timestamps in snapshot, archive and log file names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H-%M-%S";

const LOCK_FILE: &str = ".lock";
const SNAPSHOT_DIR: &str = "zfs";

/// Configuration and start time of a run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub config: BackupConfig,
    pub started: DateTime<Local>,
}

impl RunContext {
    pub fn new(config: BackupConfig) -> Self {
        Self {
            config,
            started: Local::now(),
        }
    }

    /// Start of the run, used in snapshot and log file names.
    pub fn timestamp(&self) -> String {
        self.started.format(TIMESTAMP_FORMAT).to_string()
    }

    pub fn lock_path(&self) -> PathBuf {
        self.config.general.tmp_dir.join(LOCK_FILE)
    }

    /// Directory the snapshots are mounted in. Part of every archive if
    /// ZFS pools are configured.
    pub fn snapshot_root(&self) -> PathBuf {
        self.config.general.tmp_dir.join(SNAPSHOT_DIR)
    }
}

#[derive(Debug, Display, Error)]
/// Reasons for aborting a run before any backup work started.
pub enum RunError {
    /// Neither directories nor ZFS pools configured.
    #[display("Neither ZFS pools nor directories configured for backup")]
    NoSources,
    /// Another run holds the lock.
    #[display("Lock file {} already exists, another backup is running", _0.display())]
    AlreadyRunning(#[error(ignore)] PathBuf),
    /// The lock file or the scratch directory couldn't be created.
    #[display("Unable to create {resource} {}: {source}", path.display())]
    ResourceCreation {
        resource: &'static str,
        path: PathBuf,
        source: io::Error,
    },
    /// The scratch directory contains leftovers of an earlier run.
    #[display("Scratch directory {} isn't empty, manual cleanup necessary", _0.display())]
    StaleState(#[error(ignore)] PathBuf),
}

impl From<LockError> for RunError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::AlreadyRunning(path) => Self::AlreadyRunning(path),
            LockError::Create { path, source } => Self::ResourceCreation {
                resource: "lock file",
                path,
                source,
            },
        }
    }
}

impl RunError {
    /// Subject of the notification about the aborted run.
    pub fn subject(&self, tag: &str) -> String {
        match self {
            Self::NoSources => format!("{tag} FAILED: No backup sources configured"),
            Self::AlreadyRunning(_) => format!("{tag} FAILED: Backup Already Running"),
            Self::ResourceCreation { resource, .. } => {
                format!("{tag} FAILED: Unable to create {resource}")
            }
            Self::StaleState(_) => format!("{tag} FAILED: Scratch directory not clean"),
        }
    }

    pub fn body(&self) -> String {
        format!("The backup script did not start: {self}.")
    }
}

/// Progress of a run.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    LockAcquired,
    SnapshotsPrepared,
    TargetsAssembled,
    #[display("PerRepository({_0})")]
    PerRepository(Stage),
    SnapshotsTornDown,
    LockReleased,
    Reported,
    Done,
}

/// Paths handed to `borg create`: the directories followed by the snapshot
/// root if any pool is configured.
///
/// The snapshot root is included even if no snapshot could be mounted.
pub fn assemble_targets(
    directories: &[PathBuf],
    pools: &[String],
    snapshot_root: &Path,
) -> Vec<PathBuf> {
    let mut targets = directories.to_vec();
    if !pools.is_empty() {
        targets.push(snapshot_root.to_path_buf());
    }
    targets
}

/// Sequencing of one run.
pub struct BackupCycle<'a> {
    ctx: &'a RunContext,
    runner: &'a dyn CommandRunner,
    notifier: &'a dyn Notifier,
    phases: Vec<Phase>,
}

impl<'a> BackupCycle<'a> {
    pub fn new(
        ctx: &'a RunContext,
        runner: &'a dyn CommandRunner,
        notifier: &'a dyn Notifier,
    ) -> Self {
        Self {
            ctx,
            runner,
            notifier,
            phases: vec![Phase::Idle],
        }
    }

    /// Phases passed so far, in order.
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    fn enter(&mut self, phase: Phase) {
        log::debug!(target: "cycle", "Entering phase {phase}");
        self.phases.push(phase);
    }

    /// Performs the run and reports the outcome through the notifier.
    ///
    /// Fatal errors are reported too before they are returned.
    pub fn run(&mut self) -> Result<RunSummary, RunError> {
        let ctx = self.ctx;
        let email = &ctx.config.email;
        let result = self.execute();

        match &result {
            Ok(summary) => notify::report(self.notifier, summary, email),
            Err(e) => {
                log::error!(target: "cycle", "{e}");
                notify::dispatch(self.notifier, &e.subject(&email.subject_tag), &e.body());
            }
        }
        self.enter(Phase::Reported);
        self.enter(Phase::Done);

        result
    }

    fn execute(&mut self) -> Result<RunSummary, RunError> {
        let ctx = self.ctx;
        let config = &ctx.config;

        if config.sources.is_empty() {
            return Err(RunError::NoSources);
        }

        let tmp_dir = &config.general.tmp_dir;
        fs::create_dir_all(tmp_dir).map_err(|source| RunError::ResourceCreation {
            resource: "scratch directory",
            path: tmp_dir.clone(),
            source,
        })?;

        let lock = RunLock::acquire(&ctx.lock_path())?;
        self.enter(Phase::LockAcquired);
        ensure_clean(tmp_dir, lock.path())?;

        let mut ledger = FailureLedger::new();
        let zfs = Zfs::new(self.runner, ctx.snapshot_root());
        let sources = &config.sources;

        let mounted = panic::catch_unwind(AssertUnwindSafe(|| {
            zfs.mount_guarded(&sources.zfs_pools, &ctx.timestamp(), &mut ledger)
        }));
        let mounted = match mounted {
            Ok(mounted) => Some(mounted),
            Err(payload) => {
                record_panic(&mut ledger, payload.as_ref());
                None
            }
        };
        self.enter(Phase::SnapshotsPrepared);

        let work = panic::catch_unwind(AssertUnwindSafe(|| {
            self.back_up(zfs.snapshot_root(), &mut ledger)
        }));
        if let Err(payload) = work {
            record_panic(&mut ledger, payload.as_ref());
        }

        // teardown failures belong to this run's report, panic or not
        if let Some(mounted) = mounted {
            mounted.teardown(&mut ledger);
        }
        self.enter(Phase::SnapshotsTornDown);

        zfs.remove_snapshot_root();
        lock.release();
        self.enter(Phase::LockReleased);

        let summary = RunSummary::new(&ledger, ctx.started, Local::now());
        log::info!(target: "cycle", "=== SUMMARY ===");
        for line in summary.body().lines() {
            log::info!(target: "cycle", "{line}");
        }

        Ok(summary)
    }

    /// Archives into every repository and cleans up old log files.
    fn back_up(&mut self, snapshot_root: &Path, ledger: &mut FailureLedger) {
        let ctx = self.ctx;
        let sources = &ctx.config.sources;

        let targets = assemble_targets(&sources.directories, &sources.zfs_pools, snapshot_root);
        log::debug!(target: "cycle", "Backup targets: {targets:?}");
        self.enter(Phase::TargetsAssembled);

        self.process_repositories(&targets, ledger);

        let logging_cfg = &ctx.config.logging;
        logging::collect_garbage(&logging_cfg.dir, &ctx.config.general.script_name, logging_cfg.keep);
    }

    /// Runs every stage for every repository, one stage after the other.
    ///
    /// A failed stage doesn't prevent the following stages, not even for
    /// the same repository.
    fn process_repositories(&mut self, targets: &[PathBuf], ledger: &mut FailureLedger) {
        let ctx = self.ctx;
        let config = &ctx.config;
        if config.repositories.is_empty() {
            log::warn!(target: "cycle", "No borg repositories configured.");
        }

        let borg = Borg::new(self.runner, &config.archive, &config.prune);
        let mut stages = vec![Stage::Create, Stage::Verify, Stage::Prune];
        if config.archive.compact {
            stages.push(Stage::Compact);
        }

        for stage in stages {
            self.enter(Phase::PerRepository(stage));
            for repo in &config.repositories {
                let archive = archive_name(&config.general.backup_name_prefix, &Local::now());
                if let Err(e) = borg.run_stage(stage, repo, &archive, targets) {
                    log::error!(target: "cycle", "{}: {e}", stage.failure_reason(repo));
                    ledger.record(stage.failure_reason(repo));
                }
            }
        }
    }
}

/// The scratch directory must hold nothing but our lock.
fn ensure_clean(tmp_dir: &Path, lock: &Path) -> Result<(), RunError> {
    let entries = fs::read_dir(tmp_dir).map_err(|source| RunError::ResourceCreation {
        resource: "scratch directory",
        path: tmp_dir.to_path_buf(),
        source,
    })?;

    let leftovers: Vec<_> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path != lock)
        .collect();
    if leftovers.is_empty() {
        Ok(())
    } else {
        log::error!(target: "cycle", "Leftovers in scratch directory: {leftovers:?}");
        Err(RunError::StaleState(tmp_dir.to_path_buf()))
    }
}

fn record_panic(ledger: &mut FailureLedger, payload: &(dyn Any + Send)) {
    let message = panic_message(payload);
    log::error!(target: "cycle", "Unexpected error during backup run: {message}");
    ledger.record(format!("Unexpected error during backup run: {message}"));
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
