//! Implements atomic backups of ZFS datasets using [Zfs] snapshots.
//!
//! Every configured dataset gets a non-recursive snapshot which is mounted
//! read-only below the snapshot root. Borg then archives the snapshot root
//! instead of the live datasets.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::{run_checked, CommandError};
use crate::command::{CommandRunner, Invocation};
use crate::ledger::FailureLedger;

mod snapshot;

pub use snapshot::{mount_point, snapshot_name, SnapshotRecord};

/// Creates, mounts and removes snapshots of ZFS datasets.
#[derive(Clone)]
pub struct Zfs<'a> {
    runner: &'a dyn CommandRunner,
    snapshot_root: PathBuf,
}

impl<'a> Zfs<'a> {
    /// Snapshots get mounted in subdirectories of `snapshot_root`.
    pub fn new(runner: &'a dyn CommandRunner, snapshot_root: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            snapshot_root: snapshot_root.into(),
        }
    }

    pub fn snapshot_root(&self) -> &Path {
        &self.snapshot_root
    }

    /// Snapshots and mounts every dataset in `pools`, in order.
    ///
    /// A dataset failing in any step is rolled back right away and recorded
    /// in `ledger`, the remaining datasets are processed regardless.
    /// Only fully mounted snapshots are returned.
    pub fn create_and_mount(
        &self,
        pools: &[String],
        timestamp: &str,
        ledger: &mut FailureLedger,
    ) -> Vec<SnapshotRecord> {
        let mut records = Vec::new();
        if pools.is_empty() {
            return records;
        }

        log::info!(target: "backend::zfs", "Creating and mounting ZFS snapshots...");
        if let Err(e) = fs::create_dir_all(&self.snapshot_root) {
            log::error!(
                target: "backend::zfs",
                "Unable to create {}: {e}",
                self.snapshot_root.display()
            );
            ledger.record(format!(
                "Unable to create {}",
                self.snapshot_root.display()
            ));
            return records;
        }

        for pool in pools {
            if let Some(record) = self.snapshot_and_mount(pool, timestamp, ledger) {
                log::info!(
                    target: "backend::zfs",
                    "Snapshot created and mounted: {} -> {}",
                    record.snapshot(),
                    record.mount_point().display()
                );
                records.push(record);
            }
        }

        records
    }

    fn snapshot_and_mount(
        &self,
        pool: &str,
        timestamp: &str,
        ledger: &mut FailureLedger,
    ) -> Option<SnapshotRecord> {
        let snapshot = snapshot_name(pool, timestamp);
        let mount_point = mount_point(&self.snapshot_root, pool);

        if let Err(e) = self.create_snapshot(&snapshot) {
            log::error!(target: "backend::zfs", "Snapshot failed for {snapshot}: {e}");
            ledger.record(format!("Snapshot failed for {snapshot}"));
            return None;
        }

        // must not exist yet, an existing directory may be a foreign mount
        if let Err(e) = fs::create_dir(&mount_point) {
            log::error!(
                target: "backend::zfs",
                "Unable to create mount point {}: {e}",
                mount_point.display()
            );
            ledger.record(format!(
                "Unable to create mount point {}",
                mount_point.display()
            ));
            self.rollback_snapshot(&snapshot);
            return None;
        }

        if let Err(e) = self.mount(&snapshot, &mount_point) {
            log::error!(target: "backend::zfs", "Mount failed for {snapshot}: {e}");
            ledger.record(format!("Mount failed for {snapshot}"));
            self.rollback_snapshot(&snapshot);
            if let Err(e) = fs::remove_dir(&mount_point) {
                log::warn!(
                    target: "backend::zfs",
                    "Unable to remove mount point {}: {e}",
                    mount_point.display()
                );
            }
            return None;
        }

        Some(SnapshotRecord::new(pool.to_string(), snapshot, mount_point))
    }

    fn rollback_snapshot(&self, snapshot: &str) {
        if let Err(e) = self.destroy(snapshot) {
            log::warn!(
                target: "backend::zfs",
                "Rolling back snapshot {snapshot} failed, manual cleanup may be necessary: {e}"
            );
        }
    }

    /// Unmounts and destroys every snapshot in `records`, in order.
    ///
    /// Failures are recorded in `ledger` and never stop the teardown of the
    /// remaining records.
    pub fn teardown(&self, records: &[SnapshotRecord], ledger: &mut FailureLedger) {
        if records.is_empty() {
            return;
        }
        log::info!(target: "backend::zfs", "Unmounting and destroying ZFS snapshots...");

        for record in records {
            let mount_point = record.mount_point();
            match self.unmount(mount_point) {
                Err(e) => {
                    log::error!(
                        target: "backend::zfs",
                        "Unmount failed for {}, manual cleanup may be necessary: {e}",
                        mount_point.display()
                    );
                    ledger.record(format!("Unmount failed for {}", mount_point.display()));
                }
                Ok(()) => {
                    if let Err(e) = fs::remove_dir(mount_point) {
                        log::warn!(
                            target: "backend::zfs",
                            "Unable to remove mount point {}: {e}",
                            mount_point.display()
                        );
                    }
                }
            }

            if let Err(e) = self.destroy(record.snapshot()) {
                log::error!(
                    target: "backend::zfs",
                    "Destroy failed for {}: {e}",
                    record.snapshot()
                );
                ledger.record(format!("Destroy failed for {}", record.snapshot()));
            }
        }
    }

    /// Same as [create_and_mount](Self::create_and_mount), but the snapshots
    /// are torn down when the returned guard is dropped.
    pub fn mount_guarded(
        &self,
        pools: &[String],
        timestamp: &str,
        ledger: &mut FailureLedger,
    ) -> MountedSnapshots<'a> {
        let records = self.create_and_mount(pools, timestamp, ledger);
        MountedSnapshots {
            zfs: self.clone(),
            records,
            torn_down: false,
        }
    }

    /// Removes the snapshot root if nothing is left inside.
    ///
    /// Mount points whose unmount failed are left alone, never removed recursively.
    pub fn remove_snapshot_root(&self) {
        match fs::remove_dir(&self.snapshot_root) {
            Ok(()) => log::debug!(
                target: "backend::zfs",
                "Removed snapshot root {}",
                self.snapshot_root.display()
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!(
                target: "backend::zfs",
                "Snapshot root {} not removed: {e}",
                self.snapshot_root.display()
            ),
        }
    }
}

// commands
impl Zfs<'_> {
    fn create_snapshot(&self, snapshot: &str) -> Result<(), CommandError> {
        // no `-r`, child datasets aren't part of the snapshot
        let invocation = Invocation::new("zfs").arg("snapshot").arg(snapshot);
        run_checked(self.runner, &invocation).map(drop)
    }

    fn mount(&self, snapshot: &str, mount_point: &Path) -> Result<(), CommandError> {
        let invocation = Invocation::new("mount")
            .args(["-t", "zfs", "-o", "ro", snapshot])
            .arg(mount_point.to_string_lossy());
        run_checked(self.runner, &invocation).map(drop)
    }

    fn unmount(&self, mount_point: &Path) -> Result<(), CommandError> {
        let invocation = Invocation::new("umount").arg(mount_point.to_string_lossy());
        run_checked(self.runner, &invocation).map(drop)
    }

    fn destroy(&self, snapshot: &str) -> Result<(), CommandError> {
        let invocation = Invocation::new("zfs").arg("destroy").arg(snapshot);
        run_checked(self.runner, &invocation).map(drop)
    }
}

/// Mounted snapshots which get torn down at the latest when dropped.
pub struct MountedSnapshots<'a> {
    zfs: Zfs<'a>,
    records: Vec<SnapshotRecord>,
    torn_down: bool,
}

impl MountedSnapshots<'_> {
    pub fn records(&self) -> &[SnapshotRecord] {
        &self.records
    }

    /// Tears the snapshots down and records failures in `ledger`.
    pub fn teardown(mut self, ledger: &mut FailureLedger) {
        self.torn_down = true;
        self.zfs.teardown(&self.records, ledger);
    }
}

impl Drop for MountedSnapshots<'_> {
    fn drop(&mut self) {
        if self.torn_down || self.records.is_empty() {
            return;
        }

        log::warn!(target: "backend::zfs", "Tearing down snapshots of an aborted run");
        let mut ledger = FailureLedger::new();
        self.zfs.teardown(&self.records, &mut ledger);
        for reason in ledger.reasons() {
            log::error!(target: "backend::zfs", "{reason}");
        }
    }
}
