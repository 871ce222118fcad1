use std::path::{Path, PathBuf};

/// A snapshot of a ZFS dataset which is mounted read-only.
///
/// Records only exist for snapshots whose creation and mount succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pool: String,
    snapshot: String,
    mount_point: PathBuf,
}

impl SnapshotRecord {
    pub(super) fn new(pool: String, snapshot: String, mount_point: PathBuf) -> Self {
        Self {
            pool,
            snapshot,
            mount_point,
        }
    }

    /// Dataset the snapshot was taken of.
    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Full snapshot name, e.g. `tank/data@backup-snapshot_20250101_03-00-00`.
    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }
}

/// Name of the snapshot taken of `pool` in the run started at `timestamp`.
pub fn snapshot_name(pool: &str, timestamp: &str) -> String {
    format!("{pool}@backup-snapshot_{timestamp}")
}

/// Mount point of the snapshot of `pool` below `snapshot_root`.
///
/// Dataset names contain `/`, which is replaced to get a single directory.
pub fn mount_point(snapshot_root: &Path, pool: &str) -> PathBuf {
    snapshot_root.join(pool.replace('/', "_"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert_eq!(
            snapshot_name("rpool/data", "20250101_03-00-00"),
            "rpool/data@backup-snapshot_20250101_03-00-00"
        );
        assert_eq!(
            mount_point(Path::new("/tmp/backup/zfs"), "rpool/data/vm"),
            PathBuf::from("/tmp/backup/zfs/rpool_data_vm")
        );
        assert_eq!(
            mount_point(Path::new("/tmp/backup/zfs"), "tank"),
            PathBuf::from("/tmp/backup/zfs/tank")
        );
    }
}
