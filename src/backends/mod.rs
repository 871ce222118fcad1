//! External tools driven during a backup run.
//!
//! - [Zfs]: Read-only snapshots of ZFS datasets, mounted below the scratch directory.
//! - [Borg]: Creation, verification, pruning and compaction of borg archives.

pub mod borg;
pub mod zfs;

pub use borg::{Borg, Stage};
pub use zfs::{MountedSnapshots, SnapshotRecord, Zfs};

use std::io;

use derive_more::{Display, Error};

use crate::command::{CommandOutput, CommandRunner, Invocation};

#[derive(Debug, Display, Error)]
/// An external command didn't complete successfully.
pub enum CommandError {
    /// The program couldn't be started.
    #[display("Running `{command}` failed: {source}")]
    Spawn { command: String, source: io::Error },
    /// The program exited unsuccessfully.
    #[display("`{command}` exited unsuccessfully ({})", output.status_description())]
    Failed {
        command: String,
        output: CommandOutput,
    },
}

/// Runs `invocation` and turns anything but a zero exit code into an error.
pub(crate) fn run_checked(
    runner: &dyn CommandRunner,
    invocation: &Invocation,
) -> Result<CommandOutput, CommandError> {
    let output = runner.run(invocation).map_err(|source| {
        log::error!(target: "command", "Unable to run `{invocation}`: {source}");
        CommandError::Spawn {
            command: invocation.to_string(),
            source,
        }
    })?;

    if output.success() {
        Ok(output)
    } else {
        Err(CommandError::Failed {
            command: invocation.to_string(),
            output,
        })
    }
}
