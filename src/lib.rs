//! Library to backup directories and [ZFS][zfs] pools into [BorgBackup][borg] repositories.
//!
//! A run takes read-only snapshots of the configured pools, archives them
//! together with plain directories into every repository, verifies, prunes
//! and compacts the repositories and finally reports the outcome.
//! The orchestration lives in [`cycle`], the external tools are driven by the
//! modules in [`backends`].
//!
//! [zfs]: https://openzfs.org/
//! [borg]: https://www.borgbackup.org/

#![forbid(unsafe_code)]

pub mod backends;
pub mod cli;
pub mod command;
pub mod config;
pub mod cycle;
pub mod ledger;
pub mod lock;
pub mod logging;
pub mod notify;
pub mod report;
pub mod util;
