//! Log setup: every run logs to stderr and into a log file of its own.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use log::LevelFilter;

/// Log file of the run started at `timestamp`.
pub fn log_file_path(dir: &Path, script_name: &str, timestamp: &str) -> PathBuf {
    dir.join(format!("{script_name}_{timestamp}.log"))
}

/// Log file shared with the logger. Output is written to stderr only until
/// a file is [attached](Self::attach).
#[derive(Clone, Default)]
pub struct LogFile {
    file: Arc<Mutex<Option<File>>>,
}

impl LogFile {
    /// Creates `path` and duplicates all further log output into it.
    pub fn attach(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create_new(path)?;
        *self.file.lock().unwrap_or_else(PoisonError::into_inner) = Some(file);
        Ok(())
    }
}

/// Duplicates log output into the attached [LogFile].
struct Tee {
    log_file: LogFile,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // losing the console (e.g. closed by cron) must not lose the log file
        let _ = io::stderr().write_all(buf);
        let mut file = self
            .log_file
            .file
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(file) = file.as_mut() {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stderr().flush();
        let mut file = self
            .log_file
            .file
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// Initialises the logger writing to stderr.
///
/// The returned [LogFile] adds a log file later on.
pub fn init(verbose: Option<LevelFilter>) -> LogFile {
    let log_file = LogFile::default();

    let mut env_logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = verbose {
        env_logger.filter_level(level);
    }
    env_logger.target(env_logger::Target::Pipe(Box::new(Tee {
        log_file: log_file.clone(),
    })));
    if let Err(e) = env_logger.try_init() {
        eprintln!("Initialising the logger failed: {e}");
    }

    log_file
}

/// Deletes the oldest log files so that only the newest `keep` remain.
///
/// Only files named like the logs of `script_name` are considered.
/// `keep = 0` keeps every file. Returns the number of deleted files.
pub fn collect_garbage(dir: &Path, script_name: &str, keep: usize) -> usize {
    if keep == 0 {
        log::info!(target: "logging", "Log garbage collection disabled, keeping all log files.");
        return 0;
    }

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!(target: "logging", "Unable to list log directory {}: {e}", dir.display());
            return 0;
        }
    };

    let prefix = format!("{script_name}_");
    let mut logs: Vec<(SystemTime, PathBuf)> = entries
        .filter_map(Result::ok)
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with(&prefix) && name.ends_with(".log")
        })
        .filter_map(|entry| {
            let modified = entry.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, entry.path()))
        })
        .collect();

    if logs.len() <= keep {
        log::info!(target: "logging", "{} log files present, none deleted.", logs.len());
        return 0;
    }

    // oldest first
    logs.sort();
    let excess = logs.len() - keep;
    log::info!(
        target: "logging",
        "{} log files present, deleting the oldest {excess}.",
        logs.len()
    );

    let mut deleted = 0;
    for (_, path) in logs.into_iter().take(excess) {
        match fs::remove_file(&path) {
            Ok(()) => {
                log::info!(target: "logging", "Deleted: {}", path.display());
                deleted += 1;
            }
            Err(e) => log::error!(target: "logging", "Unable to delete log file {}: {e}", path.display()),
        }
    }
    deleted
}
