//! Invocation of external programs.
//!
//! Every interaction with `zfs`, `mount` and `borg` goes through a
//! [CommandRunner]. A non-zero exit code is not an error of the runner,
//! it is returned in [CommandOutput] and the caller decides what it means.

use std::fmt;
use std::io::{self, Read};
use std::process::{Child, Command, Output, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[cfg(test)]
pub(crate) mod testing;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Change applied to one environment variable of the spawned process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvChange {
    Set(String),
    Remove,
}

/// A program together with its arguments and environment overlay.
///
/// The overlay only applies to the spawned process, the environment of the
/// current process is never touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
    env: Vec<(String, EnvChange)>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets `key` to `value` for this invocation only.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), EnvChange::Set(value.into())));
        self
    }

    /// Removes `key` from the inherited environment for this invocation only.
    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        self.env.push((key.into(), EnvChange::Remove));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn env_overlay(&self) -> &[(String, EnvChange)] {
        &self.env
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        for (key, change) in &self.env {
            match change {
                EnvChange::Set(value) => {
                    command.env(key, value);
                }
                EnvChange::Remove => {
                    command.env_remove(key);
                }
            }
        }

        command
    }
}

/// Renders the command line. The environment overlay is left out on purpose,
/// it may carry passphrases.
impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Result of a finished external program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, [None] if the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// The process was killed after exceeding the configured timeout.
    pub timed_out: bool,
}

impl CommandOutput {
    /// Output of a process exiting with `code` and no output.
    pub fn with_code(code: i32) -> Self {
        Self {
            code: Some(code),
            ..Default::default()
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Human readable exit status.
    pub fn status_description(&self) -> String {
        match self.code {
            _ if self.timed_out => "timed out".to_string(),
            Some(code) => format!("code {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            timed_out: false,
        }
    }
}

/// Executes an [Invocation] synchronously.
pub trait CommandRunner {
    /// Runs the invocation to completion and captures both output streams.
    ///
    /// # Errors
    ///
    /// Only if the program could not be spawned or waited for.
    /// A non-zero exit code is reported through [CommandOutput::code].
    fn run(&self, invocation: &Invocation) -> io::Result<CommandOutput>;
}

/// Spawns real processes.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    timeout: Option<Duration>,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill commands that run longer than `timeout`.
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> io::Result<CommandOutput> {
        log::debug!(target: "command", "Running: {invocation}");

        let mut command = invocation.to_command();
        let output = match self.timeout {
            None => command.output()?.into(),
            Some(timeout) => wait_with_timeout(command.spawn()?, timeout)?,
        };

        log_output(invocation, &output);
        Ok(output)
    }
}

fn wait_with_timeout(mut child: Child, timeout: Duration) -> io::Result<CommandOutput> {
    // drain pipes concurrently so a chatty child can't block on a full pipe
    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let code = loop {
        if let Some(status) = child.try_wait()? {
            break status.code();
        }
        if Instant::now() >= deadline {
            log::warn!(target: "command", "Killing command after {}s timeout", timeout.as_secs_f32());
            // the child may have exited right after try_wait
            let _ = child.kill();
            child.wait()?;
            timed_out = true;
            break None;
        }
        thread::sleep(POLL_INTERVAL);
    };

    Ok(CommandOutput {
        code,
        stdout: join_reader(stdout),
        stderr: join_reader(stderr),
        timed_out,
    })
}

fn spawn_reader<T: Read + Send + 'static>(mut pipe: T) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn join_reader(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .map(|buf| String::from_utf8_lossy(&buf).into_owned())
        .unwrap_or_default()
}

fn log_output(invocation: &Invocation, output: &CommandOutput) {
    if output.success() {
        log::debug!(target: "command", "Command succeeded: {invocation}");
    } else {
        log::error!(
            target: "command",
            "Command failed ({}): {invocation}",
            output.status_description()
        );
        log::error!(target: "command", "stderr: {}", output.stderr.trim());
    }

    if !output.stdout.is_empty() {
        log::debug!(target: "command", "stdout:\n{}", output.stdout.trim());
    }
    if !output.stderr.is_empty() {
        log::debug!(target: "command", "stderr:\n{}", output.stderr.trim());
    }
}

/// Logs invocations instead of executing them and reports success.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunner;

impl CommandRunner for DryRunner {
    fn run(&self, invocation: &Invocation) -> io::Result<CommandOutput> {
        log::info!(target: "command", "Dry run, not executing: {invocation}");
        Ok(CommandOutput::with_code(0))
    }
}
