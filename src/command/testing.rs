//! Scripted [CommandRunner] for tests.

use std::cell::RefCell;
use std::io;

use super::{CommandOutput, CommandRunner, Invocation};

/// Records every invocation and fails those whose command line starts with
/// one of the configured prefixes.
#[derive(Debug, Default)]
pub(crate) struct ScriptedRunner {
    calls: RefCell<Vec<Invocation>>,
    failing: Vec<String>,
    unspawnable: Vec<String>,
}

impl ScriptedRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Commands starting with `prefix` exit with code 1.
    pub(crate) fn fail_on(mut self, prefix: &str) -> Self {
        self.failing.push(prefix.to_string());
        self
    }

    /// Commands starting with `prefix` can't be spawned.
    pub(crate) fn unspawnable(mut self, prefix: &str) -> Self {
        self.unspawnable.push(prefix.to_string());
        self
    }

    pub(crate) fn invocations(&self) -> Vec<Invocation> {
        self.calls.borrow().clone()
    }

    /// Rendered command lines in call order.
    pub(crate) fn lines(&self) -> Vec<String> {
        self.calls.borrow().iter().map(ToString::to_string).collect()
    }

    pub(crate) fn count_starting_with(&self, prefix: &str) -> usize {
        self.lines().iter().filter(|l| l.starts_with(prefix)).count()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, invocation: &Invocation) -> io::Result<CommandOutput> {
        self.calls.borrow_mut().push(invocation.clone());
        let line = invocation.to_string();

        if self.unspawnable.iter().any(|p| line.starts_with(p)) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "scripted spawn failure"));
        }
        if self.failing.iter().any(|p| line.starts_with(p)) {
            return Ok(CommandOutput {
                stderr: "scripted failure".to_string(),
                ..CommandOutput::with_code(1)
            });
        }
        Ok(CommandOutput::with_code(0))
    }
}
