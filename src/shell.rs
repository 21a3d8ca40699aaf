//! External command execution for trust-store and browser tooling.
//!
//! Installers talk to `certutil`, `security`, `update-ca-certificates` and
//! friends through the [`CommandRunner`] trait so tests can substitute a fake
//! store without touching the host.

use std::io;
use std::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput>;

    /// Run and report plain success; spawn errors count as failure
    fn succeeds(&self, program: &str, args: &[&str]) -> bool {
        match self.run(program, args) {
            Ok(output) => {
                if !output.success {
                    debug!("{} {:?} failed: {}", program, args, output.stderr.trim());
                }
                output.success
            }
            Err(e) => {
                debug!("Could not run {}: {}", program, e);
                false
            }
        }
    }

    /// Stdout of a successful run, `None` otherwise
    fn stdout_of(&self, program: &str, args: &[&str]) -> Option<String> {
        match self.run(program, args) {
            Ok(output) if output.success => Some(output.stdout),
            Ok(output) => {
                debug!("{} {:?} failed: {}", program, args, output.stderr.trim());
                None
            }
            Err(e) => {
                debug!("Could not run {}: {}", program, e);
                None
            }
        }
    }
}

/// Runs real processes on the host
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        debug!("Running {} {:?}", program, args);
        let output = Command::new(program).args(args).output()?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
