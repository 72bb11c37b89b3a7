//! Subprocess seam for stage bodies.
//!
//! Stage bodies never call `Command::output` directly; they go through the
//! [`CmdRunner`] carried on the build context. Tests substitute a stub
//! function, and the executor/planner layers stay free of process
//! side-effects entirely.

use anyhow::{bail, Context, Result};
use std::io;
use std::process::{Command, Output};

/// Signature of the function that actually launches a command.
pub type ExecFn = fn(&mut Command) -> io::Result<Output>;

#[derive(Debug, Clone, Copy)]
pub struct CmdRunner(ExecFn);

fn run_real(cmd: &mut Command) -> io::Result<Output> {
    cmd.output()
}

impl Default for CmdRunner {
    fn default() -> Self {
        CmdRunner(run_real)
    }
}

impl CmdRunner {
    /// A runner backed by a custom launcher, used by tests.
    pub fn with(exec: ExecFn) -> Self {
        CmdRunner(exec)
    }

    /// Run a command and require success. Failures carry the trimmed
    /// stderr so the user sees the tool's own diagnostic.
    pub fn run(&self, cmd: &mut Command) -> Result<Output> {
        let program = cmd.get_program().to_string_lossy().to_string();
        let output = (self.0)(cmd).with_context(|| format!("running '{program}'"))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "command '{}' failed ({}): {}",
                program,
                output.status,
                stderr.trim()
            );
        }
        Ok(output)
    }
}
