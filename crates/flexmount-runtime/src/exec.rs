use crate::RuntimeError;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn stdout(text: &str) -> Self {
        Self {
            stdout: text.to_owned(),
            stderr: String::new(),
        }
    }

    /// Stdout followed by stderr, the way a terminal would interleave them.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        out.push_str(&self.stderr);
        out
    }
}

/// Running binaries on the host.
pub trait HostExec: Send + Sync {
    /// Run `program` to completion. A non-zero exit is a
    /// [`RuntimeError::CommandFailed`] carrying the combined output.
    fn run(&self, program: &str, args: &[String]) -> Result<ExecOutput, RuntimeError>;

    /// Find `program` on the search path.
    fn lookup(&self, program: &str) -> Option<PathBuf>;

    fn exists(&self, path: &Path) -> bool;
}

/// [`HostExec`] backed by `std::process::Command` and the `PATH` variable.
#[derive(Debug, Clone, Default)]
pub struct SystemExec;

impl SystemExec {
    pub fn new() -> Self {
        Self
    }
}

impl HostExec for SystemExec {
    fn run(&self, program: &str, args: &[String]) -> Result<ExecOutput, RuntimeError> {
        debug!(program, ?args, "running host command");
        let output = Command::new(program).args(args).output()?;
        let result = ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if output.status.success() {
            Ok(result)
        } else {
            Err(RuntimeError::CommandFailed {
                program: program.to_owned(),
                code: output.status.code().unwrap_or(-1),
                output: result.combined().trim().to_owned(),
            })
        }
    }

    fn lookup(&self, program: &str) -> Option<PathBuf> {
        if program.contains('/') {
            let path = PathBuf::from(program);
            return is_executable(&path).then_some(path);
        }
        let search = std::env::var_os("PATH")?;
        std::env::split_paths(&search)
            .map(|dir| dir.join(program))
            .find(|candidate| is_executable(candidate))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
