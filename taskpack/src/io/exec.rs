//! Command-execution abstraction.
//!
//! Every subprocess (git, verification commands, runners) goes through
//! [`CommandExec`] so orchestration can be driven by a scripted fake in tests.
//! Calls are synchronous and block the calling thread; there is no timeout.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

/// A command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// File fed to the child's stdin. `None` means an empty stdin.
    pub stdin_path: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            stdin_path: None,
        }
    }

    /// `sh -c <line>` in `cwd`.
    pub fn shell(line: &str, cwd: impl Into<PathBuf>) -> Self {
        Self::new("sh", cwd).args(["-c", line])
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

    pub fn stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin_path = Some(path.into());
        self
    }

    /// `program arg1 arg2`, for logs and error messages.
    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, or `None` when terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs commands. Failing to launch is an error; a non-zero exit is not.
pub trait CommandExec {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Executes real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemExec;

impl CommandExec for SystemExec {
    #[instrument(skip_all, fields(program = %spec.program, cwd = %spec.cwd.display()))]
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let stdin = match &spec.stdin_path {
            Some(path) => Stdio::from(
                File::open(path).with_context(|| format!("open stdin {}", path.display()))?,
            ),
            None => Stdio::null(),
        };
        let output = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(stdin)
            .output()
            .with_context(|| format!("spawn {}", spec.display()))?;
        let code = output.status.code();
        if code.is_none() {
            warn!(command = %spec.display(), "command terminated by signal");
        }
        debug!(exit_code = ?code, "command finished");
        Ok(CommandOutput {
            code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Keep at most `limit` bytes of `text`, cut on a char boundary, with a
/// notice of how much was dropped.
pub fn bounded(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}\n[truncated {} bytes]\n",
        &text[..cut],
        text.len() - cut
    )
}

/// Run `spec` and fail unless it exits 0.
pub fn run_checked(exec: &dyn CommandExec, spec: &CommandSpec) -> Result<CommandOutput> {
    let output = exec.run(spec)?;
    if !output.success() {
        anyhow::bail!(
            "{} failed ({}): {}",
            spec.display(),
            exit_label(output.code),
            output.stderr.trim()
        );
    }
    Ok(output)
}

pub fn exit_label(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit {code}"),
        None => "signal".to_string(),
    }
}

/// Resolve `path` against `base` unless already absolute.
pub fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
