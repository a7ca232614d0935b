//! Runner adapters for `auto` mode.
//!
//! The [`RunnerAdapter`] trait decouples the kernel from how a runner is
//! launched. The kernel calls it at most once per invocation.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::io::exec::{CommandExec, CommandSpec, bounded};

/// Parameters for one runner invocation.
#[derive(Debug, Clone)]
pub struct RunnerInvocation {
    pub runner: String,
    pub model: String,
    pub step: String,
    /// Program and arguments from the availability file.
    pub command: Vec<String>,
    /// Working directory for the runner (repository root).
    pub workdir: PathBuf,
    /// Already-written prompt file, fed to the runner's stdin.
    pub prompt_path: PathBuf,
    pub output_limit_bytes: usize,
}

/// What the runner did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RunnerResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Abstraction over runner backends.
pub trait RunnerAdapter {
    /// Launch the runner once. Failing to launch is an error; a non-zero exit
    /// is a result.
    fn invoke(&self, request: &RunnerInvocation) -> Result<RunnerResult>;
}

/// Launches the configured command through a [`CommandExec`]. The model name
/// is exported as `TASKPACK_MODEL` via `env`.
pub struct CommandRunner<'a> {
    exec: &'a dyn CommandExec,
}

impl<'a> CommandRunner<'a> {
    pub fn new(exec: &'a dyn CommandExec) -> Self {
        Self { exec }
    }
}

impl RunnerAdapter for CommandRunner<'_> {
    #[instrument(skip_all, fields(runner = %request.runner, model = %request.model, step = %request.step))]
    fn invoke(&self, request: &RunnerInvocation) -> Result<RunnerResult> {
        let (program, args) = request
            .command
            .split_first()
            .ok_or_else(|| anyhow!("runner {} has no command", request.runner))?;
        info!(program = %program, "launching runner");
        let spec = CommandSpec::new("env", &request.workdir)
            .arg(format!("TASKPACK_MODEL={}", request.model))
            .arg(format!("TASKPACK_STEP={}", request.step))
            .arg(program.as_str())
            .args(args.iter().map(String::as_str))
            .stdin_file(&request.prompt_path);
        let output = self
            .exec
            .run(&spec)
            .with_context(|| format!("launch runner {}", request.runner))?;
        if !output.success() {
            warn!(exit_code = ?output.code, "runner exited unsuccessfully");
        }
        Ok(RunnerResult {
            exit_code: output.code,
            stdout: bounded(&output.stdout, request.output_limit_bytes),
            stderr: bounded(&output.stderr, request.output_limit_bytes),
        })
    }
}
