//! Kernel configuration stored under `.taskpack/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::io::artifacts::write_atomic;

/// Timestamp written into records in deterministic mode.
pub const DETERMINISTIC_TIMESTAMP: &str = "1970-01-01T00:00:00Z";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimestampMode {
    #[default]
    Deterministic,
    Wallclock,
}

impl TimestampMode {
    pub fn now(self) -> String {
        match self {
            Self::Deterministic => DETERMINISTIC_TIMESTAMP.to_string(),
            Self::Wallclock => Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        }
    }
}

/// Kernel configuration (TOML).
///
/// Edited by humans; missing fields default. Paths are relative to the
/// repository root unless absolute.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    /// Parent of per-packet run directories.
    pub runs_dir: PathBuf,

    /// Parent of packet worktrees.
    pub worktrees_dir: PathBuf,

    /// Availability file consulted by the router.
    pub availability_path: PathBuf,

    pub default_base: String,

    pub default_remote: String,

    /// Truncate runner stdout/stderr logs beyond this many bytes.
    pub runner_output_limit_bytes: usize,

    /// Truncate verification command output in evidence beyond this many bytes.
    pub verification_output_limit_bytes: usize,

    pub timestamp_mode: TimestampMode,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            runs_dir: PathBuf::from("out/runs"),
            worktrees_dir: PathBuf::from(".worktrees"),
            availability_path: PathBuf::from(".taskpack/availability.toml"),
            default_base: "main".to_string(),
            default_remote: "origin".to_string(),
            runner_output_limit_bytes: 100_000,
            verification_output_limit_bytes: 100_000,
            timestamp_mode: TimestampMode::Deterministic,
        }
    }
}

impl KernelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.runs_dir.as_os_str().is_empty() {
            return Err(anyhow!("runs_dir must not be empty"));
        }
        if self.worktrees_dir.as_os_str().is_empty() {
            return Err(anyhow!("worktrees_dir must not be empty"));
        }
        if self.default_base.trim().is_empty() {
            return Err(anyhow!("default_base must not be empty"));
        }
        if self.default_remote.trim().is_empty() {
            return Err(anyhow!("default_remote must not be empty"));
        }
        if self.runner_output_limit_bytes == 0 {
            return Err(anyhow!("runner_output_limit_bytes must be > 0"));
        }
        if self.verification_output_limit_bytes == 0 {
            return Err(anyhow!("verification_output_limit_bytes must be > 0"));
        }
        Ok(())
    }
}

/// Path of the config file for a repository root.
pub fn config_path(repo_root: &Path) -> PathBuf {
    repo_root.join(".taskpack").join("config.toml")
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `KernelConfig::default()`.
pub fn load_config(path: &Path) -> Result<KernelConfig> {
    if !path.exists() {
        let cfg = KernelConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: KernelConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &KernelConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}
