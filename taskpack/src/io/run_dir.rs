//! Canonical file names inside a run directory.

use std::path::{Path, PathBuf};

pub const TASK_PACKET: &str = "TASK_PACKET.md";
pub const RUN_ENVELOPE: &str = "RUN_ENVELOPE.json";
pub const EVIDENCE: &str = "EVIDENCE.md";
pub const ALLOWLIST_DIFF: &str = "ALLOWLIST_DIFF.json";
pub const VIOLATIONS: &str = "VIOLATIONS.md";
pub const PROMOTION_TOKEN: &str = "PROMOTION_TOKEN.json";
pub const COMMIT_RUN: &str = "COMMIT_RUN.json";
pub const WORKTREE: &str = "WORKTREE.json";
pub const COMMIT_SEQUENCE_RUN: &str = "COMMIT_SEQUENCE_RUN.json";
pub const FINISH: &str = "FINISH.json";
pub const ROUTE_PLAN_JSON: &str = "ROUTE_PLAN.json";
pub const ROUTE_PLAN_MD: &str = "ROUTE_PLAN.md";
pub const HANDOFF: &str = "HANDOFF.md";
pub const REFUSAL_REPORT: &str = "REFUSAL_REPORT.json";
pub const RUN_REPORT: &str = "RUN_REPORT.json";
pub const ERROR_REPORT: &str = "ERROR_REPORT.json";
pub const RUNNER_PROMPT: &str = "RUNNER_PROMPT.md";
pub const RUNNER_STDOUT: &str = "RUNNER_STDOUT.log";
pub const RUNNER_STDERR: &str = "RUNNER_STDERR.log";

/// Paths of the records inside one run directory.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub dir: PathBuf,
    pub task_packet: PathBuf,
    pub envelope: PathBuf,
    pub evidence: PathBuf,
    pub allowlist_diff: PathBuf,
    pub promotion_token: PathBuf,
    pub worktree: PathBuf,
}

impl RunPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            task_packet: dir.join(TASK_PACKET),
            envelope: dir.join(RUN_ENVELOPE),
            evidence: dir.join(EVIDENCE),
            allowlist_diff: dir.join(ALLOWLIST_DIFF),
            promotion_token: dir.join(PROMOTION_TOKEN),
            worktree: dir.join(WORKTREE),
            dir,
        }
    }

    /// Last path component, used in stash messages and default branch names.
    pub fn run_name(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "run".to_string())
    }

    /// Run directory relative to `repo_root`, when it lies inside it.
    pub fn relative_to(&self, repo_root: &Path) -> Option<String> {
        self.dir
            .strip_prefix(repo_root)
            .ok()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .filter(|p| !p.is_empty())
    }
}

/// `<runs_dir>/<packet id>/<first 16 hex of the packet hash>`.
pub fn default_run_dir(runs_dir: &Path, packet_id: &str, packet_sha256: &str) -> PathBuf {
    let short = &packet_sha256[..packet_sha256.len().min(16)];
    runs_dir.join(packet_id).join(short)
}
