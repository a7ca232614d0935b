//! Shared domain types for the kernel and the worktree engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Stable refusal reason codes.
///
/// The snake_case wire form is contractual: tests and downstream tooling match
/// on it, so variants are only ever added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalCode {
    PacketFormat,
    AvailabilityInvalid,
    RouteRefused,
    RunnerNotConfigured,
    DirtyTree,
    BranchExists,
    WorktreePathExists,
    DetachedHead,
    OnBaseBranch,
    PrestagedIndex,
    MissingCommitPlan,
    EmptyStep,
    OutsideAllowlist,
    VerificationFailed,
    Unpromoted,
    AllowlistViolations,
    MissingArtifact,
    RebaseConflict,
    NotFastForward,
    PushMismatch,
    UnsupportedMode,
}

impl RefusalCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PacketFormat => "packet_format",
            Self::AvailabilityInvalid => "availability_invalid",
            Self::RouteRefused => "route_refused",
            Self::RunnerNotConfigured => "runner_not_configured",
            Self::DirtyTree => "dirty_tree",
            Self::BranchExists => "branch_exists",
            Self::WorktreePathExists => "worktree_path_exists",
            Self::DetachedHead => "detached_head",
            Self::OnBaseBranch => "on_base_branch",
            Self::PrestagedIndex => "prestaged_index",
            Self::MissingCommitPlan => "missing_commit_plan",
            Self::EmptyStep => "empty_step",
            Self::OutsideAllowlist => "outside_allowlist",
            Self::VerificationFailed => "verification_failed",
            Self::Unpromoted => "unpromoted",
            Self::AllowlistViolations => "allowlist_violations",
            Self::MissingArtifact => "missing_artifact",
            Self::RebaseConflict => "rebase_conflict",
            Self::NotFastForward => "not_fast_forward",
            Self::PushMismatch => "push_mismatch",
            Self::UnsupportedMode => "unsupported_mode",
        }
    }
}

impl fmt::Display for RefusalCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured, non-exceptional decision not to proceed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refusal {
    pub code: RefusalCode,
    /// Human-readable reason.
    pub message: String,
    /// Smallest concrete precondition that would need to change to proceed.
    pub remedy: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

impl Refusal {
    pub fn new(code: RefusalCode, message: impl Into<String>, remedy: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            remedy: remedy.into(),
            details: Vec::new(),
        }
    }

    pub fn with_details(mut self, details: Vec<String>) -> Self {
        self.details = details;
        self
    }
}

impl fmt::Display for Refusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "refused ({}): {}", self.code, self.message)?;
        for detail in &self.details {
            write!(f, "\n  - {detail}")?;
        }
        write!(f, "\nto proceed: {}", self.remedy)
    }
}

/// Stage result: success or refusal. Unexpected failures travel through
/// `anyhow::Result` around this value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Done(T),
    Refused(Refusal),
}

impl<T> Outcome<T> {
    pub fn is_refused(&self) -> bool {
        matches!(self, Self::Refused(_))
    }

    pub fn refusal(&self) -> Option<&Refusal> {
        match self {
            Self::Done(_) => None,
            Self::Refused(refusal) => Some(refusal),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Done(value) => Outcome::Done(f(value)),
            Self::Refused(refusal) => Outcome::Refused(refusal),
        }
    }
}

/// How an unclean working tree is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DirtyPolicy {
    #[default]
    Refuse,
    Stash,
}

impl DirtyPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Refuse => "refuse",
            Self::Stash => "stash",
        }
    }
}

impl FromStr for DirtyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "refuse" => Ok(Self::Refuse),
            "stash" => Ok(Self::Stash),
            other => Err(format!("unknown dirty policy '{other}' (expected refuse|stash)")),
        }
    }
}

/// Whether the kernel invokes a runner itself or emits a handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Auto,
    #[default]
    Manual,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown execution mode '{other}' (expected auto|manual)")),
        }
    }
}
