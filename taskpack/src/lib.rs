//! Deterministic task-packet execution kernel.
//!
//! A task packet is a Markdown work order. The kernel validates it, routes
//! each step to a runner/model pair under an explicit availability policy,
//! then either invokes the runner or emits a handoff. Every decision lands in
//! canonical, hashed artifacts inside a run directory. A worktree engine
//! carries the resulting changes onto the base branch under allowlist and
//! dirty-tree rules.
//!
//! - **[`core`]**: pure, deterministic logic (packet parsing, scoring,
//!   planning, allowlists, commit plans, the kernel state machine).
//! - **[`io`]**: side effects (artifacts, config, subprocesses, git, runners).
//!
//! The remaining modules orchestrate one CLI command each.

pub mod commit_run;
pub mod commit_sequence;
pub mod core;
pub mod envelope;
pub mod exit_codes;
pub mod finish;
pub mod gate;
pub mod io;
pub mod kernel;
pub mod logging;
pub mod route;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod worktree;
