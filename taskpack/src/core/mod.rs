//! Deterministic, pure logic shared by the kernel and the worktree engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod allowlist;
pub mod availability;
pub mod canonical;
pub mod commit_plan;
pub mod compliance;
pub mod hints;
pub mod markdown;
pub mod naming;
pub mod packet;
pub mod planner;
pub mod scoring;
pub mod sequence;
pub mod state;
pub mod types;
