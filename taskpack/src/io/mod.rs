//! I/O helpers for kernel and worktree commands.

pub mod artifacts;
pub mod availability;
pub mod config;
pub mod exec;
pub mod git;
pub mod ledger;
pub mod packet_store;
pub mod render;
pub mod run_dir;
pub mod runner;
