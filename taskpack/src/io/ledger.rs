//! Dirty State Ledger (`DIRTY_STATE.json`).
//!
//! Every stash the worktree engine performs is recorded here. The type only
//! exposes `append`: entries are never removed, rewritten or popped.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::canonical::to_canonical_string;
use crate::core::types::DirtyPolicy;
use crate::io::artifacts::{read_json, write_atomic};

pub const DIRTY_STATE: &str = "DIRTY_STATE.json";

/// One stash performed under policy `stash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyStateEntry {
    /// `repo_root` or `worktree`.
    pub location: String,
    /// Engine operation that stashed (`wt-start`, `commit-sequence`, `finish`).
    pub operation: String,
    pub policy: DirtyPolicy,
    /// Stash commit SHA.
    pub stash_ref: String,
    pub message: String,
    /// Sorted porcelain lines captured before stashing.
    pub status_porcelain: Vec<String>,
    pub timestamp: String,
}

/// Add-only view of a run's ledger file.
#[derive(Debug)]
pub struct DirtyStateLedger {
    path: PathBuf,
    entries: Vec<DirtyStateEntry>,
}

impl DirtyStateLedger {
    /// Load the ledger in `run_dir`, empty when the file does not exist yet.
    pub fn load(run_dir: &Path) -> Result<Self> {
        let path = run_dir.join(DIRTY_STATE);
        let entries: Vec<DirtyStateEntry> = read_json(&path)
            .with_context(|| format!("load dirty state ledger {}", path.display()))?
            .unwrap_or_default();
        Ok(Self { path, entries })
    }

    pub fn entries(&self) -> &[DirtyStateEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append one entry and persist the whole list atomically.
    pub fn append(&mut self, entry: DirtyStateEntry) -> Result<()> {
        info!(
            location = %entry.location,
            operation = %entry.operation,
            stash_ref = %entry.stash_ref,
            "recording stash in dirty state ledger"
        );
        let mut next = self.entries.clone();
        next.push(entry);
        let text = to_canonical_string(&next).context("serialize dirty state ledger")?;
        write_atomic(&self.path, text.as_bytes())?;
        self.entries = next;
        Ok(())
    }
}
