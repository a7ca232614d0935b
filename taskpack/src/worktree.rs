//! Worktree engine: `taskpack wt start`, plus the record and dirty-tree
//! helpers shared with `commit-sequence` and `finish`.
//!
//! Every operation checks all of its refusal conditions before mutating the
//! repository. Refusals are written into the operation's record with status
//! `refused`, unless a completed record already exists.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::core::naming::{packet_branch, run_branch, stash_message, worktree_dir_name};
use crate::core::types::{DirtyPolicy, Outcome, Refusal, RefusalCode};
use crate::envelope::{load_run_packet, missing_artifact};
use crate::gate::{engine_paths, working_changes};
use crate::io::artifacts::{ArtifactWriter, read_json};
use crate::io::config::KernelConfig;
use crate::io::exec::{CommandExec, resolve};
use crate::io::git::{Git, StatusEntry};
use crate::io::ledger::{DirtyStateEntry, DirtyStateLedger};
use crate::io::run_dir::{RunPaths, WORKTREE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Completed,
    Refused,
}

/// Contents of `WORKTREE.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeRecord {
    pub status: RecordStatus,
    pub branch: String,
    pub base: String,
    pub remote: String,
    /// Relative to the repository root when inside it.
    pub worktree_path: String,
    /// `<remote>/<base>` at creation.
    pub base_head: Option<String>,
    pub dirty_policy: DirtyPolicy,
    pub stash_ref: Option<String>,
    pub refusal: Option<Refusal>,
    pub timestamp: String,
}

impl WorktreeRecord {
    pub fn worktree_dir(&self, root: &Path) -> PathBuf {
        resolve(root, Path::new(&self.worktree_path))
    }
}

/// Options for `wt start`; unset fields fall back to config defaults.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub branch: Option<String>,
    pub base: Option<String>,
    pub remote: Option<String>,
    pub worktree_path: Option<PathBuf>,
    pub dirty_policy: DirtyPolicy,
}

/// `wt start`: create a fresh branch from `<remote>/<base>` and check it out
/// in its own worktree. An existing branch is never reused.
#[instrument(skip_all, fields(run = %paths.dir.display()))]
pub fn start(
    exec: &dyn CommandExec,
    root: &Path,
    config: &KernelConfig,
    paths: &RunPaths,
    request: &StartRequest,
) -> Result<Outcome<WorktreeRecord>> {
    let git = &Git::new(exec, root);
    let branch = match &request.branch {
        Some(branch) => branch.clone(),
        None => match load_run_packet(paths)? {
            Outcome::Done((packet, _)) => packet_branch(&packet.id, &packet.title),
            Outcome::Refused(_) => run_branch(&paths.run_name()),
        },
    };
    let base = request
        .base
        .clone()
        .unwrap_or_else(|| config.default_base.clone());
    let remote = request
        .remote
        .clone()
        .unwrap_or_else(|| config.default_remote.clone());
    let worktree_dir = match &request.worktree_path {
        Some(path) => resolve(root, path),
        None => resolve(root, &config.worktrees_dir).join(worktree_dir_name(&branch)),
    };
    let timestamp = config.timestamp_mode.now();
    let mut record = WorktreeRecord {
        status: RecordStatus::Completed,
        branch: branch.clone(),
        base: base.clone(),
        remote: remote.clone(),
        worktree_path: display_path(root, &worktree_dir),
        base_head: None,
        dirty_policy: request.dirty_policy,
        stash_ref: None,
        refusal: None,
        timestamp: timestamp.clone(),
    };

    if git.branch_exists(&branch)? {
        let refusal = Refusal::new(
            RefusalCode::BranchExists,
            format!("branch {branch} already exists"),
            "choose a new --branch; existing branches are never reused",
        );
        return refuse_with_record(paths, WORKTREE, record, refusal);
    }
    if worktree_dir.exists() {
        let refusal = Refusal::new(
            RefusalCode::WorktreePathExists,
            format!("worktree path {} already exists", worktree_dir.display()),
            "remove the directory or pass a different --worktree-path",
        );
        return refuse_with_record(paths, WORKTREE, record, refusal);
    }

    let dirty = working_changes(git, &engine_paths(root, config, paths))?;
    let settled = settle_dirty(
        &DirtySite {
            git,
            location: "repo_root",
            operation: "wt-start",
        },
        request.dirty_policy,
        &dirty,
        paths,
        &timestamp,
    )?;
    match settled {
        Settled::Refused(refusal) => return refuse_with_record(paths, WORKTREE, record, refusal),
        Settled::Stashed(stash) => record.stash_ref = Some(stash),
        Settled::Clean => {}
    }

    git.fetch(&remote)?;
    let upstream = format!("{remote}/{base}");
    git.create_branch(&branch, &upstream)?;
    git.worktree_add(&worktree_dir, &branch)?;
    record.base_head = Some(git.rev_parse(&upstream)?);

    let mut writer = ArtifactWriter::create(&paths.dir)?;
    writer.write_json(WORKTREE, &record)?;
    info!(branch = %branch, worktree = %record.worktree_path, "worktree created");
    Ok(Outcome::Done(record))
}

/// The completed `WORKTREE.json` of a run, or a refusal naming what is missing.
pub fn load_worktree(paths: &RunPaths) -> Result<Outcome<WorktreeRecord>> {
    match read_json::<WorktreeRecord>(&paths.worktree)? {
        Some(record) if record.status == RecordStatus::Completed => Ok(Outcome::Done(record)),
        _ => Ok(Outcome::Refused(missing_artifact(paths, WORKTREE, "taskpack wt start"))),
    }
}

/// Where a dirty check happens, for ledger entries and stash messages.
pub struct DirtySite<'a, 'g> {
    pub git: &'a Git<'g>,
    /// `repo_root` or `worktree`.
    pub location: &'static str,
    pub operation: &'static str,
}

pub enum Settled {
    Clean,
    Stashed(String),
    Refused(Refusal),
}

/// Apply the dirty policy to `dirty`: refuse, or stash exactly those paths
/// and append one ledger entry.
pub fn settle_dirty(
    site: &DirtySite<'_, '_>,
    policy: DirtyPolicy,
    dirty: &[StatusEntry],
    paths: &RunPaths,
    timestamp: &str,
) -> Result<Settled> {
    if dirty.is_empty() {
        return Ok(Settled::Clean);
    }
    let mut lines: Vec<String> = dirty.iter().map(StatusEntry::line).collect();
    lines.sort();
    match policy {
        DirtyPolicy::Refuse => {
            warn!(location = site.location, entries = lines.len(), "dirty tree refused");
            Ok(Settled::Refused(
                Refusal::new(
                    RefusalCode::DirtyTree,
                    format!("{} has {} uncommitted change(s)", site.location, lines.len()),
                    "commit or remove the listed changes, or rerun with --dirty stash",
                )
                .with_details(lines),
            ))
        }
        DirtyPolicy::Stash => {
            let stash_ref = stash_and_record(site, dirty, lines, paths, timestamp)?;
            Ok(Settled::Stashed(stash_ref))
        }
    }
}

/// Stash `entries` and append the ledger entry; the stash is never popped.
pub fn stash_and_record(
    site: &DirtySite<'_, '_>,
    entries: &[StatusEntry],
    lines: Vec<String>,
    paths: &RunPaths,
    timestamp: &str,
) -> Result<String> {
    let message = stash_message(site.operation, &paths.run_name());
    let pathspecs: Vec<String> = entries.iter().map(|e| e.path.clone()).collect();
    let stash_ref = site.git.stash_push(&message, &pathspecs)?;
    let mut ledger = DirtyStateLedger::load(&paths.dir)?;
    ledger.append(DirtyStateEntry {
        location: site.location.to_string(),
        operation: site.operation.to_string(),
        policy: DirtyPolicy::Stash,
        stash_ref: stash_ref.clone(),
        message,
        status_porcelain: lines,
        timestamp: timestamp.to_string(),
    })?;
    info!(location = site.location, stash = %stash_ref, "dirty changes stashed");
    Ok(stash_ref)
}

/// Record a refusal in the operation's record, then return it.
pub fn refuse_with_record<T>(
    paths: &RunPaths,
    name: &str,
    mut record: T,
    refusal: Refusal,
) -> Result<Outcome<T>>
where
    T: Serialize + RefusableRecord,
{
    warn!(code = %refusal.code, record = name, "operation refused");
    record.mark_refused(refusal.clone());
    let path = paths.dir.join(name);
    let completed = read_json::<Value>(&path)?
        .is_some_and(|existing| existing["status"] != "refused");
    if completed {
        warn!(record = name, "keeping completed record; refusal not written");
    } else {
        let mut writer = ArtifactWriter::create(&paths.dir)?;
        writer.write_json(name, &record)?;
    }
    Ok(Outcome::Refused(refusal))
}

/// Records that carry a status and an optional refusal.
pub trait RefusableRecord {
    fn mark_refused(&mut self, refusal: Refusal);
}

impl RefusableRecord for WorktreeRecord {
    fn mark_refused(&mut self, refusal: Refusal) {
        self.status = RecordStatus::Refused;
        self.refusal = Some(refusal);
    }
}

/// `path` relative to `root` when inside it, else as given.
pub fn display_path(root: &Path, path: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
        Err(_) => path.to_string_lossy().into_owned(),
    }
}
