//! `taskpack wt finish`: land the packet branch on the base branch.
//!
//! Only the `rebase-ff` mode exists: rebase the branch onto `<remote>/<base>`,
//! fast-forward the base branch to it, push, then confirm the remote head.
//! Conflicts are never resolved automatically.

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::core::types::{DirtyPolicy, Outcome, Refusal, RefusalCode};
use crate::gate::{engine_paths, working_changes};
use crate::io::artifacts::ArtifactWriter;
use crate::io::config::KernelConfig;
use crate::io::exec::CommandExec;
use crate::io::git::Git;
use crate::io::run_dir::{FINISH, RunPaths};
use crate::worktree::{
    DirtySite, RecordStatus, RefusableRecord, Settled, load_worktree, refuse_with_record,
    settle_dirty,
};

pub const REBASE_FF: &str = "rebase-ff";

#[derive(Debug, Clone)]
pub struct FinishRequest {
    pub mode: String,
    /// Remove the worktree and delete the local branch afterwards.
    pub cleanup: bool,
    pub dirty_policy: DirtyPolicy,
}

impl Default for FinishRequest {
    fn default() -> Self {
        Self {
            mode: REBASE_FF.to_string(),
            cleanup: true,
            dirty_policy: DirtyPolicy::Refuse,
        }
    }
}

/// Contents of `FINISH.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishRecord {
    pub status: RecordStatus,
    pub mode: String,
    pub branch: String,
    pub base: String,
    pub remote: String,
    pub pre_rebase_head: Option<String>,
    pub post_rebase_head: Option<String>,
    pub base_head_before: Option<String>,
    pub base_head_after: Option<String>,
    pub remote_head_after: Option<String>,
    pub stash_refs: Vec<String>,
    pub cleanup: bool,
    pub refusal: Option<Refusal>,
    pub timestamp: String,
}

impl RefusableRecord for FinishRecord {
    fn mark_refused(&mut self, refusal: Refusal) {
        self.status = RecordStatus::Refused;
        self.refusal = Some(refusal);
    }
}

#[instrument(skip_all, fields(run = %paths.dir.display(), mode = %request.mode))]
pub fn finish(
    exec: &dyn CommandExec,
    root: &Path,
    config: &KernelConfig,
    paths: &RunPaths,
    request: &FinishRequest,
) -> Result<Outcome<FinishRecord>> {
    let worktree = match load_worktree(paths)? {
        Outcome::Done(record) => record,
        Outcome::Refused(refusal) => return Ok(Outcome::Refused(refusal)),
    };
    let timestamp = config.timestamp_mode.now();
    let mut record = FinishRecord {
        status: RecordStatus::Completed,
        mode: request.mode.clone(),
        branch: worktree.branch.clone(),
        base: worktree.base.clone(),
        remote: worktree.remote.clone(),
        pre_rebase_head: None,
        post_rebase_head: None,
        base_head_before: None,
        base_head_after: None,
        remote_head_after: None,
        stash_refs: Vec::new(),
        cleanup: request.cleanup,
        refusal: None,
        timestamp: timestamp.clone(),
    };
    if request.mode != REBASE_FF {
        let refusal = Refusal::new(
            RefusalCode::UnsupportedMode,
            format!("finish mode '{}' is not supported", request.mode),
            format!("use --mode {REBASE_FF}"),
        );
        return refuse_with_record(paths, FINISH, record, refusal);
    }

    let worktree_dir = worktree.worktree_dir(root);
    let branch_git = Git::new(exec, &worktree_dir);
    let root_git = Git::new(exec, root);

    let worktree_dirty = working_changes(&branch_git, &[])?;
    let root_dirty = working_changes(&root_git, &engine_paths(root, config, paths))?;
    for (git, location, dirty) in [
        (&branch_git, "worktree", &worktree_dirty),
        (&root_git, "repo_root", &root_dirty),
    ] {
        let site = DirtySite {
            git,
            location,
            operation: "finish",
        };
        match settle_dirty(&site, request.dirty_policy, dirty, paths, &timestamp)? {
            Settled::Refused(refusal) => return refuse_with_record(paths, FINISH, record, refusal),
            Settled::Stashed(stash) => record.stash_refs.push(stash),
            Settled::Clean => {}
        }
    }

    let upstream = format!("{}/{}", worktree.remote, worktree.base);
    record.pre_rebase_head = Some(branch_git.rev_parse("HEAD")?);
    branch_git.fetch(&worktree.remote)?;
    if !branch_git.rebase(&upstream)? {
        let refusal = if branch_git.rebase_in_progress()? {
            branch_git.rebase_abort()?;
            Refusal::new(
                RefusalCode::RebaseConflict,
                format!("rebasing {} onto {upstream} conflicts", worktree.branch),
                format!("rebase {} onto {upstream} by hand, then finish again", worktree.branch),
            )
        } else {
            Refusal::new(
                RefusalCode::RebaseConflict,
                format!("rebase of {} onto {upstream} did not start", worktree.branch),
                format!("check that {upstream} exists after fetching {}", worktree.remote),
            )
        };
        return refuse_with_record(paths, FINISH, record, refusal);
    }
    let post_rebase = branch_git.rev_parse("HEAD")?;
    record.post_rebase_head = Some(post_rebase.clone());
    if !branch_git.is_ancestor(&upstream, &post_rebase)? {
        let refusal = Refusal::new(
            RefusalCode::NotFastForward,
            format!("{upstream} is not an ancestor of the rebased branch"),
            "fetch and finish again",
        );
        return refuse_with_record(paths, FINISH, record, refusal);
    }

    record.base_head_before = Some(root_git.rev_parse(&worktree.base)?);
    root_git.checkout(&worktree.base)?;
    if !root_git.merge_ff_only(&upstream)? || !root_git.merge_ff_only(&worktree.branch)? {
        let refusal = Refusal::new(
            RefusalCode::NotFastForward,
            format!("{} cannot be fast-forwarded to {}", worktree.base, worktree.branch),
            format!("reconcile local {} with {upstream}, then finish again", worktree.base),
        );
        return refuse_with_record(paths, FINISH, record, refusal);
    }
    let base_after = root_git.rev_parse("HEAD")?;
    record.base_head_after = Some(base_after.clone());

    if !root_git.push(&worktree.remote, &worktree.base)? {
        let refusal = Refusal::new(
            RefusalCode::PushMismatch,
            format!("{} rejected the push of {}", worktree.remote, worktree.base),
            "fetch, then finish again",
        );
        return refuse_with_record(paths, FINISH, record, refusal);
    }
    let remote_head = root_git.ls_remote_head(&worktree.remote, &worktree.base)?;
    record.remote_head_after = remote_head.clone();
    if remote_head.as_deref() != Some(base_after.as_str()) {
        warn!(local = %base_after, remote = ?remote_head, "remote head differs after push");
        let refusal = Refusal::new(
            RefusalCode::PushMismatch,
            format!("remote {} head does not match local {}", worktree.remote, worktree.base),
            "inspect the remote branch before retrying",
        )
        .with_details(vec![
            format!("local: {base_after}"),
            format!("remote: {}", remote_head.as_deref().unwrap_or("missing")),
        ]);
        return refuse_with_record(paths, FINISH, record, refusal);
    }

    if request.cleanup {
        root_git.worktree_remove(&worktree_dir)?;
        root_git.delete_branch(&worktree.branch)?;
    }
    let mut writer = ArtifactWriter::create(&paths.dir)?;
    writer.write_json(FINISH, &record)?;
    info!(base = %worktree.base, head = %base_after, "branch finished");
    Ok(Outcome::Done(record))
}
