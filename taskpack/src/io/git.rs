//! Git adapter for the worktree engine.
//!
//! A small, explicit wrapper around `git` subprocess calls, routed through
//! [`CommandExec`]. Methods whose failure is an expected repository state
//! (rebase conflict, non-fast-forward, rejected push) return `bool`; every
//! other non-zero exit is an error.

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::io::exec::{CommandExec, CommandOutput, CommandSpec, run_checked};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

impl StatusEntry {
    /// The porcelain line this entry came from.
    pub fn line(&self) -> String {
        format!("{} {}", self.code, self.path)
    }

    /// True when the path equals or lies below any of `prefixes`.
    pub fn under_any(&self, prefixes: &[String]) -> bool {
        prefixes.iter().any(|prefix| {
            let dir = prefix.trim_end_matches('/');
            !dir.is_empty()
                && (self.path == dir
                    || self.path.starts_with(&format!("{dir}/")))
        })
    }
}

/// Wrapper for executing git commands in a working directory.
#[derive(Clone, Copy)]
pub struct Git<'a> {
    exec: &'a dyn CommandExec,
    workdir: &'a Path,
}

impl<'a> Git<'a> {
    pub fn new(exec: &'a dyn CommandExec, workdir: &'a Path) -> Self {
        Self { exec, workdir }
    }

    pub fn workdir(&self) -> &Path {
        self.workdir
    }

    /// Absolute top-level directory of the repository.
    pub fn toplevel(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--show-toplevel"])?;
        Ok(PathBuf::from(out.trim()))
    }

    /// Current branch name, or `None` on detached HEAD.
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<Option<String>> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Ok(None);
        }
        debug!(branch = %name, "current branch");
        Ok(Some(name))
    }

    /// Full SHA of a revision.
    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--verify", &format!("{rev}^{{commit}}")])?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Paths currently staged in the index.
    pub fn staged_files(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["diff", "--cached", "--name-only"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let output = self.run(&[
            "show-ref",
            "--verify",
            "--quiet",
            &format!("refs/heads/{branch}"),
        ])?;
        Ok(output.success())
    }

    #[instrument(skip_all, fields(remote))]
    pub fn fetch(&self, remote: &str) -> Result<()> {
        self.run_checked(&["fetch", remote])?;
        Ok(())
    }

    /// Create `branch` at `start` without checking it out.
    #[instrument(skip_all, fields(branch, start))]
    pub fn create_branch(&self, branch: &str, start: &str) -> Result<()> {
        debug!(branch, start, "creating branch");
        self.run_checked(&["branch", branch, start])?;
        Ok(())
    }

    #[instrument(skip_all, fields(branch))]
    pub fn worktree_add(&self, path: &Path, branch: &str) -> Result<()> {
        let path = path.to_string_lossy();
        self.run_checked(&["worktree", "add", &path, branch])?;
        Ok(())
    }

    pub fn worktree_remove(&self, path: &Path) -> Result<()> {
        let path = path.to_string_lossy();
        self.run_checked(&["worktree", "remove", "--force", &path])?;
        Ok(())
    }

    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["branch", "-D", branch])?;
        Ok(())
    }

    /// Checkout an existing branch.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// Stage exactly `paths` (additions, modifications and deletions).
    pub fn stage_paths(&self, paths: &[String]) -> Result<()> {
        let mut args = vec!["add", "-A", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_checked(&args)?;
        Ok(())
    }

    /// Commit the index and return the new HEAD SHA.
    #[instrument(skip_all)]
    pub fn commit(&self, message: &str) -> Result<String> {
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        self.rev_parse("HEAD")
    }

    /// Unstage everything, keeping working-tree changes.
    pub fn reset_mixed(&self) -> Result<()> {
        self.run_checked(&["reset", "--mixed", "--quiet", "HEAD"])?;
        Ok(())
    }

    /// Stash `paths` (untracked included) and return the stash commit SHA.
    /// The stash is never popped by this crate.
    #[instrument(skip_all, fields(message))]
    pub fn stash_push(&self, message: &str, paths: &[String]) -> Result<String> {
        let mut args = vec!["stash", "push", "--include-untracked", "-m", message, "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_checked(&args)?;
        let sha = self.rev_parse("refs/stash")?;
        debug!(stash = %sha, "stashed changes");
        Ok(sha)
    }

    /// Rebase the current branch onto `upstream`. `false` on conflict.
    #[instrument(skip_all, fields(upstream))]
    pub fn rebase(&self, upstream: &str) -> Result<bool> {
        let output = self.run(&["rebase", upstream])?;
        if !output.success() {
            warn!(stderr = %output.stderr.trim(), "rebase failed");
        }
        Ok(output.success())
    }

    /// True while a stopped rebase awaits `--continue` or `--abort`.
    pub fn rebase_in_progress(&self) -> Result<bool> {
        for state_dir in ["rebase-merge", "rebase-apply"] {
            let out = self.run_capture(&["rev-parse", "--git-path", state_dir])?;
            let rel = out.trim();
            if !rel.is_empty() && self.workdir.join(rel).exists() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn rebase_abort(&self) -> Result<()> {
        self.run_checked(&["rebase", "--abort"])?;
        Ok(())
    }

    /// `git merge-base --is-ancestor`.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let output = self.run(&["merge-base", "--is-ancestor", ancestor, descendant])?;
        match output.code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(anyhow!(
                "git merge-base --is-ancestor {ancestor} {descendant} failed: {}",
                output.stderr.trim()
            )),
        }
    }

    /// Fast-forward the current branch to `rev`. `false` when not possible.
    #[instrument(skip_all, fields(rev))]
    pub fn merge_ff_only(&self, rev: &str) -> Result<bool> {
        let output = self.run(&["merge", "--ff-only", rev])?;
        Ok(output.success())
    }

    /// Push `branch` to `remote`. `false` when the remote rejects it.
    #[instrument(skip_all, fields(remote, branch))]
    pub fn push(&self, remote: &str, branch: &str) -> Result<bool> {
        let output = self.run(&["push", remote, &format!("refs/heads/{branch}:refs/heads/{branch}")])?;
        if !output.success() {
            warn!(stderr = %output.stderr.trim(), "push rejected");
        }
        Ok(output.success())
    }

    /// SHA the remote reports for `branch`, queried from the remote itself.
    pub fn ls_remote_head(&self, remote: &str, branch: &str) -> Result<Option<String>> {
        let out = self.run_capture(&["ls-remote", remote, &format!("refs/heads/{branch}")])?;
        Ok(out
            .lines()
            .find_map(|line| line.split_whitespace().next())
            .map(str::to_string))
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        Ok(self.run_checked(args)?.stdout)
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        run_checked(self.exec, &self.spec(args))
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        self.exec.run(&self.spec(args))
    }

    fn spec(&self, args: &[&str]) -> CommandSpec {
        CommandSpec::new("git", self.workdir).args(args.iter().copied())
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: unquote(path.trim()),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once(" -> ") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry {
        code,
        path: unquote(&path),
    })
}

fn unquote(path: &str) -> String {
    path.strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .unwrap_or(path)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedExec;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string()
            }
        );
    }

    #[test]
    fn parses_modified_line() {
        let e = parse_status_line(" M src/main.rs").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: " M".to_string(),
                path: "src/main.rs".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn quoted_paths_are_unquoted() {
        let e = parse_status_line("?? \"with space.txt\"").expect("parse");
        assert_eq!(e.path, "with space.txt");
    }

    #[test]
    fn under_any_matches_directories_not_siblings() {
        let entry = StatusEntry {
            code: "??".to_string(),
            path: "out/runs/x/FILE.json".to_string(),
        };
        assert!(entry.under_any(&["out/runs/x".to_string()]));
        assert!(entry.under_any(&["out/".to_string()]));
        assert!(!entry.under_any(&["out/run".to_string()]));
    }

    #[test]
    fn detached_head_is_none() {
        let exec = ScriptedExec::new();
        exec.respond("git rev-parse --abbrev-ref HEAD", 0, "HEAD\n");
        let dir = PathBuf::from("/repo");
        let git = Git::new(&exec, &dir);
        assert_eq!(git.current_branch().expect("branch"), None);
    }

    #[test]
    fn is_ancestor_maps_exit_codes() {
        let exec = ScriptedExec::new();
        exec.respond("git merge-base --is-ancestor a b", 0, "");
        exec.respond("git merge-base --is-ancestor b a", 1, "");
        exec.respond("git merge-base --is-ancestor x y", 128, "");
        let dir = PathBuf::from("/repo");
        let git = Git::new(&exec, &dir);
        assert!(git.is_ancestor("a", "b").expect("a b"));
        assert!(!git.is_ancestor("b", "a").expect("b a"));
        assert!(git.is_ancestor("x", "y").is_err());
    }

    #[test]
    fn stage_paths_passes_pathspec_after_separator() {
        let exec = ScriptedExec::new();
        let dir = PathBuf::from("/repo");
        let git = Git::new(&exec, &dir);
        git.stage_paths(&["a b.txt".to_string(), "c".to_string()])
            .expect("stage");
        let calls = exec.calls();
        assert_eq!(calls[0].args, vec!["add", "-A", "--", "a b.txt", "c"]);
    }
}
