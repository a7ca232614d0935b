//! Orchestration for `taskpack run commit`: one commit of the run's
//! allowlisted changes on the current branch.

use std::path::Path;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::core::allowlist::Allowlist;
use crate::core::types::{Outcome, Refusal, RefusalCode};
use crate::envelope::{load_run_packet, missing_artifact};
use crate::gate::{engine_paths, gate_refusal, working_changes};
use crate::io::artifacts::ArtifactWriter;
use crate::io::config::KernelConfig;
use crate::io::git::Git;
use crate::io::run_dir::{ALLOWLIST_DIFF, COMMIT_RUN, PROMOTION_TOKEN, RunPaths};

/// Contents of `COMMIT_RUN.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRunRecord {
    pub packet_id: String,
    pub branch: String,
    pub commit: String,
    pub message: String,
    pub files: Vec<String>,
    pub timestamp: String,
}

#[instrument(skip_all, fields(run = %paths.dir.display()))]
pub fn commit_run(
    git: &Git<'_>,
    root: &Path,
    config: &KernelConfig,
    paths: &RunPaths,
    message: Option<&str>,
) -> Result<Outcome<CommitRunRecord>> {
    let (packet, _) = match load_run_packet(paths)? {
        Outcome::Done(loaded) => loaded,
        Outcome::Refused(refusal) => return Ok(Outcome::Refused(refusal)),
    };
    if !paths.promotion_token.exists() {
        return Ok(Outcome::Refused(Refusal::new(
            RefusalCode::Unpromoted,
            format!("{PROMOTION_TOKEN} not found in {}", paths.dir.display()),
            "run `taskpack run gate` and `taskpack run promote` first",
        )));
    }
    if !paths.allowlist_diff.exists() {
        return Ok(Outcome::Refused(missing_artifact(paths, ALLOWLIST_DIFF, "taskpack run gate")));
    }
    if let Some(refusal) = gate_refusal(paths)? {
        return Ok(Outcome::Refused(refusal));
    }

    let Some(branch) = git.current_branch()? else {
        return Ok(Outcome::Refused(Refusal::new(
            RefusalCode::DetachedHead,
            "HEAD is detached",
            "check out a branch before committing",
        )));
    };
    let staged = git.staged_files()?;
    if !staged.is_empty() {
        return Ok(Outcome::Refused(
            Refusal::new(
                RefusalCode::PrestagedIndex,
                format!("{} path(s) are already staged", staged.len()),
                "unstage everything (`git reset`) so only allowlisted files are committed",
            )
            .with_details(staged),
        ));
    }

    let allowlist = Allowlist::new(&packet.allowlist)
        .map_err(|errors| anyhow!("validated allowlist rejected: {}", errors.join("; ")))?;
    let changed: Vec<String> = working_changes(git, &engine_paths(root, config, paths))?
        .into_iter()
        .map(|entry| entry.path)
        .collect();
    let (allowed, disallowed) = allowlist.partition(changed.iter().map(String::as_str));
    if !disallowed.is_empty() {
        return Ok(Outcome::Refused(
            Refusal::new(
                RefusalCode::OutsideAllowlist,
                format!("{} changed path(s) are outside the allowlist", disallowed.len()),
                "revert or stash the listed paths",
            )
            .with_details(disallowed),
        ));
    }
    if allowed.is_empty() {
        return Ok(Outcome::Refused(Refusal::new(
            RefusalCode::EmptyStep,
            "no allowlisted changes to commit",
            "make the packet's changes before committing the run",
        )));
    }

    let message = message
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}: {}", packet.id, packet.title));
    git.stage_paths(&allowed)?;
    let commit = git.commit(&message)?;
    let record = CommitRunRecord {
        packet_id: packet.id,
        branch,
        commit,
        message,
        files: allowed,
        timestamp: config.timestamp_mode.now(),
    };
    let mut writer = ArtifactWriter::create(&paths.dir)?;
    writer.write_json(COMMIT_RUN, &record)?;
    info!(commit = %record.commit, files = record.files.len(), "run committed");
    Ok(Outcome::Done(record))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::envelope::init_run;
    use crate::test_support::{ScriptedExec, packet_doc};

    fn init(root: &Path) -> RunPaths {
        let packet = root.join("TP_0001.md");
        fs::write(&packet, packet_doc()).expect("write packet");
        let paths = RunPaths::new(root.join("out/runs/TP_0001/abc"));
        init_run(&KernelConfig::default(), &packet, &paths).expect("init");
        paths
    }

    #[test]
    fn unpromoted_run_is_refused_before_git() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init(temp.path());
        let exec = ScriptedExec::new();
        let git = Git::new(&exec, temp.path());
        let outcome =
            commit_run(&git, temp.path(), &KernelConfig::default(), &paths, None).expect("commit");
        assert_eq!(outcome.refusal().map(|r| r.code), Some(RefusalCode::Unpromoted));
        assert!(exec.calls().is_empty());
    }

    #[test]
    fn prestaged_index_is_refused_without_committing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init(temp.path());
        fs::write(&paths.promotion_token, "{}").expect("token");
        fs::write(
            &paths.allowlist_diff,
            r#"{"allowed_files":[],"allowlist":["src/a.py"],"disallowed_files":[],"packet_id":"TP_0001","timestamp":"t","violations":{"count":0,"items":[]}}"#,
        )
        .expect("diff");
        let exec = ScriptedExec::new();
        exec.respond("git rev-parse --abbrev-ref HEAD", 0, "feature\n");
        exec.respond("git diff --cached --name-only", 0, "src/a.py\n");
        let git = Git::new(&exec, temp.path());
        let outcome =
            commit_run(&git, temp.path(), &KernelConfig::default(), &paths, None).expect("commit");
        assert_eq!(
            outcome.refusal().map(|r| r.code),
            Some(RefusalCode::PrestagedIndex)
        );
        assert!(!exec.commands().iter().any(|c| c.starts_with("git commit")));
    }
}
