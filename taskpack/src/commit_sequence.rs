//! `taskpack wt commit-sequence`: one commit per commit plan step, in
//! declared order, inside the run's worktree.

use std::path::Path;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::core::sequence::assign_changes;
use crate::core::types::{DirtyPolicy, Outcome, Refusal, RefusalCode};
use crate::envelope::load_run_packet;
use crate::gate::{gate_refusal, working_changes};
use crate::io::artifacts::ArtifactWriter;
use crate::io::config::KernelConfig;
use crate::io::exec::{CommandExec, CommandSpec, exit_label};
use crate::io::git::{Git, StatusEntry};
use crate::io::run_dir::{COMMIT_SEQUENCE_RUN, RunPaths};
use crate::worktree::{
    DirtySite, RecordStatus, RefusableRecord, load_worktree, refuse_with_record, stash_and_record,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceRequest {
    /// Commit without a promotion token.
    pub allow_unpromoted: bool,
    /// Applies to changes outside every step allowlist.
    pub dirty_policy: DirtyPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub command: String,
    pub exit: String,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: String,
    pub message: String,
    pub files: Vec<String>,
    pub verification: Vec<VerificationRecord>,
    pub commit: Option<String>,
}

/// Contents of `COMMIT_SEQUENCE_RUN.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSequenceRecord {
    pub status: RecordStatus,
    pub packet_id: Option<String>,
    pub branch: Option<String>,
    pub base: String,
    pub allow_unpromoted: bool,
    pub promoted: bool,
    pub steps: Vec<StepRecord>,
    pub stash_ref: Option<String>,
    pub refusal: Option<Refusal>,
    pub timestamp: String,
}

impl RefusableRecord for CommitSequenceRecord {
    fn mark_refused(&mut self, refusal: Refusal) {
        self.status = RecordStatus::Refused;
        self.refusal = Some(refusal);
    }
}

#[instrument(skip_all, fields(run = %paths.dir.display()))]
pub fn commit_sequence(
    exec: &dyn CommandExec,
    root: &Path,
    config: &KernelConfig,
    paths: &RunPaths,
    request: SequenceRequest,
) -> Result<Outcome<CommitSequenceRecord>> {
    let worktree = match load_worktree(paths)? {
        Outcome::Done(record) => record,
        Outcome::Refused(refusal) => return Ok(Outcome::Refused(refusal)),
    };
    let timestamp = config.timestamp_mode.now();
    let promoted = paths.promotion_token.exists();
    let mut record = CommitSequenceRecord {
        status: RecordStatus::Completed,
        packet_id: None,
        branch: None,
        base: worktree.base.clone(),
        allow_unpromoted: request.allow_unpromoted,
        promoted,
        steps: Vec::new(),
        stash_ref: None,
        refusal: None,
        timestamp: timestamp.clone(),
    };

    if let Some(refusal) = gate_refusal(paths)? {
        return refuse_with_record(paths, COMMIT_SEQUENCE_RUN, record, refusal);
    }
    if !promoted && !request.allow_unpromoted {
        let refusal = Refusal::new(
            RefusalCode::Unpromoted,
            "run has no promotion token",
            "run `taskpack run promote`, or pass --allow-unpromoted",
        );
        return refuse_with_record(paths, COMMIT_SEQUENCE_RUN, record, refusal);
    }

    let worktree_dir = worktree.worktree_dir(root);
    let git = Git::new(exec, &worktree_dir);
    let Some(branch) = git.current_branch()? else {
        let refusal = Refusal::new(
            RefusalCode::DetachedHead,
            "worktree HEAD is detached",
            format!("check out {} in the worktree", worktree.branch),
        );
        return refuse_with_record(paths, COMMIT_SEQUENCE_RUN, record, refusal);
    };
    record.branch = Some(branch.clone());
    if branch == worktree.base {
        let refusal = Refusal::new(
            RefusalCode::OnBaseBranch,
            format!("worktree is on base branch {branch}"),
            format!("check out {} in the worktree", worktree.branch),
        );
        return refuse_with_record(paths, COMMIT_SEQUENCE_RUN, record, refusal);
    }
    let staged = git.staged_files()?;
    if !staged.is_empty() {
        let refusal = Refusal::new(
            RefusalCode::PrestagedIndex,
            format!("{} path(s) are already staged in the worktree", staged.len()),
            "unstage everything (`git reset`) before sequencing commits",
        )
        .with_details(staged);
        return refuse_with_record(paths, COMMIT_SEQUENCE_RUN, record, refusal);
    }

    let (packet, _) = match load_run_packet(paths)? {
        Outcome::Done(loaded) => loaded,
        Outcome::Refused(refusal) => {
            return refuse_with_record(paths, COMMIT_SEQUENCE_RUN, record, refusal);
        }
    };
    record.packet_id = Some(packet.id.clone());
    let Some(steps) = packet.commit_plan.clone() else {
        let refusal = Refusal::new(
            RefusalCode::MissingCommitPlan,
            format!("packet {} has no COMMIT PLAN section", packet.id),
            "add a COMMIT PLAN block to the packet and initialize a new run",
        );
        return refuse_with_record(paths, COMMIT_SEQUENCE_RUN, record, refusal);
    };

    let changes = working_changes(&git, &[])?;
    let changed: Vec<String> = changes.iter().map(|entry| entry.path.clone()).collect();
    let assignment = assign_changes(&changed, &steps)
        .map_err(|errors| anyhow!("validated commit plan rejected: {}", errors.join("; ")))?;
    let empty = assignment.empty_steps();
    if !empty.is_empty() {
        let refusal = Refusal::new(
            RefusalCode::EmptyStep,
            format!("{} step(s) match no changed file", empty.len()),
            "change a file in each listed step's allowlist, or drop the step from the plan",
        )
        .with_details(empty.iter().map(|id| (*id).to_string()).collect());
        return refuse_with_record(paths, COMMIT_SEQUENCE_RUN, record, refusal);
    }
    if !assignment.outside.is_empty() {
        let outside: Vec<StatusEntry> = changes
            .iter()
            .filter(|entry| assignment.outside.contains(&entry.path))
            .cloned()
            .collect();
        match request.dirty_policy {
            DirtyPolicy::Refuse => {
                let refusal = Refusal::new(
                    RefusalCode::OutsideAllowlist,
                    format!(
                        "{} changed path(s) match no step allowlist",
                        assignment.outside.len()
                    ),
                    "revert the listed paths, or rerun with --dirty stash",
                )
                .with_details(assignment.outside.clone());
                return refuse_with_record(paths, COMMIT_SEQUENCE_RUN, record, refusal);
            }
            DirtyPolicy::Stash => {
                let mut lines: Vec<String> = outside.iter().map(StatusEntry::line).collect();
                lines.sort();
                let site = DirtySite {
                    git: &git,
                    location: "worktree",
                    operation: "commit-sequence",
                };
                record.stash_ref = Some(stash_and_record(&site, &outside, lines, paths, &timestamp)?);
            }
        }
    }

    for (step, stage) in steps.iter().zip(&assignment.stages) {
        let commands = step.verify.as_ref().unwrap_or(&packet.verification_commands);
        git.stage_paths(&stage.files)?;
        let mut step_record = StepRecord {
            step_id: step.step_id.clone(),
            message: step.message.clone(),
            files: stage.files.clone(),
            verification: Vec::with_capacity(commands.len()),
            commit: None,
        };
        for command in commands {
            let output = exec.run(&CommandSpec::shell(command, &worktree_dir))?;
            step_record.verification.push(VerificationRecord {
                command: command.clone(),
                exit: exit_label(output.code),
                passed: output.success(),
            });
        }
        let failed: Vec<String> = step_record
            .verification
            .iter()
            .filter(|v| !v.passed)
            .map(|v| v.command.clone())
            .collect();
        if !failed.is_empty() {
            warn!(step = %step.step_id, "step verification failed; unstaging");
            git.reset_mixed()?;
            record.steps.push(step_record);
            let refusal = Refusal::new(
                RefusalCode::VerificationFailed,
                format!("verification failed for step {}", step.step_id),
                "fix the failing commands; committed steps stay, rerun for the rest",
            )
            .with_details(failed);
            return refuse_with_record(paths, COMMIT_SEQUENCE_RUN, record, refusal);
        }
        let commit = git.commit(&format!("{} {}: {}", packet.id, step.step_id, step.message))?;
        info!(step = %step.step_id, commit = %commit, files = stage.files.len(), "step committed");
        step_record.commit = Some(commit);
        record.steps.push(step_record);
    }

    let mut writer = ArtifactWriter::create(&paths.dir)?;
    writer.write_json(COMMIT_SEQUENCE_RUN, &record)?;
    Ok(Outcome::Done(record))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::io::ledger::DirtyStateLedger;
    use crate::io::run_dir::WORKTREE;
    use crate::test_support::{ScriptedExec, packet_doc_for};
    use crate::worktree::WorktreeRecord;

    const PLAN: &str = r#"{"commit_plan":[
        {"step_id":"c1","message":"parser","allowlist":["src/a.py"]},
        {"step_id":"c2","message":"docs","allowlist":["docs/"]}
    ]}"#;

    fn prepared_run(root: &Path) -> RunPaths {
        prepared_run_with(root, Some(PLAN))
    }

    fn prepared_run_with(root: &Path, plan: Option<&str>) -> RunPaths {
        let paths = RunPaths::new(root.join("out/runs/TP_0001/abc"));
        let mut writer = ArtifactWriter::create(&paths.dir).expect("writer");
        writer
            .write_text(
                crate::io::run_dir::TASK_PACKET,
                &packet_doc_for(&["src/a.py", "docs/"], &["true"], plan),
            )
            .expect("packet");
        writer
            .write_json(
                WORKTREE,
                &WorktreeRecord {
                    status: RecordStatus::Completed,
                    branch: "tp/tp_0001-add-parser".to_string(),
                    base: "main".to_string(),
                    remote: "origin".to_string(),
                    worktree_path: ".worktrees/tp__tp_0001-add-parser".to_string(),
                    base_head: Some("abc".to_string()),
                    dirty_policy: DirtyPolicy::Refuse,
                    stash_ref: None,
                    refusal: None,
                    timestamp: "t".to_string(),
                },
            )
            .expect("worktree");
        paths
    }

    fn run(exec: &ScriptedExec, root: &Path, paths: &RunPaths) -> Outcome<CommitSequenceRecord> {
        let request = SequenceRequest {
            allow_unpromoted: true,
            dirty_policy: DirtyPolicy::Refuse,
        };
        commit_sequence(exec, root, &KernelConfig::default(), paths, request).expect("sequence")
    }

    fn mutating(exec: &ScriptedExec) -> bool {
        exec.commands()
            .iter()
            .any(|c| c.starts_with("git add") || c.starts_with("git commit"))
    }

    #[test]
    fn on_base_branch_refuses_without_staging() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = prepared_run(temp.path());
        let exec = ScriptedExec::new();
        exec.respond("git rev-parse --abbrev-ref HEAD", 0, "main\n");
        let outcome = run(&exec, temp.path(), &paths);
        assert_eq!(outcome.refusal().map(|r| r.code), Some(RefusalCode::OnBaseBranch));
        assert!(!mutating(&exec));
        let raw = fs::read_to_string(paths.dir.join(COMMIT_SEQUENCE_RUN)).expect("record");
        assert!(raw.contains("\"on_base_branch\""));
    }

    #[test]
    fn unpromoted_run_is_refused_unless_allowed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = prepared_run(temp.path());
        let exec = ScriptedExec::new();
        let outcome = commit_sequence(
            &exec,
            temp.path(),
            &KernelConfig::default(),
            &paths,
            SequenceRequest::default(),
        )
        .expect("sequence");
        assert_eq!(outcome.refusal().map(|r| r.code), Some(RefusalCode::Unpromoted));
        assert!(exec.calls().is_empty());
    }

    #[test]
    fn empty_step_refuses_before_any_commit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = prepared_run(temp.path());
        let exec = ScriptedExec::new();
        exec.respond("git rev-parse --abbrev-ref HEAD", 0, "tp/tp_0001-add-parser\n");
        exec.respond("git status --porcelain=v1 -uall", 0, " M src/a.py\n");
        let outcome = run(&exec, temp.path(), &paths);
        let refusal = outcome.refusal().expect("refused");
        assert_eq!(refusal.code, RefusalCode::EmptyStep);
        assert_eq!(refusal.details, vec!["c2"]);
        assert!(!mutating(&exec));
    }

    #[test]
    fn outside_changes_refuse_under_refuse_policy() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = prepared_run(temp.path());
        let exec = ScriptedExec::new();
        exec.respond("git rev-parse --abbrev-ref HEAD", 0, "tp/tp_0001-add-parser\n");
        exec.respond(
            "git status --porcelain=v1 -uall",
            0,
            " M src/a.py\n?? docs/guide.md\n M README.md\n",
        );
        let outcome = run(&exec, temp.path(), &paths);
        let refusal = outcome.refusal().expect("refused");
        assert_eq!(refusal.code, RefusalCode::OutsideAllowlist);
        assert_eq!(refusal.details, vec!["README.md"]);
        assert!(!mutating(&exec));
    }

    #[test]
    fn each_step_commits_its_own_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = prepared_run(temp.path());
        let exec = ScriptedExec::new();
        exec.respond("git rev-parse --abbrev-ref HEAD", 0, "tp/tp_0001-add-parser\n");
        exec.respond("git status --porcelain=v1 -uall", 0, " M src/a.py\n?? docs/guide.md\n");
        exec.respond("git rev-parse --verify HEAD^{commit}", 0, "c0ffee\n");
        let Outcome::Done(record) = run(&exec, temp.path(), &paths) else {
            panic!("expected commits");
        };
        let files: Vec<Vec<String>> = record.steps.iter().map(|s| s.files.clone()).collect();
        assert_eq!(files, vec![vec!["src/a.py"], vec!["docs/guide.md"]]);
        let commits: Vec<String> = exec
            .commands()
            .into_iter()
            .filter(|c| c.starts_with("git commit"))
            .collect();
        assert_eq!(
            commits,
            vec![
                "git commit -m TP_0001 c1: parser",
                "git commit -m TP_0001 c2: docs"
            ]
        );
    }

    #[test]
    fn failed_step_verification_unstages_and_refuses() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = prepared_run(temp.path());
        let exec = ScriptedExec::new();
        exec.respond("git rev-parse --abbrev-ref HEAD", 0, "tp/tp_0001-add-parser\n");
        exec.respond("git status --porcelain=v1 -uall", 0, " M src/a.py\n?? docs/guide.md\n");
        exec.respond("sh -c true", 1, "");
        let outcome = run(&exec, temp.path(), &paths);
        assert_eq!(
            outcome.refusal().map(|r| r.code),
            Some(RefusalCode::VerificationFailed)
        );
        let commands = exec.commands();
        assert!(commands.iter().any(|c| c == "git reset --mixed --quiet HEAD"));
        assert!(!commands.iter().any(|c| c.starts_with("git commit")));
    }

    #[test]
    fn detached_head_refuses_without_staging() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = prepared_run(temp.path());
        let exec = ScriptedExec::new();
        exec.respond("git rev-parse --abbrev-ref HEAD", 0, "HEAD\n");
        let outcome = run(&exec, temp.path(), &paths);
        assert_eq!(outcome.refusal().map(|r| r.code), Some(RefusalCode::DetachedHead));
        assert!(!mutating(&exec));
    }

    #[test]
    fn prestaged_index_refuses_before_any_commit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = prepared_run(temp.path());
        let exec = ScriptedExec::new();
        exec.respond("git rev-parse --abbrev-ref HEAD", 0, "tp/tp_0001-add-parser\n");
        exec.respond("git diff --cached --name-only", 0, "src/a.py\n");
        exec.respond("git status --porcelain=v1 -uall", 0, "M  src/a.py\n?? docs/guide.md\n");
        let outcome = run(&exec, temp.path(), &paths);
        let refusal = outcome.refusal().expect("refused");
        assert_eq!(refusal.code, RefusalCode::PrestagedIndex);
        assert_eq!(refusal.details, vec!["src/a.py"]);
        assert!(!mutating(&exec));
    }

    #[test]
    fn packet_without_commit_plan_is_refused() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = prepared_run_with(temp.path(), None);
        let exec = ScriptedExec::new();
        exec.respond("git rev-parse --abbrev-ref HEAD", 0, "tp/tp_0001-add-parser\n");
        exec.respond("git status --porcelain=v1 -uall", 0, " M src/a.py\n");
        let outcome = run(&exec, temp.path(), &paths);
        assert_eq!(
            outcome.refusal().map(|r| r.code),
            Some(RefusalCode::MissingCommitPlan)
        );
        assert!(!mutating(&exec));
        let raw = fs::read_to_string(paths.dir.join(COMMIT_SEQUENCE_RUN)).expect("record");
        assert!(raw.contains("\"missing_commit_plan\""));
    }

    #[test]
    fn outside_changes_are_stashed_once_under_stash_policy() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = prepared_run(temp.path());
        let exec = ScriptedExec::new();
        exec.respond("git rev-parse --abbrev-ref HEAD", 0, "tp/tp_0001-add-parser\n");
        exec.respond(
            "git status --porcelain=v1 -uall",
            0,
            " M src/a.py\n?? docs/guide.md\n M README.md\n",
        );
        exec.respond("git rev-parse --verify refs/stash^{commit}", 0, "5ea5\n");
        let request = SequenceRequest {
            allow_unpromoted: true,
            dirty_policy: DirtyPolicy::Stash,
        };
        let outcome = commit_sequence(&exec, temp.path(), &KernelConfig::default(), &paths, request)
            .expect("sequence");
        let Outcome::Done(record) = outcome else {
            panic!("expected commits");
        };
        assert_eq!(record.stash_ref.as_deref(), Some("5ea5"));
        assert_eq!(record.steps.len(), 2);

        let ledger = DirtyStateLedger::load(&paths.dir).expect("ledger");
        assert_eq!(ledger.len(), 1);
        let entry = &ledger.entries()[0];
        assert_eq!(entry.location, "worktree");
        assert_eq!(entry.operation, "commit-sequence");
        assert_eq!(entry.stash_ref, "5ea5");
        assert_eq!(entry.status_porcelain, vec![" M README.md"]);
        assert!(
            exec.commands()
                .iter()
                .any(|c| c.starts_with("git stash push") && c.ends_with("-- README.md"))
        );
    }

    #[test]
    fn explicit_empty_step_verify_runs_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan = r#"{"commit_plan":[
            {"step_id":"c1","message":"parser","allowlist":["src/a.py"],"verify":[]}
        ]}"#;
        let paths = prepared_run_with(temp.path(), Some(plan));
        let exec = ScriptedExec::new();
        exec.respond("git rev-parse --abbrev-ref HEAD", 0, "tp/tp_0001-add-parser\n");
        exec.respond("git status --porcelain=v1 -uall", 0, " M src/a.py\n");
        exec.respond("sh -c true", 1, "");
        let Outcome::Done(record) = run(&exec, temp.path(), &paths) else {
            panic!("expected a commit");
        };
        assert!(record.steps[0].verification.is_empty());
        assert!(!exec.commands().iter().any(|c| c.starts_with("sh -c")));
    }
}
