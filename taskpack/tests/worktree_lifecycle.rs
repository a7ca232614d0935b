//! Worktree engine scenarios against real git repositories.
//!
//! Each test builds a throwaway repository with a bare `origin`, initializes a
//! run directory inside it, then drives `start`, `commit_sequence` and
//! `finish` through the library.

use std::fs;
use std::path::{Path, PathBuf};

use taskpack::commit_sequence::{SequenceRequest, commit_sequence};
use taskpack::core::types::{DirtyPolicy, Outcome, RefusalCode};
use taskpack::envelope::init_run;
use taskpack::finish::{FinishRequest, finish};
use taskpack::io::config::KernelConfig;
use taskpack::io::exec::SystemExec;
use taskpack::io::git::Git;
use taskpack::io::ledger::DirtyStateLedger;
use taskpack::io::run_dir::RunPaths;
use taskpack::test_support::{TestRepo, packet_doc_for};
use taskpack::worktree::{StartRequest, WorktreeRecord, start};

const PLAN: &str = r#"{"commit_plan":[
    {"step_id":"c1","message":"add parser","allowlist":["src/a.py"]},
    {"step_id":"c2","message":"document parser","allowlist":["docs/"]}
]}"#;

const BRANCH: &str = "tp/tp_0001-add-parser";

struct Scenario {
    repo: TestRepo,
    // Holds the packet file outside the repository.
    _packets: tempfile::TempDir,
    paths: RunPaths,
    config: KernelConfig,
}

impl Scenario {
    fn new() -> Self {
        let repo = TestRepo::new().expect("test repo");
        let packets = tempfile::tempdir().expect("tempdir");
        let packet = packets.path().join("TP_0001.md");
        fs::write(
            &packet,
            packet_doc_for(&["src/a.py", "docs/"], &["true"], Some(PLAN)),
        )
        .expect("write packet");
        let config = KernelConfig::default();
        let paths = RunPaths::new(repo.root().join("out/runs/TP_0001/run1"));
        let outcome = init_run(&config, &packet, &paths).expect("init run");
        assert!(matches!(outcome, Outcome::Done(_)));
        Self {
            repo,
            _packets: packets,
            paths,
            config,
        }
    }

    fn root(&self) -> &Path {
        self.repo.root()
    }

    fn start(&self, request: &StartRequest) -> Outcome<WorktreeRecord> {
        start(&SystemExec, self.root(), &self.config, &self.paths, request).expect("wt start")
    }

    fn started(&self) -> PathBuf {
        match self.start(&StartRequest::default()) {
            Outcome::Done(record) => record.worktree_dir(self.root()),
            Outcome::Refused(refusal) => panic!("unexpected refusal: {refusal}"),
        }
    }

    fn sequence(&self) {
        let request = SequenceRequest {
            allow_unpromoted: true,
            dirty_policy: DirtyPolicy::Refuse,
        };
        let outcome = commit_sequence(&SystemExec, self.root(), &self.config, &self.paths, request)
            .expect("commit sequence");
        if let Outcome::Refused(refusal) = outcome {
            panic!("unexpected refusal: {refusal}");
        }
    }
}

fn write(dir: &Path, rel: &str, contents: &str) {
    let path = dir.join(rel);
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(path, contents).expect("write");
}

#[test]
fn start_sequence_finish_lands_commits_on_origin() {
    let scenario = Scenario::new();
    let worktree = scenario.started();
    assert!(worktree.ends_with(".worktrees/tp__tp_0001-add-parser"));

    write(&worktree, "src/a.py", "def parse():\n    return {}\n");
    write(&worktree, "docs/guide.md", "# Parser\n");
    scenario.sequence();

    let log = Git::new(&SystemExec, &worktree);
    assert_eq!(log.current_branch().expect("branch").as_deref(), Some(BRANCH));

    let outcome = finish(
        &SystemExec,
        scenario.root(),
        &scenario.config,
        &scenario.paths,
        &FinishRequest::default(),
    )
    .expect("finish");
    let record = match outcome {
        Outcome::Done(record) => record,
        Outcome::Refused(refusal) => panic!("unexpected refusal: {refusal}"),
    };
    let origin_head = scenario.repo.origin_head("main").expect("origin head");
    assert_eq!(record.base_head_after.as_deref(), Some(origin_head.as_str()));
    assert_eq!(record.remote_head_after.as_deref(), Some(origin_head.as_str()));
    assert!(!worktree.exists());

    let subjects = scenario
        .repo
        .git(&["log", "--format=%s", "-3", "main"])
        .expect("log");
    assert_eq!(
        subjects.lines().collect::<Vec<_>>(),
        vec![
            "TP_0001 c2: document parser",
            "TP_0001 c1: add parser",
            "initial"
        ]
    );
}

#[test]
fn rebase_conflict_is_refused_and_worktree_untouched() {
    let scenario = Scenario::new();
    let worktree = scenario.started();
    let git = Git::new(&SystemExec, &worktree);
    write(&worktree, "README.md", "# ours\n");
    git.stage_paths(&["README.md".to_string()]).expect("stage");
    let ours = git.commit("edit readme").expect("commit");

    let theirs = scenario
        .repo
        .push_from_other_clone("main", "README.md", "# theirs\n", "upstream edit")
        .expect("upstream push");

    let outcome = finish(
        &SystemExec,
        scenario.root(),
        &scenario.config,
        &scenario.paths,
        &FinishRequest::default(),
    )
    .expect("finish");
    assert_eq!(
        outcome.refusal().map(|r| r.code),
        Some(RefusalCode::RebaseConflict)
    );
    assert_eq!(git.rev_parse("HEAD").expect("head"), ours);
    assert!(git.status_porcelain().expect("status").is_empty());
    assert_eq!(scenario.repo.origin_head("main").expect("origin"), theirs);
}

#[test]
fn stash_policy_records_exactly_one_ledger_entry() {
    let scenario = Scenario::new();
    scenario.repo.write("notes.txt", "scratch\n").expect("dirty");

    let refused = scenario.start(&StartRequest::default());
    assert_eq!(refused.refusal().map(|r| r.code), Some(RefusalCode::DirtyTree));
    assert!(DirtyStateLedger::load(&scenario.paths.dir).expect("ledger").is_empty());

    let request = StartRequest {
        branch: Some("tp/stashed".to_string()),
        dirty_policy: DirtyPolicy::Stash,
        ..StartRequest::default()
    };
    let record = match scenario.start(&request) {
        Outcome::Done(record) => record,
        Outcome::Refused(refusal) => panic!("unexpected refusal: {refusal}"),
    };
    let ledger = DirtyStateLedger::load(&scenario.paths.dir).expect("ledger");
    assert_eq!(ledger.len(), 1);
    let entry = &ledger.entries()[0];
    assert_eq!(entry.location, "repo_root");
    assert_eq!(entry.status_porcelain, vec!["?? notes.txt"]);
    assert_eq!(record.stash_ref.as_deref(), Some(entry.stash_ref.as_str()));
    assert!(!scenario.root().join("notes.txt").exists());
}

#[test]
fn existing_branch_is_never_reused() {
    let scenario = Scenario::new();
    scenario.repo.git(&["branch", BRANCH]).expect("branch");
    let outcome = scenario.start(&StartRequest::default());
    assert_eq!(
        outcome.refusal().map(|r| r.code),
        Some(RefusalCode::BranchExists)
    );
    assert!(!scenario.root().join(".worktrees").exists());
}
