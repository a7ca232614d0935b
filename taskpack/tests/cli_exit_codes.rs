//! CLI tests for the exit-code contract.
//!
//! Spawns the taskpack binary and checks that success, refusal and unexpected
//! error map to 0, 2 and 1.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use taskpack::core::packet::GOAL;
use taskpack::exit_codes;
use taskpack::io::run_dir::{HANDOFF, REFUSAL_REPORT, ROUTE_PLAN_JSON};
use taskpack::test_support::{
    packet_doc, packet_doc_with, single_pair_availability, write_availability,
};

struct Workspace {
    temp: tempfile::TempDir,
}

impl Workspace {
    fn new(doc: &str) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("TP_0001.md"), doc).expect("write packet");
        write_availability(
            &temp.path().join(".taskpack/availability.toml"),
            &single_pair_availability(),
        )
        .expect("availability");
        Self { temp }
    }

    fn path(&self) -> &Path {
        self.temp.path()
    }

    fn taskpack(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_taskpack"))
            .current_dir(self.path())
            .args(args)
            .output()
            .expect("run taskpack")
    }
}

fn stdout_path(output: &Output) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(&output.stdout).trim())
}

#[test]
fn valid_packet_validates_with_ok_code() {
    let ws = Workspace::new(&packet_doc());
    let output = ws.taskpack(&["packet", "validate", "TP_0001.md"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&output.stdout).starts_with("TP_0001 valid"));
}

#[test]
fn malformed_packet_is_refused_with_every_defect() {
    let doc = packet_doc_with(GOAL, "").replace("## SOURCES", "## SOURCE");
    let ws = Workspace::new(&doc);
    let output = ws.taskpack(&["packet", "validate", "TP_0001.md"]);
    assert_eq!(output.status.code(), Some(exit_codes::REFUSED));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("packet_format"));
    assert!(stderr.contains("[GOAL]"));
    assert!(stderr.contains("[SOURCES]"));
}

#[test]
fn route_plan_writes_artifacts_and_exits_ok() {
    let ws = Workspace::new(&packet_doc());
    let output = ws.taskpack(&["route", "plan", "TP_0001.md", "--out", "plan"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let dir = ws.path().join("plan");
    assert!(dir.join(ROUTE_PLAN_JSON).exists());
    assert!(dir.join(HANDOFF).exists());
}

#[test]
fn route_plan_below_threshold_is_refused_with_artifacts() {
    let ws = Workspace::new(&packet_doc());
    let mut availability = single_pair_availability();
    availability.policy.min_total_score = 1000;
    write_availability(&ws.path().join(".taskpack/availability.toml"), &availability)
        .expect("availability");
    let output = ws.taskpack(&["route", "plan", "TP_0001.md", "--out", "plan"]);
    assert_eq!(output.status.code(), Some(exit_codes::REFUSED));
    let dir = ws.path().join("plan");
    assert!(dir.join(ROUTE_PLAN_JSON).exists());
    let report = fs::read_to_string(dir.join(REFUSAL_REPORT)).expect("refusal report");
    assert!(report.contains("below_threshold"));
}

#[test]
fn unknown_explain_step_is_an_error() {
    let ws = Workspace::new(&packet_doc());
    let output = ws.taskpack(&["route", "explain", "TP_0001.md", "--step", "deploy"]);
    assert_eq!(output.status.code(), Some(exit_codes::ERROR));
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown step 'deploy'"));
}

#[test]
fn kernel_manual_mode_emits_handoff() {
    let ws = Workspace::new(&packet_doc());
    let output = ws.taskpack(&["kernel", "TP_0001.md"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let run_dir = stdout_path(&output);
    assert!(run_dir.starts_with(ws.path().join("out/runs/TP_0001")));
    assert!(run_dir.join(HANDOFF).exists());
}

#[test]
fn kernel_without_availability_is_refused() {
    let ws = Workspace::new(&packet_doc());
    fs::remove_file(ws.path().join(".taskpack/availability.toml")).expect("remove");
    let output = ws.taskpack(&["kernel", "TP_0001.md", "--run-dir", "run"]);
    assert_eq!(output.status.code(), Some(exit_codes::REFUSED));
    assert!(ws.path().join("run").join(REFUSAL_REPORT).exists());
}

#[test]
fn run_evidence_without_init_is_refused() {
    let ws = Workspace::new(&packet_doc());
    let output = ws.taskpack(&["run", "evidence", "--run-dir", "run"]);
    assert_eq!(output.status.code(), Some(exit_codes::REFUSED));
    assert!(String::from_utf8_lossy(&output.stderr).contains("missing_artifact"));
}

#[test]
fn missing_packet_file_is_an_error() {
    let ws = Workspace::new(&packet_doc());
    let output = ws.taskpack(&["packet", "validate", "TP_9999.md"]);
    assert_eq!(output.status.code(), Some(exit_codes::ERROR));
}

#[test]
fn init_writes_config_and_availability_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let status = Command::new(env!("CARGO_BIN_EXE_taskpack"))
        .current_dir(temp.path())
        .arg("init")
        .status()
        .expect("taskpack init");
    assert_eq!(status.code(), Some(exit_codes::OK));
    assert!(temp.path().join(".taskpack/config.toml").exists());
    assert!(temp.path().join(".taskpack/availability.toml").exists());
}
