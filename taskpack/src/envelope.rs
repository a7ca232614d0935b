//! Orchestration for `taskpack run init` and `taskpack run evidence`.
//!
//! `run init` snapshots the packet into the run directory; every later run
//! command (evidence, gate, commit, worktree engine) reads that snapshot
//! rather than the original file.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::core::canonical::sha256_hex;
use crate::core::packet::{TaskPacket, parse_packet};
use crate::core::types::{Outcome, Refusal, RefusalCode};
use crate::io::artifacts::ArtifactWriter;
use crate::io::config::KernelConfig;
use crate::io::exec::{CommandExec, CommandSpec, bounded, exit_label};
use crate::io::packet_store::load_packet;
use crate::io::render::{CommandEvidence, Renderer};
use crate::io::run_dir::{EVIDENCE, RUN_ENVELOPE, RunPaths, TASK_PACKET};
use crate::route::KERNEL_VERSION;

/// Contents of `RUN_ENVELOPE.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEnvelope {
    pub schema_version: u32,
    pub kernel_version: String,
    pub packet_id: String,
    pub title: String,
    pub packet_sha256: String,
    pub allowlist: Vec<String>,
    pub verification_commands: Vec<String>,
    pub sources: Vec<String>,
    pub has_commit_plan: bool,
    pub created_at: String,
}

/// Summary of one `run evidence` invocation.
#[derive(Debug, Clone)]
pub struct EvidenceReport {
    pub commands: Vec<CommandEvidence>,
    pub failed: Vec<String>,
}

/// `run init`: write `TASK_PACKET.md` and `RUN_ENVELOPE.json`.
#[instrument(skip_all, fields(run = %paths.dir.display()))]
pub fn init_run(
    config: &KernelConfig,
    packet_path: &Path,
    paths: &RunPaths,
) -> Result<Outcome<RunEnvelope>> {
    let loaded = load_packet(packet_path)?;
    let packet = match loaded.parsed {
        Ok(packet) => packet,
        Err(err) => return Ok(Outcome::Refused(err.to_refusal())),
    };
    let envelope = RunEnvelope {
        schema_version: 1,
        kernel_version: KERNEL_VERSION.to_string(),
        packet_id: packet.id.clone(),
        title: packet.title.clone(),
        packet_sha256: loaded.sha256,
        allowlist: packet.allowlist.clone(),
        verification_commands: packet.verification_commands.clone(),
        sources: packet.sources.clone(),
        has_commit_plan: packet.commit_plan.is_some(),
        created_at: config.timestamp_mode.now(),
    };
    let mut writer = ArtifactWriter::create(&paths.dir)?;
    writer.write_text(TASK_PACKET, &loaded.text)?;
    writer.write_json(RUN_ENVELOPE, &envelope)?;
    info!(packet = %envelope.packet_id, "run initialized");
    Ok(Outcome::Done(envelope))
}

/// Parse the packet snapshot of a run. A missing snapshot or an invalid one
/// is a refusal.
pub fn load_run_packet(paths: &RunPaths) -> Result<Outcome<(TaskPacket, String)>> {
    if !paths.task_packet.exists() {
        return Ok(Outcome::Refused(missing_artifact(paths, TASK_PACKET, "taskpack run init")));
    }
    let text = fs::read_to_string(&paths.task_packet)
        .with_context(|| format!("read {}", paths.task_packet.display()))?;
    match parse_packet(&text) {
        Ok(packet) => Ok(Outcome::Done((packet, sha256_hex(text.as_bytes())))),
        Err(err) => Ok(Outcome::Refused(err.to_refusal())),
    }
}

/// Refusal for a run record that an earlier command should have written.
pub fn missing_artifact(paths: &RunPaths, name: &str, producer: &str) -> Refusal {
    Refusal::new(
        RefusalCode::MissingArtifact,
        format!("{name} not found in run directory {}", paths.dir.display()),
        format!("run `{producer}` for this run directory first"),
    )
}

/// `run evidence`: run every verification command from the repository root
/// and write `EVIDENCE.md`. Failing commands are recorded, then refused.
#[instrument(skip_all, fields(run = %paths.dir.display()))]
pub fn collect_evidence(
    exec: &dyn CommandExec,
    root: &Path,
    config: &KernelConfig,
    paths: &RunPaths,
) -> Result<Outcome<EvidenceReport>> {
    let (packet, sha256) = match load_run_packet(paths)? {
        Outcome::Done(loaded) => loaded,
        Outcome::Refused(refusal) => return Ok(Outcome::Refused(refusal)),
    };

    let mut commands = Vec::with_capacity(packet.verification_commands.len());
    let mut failed = Vec::new();
    for command in &packet.verification_commands {
        let output = exec.run(&CommandSpec::shell(command, root))?;
        if !output.success() {
            warn!(command = %command, exit_code = ?output.code, "verification command failed");
            failed.push(command.clone());
        }
        let mut combined = output.stdout;
        if !output.stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&output.stderr);
        }
        commands.push(CommandEvidence {
            command: command.clone(),
            exit: exit_label(output.code),
            output: bounded(combined.trim_end(), config.verification_output_limit_bytes),
        });
    }

    let text = Renderer::new().evidence(&packet, &sha256, &config.timestamp_mode.now(), &commands)?;
    let mut writer = ArtifactWriter::create(&paths.dir)?;
    writer.write_text(EVIDENCE, &text)?;
    info!(commands = commands.len(), failed = failed.len(), "evidence collected");

    if !failed.is_empty() {
        return Ok(Outcome::Refused(
            Refusal::new(
                RefusalCode::VerificationFailed,
                format!("{} verification command(s) failed", failed.len()),
                "make every verification command exit 0, then collect evidence again",
            )
            .with_details(failed),
        ));
    }
    Ok(Outcome::Done(EvidenceReport { commands, failed }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::compliance::has_verification_evidence;
    use crate::test_support::{ScriptedExec, packet_doc};

    fn init(temp: &Path) -> RunPaths {
        let packet = temp.join("TP_0001.md");
        fs::write(&packet, packet_doc()).expect("write packet");
        let paths = RunPaths::new(temp.join("run"));
        let outcome = init_run(&KernelConfig::default(), &packet, &paths).expect("init");
        assert!(matches!(outcome, Outcome::Done(_)));
        paths
    }

    #[test]
    fn init_snapshots_packet_and_envelope() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init(temp.path());
        assert_eq!(
            fs::read_to_string(&paths.task_packet).expect("snapshot"),
            packet_doc()
        );
        let envelope: RunEnvelope = crate::io::artifacts::read_json(&paths.envelope)
            .expect("read")
            .expect("envelope");
        assert_eq!(envelope.packet_id, "TP_0001");
        assert_eq!(envelope.packet_sha256, sha256_hex(packet_doc().as_bytes()));
        assert!(!envelope.has_commit_plan);
    }

    #[test]
    fn evidence_without_init_is_missing_artifact() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exec = ScriptedExec::new();
        let outcome = collect_evidence(
            &exec,
            temp.path(),
            &KernelConfig::default(),
            &RunPaths::new(temp.path().join("run")),
        )
        .expect("evidence");
        assert_eq!(
            outcome.refusal().map(|r| r.code),
            Some(RefusalCode::MissingArtifact)
        );
        assert!(exec.calls().is_empty());
    }

    #[test]
    fn evidence_records_each_command() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init(temp.path());
        let exec = ScriptedExec::new();
        exec.respond("sh -c pytest -q", 0, "1 passed\n");
        let outcome = collect_evidence(&exec, temp.path(), &KernelConfig::default(), &paths)
            .expect("evidence");
        let Outcome::Done(report) = outcome else {
            panic!("expected evidence");
        };
        assert_eq!(report.commands[0].output, "1 passed");
        let text = fs::read_to_string(&paths.evidence).expect("evidence file");
        assert!(has_verification_evidence(&text));
        assert!(text.contains("- exit: exit 0"));
    }

    #[test]
    fn failing_command_is_recorded_then_refused() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init(temp.path());
        let exec = ScriptedExec::new();
        exec.respond("sh -c pytest -q", 1, "1 failed\n");
        let outcome = collect_evidence(&exec, temp.path(), &KernelConfig::default(), &paths)
            .expect("evidence");
        assert_eq!(
            outcome.refusal().map(|r| r.code),
            Some(RefusalCode::VerificationFailed)
        );
        assert!(fs::read_to_string(&paths.evidence).expect("evidence").contains("1 failed"));
    }
}
