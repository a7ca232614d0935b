//! Orchestration for `taskpack run gate` and `taskpack run promote`.
//!
//! The gate compares the repository's changed files against the packet
//! allowlist and checks that verification evidence was recorded. Promotion
//! turns a clean gate into a `PROMOTION_TOKEN.json` that commit commands
//! require.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::core::allowlist::Allowlist;
use crate::core::canonical::{sha256_hex, to_canonical_string};
use crate::core::compliance::{AllowlistDiff, evaluate_allowlist, promotion_blockers};
use crate::core::types::{Outcome, Refusal, RefusalCode};
use crate::envelope::{load_run_packet, missing_artifact};
use crate::io::artifacts::{ArtifactWriter, read_json};
use crate::io::config::KernelConfig;
use crate::io::exec::resolve;
use crate::io::git::{Git, StatusEntry};
use crate::io::run_dir::{ALLOWLIST_DIFF, PROMOTION_TOKEN, RunPaths, VIOLATIONS};
use crate::io::render::Renderer;

/// Contents of `PROMOTION_TOKEN.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionToken {
    pub status: String,
    pub packet_id: String,
    pub allowlist_diff_sha256: String,
    pub evidence_sha256: String,
    /// Hash binding the diff and evidence hashes together.
    pub token: String,
    pub reasons: Vec<String>,
    pub timestamp: String,
}

/// Repository-relative prefixes that never count as packet changes: the run
/// directory and the worktrees directory.
pub fn engine_paths(root: &Path, config: &KernelConfig, paths: &RunPaths) -> Vec<String> {
    let mut prefixes = Vec::new();
    if let Some(rel) = paths.relative_to(root) {
        prefixes.push(rel);
    }
    let worktrees = resolve(root, &config.worktrees_dir);
    if let Ok(rel) = worktrees.strip_prefix(root) {
        let rel = rel.to_string_lossy().replace('\\', "/");
        if !rel.is_empty() {
            prefixes.push(rel);
        }
    }
    prefixes
}

/// Porcelain entries of `git`'s working tree outside `excluded` prefixes.
pub fn working_changes(git: &Git<'_>, excluded: &[String]) -> Result<Vec<StatusEntry>> {
    Ok(git
        .status_porcelain()?
        .into_iter()
        .filter(|entry| !entry.under_any(excluded))
        .collect())
}

/// `run gate`: write `ALLOWLIST_DIFF.json` and `VIOLATIONS.md`. A gate with
/// violations is written, then refused.
#[instrument(skip_all, fields(run = %paths.dir.display()))]
pub fn run_gate(
    git: &Git<'_>,
    root: &Path,
    config: &KernelConfig,
    paths: &RunPaths,
) -> Result<Outcome<AllowlistDiff>> {
    let (packet, _) = match load_run_packet(paths)? {
        Outcome::Done(loaded) => loaded,
        Outcome::Refused(refusal) => return Ok(Outcome::Refused(refusal)),
    };
    let allowlist = Allowlist::new(&packet.allowlist)
        .map_err(|errors| anyhow::anyhow!("validated allowlist rejected: {}", errors.join("; ")))?;

    let changed: Vec<String> = working_changes(git, &engine_paths(root, config, paths))?
        .into_iter()
        .map(|entry| entry.path)
        .collect();
    let evidence = read_optional(&paths.evidence)?;
    let diff = evaluate_allowlist(
        &packet.id,
        &allowlist,
        &changed,
        evidence.as_deref(),
        &config.timestamp_mode.now(),
    );

    let mut writer = ArtifactWriter::create(&paths.dir)?;
    writer.write_json(ALLOWLIST_DIFF, &diff)?;
    writer.write_text(VIOLATIONS, &Renderer::new().violations(&diff)?)?;

    if diff.violations.count > 0 {
        warn!(violations = diff.violations.count, "allowlist gate failed");
        return Ok(Outcome::Refused(
            Refusal::new(
                RefusalCode::AllowlistViolations,
                format!("allowlist gate found {} violation(s)", diff.violations.count),
                "revert out-of-scope changes and record verification evidence, then gate again",
            )
            .with_details(diff.violations.items.iter().map(|v| v.message.clone()).collect()),
        ));
    }
    info!(allowed = diff.allowed_files.len(), "allowlist gate passed");
    Ok(Outcome::Done(diff))
}

/// `run promote`: write `PROMOTION_TOKEN.json` only for a clean gate with
/// evidence present.
#[instrument(skip_all, fields(run = %paths.dir.display()))]
pub fn promote(config: &KernelConfig, paths: &RunPaths) -> Result<Outcome<PromotionToken>> {
    let Some(diff) = read_json::<AllowlistDiff>(&paths.allowlist_diff)? else {
        return Ok(Outcome::Refused(missing_artifact(paths, ALLOWLIST_DIFF, "taskpack run gate")));
    };
    let evidence = read_optional(&paths.evidence)?;
    let blockers = promotion_blockers(&diff, evidence.as_deref());
    if !blockers.is_empty() {
        warn!(blockers = blockers.len(), "promotion refused");
        return Ok(Outcome::Refused(
            Refusal::new(
                RefusalCode::AllowlistViolations,
                "run is not promotable",
                "make the gate pass with evidence recorded, then promote again",
            )
            .with_details(blockers),
        ));
    }

    let diff_sha = sha256_hex(to_canonical_string(&diff)?.as_bytes());
    let evidence_sha = sha256_hex(evidence.unwrap_or_default().as_bytes());
    let token = PromotionToken {
        status: "promoted".to_string(),
        packet_id: diff.packet_id.clone(),
        token: sha256_hex(format!("{diff_sha}:{evidence_sha}").as_bytes()),
        allowlist_diff_sha256: diff_sha,
        evidence_sha256: evidence_sha,
        reasons: Vec::new(),
        timestamp: config.timestamp_mode.now(),
    };
    let mut writer = ArtifactWriter::create(&paths.dir)?;
    writer.write_json(PROMOTION_TOKEN, &token)?;
    info!(packet = %token.packet_id, "run promoted");
    Ok(Outcome::Done(token))
}

/// Refusal when the gate recorded violations; `None` when clean or not run.
pub fn gate_refusal(paths: &RunPaths) -> Result<Option<Refusal>> {
    let Some(diff) = read_json::<AllowlistDiff>(&paths.allowlist_diff)? else {
        return Ok(None);
    };
    if diff.violations.count == 0 {
        return Ok(None);
    }
    Ok(Some(
        Refusal::new(
            RefusalCode::AllowlistViolations,
            format!(
                "{} records {} violation(s)",
                ALLOWLIST_DIFF, diff.violations.count
            ),
            "fix the violations and run `taskpack run gate` again",
        )
        .with_details(diff.disallowed_files),
    ))
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    fs::read_to_string(path)
        .map(Some)
        .with_context(|| format!("read {}", path.display()))
}
