//! Orchestration for `taskpack route plan` and `taskpack route explain`.
//!
//! Planning without execution: validate the packet, load availability, build
//! the route plan and persist it. The kernel reuses [`load_inputs`] and
//! [`RefusalReport`].

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::availability::AvailabilityConfig;
use crate::core::packet::{PacketDefect, TaskPacket};
use crate::core::planner::{PlanStatus, RoutePlan, StepRefusal, build_route_plan, explain_step};
use crate::core::state::KernelState;
use crate::core::types::{Outcome, Refusal, RefusalCode};
use crate::io::artifacts::ArtifactWriter;
use crate::io::availability::load_availability;
use crate::io::config::KernelConfig;
use crate::io::exec::resolve;
use crate::io::packet_store::load_packet;
use crate::io::render::Renderer;
use crate::io::run_dir::{HANDOFF, REFUSAL_REPORT, ROUTE_PLAN_JSON, ROUTE_PLAN_MD, default_run_dir};

/// Kernel version recorded in every plan; part of the determinism key.
pub const KERNEL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Packet id used for run directories of packets whose header is unreadable.
const UNKNOWN_PACKET: &str = "TP_UNKNOWN";

/// Contents of `REFUSAL_REPORT.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RefusalReport {
    pub kernel_version: String,
    pub packet_id: Option<String>,
    pub packet_sha256: String,
    pub refusal: Refusal,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub defects: Vec<PacketDefect>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub step_refusals: Vec<StepRefusal>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<KernelState>,
}

/// Validated inputs for planning.
#[derive(Debug, Clone)]
pub struct PlanInputs {
    pub packet: TaskPacket,
    pub packet_sha256: String,
    pub availability: AvailabilityConfig,
}

/// What stopped input loading, with enough context for a refusal report.
#[derive(Debug, Clone)]
pub struct InputRefusal {
    pub packet_id: Option<String>,
    pub packet_sha256: String,
    pub refusal: Refusal,
    pub defects: Vec<PacketDefect>,
}

/// Result of `route plan`.
#[derive(Debug, Clone)]
pub struct RouteReport {
    pub plan: RoutePlan,
    pub out_dir: PathBuf,
}

/// Run directory for a packet file: `--out` when given, else the default
/// derived from the packet id and hash.
pub fn run_dir_for(
    root: &Path,
    config: &KernelConfig,
    packet_id: Option<&str>,
    packet_sha256: &str,
    explicit: Option<&Path>,
) -> PathBuf {
    match explicit {
        Some(dir) => resolve(root, dir),
        None => default_run_dir(
            &resolve(root, &config.runs_dir),
            packet_id.unwrap_or(UNKNOWN_PACKET),
            packet_sha256,
        ),
    }
}

/// Read and validate the packet, then the availability file.
///
/// The packet is validated first: a malformed packet is reported even when the
/// availability file is also broken.
pub fn load_inputs(
    packet_path: &Path,
    availability_path: &Path,
) -> Result<Result<PlanInputs, InputRefusal>> {
    let loaded = load_packet(packet_path)?;
    let packet = match loaded.parsed {
        Ok(packet) => packet,
        Err(err) => {
            warn!(defects = err.defects.len(), "packet failed validation");
            let packet_id = header_id(&loaded.text);
            let refusal = err.to_refusal();
            return Ok(Err(InputRefusal {
                packet_id,
                packet_sha256: loaded.sha256,
                refusal,
                defects: err.defects,
            }));
        }
    };
    match load_availability(availability_path)? {
        Outcome::Done(availability) => Ok(Ok(PlanInputs {
            packet,
            packet_sha256: loaded.sha256,
            availability,
        })),
        Outcome::Refused(refusal) => Ok(Err(InputRefusal {
            packet_id: Some(packet.id),
            packet_sha256: loaded.sha256,
            refusal,
            defects: Vec::new(),
        })),
    }
}

/// Id from a header line that failed validation elsewhere, when recognizable.
fn header_id(text: &str) -> Option<String> {
    let first = text.lines().find(|line| !line.trim().is_empty())?;
    first
        .split_whitespace()
        .find(|word| word.starts_with("TP_") && word.len() == 7)
        .filter(|word| word[3..].chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
}

/// Refusal for a plan in which at least one step was refused.
pub fn plan_refusal(plan: &RoutePlan) -> Refusal {
    Refusal::new(
        RefusalCode::RouteRefused,
        format!(
            "{} of {} step(s) could not be routed",
            plan.refusal_reasons.len(),
            plan.steps.len()
        ),
        "make a qualifying runner/model available or adjust the routing policy",
    )
    .with_details(
        plan.refusal_reasons
            .iter()
            .map(|r| format!("{}: {} ({})", r.step, r.reason_code.as_str(), r.message))
            .collect(),
    )
}

/// `route plan`: write `ROUTE_PLAN.json`, `ROUTE_PLAN.md`, then `HANDOFF.md`
/// or `REFUSAL_REPORT.json`.
#[instrument(skip_all, fields(packet = %packet_path.display()))]
pub fn plan_route(
    root: &Path,
    config: &KernelConfig,
    packet_path: &Path,
    availability_path: &Path,
    out_dir: Option<&Path>,
) -> Result<Outcome<RouteReport>> {
    let inputs = match load_inputs(packet_path, availability_path)? {
        Ok(inputs) => inputs,
        Err(refused) => {
            let dir = run_dir_for(
                root,
                config,
                refused.packet_id.as_deref(),
                &refused.packet_sha256,
                out_dir,
            );
            let mut writer = ArtifactWriter::create(&dir)?;
            writer.write_json(
                REFUSAL_REPORT,
                &RefusalReport {
                    kernel_version: KERNEL_VERSION.to_string(),
                    packet_id: refused.packet_id,
                    packet_sha256: refused.packet_sha256,
                    refusal: refused.refusal.clone(),
                    defects: refused.defects,
                    step_refusals: Vec::new(),
                    states: Vec::new(),
                },
            )?;
            return Ok(Outcome::Refused(refused.refusal));
        }
    };

    let plan = build_route_plan(
        &inputs.packet,
        &inputs.packet_sha256,
        &inputs.availability,
        KERNEL_VERSION,
    );
    let dir = run_dir_for(
        root,
        config,
        Some(&inputs.packet.id),
        &inputs.packet_sha256,
        out_dir,
    );
    let renderer = Renderer::new();
    let mut writer = ArtifactWriter::create(&dir)?;
    writer.write_json(ROUTE_PLAN_JSON, &plan)?;
    writer.write_text(ROUTE_PLAN_MD, &renderer.route_plan(&plan)?)?;

    if plan.status == PlanStatus::Refused {
        let refusal = plan_refusal(&plan);
        writer.write_json(
            REFUSAL_REPORT,
            &RefusalReport {
                kernel_version: KERNEL_VERSION.to_string(),
                packet_id: Some(plan.packet_id.clone()),
                packet_sha256: plan.packet_sha256.clone(),
                refusal: refusal.clone(),
                defects: Vec::new(),
                step_refusals: plan.refusal_reasons.clone(),
                states: Vec::new(),
            },
        )?;
        info!(dir = %dir.display(), "route plan refused");
        return Ok(Outcome::Refused(refusal));
    }

    writer.write_text(HANDOFF, &renderer.handoff(&plan, &inputs.packet)?)?;
    info!(dir = %dir.display(), steps = plan.steps.len(), "route plan written");
    Ok(Outcome::Done(RouteReport { plan, out_dir: dir }))
}

/// `route explain`: score breakdown for one step. Unknown steps are errors.
pub fn explain_route(
    packet_path: &Path,
    availability_path: &Path,
    step: &str,
) -> Result<Outcome<String>> {
    let inputs = match load_inputs(packet_path, availability_path)? {
        Ok(inputs) => inputs,
        Err(refused) => return Ok(Outcome::Refused(refused.refusal)),
    };
    let plan = build_route_plan(
        &inputs.packet,
        &inputs.packet_sha256,
        &inputs.availability,
        KERNEL_VERSION,
    );
    explain_step(&plan, step)
        .map(Outcome::Done)
        .ok_or_else(|| {
            let known: Vec<&str> = plan.steps.iter().map(|s| s.step.as_str()).collect();
            anyhow::anyhow!("unknown step '{step}' (declared: {})", known.join(", "))
        })
}
