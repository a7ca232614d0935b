//! Deterministic route planning.
//!
//! Planning is a pure function of (packet, packet hash, availability config,
//! kernel version). Refusal is a normal plan value, never an error.

use serde::{Deserialize, Serialize};

use crate::core::availability::{AvailabilityConfig, RoutePolicy};
use crate::core::hints::{StepSpec, declared_steps};
use crate::core::packet::TaskPacket;
use crate::core::scoring::{ScoredCandidate, score_candidates};

/// Ranked alternatives recorded per step.
pub const TOP_CANDIDATES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Planned,
    Refused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Planned,
    Refused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRefusalCode {
    NoCandidates,
    BelowThreshold,
    Ambiguous,
}

impl StepRefusalCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoCandidates => "no_candidates",
            Self::BelowThreshold => "below_threshold",
            Self::Ambiguous => "ambiguous",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRefusal {
    pub step: String,
    pub reason_code: StepRefusalCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopCandidate {
    pub runner: String,
    pub model: String,
    pub total: i64,
}

impl From<&ScoredCandidate> for TopCandidate {
    fn from(candidate: &ScoredCandidate) -> Self {
        Self {
            runner: candidate.runner.clone(),
            model: candidate.model.clone(),
            total: candidate.total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub step: String,
    pub required_tags: Vec<String>,
    pub status: StepStatus,
    /// Selected pair with its full score breakdown; `None` when refused.
    pub selected: Option<ScoredCandidate>,
    pub candidates: Vec<TopCandidate>,
    pub refusal: Option<StepRefusal>,
}

impl PlannedStep {
    pub fn runner(&self) -> Option<&str> {
        self.selected.as_ref().map(|c| c.runner.as_str())
    }

    pub fn model(&self) -> Option<&str> {
        self.selected.as_ref().map(|c| c.model.as_str())
    }
}

/// Ordered plan mirroring the packet's declared steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutePlan {
    pub kernel_version: String,
    pub packet_id: String,
    pub packet_title: String,
    pub packet_sha256: String,
    pub status: PlanStatus,
    pub policy: RoutePolicy,
    pub steps: Vec<PlannedStep>,
    pub refusal_reasons: Vec<StepRefusal>,
}

impl RoutePlan {
    /// First planned step in declared order.
    pub fn first_planned(&self) -> Option<&PlannedStep> {
        self.steps.iter().find(|s| s.status == StepStatus::Planned)
    }
}

/// Build the route plan for a validated packet.
pub fn build_route_plan(
    packet: &TaskPacket,
    packet_sha256: &str,
    config: &AvailabilityConfig,
    kernel_version: &str,
) -> RoutePlan {
    let steps: Vec<PlannedStep> = declared_steps(packet.routing_hints.as_ref())
        .iter()
        .map(|spec| plan_step(spec, config))
        .collect();
    let refusal_reasons: Vec<StepRefusal> =
        steps.iter().filter_map(|s| s.refusal.clone()).collect();
    let status = if refusal_reasons.is_empty() {
        PlanStatus::Planned
    } else {
        PlanStatus::Refused
    };
    RoutePlan {
        kernel_version: kernel_version.to_string(),
        packet_id: packet.id.clone(),
        packet_title: packet.title.clone(),
        packet_sha256: packet_sha256.to_string(),
        status,
        policy: config.policy.clone(),
        steps,
        refusal_reasons,
    }
}

/// Plan one step: pick the best candidate or say exactly why none qualifies.
pub fn plan_step(spec: &StepSpec, config: &AvailabilityConfig) -> PlannedStep {
    let scored = score_candidates(spec, config);
    let candidates: Vec<TopCandidate> = scored
        .iter()
        .take(TOP_CANDIDATES)
        .map(TopCandidate::from)
        .collect();
    let policy = &config.policy;

    let refusal = match scored.as_slice() {
        [] => Some((
            StepRefusalCode::NoCandidates,
            format!(
                "no available runner paired with a model at or below cost tier '{}'",
                policy.max_cost_tier
            ),
        )),
        [top, ..] if top.total < policy.min_total_score => Some((
            StepRefusalCode::BelowThreshold,
            format!(
                "best candidate {}/{} scores {} below min_total_score {}",
                top.runner, top.model, top.total, policy.min_total_score
            ),
        )),
        [top, second, ..] if policy.stop_on_ambiguity && top.total == second.total => Some((
            StepRefusalCode::Ambiguous,
            format!(
                "{}/{} and {}/{} tie at {}",
                top.runner, top.model, second.runner, second.model, top.total
            ),
        )),
        _ => None,
    };

    match refusal {
        Some((reason_code, message)) => PlannedStep {
            step: spec.name.clone(),
            required_tags: spec.required_tags.clone(),
            status: StepStatus::Refused,
            selected: None,
            candidates,
            refusal: Some(StepRefusal {
                step: spec.name.clone(),
                reason_code,
                message,
            }),
        },
        None => PlannedStep {
            step: spec.name.clone(),
            required_tags: spec.required_tags.clone(),
            status: StepStatus::Planned,
            selected: scored.into_iter().next(),
            candidates,
            refusal: None,
        },
    }
}

/// Human-readable score explanation for one step of a plan.
pub fn explain_step(plan: &RoutePlan, step: &str) -> Option<String> {
    let planned = plan.steps.iter().find(|s| s.step == step)?;
    let mut lines = vec![
        format!("step: {}", planned.step),
        format!("required_tags: {}", planned.required_tags.join(", ")),
        format!(
            "status: {}",
            match planned.status {
                StepStatus::Planned => "planned",
                StepStatus::Refused => "refused",
            }
        ),
    ];
    if let Some(selected) = &planned.selected {
        lines.push(format!("selected: {}/{}", selected.runner, selected.model));
        lines.push(format!(
            "score: base {} + runner_fit {} + model_fit {} + ladder_bonus {} - cost_penalty {} = {}",
            crate::core::scoring::BASE_SCORE,
            selected.runner_fit,
            selected.model_fit,
            selected.ladder_bonus,
            selected.cost_penalty,
            selected.total
        ));
    }
    if let Some(refusal) = &planned.refusal {
        lines.push(format!(
            "refusal: {} ({})",
            refusal.reason_code.as_str(),
            refusal.message
        ));
    }
    for (rank, candidate) in planned.candidates.iter().enumerate() {
        lines.push(format!(
            "candidate {}: {}/{} total {}",
            rank + 1,
            candidate.runner,
            candidate.model,
            candidate.total
        ));
    }
    Some(lines.join("\n"))
}
