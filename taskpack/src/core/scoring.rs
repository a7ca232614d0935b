//! Candidate scoring for the router.
//!
//! `total = BASE + runner_fit + model_fit + ladder_bonus - cost_penalty`
//!
//! - `runner_fit` / `model_fit`: [`TAG_WEIGHT`] per required tag the runner /
//!   model declares.
//! - `ladder_bonus`: [`LADDER_WEIGHT`] × (ladder length − position); models
//!   absent from the ladder get 0.
//! - `cost_penalty`: 0 / 4 / 8 for cheap / medium / high.
//!
//! Candidates sort by total descending, then runner name, then model name.
//! The formula is part of the artifact contract: changing it changes plans.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::core::availability::{AvailabilityConfig, CostTier, ModelSpec, RunnerSpec};
use crate::core::hints::StepSpec;

pub const BASE_SCORE: i64 = 20;
pub const TAG_WEIGHT: i64 = 10;
pub const LADDER_WEIGHT: i64 = 4;

pub fn cost_penalty(tier: CostTier) -> i64 {
    match tier {
        CostTier::Cheap => 0,
        CostTier::Medium => 4,
        CostTier::High => 8,
    }
}

/// Score breakdown for one (runner, model) pair on one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub runner: String,
    pub model: String,
    pub runner_fit: i64,
    pub model_fit: i64,
    pub ladder_bonus: i64,
    pub cost_penalty: i64,
    pub total: i64,
    /// Required tags covered by the runner or the model, sorted.
    pub matched_tags: Vec<String>,
}

/// Score every eligible candidate for `step`, best first.
///
/// Eligible: runner marked available and model cost tier within the policy
/// maximum.
pub fn score_candidates(step: &StepSpec, config: &AvailabilityConfig) -> Vec<ScoredCandidate> {
    let mut candidates = Vec::new();
    for (runner_name, runner) in &config.runners {
        if !runner.available {
            continue;
        }
        for (model_name, model) in &config.models {
            if model.cost_tier > config.policy.max_cost_tier {
                continue;
            }
            candidates.push(score_pair(step, config, runner_name, runner, model_name, model));
        }
    }
    candidates.sort_by(rank);
    candidates
}

fn score_pair(
    step: &StepSpec,
    config: &AvailabilityConfig,
    runner_name: &str,
    runner: &RunnerSpec,
    model_name: &str,
    model: &ModelSpec,
) -> ScoredCandidate {
    let runner_hits = overlap(&step.required_tags, &runner.strengths);
    let model_hits = overlap(&step.required_tags, &model.strengths);
    let ladder = &config.policy.escalation_ladder;
    let ladder_bonus = ladder
        .iter()
        .position(|name| name == model_name)
        .map_or(0, |idx| LADDER_WEIGHT * (ladder.len() - idx) as i64);
    let runner_fit = TAG_WEIGHT * runner_hits.len() as i64;
    let model_fit = TAG_WEIGHT * model_hits.len() as i64;
    let penalty = cost_penalty(model.cost_tier);

    let mut matched_tags: Vec<String> = runner_hits.into_iter().chain(model_hits).collect();
    matched_tags.sort();
    matched_tags.dedup();

    ScoredCandidate {
        runner: runner_name.to_string(),
        model: model_name.to_string(),
        runner_fit,
        model_fit,
        ladder_bonus,
        cost_penalty: penalty,
        total: BASE_SCORE + runner_fit + model_fit + ladder_bonus - penalty,
        matched_tags,
    }
}

/// Total descending, then (runner, model) ascending.
pub fn rank(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.total
        .cmp(&a.total)
        .then_with(|| a.runner.cmp(&b.runner))
        .then_with(|| a.model.cmp(&b.model))
}

fn overlap(required: &[String], declared: &[String]) -> Vec<String> {
    required
        .iter()
        .filter(|tag| declared.contains(tag))
        .cloned()
        .collect()
}
