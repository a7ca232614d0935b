//! Declared runners, models and routing policy.
//!
//! The configuration is parsed once per invocation and handed to the planner
//! as an immutable value.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::hints::normalize_tags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostTier {
    Cheap,
    Medium,
    High,
}

impl CostTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cheap => "cheap",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for CostTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CostTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cheap" => Ok(Self::Cheap),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown cost tier '{other}' (expected cheap|medium|high)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextSize {
    Small,
    Medium,
    Large,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelSpec {
    #[serde(default)]
    pub strengths: Vec<String>,
    pub cost_tier: CostTier,
    pub context: ContextSize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerSpec {
    pub available: bool,
    #[serde(default)]
    pub strengths: Vec<String>,
    /// Program and arguments used to launch the runner in `auto` mode. The
    /// rendered prompt is written to its stdin.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoutePolicy {
    pub max_cost_tier: CostTier,
    pub min_total_score: i64,
    pub stop_on_ambiguity: bool,
    /// Preferred models, most preferred first.
    pub escalation_ladder: Vec<String>,
}

impl Default for RoutePolicy {
    fn default() -> Self {
        Self {
            max_cost_tier: CostTier::High,
            min_total_score: 40,
            stop_on_ambiguity: true,
            escalation_ladder: Vec::new(),
        }
    }
}

/// Availability file contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AvailabilityConfig {
    #[serde(default)]
    pub models: BTreeMap<String, ModelSpec>,
    #[serde(default)]
    pub runners: BTreeMap<String, RunnerSpec>,
    #[serde(default)]
    pub policy: RoutePolicy,
}

impl AvailabilityConfig {
    /// Normalize tags and the escalation ladder, then report every problem.
    pub fn normalized(mut self) -> Result<Self, Vec<String>> {
        let mut errors = Vec::new();
        if self.models.is_empty() {
            errors.push("no models declared".to_string());
        }
        if self.runners.is_empty() {
            errors.push("no runners declared".to_string());
        }
        for (name, model) in &mut self.models {
            if name.trim().is_empty() {
                errors.push("model with empty name".to_string());
            }
            model.strengths = normalize_tags(std::mem::take(&mut model.strengths));
        }
        for (name, runner) in &mut self.runners {
            if name.trim().is_empty() {
                errors.push("runner with empty name".to_string());
            }
            runner.strengths = normalize_tags(std::mem::take(&mut runner.strengths));
            if runner.command.first().is_some_and(|program| program.trim().is_empty()) {
                errors.push(format!("runners.{name}.command must start with a program"));
            }
        }

        let mut seen = BTreeSet::new();
        let mut ladder = Vec::new();
        for model in std::mem::take(&mut self.policy.escalation_ladder) {
            let model = model.trim().to_string();
            if model.is_empty() || !seen.insert(model.clone()) {
                continue;
            }
            if !self.models.contains_key(&model) {
                errors.push(format!("escalation_ladder names unknown model '{model}'"));
            }
            ladder.push(model);
        }
        self.policy.escalation_ladder = ladder;

        if errors.is_empty() { Ok(self) } else { Err(errors) }
    }
}

/// Parse and validate availability TOML, listing every problem found.
pub fn parse_availability(text: &str) -> Result<AvailabilityConfig, Vec<String>> {
    let raw: AvailabilityConfig =
        toml::from_str(text).map_err(|err| vec![format!("parse availability toml: {err}")])?;
    raw.normalized()
}

/// Availability file written by `taskpack init`.
pub const DEFAULT_AVAILABILITY: &str = r#"# Runners and models the router may choose from.

[models.haiku]
strengths = ["cheap", "planning", "summaries", "automation"]
cost_tier = "cheap"
context = "medium"

[models.sonnet]
strengths = ["code_edit", "tests", "correctness", "gates"]
cost_tier = "medium"
context = "large"

[models.opus]
strengths = ["code_edit", "correctness", "finalization", "planning"]
cost_tier = "high"
context = "large"

[runners.claude_code]
available = true
strengths = ["code_edit", "tests", "automation"]

[runners.codex_desktop]
available = true
strengths = ["code_edit", "gates", "correctness", "finalization", "summaries"]

[policy]
max_cost_tier = "high"
min_total_score = 40
stop_on_ambiguity = true
escalation_ladder = ["haiku", "sonnet", "opus"]
"#;
