//! Routing hints section and declared step resolution.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::types::ExecutionMode;

/// Steps routed when a packet declares none, with their required capability tags.
pub const DEFAULT_STEPS: [(&str, &[&str]); 6] = [
    ("compile-tasks", &["cheap", "planning"]),
    ("run-task", &["code_edit", "tests"]),
    ("collect-evidence", &["automation", "summaries"]),
    ("gate-allowlist", &["correctness", "gates"]),
    ("commit-run", &["correctness", "tests"]),
    ("finish", &["correctness", "finalization"]),
];

/// Parsed `## ROUTING HINTS` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingHints {
    pub mode: Option<ExecutionMode>,
    /// Declared step order. Empty means the default steps.
    pub steps: Vec<String>,
    /// Required tags per step, overriding built-in defaults.
    pub requires: BTreeMap<String, Vec<String>>,
    /// Unrecognized keys, kept verbatim.
    pub extra: BTreeMap<String, String>,
}

/// A step the router must assign a runner/model pair to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    /// Sorted, deduplicated.
    pub required_tags: Vec<String>,
}

/// Parse `key: value` lines, reporting every malformed line.
pub fn parse_routing_hints(body: &str) -> Result<RoutingHints, Vec<String>> {
    let mut hints = RoutingHints::default();
    let mut errors = Vec::new();
    for (idx, raw) in body.lines().enumerate() {
        let line = raw.trim();
        let line = line
            .strip_prefix("- ")
            .or_else(|| line.strip_prefix("* "))
            .unwrap_or(line)
            .trim();
        if line.is_empty() || line.starts_with("```") {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            errors.push(format!("line {}: expected `key: value`, got '{line}'", idx + 1));
            continue;
        };
        let key = key.trim().trim_matches('`').to_ascii_lowercase();
        let value = value.trim().trim_matches('`');
        if key == "mode" {
            match value.parse::<ExecutionMode>() {
                Ok(mode) => hints.mode = Some(mode),
                Err(err) => errors.push(format!("line {}: {err}", idx + 1)),
            }
        } else if key == "steps" {
            let mut seen = BTreeSet::new();
            for step in split_list(value) {
                if !seen.insert(step.clone()) {
                    errors.push(format!("line {}: step '{step}' declared twice", idx + 1));
                    continue;
                }
                hints.steps.push(step);
            }
        } else if let Some(step) = key.strip_prefix("requires.") {
            let step = step.trim();
            if step.is_empty() {
                errors.push(format!("line {}: `requires.` needs a step name", idx + 1));
                continue;
            }
            hints
                .requires
                .insert(step.to_string(), normalize_tags(split_list(value)));
        } else {
            hints.extra.insert(key, value.to_string());
        }
    }

    let known: BTreeSet<&str> = if hints.steps.is_empty() {
        DEFAULT_STEPS.iter().map(|(name, _)| *name).collect()
    } else {
        hints.steps.iter().map(String::as_str).collect()
    };
    for step in hints.requires.keys() {
        if !known.contains(step.as_str()) {
            errors.push(format!("requires.{step} names an undeclared step"));
        }
    }

    if errors.is_empty() {
        Ok(hints)
    } else {
        Err(errors)
    }
}

/// Resolve the ordered steps to route for a packet.
pub fn declared_steps(hints: Option<&RoutingHints>) -> Vec<StepSpec> {
    let names: Vec<String> = match hints {
        Some(h) if !h.steps.is_empty() => h.steps.clone(),
        _ => DEFAULT_STEPS
            .iter()
            .map(|(name, _)| (*name).to_string())
            .collect(),
    };
    names
        .into_iter()
        .map(|name| {
            let declared = hints.and_then(|h| h.requires.get(&name)).cloned();
            let required_tags = declared.unwrap_or_else(|| default_tags(&name));
            StepSpec {
                name,
                required_tags: normalize_tags(required_tags),
            }
        })
        .collect()
}

fn default_tags(step: &str) -> Vec<String> {
    DEFAULT_STEPS
        .iter()
        .find(|(name, _)| *name == step)
        .map(|(_, tags)| tags.iter().map(|t| (*t).to_string()).collect())
        .unwrap_or_default()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim().trim_matches('`').to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

/// Lowercase, sort and dedupe capability tags.
pub fn normalize_tags(tags: impl IntoIterator<Item = String>) -> Vec<String> {
    let set: BTreeSet<String> = tags
        .into_iter()
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    set.into_iter().collect()
}
