//! Commit plan block embedded in a task packet.
//!
//! The `## COMMIT PLAN` section carries a fenced `json` (or untagged) block of the form
//! `{"commit_plan": [{"step_id", "message", "allowlist", "verify"?}]}`. The
//! block is checked against an embedded JSON Schema (Draft 2020-12) and every
//! violation is reported.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use jsonschema::{Draft, Validator};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::allowlist::validate_pattern;
use crate::core::markdown::fenced_blocks;

const COMMIT_PLAN_SCHEMA: &str = include_str!("../../../schemas/commit_plan/v1.schema.json");

static SCHEMA: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(COMMIT_PLAN_SCHEMA).expect("commit plan schema should be json");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("commit plan schema should compile")
});

/// One planned commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStep {
    pub step_id: String,
    pub message: String,
    pub allowlist: Vec<String>,
    /// Verification commands. Absent means the packet's own commands; an
    /// explicit empty list runs nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct CommitPlanDoc {
    commit_plan: Vec<CommitStep>,
}

/// Parse the section body into ordered steps, or every problem found.
pub fn parse_commit_plan(body: &str) -> Result<Vec<CommitStep>, Vec<String>> {
    let Some(block) = fenced_blocks(body)
        .into_iter()
        .find(|b| matches!(b.lang.as_str(), "json" | ""))
    else {
        return Err(vec!["expected a fenced ```json block".to_string()]);
    };
    let value: Value = serde_json::from_str(&block.body)
        .map_err(|err| vec![format!("commit plan is not valid json: {err}")])?;

    let schema_errors: Vec<String> = SCHEMA
        .iter_errors(&value)
        .map(|err| format!("schema: {err}"))
        .collect();
    if !schema_errors.is_empty() {
        return Err(schema_errors);
    }

    let doc: CommitPlanDoc = serde_json::from_value(value)
        .map_err(|err| vec![format!("commit plan shape: {err}")])?;

    let mut errors = Vec::new();
    let mut seen = BTreeSet::new();
    for step in &doc.commit_plan {
        if !seen.insert(step.step_id.as_str()) {
            errors.push(format!("duplicate step_id '{}'", step.step_id));
        }
        for pattern in &step.allowlist {
            if let Err(err) = validate_pattern(pattern) {
                errors.push(format!("step '{}': {err}", step.step_id));
            }
        }
    }
    if errors.is_empty() {
        Ok(doc.commit_plan)
    } else {
        Err(errors)
    }
}
