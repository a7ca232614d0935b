//! Assignment of changed files to commit plan steps.

use crate::core::allowlist::Allowlist;
use crate::core::commit_plan::CommitStep;

/// Files one step will stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepStage {
    pub step_id: String,
    pub files: Vec<String>,
}

/// Changed files split across steps, in declared step order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageAssignment {
    pub stages: Vec<StepStage>,
    /// Changed files no step allowlist matches.
    pub outside: Vec<String>,
}

impl StageAssignment {
    /// Ids of steps that would produce an empty commit.
    pub fn empty_steps(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|stage| stage.files.is_empty())
            .map(|stage| stage.step_id.as_str())
            .collect()
    }
}

/// Give each changed file to the first step (declared order) whose allowlist
/// matches it.
pub fn assign_changes(changed: &[String], steps: &[CommitStep]) -> Result<StageAssignment, Vec<String>> {
    let mut allowlists = Vec::with_capacity(steps.len());
    let mut errors = Vec::new();
    for step in steps {
        match Allowlist::new(&step.allowlist) {
            Ok(list) => allowlists.push(list),
            Err(errs) => errors.extend(errs.into_iter().map(|e| format!("step '{}': {e}", step.step_id))),
        }
    }
    if !errors.is_empty() {
        return Err(errors);
    }

    let mut sorted: Vec<&String> = changed.iter().collect();
    sorted.sort();
    sorted.dedup();

    let mut stages: Vec<StepStage> = steps
        .iter()
        .map(|step| StepStage {
            step_id: step.step_id.clone(),
            files: Vec::new(),
        })
        .collect();
    let mut outside = Vec::new();
    for path in sorted {
        match allowlists.iter().position(|list| list.matches(path)) {
            Some(idx) => stages[idx].files.push(path.clone()),
            None => outside.push(path.clone()),
        }
    }
    Ok(StageAssignment { stages, outside })
}
