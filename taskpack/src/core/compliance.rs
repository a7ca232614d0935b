//! Allowlist compliance gate and promotion decision.

use serde::{Deserialize, Serialize};

use crate::core::allowlist::Allowlist;

/// Heading under which verification output must appear in `EVIDENCE.md`.
pub const EVIDENCE_HEADING: &str = "## Command outputs pasted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    AllowlistViolation,
    MissingVerificationEvidence,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub message: String,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violations {
    pub count: usize,
    pub items: Vec<Violation>,
}

/// Contents of `ALLOWLIST_DIFF.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowlistDiff {
    pub packet_id: String,
    pub allowlist: Vec<String>,
    pub allowed_files: Vec<String>,
    pub disallowed_files: Vec<String>,
    pub violations: Violations,
    pub timestamp: String,
}

/// Classify changed files against the packet allowlist and check evidence.
pub fn evaluate_allowlist(
    packet_id: &str,
    allowlist: &Allowlist,
    changed: &[String],
    evidence: Option<&str>,
    timestamp: &str,
) -> AllowlistDiff {
    let (allowed_files, disallowed_files) = allowlist.partition(changed.iter().map(String::as_str));
    let mut items = Vec::new();
    if !disallowed_files.is_empty() {
        items.push(Violation {
            kind: ViolationKind::AllowlistViolation,
            message: format!(
                "{} file(s) changed outside the allowlist",
                disallowed_files.len()
            ),
            files: disallowed_files.clone(),
        });
    }
    if !evidence.is_some_and(has_verification_evidence) {
        items.push(Violation {
            kind: ViolationKind::MissingVerificationEvidence,
            message: format!("EVIDENCE.md missing or has no content under '{EVIDENCE_HEADING}'"),
            files: Vec::new(),
        });
    }
    AllowlistDiff {
        packet_id: packet_id.to_string(),
        allowlist: allowlist.patterns().to_vec(),
        allowed_files,
        disallowed_files,
        violations: Violations {
            count: items.len(),
            items,
        },
        timestamp: timestamp.to_string(),
    }
}

/// True when the evidence heading is followed by at least one non-blank line
/// before the next `##` heading.
pub fn has_verification_evidence(text: &str) -> bool {
    let mut lines = text.lines().skip_while(|line| line.trim() != EVIDENCE_HEADING);
    if lines.next().is_none() {
        return false;
    }
    lines
        .take_while(|line| !line.starts_with("## "))
        .any(|line| !line.trim().is_empty())
}

/// Reasons a run may not be promoted; empty means promotable.
pub fn promotion_blockers(diff: &AllowlistDiff, evidence: Option<&str>) -> Vec<String> {
    let mut reasons = Vec::new();
    if diff.violations.count > 0 {
        reasons.push(format!(
            "allowlist gate has {} violation(s)",
            diff.violations.count
        ));
    }
    if !diff.disallowed_files.is_empty() {
        reasons.push(format!(
            "{} disallowed file change(s)",
            diff.disallowed_files.len()
        ));
    }
    if !evidence.is_some_and(has_verification_evidence) {
        reasons.push("verification evidence missing in EVIDENCE.md".to_string());
    }
    reasons
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowlist(patterns: &[&str]) -> Allowlist {
        let owned: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        Allowlist::new(&owned).expect("allowlist")
    }

    const EVIDENCE: &str = "# EVIDENCE\n\n## Command outputs pasted\n\n### `pytest`\n- exit: 0\n";

    #[test]
    fn clean_run_has_no_violations() {
        let diff = evaluate_allowlist(
            "TP_0001",
            &allowlist(&["src/a.py"]),
            &["src/a.py".to_string()],
            Some(EVIDENCE),
            "t",
        );
        assert_eq!(diff.violations.count, 0);
        assert_eq!(diff.allowed_files, vec!["src/a.py"]);
        assert!(promotion_blockers(&diff, Some(EVIDENCE)).is_empty());
    }

    #[test]
    fn outside_changes_and_missing_evidence_are_both_reported() {
        let diff = evaluate_allowlist(
            "TP_0001",
            &allowlist(&["src/a.py"]),
            &["src/a.py".to_string(), "README.md".to_string()],
            None,
            "t",
        );
        assert_eq!(diff.violations.count, 2);
        assert_eq!(diff.disallowed_files, vec!["README.md"]);
        assert_eq!(promotion_blockers(&diff, None).len(), 3);
    }

    #[test]
    fn empty_evidence_section_does_not_count() {
        assert!(!has_verification_evidence(
            "## Command outputs pasted\n\n## Next\ntext\n"
        ));
        assert!(!has_verification_evidence("# EVIDENCE\nnothing\n"));
        assert!(has_verification_evidence(EVIDENCE));
    }
}
