//! Task packet parsing and validation.
//!
//! Parsing is a pure function of the document text: no I/O, no clock. A
//! document either yields a [`TaskPacket`] or a [`PacketFormatError`] listing
//! every structural defect found in a single pass.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::allowlist::validate_pattern;
use crate::core::commit_plan::{CommitStep, parse_commit_plan};
use crate::core::hints::{RoutingHints, parse_routing_hints};
use crate::core::markdown::{bullet_items, code_spans, fenced_blocks, is_fence};
use crate::core::types::{Refusal, RefusalCode};

pub const GOAL: &str = "GOAL";
pub const SCOPE: &str = "SCOPE (ALLOWLIST)";
pub const NON_NEGOTIABLES: &str = "NON-NEGOTIABLES";
pub const REQUIRED_CHANGES: &str = "REQUIRED CHANGES";
pub const VERIFICATION_COMMANDS: &str = "VERIFICATION COMMANDS";
pub const DEFINITION_OF_DONE: &str = "DEFINITION OF DONE";
pub const SOURCES: &str = "SOURCES";
pub const ROUTING_HINTS: &str = "ROUTING HINTS";
pub const COMMIT_PLAN: &str = "COMMIT PLAN";

/// Required sections in canonical order.
pub const REQUIRED_SECTIONS: [&str; 7] = [
    GOAL,
    SCOPE,
    NON_NEGOTIABLES,
    REQUIRED_CHANGES,
    VERIFICATION_COMMANDS,
    DEFINITION_OF_DONE,
    SOURCES,
];

static HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#\s+TASK_PACKET\s+(TP_\d{4})\s+[—–-]\s+(\S.*?)\s*$")
        .expect("header regex should compile")
});
static SECTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^##\s+(\S.*?)\s*$").expect("section regex should compile"));

/// Validated, immutable task packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPacket {
    /// `TP_` followed by four digits.
    pub id: String,
    pub title: String,
    pub goal: String,
    /// Ordered, non-empty path patterns.
    pub allowlist: Vec<String>,
    pub non_negotiables: String,
    pub required_changes: String,
    /// Ordered, non-empty.
    pub verification_commands: Vec<String>,
    pub definition_of_done: String,
    pub sources: Vec<String>,
    pub routing_hints: Option<RoutingHints>,
    pub commit_plan: Option<Vec<CommitStep>>,
    /// Sections with unrecognized names, preserved verbatim and never consulted.
    pub extra_sections: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefectKind {
    Header,
    Missing,
    Empty,
    Duplicate,
    Malformed,
}

/// One structural problem with a packet document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketDefect {
    pub section: String,
    pub kind: DefectKind,
    pub message: String,
}

/// Every defect found while validating a packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketFormatError {
    pub defects: Vec<PacketDefect>,
}

impl fmt::Display for PacketFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task packet has {} defect(s):", self.defects.len())?;
        for defect in &self.defects {
            write!(f, "\n- [{}] {}", defect.section, defect.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for PacketFormatError {}

impl PacketFormatError {
    /// Refusal listing every defect, one detail line each.
    pub fn to_refusal(&self) -> Refusal {
        Refusal::new(
            RefusalCode::PacketFormat,
            format!("task packet has {} structural defect(s)", self.defects.len()),
            "fix every listed section of the packet document",
        )
        .with_details(
            self.defects
                .iter()
                .map(|d| format!("[{}] {}", d.section, d.message))
                .collect(),
        )
    }
}

#[derive(Debug)]
struct RawSection {
    body: String,
    line: usize,
}

struct Defects(Vec<PacketDefect>);

impl Defects {
    fn push(&mut self, section: &str, kind: DefectKind, message: impl Into<String>) {
        self.0.push(PacketDefect {
            section: section.to_string(),
            kind,
            message: message.into(),
        });
    }
}

/// Parse and validate a packet document.
pub fn parse_packet(doc: &str) -> Result<TaskPacket, PacketFormatError> {
    let mut defects = Defects(Vec::new());
    let mut header: Option<(String, String)> = None;
    let mut sections: BTreeMap<String, RawSection> = BTreeMap::new();
    let mut current: Option<String> = None;
    let mut saw_first_line = false;
    let mut in_fence = false;

    for (idx, line) in doc.lines().enumerate() {
        let line_no = idx + 1;
        if !saw_first_line {
            if line.trim().is_empty() {
                continue;
            }
            saw_first_line = true;
            if let Some(caps) = HEADER_RE.captures(line.trim_end()) {
                header = Some((caps[1].to_string(), caps[2].to_string()));
                continue;
            }
            defects.push(
                "HEADER",
                DefectKind::Header,
                format!(
                    "line {line_no}: expected `# TASK_PACKET TP_NNNN — <title>`, got '{}'",
                    line.trim()
                ),
            );
        }

        if is_fence(line) {
            in_fence = !in_fence;
        } else if !in_fence && let Some(caps) = SECTION_RE.captures(line) {
            let name = caps[1].to_string();
            if let Some(existing) = sections.get(&name) {
                defects.push(
                    &name,
                    DefectKind::Duplicate,
                    format!(
                        "section '{name}' appears more than once (lines {} and {line_no})",
                        existing.line
                    ),
                );
                // Body of a duplicate is discarded.
                current = None;
            } else {
                sections.insert(
                    name.clone(),
                    RawSection {
                        body: String::new(),
                        line: line_no,
                    },
                );
                current = Some(name);
            }
            continue;
        }

        if let Some(section) = current.as_ref().and_then(|name| sections.get_mut(name)) {
            section.body.push_str(line);
            section.body.push('\n');
        }
    }

    if !saw_first_line {
        defects.push("HEADER", DefectKind::Header, "document is empty");
    }

    let mut text_of = |name: &str| -> Option<String> {
        match sections.get(name) {
            None => {
                defects.push(name, DefectKind::Missing, format!("missing section '## {name}'"));
                None
            }
            Some(section) if section.body.trim().is_empty() => {
                defects.push(name, DefectKind::Empty, format!("section '## {name}' is empty"));
                None
            }
            Some(section) => Some(section.body.trim().to_string()),
        }
    };

    let goal = text_of(GOAL);
    let scope = text_of(SCOPE);
    let non_negotiables = text_of(NON_NEGOTIABLES);
    let required_changes = text_of(REQUIRED_CHANGES);
    let verification = text_of(VERIFICATION_COMMANDS);
    let definition_of_done = text_of(DEFINITION_OF_DONE);
    let sources_text = text_of(SOURCES);

    let allowlist = scope.map(|body| parse_allowlist(&body)).unwrap_or_default();
    if sections.get(SCOPE).is_some_and(|s| !s.body.trim().is_empty()) {
        if allowlist.is_empty() {
            defects.push(SCOPE, DefectKind::Empty, "allowlist has no path entries");
        }
        for pattern in &allowlist {
            if let Err(err) = validate_pattern(pattern) {
                defects.push(SCOPE, DefectKind::Malformed, err);
            }
        }
    }

    let verification_commands = verification
        .as_deref()
        .map(parse_verification_commands)
        .unwrap_or_default();
    if verification.is_some() && verification_commands.is_empty() {
        defects.push(
            VERIFICATION_COMMANDS,
            DefectKind::Empty,
            "verification command list has no commands",
        );
    }

    let sources = sources_text.as_deref().map(parse_sources).unwrap_or_default();

    let routing_hints = match sections.get(ROUTING_HINTS) {
        None => None,
        Some(section) => match parse_routing_hints(&section.body) {
            Ok(hints) => Some(hints),
            Err(errors) => {
                for err in errors {
                    defects.push(ROUTING_HINTS, DefectKind::Malformed, err);
                }
                None
            }
        },
    };

    let commit_plan = match sections.get(COMMIT_PLAN) {
        None => None,
        Some(section) => match parse_commit_plan(&section.body) {
            Ok(steps) => Some(steps),
            Err(errors) => {
                for err in errors {
                    defects.push(COMMIT_PLAN, DefectKind::Malformed, err);
                }
                None
            }
        },
    };

    let known: BTreeSet<&str> = REQUIRED_SECTIONS
        .iter()
        .copied()
        .chain([ROUTING_HINTS, COMMIT_PLAN])
        .collect();
    let extra_sections: BTreeMap<String, String> = sections
        .iter()
        .filter(|(name, _)| !known.contains(name.as_str()))
        .map(|(name, section)| (name.clone(), section.body.trim().to_string()))
        .collect();

    let (
        Some((id, title)),
        Some(goal),
        Some(non_negotiables),
        Some(required_changes),
        Some(definition_of_done),
        true,
    ) = (
        header,
        goal,
        non_negotiables,
        required_changes,
        definition_of_done,
        defects.0.is_empty(),
    )
    else {
        return Err(PacketFormatError { defects: defects.0 });
    };

    Ok(TaskPacket {
        id,
        title,
        goal,
        allowlist,
        non_negotiables,
        required_changes,
        verification_commands,
        definition_of_done,
        sources,
        routing_hints,
        commit_plan,
        extra_sections,
    })
}

fn parse_allowlist(body: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for item in bullet_items(body) {
        let bare = item.trim_matches('`').trim();
        if bare.is_empty()
            || bare.chars().all(|c| c == '-')
            || bare.to_ascii_lowercase().starts_with("only ")
        {
            continue;
        }
        let entry = code_spans(&item)
            .into_iter()
            .next()
            .or_else(|| item.split_whitespace().next().map(str::to_string));
        if let Some(entry) = entry
            && seen.insert(entry.clone())
        {
            out.push(entry);
        }
    }
    out
}

fn parse_verification_commands(body: &str) -> Vec<String> {
    let fenced = fenced_blocks(body)
        .into_iter()
        .find(|block| matches!(block.lang.as_str(), "" | "bash" | "sh" | "shell" | "console"));
    if let Some(block) = fenced {
        return block
            .body
            .lines()
            .map(|line| line.trim().trim_start_matches("$ ").trim())
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect();
    }
    bullet_items(body)
        .into_iter()
        .map(|item| {
            code_spans(&item)
                .into_iter()
                .next()
                .unwrap_or(item)
        })
        .collect()
}

fn parse_sources(body: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    let spans = code_spans(body);
    let candidates: Vec<String> = if spans.is_empty() {
        bullet_items(body)
            .into_iter()
            .filter_map(|item| item.split_whitespace().next().map(str::to_string))
            .filter(|word| word.contains('/'))
            .collect()
    } else {
        spans
    };
    for candidate in candidates {
        if seen.insert(candidate.clone()) {
            out.push(candidate);
        }
    }
    out
}
