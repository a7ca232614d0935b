//! Human-readable artifact rendering.
//!
//! Markdown artifacts are rendered from templates embedded at compile time so
//! the output depends only on the structured input.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::compliance::AllowlistDiff;
use crate::core::packet::TaskPacket;
use crate::core::planner::RoutePlan;

const ROUTE_PLAN_TEMPLATE: &str = include_str!("templates/route_plan.md");
const HANDOFF_TEMPLATE: &str = include_str!("templates/handoff.md");
const RUNNER_PROMPT_TEMPLATE: &str = include_str!("templates/runner_prompt.md");
const EVIDENCE_TEMPLATE: &str = include_str!("templates/evidence.md");
const VIOLATIONS_TEMPLATE: &str = include_str!("templates/violations.md");

/// One verification command and its captured result, for `EVIDENCE.md`.
#[derive(Debug, Clone, Serialize)]
pub struct CommandEvidence {
    pub command: String,
    pub exit: String,
    pub output: String,
}

/// Template engine wrapper around minijinja.
pub struct Renderer {
    env: Environment<'static>,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_template("route_plan", ROUTE_PLAN_TEMPLATE)
            .expect("route_plan template should be valid");
        env.add_template("handoff", HANDOFF_TEMPLATE)
            .expect("handoff template should be valid");
        env.add_template("runner_prompt", RUNNER_PROMPT_TEMPLATE)
            .expect("runner_prompt template should be valid");
        env.add_template("evidence", EVIDENCE_TEMPLATE)
            .expect("evidence template should be valid");
        env.add_template("violations", VIOLATIONS_TEMPLATE)
            .expect("violations template should be valid");
        Self { env }
    }

    pub fn route_plan(&self, plan: &RoutePlan) -> Result<String> {
        let template = self.env.get_template("route_plan")?;
        Ok(template.render(context! { plan => plan })?)
    }

    pub fn handoff(&self, plan: &RoutePlan, packet: &TaskPacket) -> Result<String> {
        let template = self.env.get_template("handoff")?;
        Ok(template.render(context! { plan => plan, packet => packet })?)
    }

    pub fn runner_prompt(&self, packet: &TaskPacket, step: &str) -> Result<String> {
        let template = self.env.get_template("runner_prompt")?;
        Ok(template.render(context! { packet => packet, step => step })?)
    }

    pub fn evidence(
        &self,
        packet: &TaskPacket,
        packet_sha256: &str,
        timestamp: &str,
        commands: &[CommandEvidence],
    ) -> Result<String> {
        let template = self.env.get_template("evidence")?;
        Ok(template.render(context! {
            packet_id => &packet.id,
            title => &packet.title,
            packet_sha256 => packet_sha256,
            timestamp => timestamp,
            commands => commands,
        })?)
    }

    pub fn violations(&self, diff: &AllowlistDiff) -> Result<String> {
        let template = self.env.get_template("violations")?;
        Ok(template.render(context! {
            diff => diff,
            violations => &diff.violations.items,
        })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::compliance::{evaluate_allowlist, has_verification_evidence};
    use crate::core::allowlist::Allowlist;
    use crate::core::packet::parse_packet;
    use crate::core::planner::build_route_plan;
    use crate::test_support::{packet_doc, single_pair_availability};

    fn packet() -> TaskPacket {
        parse_packet(&packet_doc()).expect("packet")
    }

    #[test]
    fn route_plan_lists_every_step() {
        let plan = build_route_plan(&packet(), "abc", &single_pair_availability(), "0.1.0");
        let text = Renderer::new().route_plan(&plan).expect("render");
        assert!(text.starts_with("# ROUTE_PLAN"));
        assert!(text.contains("| run-task | planned | claude_code | sonnet | 60 |"));
        assert!(!text.contains("## Refusals"));
    }

    #[test]
    fn refused_plan_renders_reasons() {
        let mut config = single_pair_availability();
        config.policy.min_total_score = 1_000;
        let plan = build_route_plan(&packet(), "abc", &config, "0.1.0");
        let text = Renderer::new().route_plan(&plan).expect("render");
        assert!(text.contains("## Refusals"));
        assert!(text.contains("run-task: below_threshold"));
    }

    #[test]
    fn handoff_includes_allowlist_and_commands() {
        let plan = build_route_plan(&packet(), "abc", &single_pair_availability(), "0.1.0");
        let text = Renderer::new().handoff(&plan, &packet()).expect("render");
        assert!(text.contains("# HANDOFF"));
        assert!(text.contains("- `src/a.py`"));
        assert!(text.contains("pytest -q"));
    }

    #[test]
    fn rendered_evidence_satisfies_the_gate() {
        let commands = vec![CommandEvidence {
            command: "pytest -q".to_string(),
            exit: "exit 0".to_string(),
            output: "1 passed".to_string(),
        }];
        let text = Renderer::new()
            .evidence(&packet(), "abc", "1970-01-01T00:00:00Z", &commands)
            .expect("render");
        assert!(has_verification_evidence(&text));
    }

    #[test]
    fn violations_render_clean_and_dirty() {
        let list = Allowlist::new(&["src/a.py".to_string()]).expect("allowlist");
        let clean = evaluate_allowlist("TP_0001", &list, &[], Some("## Command outputs pasted\nok\n"), "t");
        let text = Renderer::new().violations(&clean).expect("render");
        assert!(text.contains("No violations."));

        let dirty = evaluate_allowlist("TP_0001", &list, &["x".to_string()], None, "t");
        let text = Renderer::new().violations(&dirty).expect("render");
        assert!(text.contains("## allowlist_violation"));
        assert!(text.contains("- `x`"));
    }
}
