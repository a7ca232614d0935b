//! Orchestration for `taskpack kernel`: one deterministic kernel invocation.
//!
//! Validate the packet, plan, then either invoke exactly one runner (`auto`)
//! or emit a handoff (`manual`). Every terminal outcome writes its artifact
//! set and `ARTIFACT_INDEX.json` before the exit code is reported. There is
//! no retry and no fallback to another candidate.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::core::planner::{PlanStatus, RoutePlan, build_route_plan};
use crate::core::state::{KernelState, StateTrace};
use crate::core::types::{ExecutionMode, Refusal, RefusalCode};
use crate::exit_codes;
use crate::io::artifacts::ArtifactWriter;
use crate::io::config::KernelConfig;
use crate::io::packet_store::load_packet;
use crate::io::render::Renderer;
use crate::io::run_dir::{
    ERROR_REPORT, HANDOFF, REFUSAL_REPORT, ROUTE_PLAN_JSON, ROUTE_PLAN_MD, RUN_REPORT,
    RUNNER_PROMPT, RUNNER_STDERR, RUNNER_STDOUT,
};
use crate::io::runner::{RunnerAdapter, RunnerInvocation};
use crate::route::{KERNEL_VERSION, PlanInputs, RefusalReport, load_inputs, plan_refusal, run_dir_for};

/// Inputs for one kernel invocation.
#[derive(Debug, Clone)]
pub struct KernelRequest {
    pub packet_path: PathBuf,
    pub availability_path: PathBuf,
    /// Explicit run directory; defaults to `<runs_dir>/<TP_id>/<hash prefix>`.
    pub run_dir: Option<PathBuf>,
    /// Overrides the packet's `mode` routing hint.
    pub mode: Option<ExecutionMode>,
}

/// Terminal outcome of the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelOutcome {
    Executed,
    ExecutionFailed { exit_code: Option<i32> },
    HandoffEmitted,
    Refused(Refusal),
}

impl KernelOutcome {
    /// Exit code fixed by outcome, not by path.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Executed | Self::HandoffEmitted => exit_codes::OK,
            Self::ExecutionFailed { .. } => exit_codes::ERROR,
            Self::Refused(_) => exit_codes::REFUSED,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Executed => "executed",
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::HandoffEmitted => "handoff_emitted",
            Self::Refused(_) => "refused",
        }
    }
}

/// Result of a kernel invocation whose artifacts were written.
#[derive(Debug, Clone)]
pub struct KernelReport {
    pub outcome: KernelOutcome,
    pub run_dir: PathBuf,
    pub states: Vec<KernelState>,
}

/// Contents of `RUN_REPORT.json`.
#[derive(Debug, Clone, Serialize)]
struct RunReport<'a> {
    kernel_version: &'a str,
    packet_id: &'a str,
    packet_sha256: &'a str,
    mode: ExecutionMode,
    outcome: &'a str,
    step: Option<&'a str>,
    runner: Option<&'a str>,
    model: Option<&'a str>,
    runner_exit_code: Option<i32>,
    states: &'a [KernelState],
    timestamp: String,
}

/// Contents of `ERROR_REPORT.json`, written best effort.
#[derive(Debug, Clone, Serialize)]
struct ErrorReport {
    kernel_version: String,
    state: KernelState,
    states: Vec<KernelState>,
    error: String,
}

/// Execute one kernel invocation end to end.
///
/// Refusals and runner failures are reported in [`KernelReport`]. Unexpected
/// failures return `Err` after a best-effort `ERROR_REPORT.json` and index.
#[instrument(skip_all, fields(packet = %request.packet_path.display()))]
pub fn run_kernel(
    root: &Path,
    config: &KernelConfig,
    request: &KernelRequest,
    runner: &dyn RunnerAdapter,
) -> Result<KernelReport> {
    let mut trace = StateTrace::default();
    advance(&mut trace, KernelState::Validating)?;

    // Hash the document first so even a malformed packet has a run directory.
    let loaded = load_packet(&request.packet_path)?;
    let packet_id = loaded.parsed.as_ref().ok().map(|p| p.id.clone());
    let run_dir = run_dir_for(
        root,
        config,
        packet_id.as_deref(),
        &loaded.sha256,
        request.run_dir.as_deref(),
    );
    let mut writer = ArtifactWriter::create(&run_dir)?;

    let mut kernel = Kernel {
        root,
        config,
        request,
        runner,
        trace,
        writer: &mut writer,
    };
    match kernel.drive() {
        Ok(outcome) => {
            let states = kernel.trace.history().to_vec();
            info!(outcome = outcome.label(), dir = %run_dir.display(), "kernel finished");
            Ok(KernelReport {
                outcome,
                run_dir,
                states,
            })
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "kernel failed");
            let report = ErrorReport {
                kernel_version: KERNEL_VERSION.to_string(),
                state: kernel.trace.current(),
                states: kernel.trace.history().to_vec(),
                error: format!("{err:#}"),
            };
            if let Err(write_err) = kernel.writer.write_json(ERROR_REPORT, &report) {
                warn!(error = %write_err, "could not write error report");
            }
            if let Err(index_err) = kernel.writer.write_index() {
                warn!(error = %index_err, "could not write artifact index");
            }
            Err(err)
        }
    }
}

struct Kernel<'a, 'w> {
    root: &'a Path,
    config: &'a KernelConfig,
    request: &'a KernelRequest,
    runner: &'a dyn RunnerAdapter,
    trace: StateTrace,
    writer: &'w mut ArtifactWriter,
}

impl Kernel<'_, '_> {
    fn drive(&mut self) -> Result<KernelOutcome> {
        let inputs = match load_inputs(&self.request.packet_path, &self.request.availability_path)? {
            Ok(inputs) => inputs,
            Err(refused) => {
                // A broken availability file is discovered while planning.
                if refused.defects.is_empty() {
                    advance(&mut self.trace, KernelState::Planning)?;
                }
                advance(&mut self.trace, KernelState::Refused)?;
                let report = RefusalReport {
                    kernel_version: KERNEL_VERSION.to_string(),
                    packet_id: refused.packet_id,
                    packet_sha256: refused.packet_sha256,
                    refusal: refused.refusal.clone(),
                    defects: refused.defects,
                    step_refusals: Vec::new(),
                    states: self.trace.history().to_vec(),
                };
                self.writer.write_json(REFUSAL_REPORT, &report)?;
                return self.finish(KernelOutcome::Refused(refused.refusal));
            }
        };

        advance(&mut self.trace, KernelState::Planning)?;
        let plan = build_route_plan(
            &inputs.packet,
            &inputs.packet_sha256,
            &inputs.availability,
            KERNEL_VERSION,
        );
        let renderer = Renderer::new();
        self.writer.write_json(ROUTE_PLAN_JSON, &plan)?;
        self.writer
            .write_text(ROUTE_PLAN_MD, &renderer.route_plan(&plan)?)?;

        if plan.status == PlanStatus::Refused {
            advance(&mut self.trace, KernelState::Refused)?;
            let refusal = plan_refusal(&plan);
            self.write_refusal(&plan, &refusal)?;
            return self.finish(KernelOutcome::Refused(refusal));
        }
        advance(&mut self.trace, KernelState::Planned)?;

        let mode = self
            .request
            .mode
            .or_else(|| inputs.packet.routing_hints.as_ref().and_then(|h| h.mode))
            .unwrap_or_default();
        info!(mode = mode.as_str(), "plan accepted");
        match mode {
            ExecutionMode::Manual => {
                self.writer
                    .write_text(HANDOFF, &renderer.handoff(&plan, &inputs.packet)?)?;
                advance(&mut self.trace, KernelState::HandoffEmitted)?;
                let outcome = KernelOutcome::HandoffEmitted;
                self.write_run_report(&inputs, &plan, mode, &outcome, None)?;
                self.finish(outcome)
            }
            ExecutionMode::Auto => self.execute(&inputs, &plan, &renderer),
        }
    }

    /// Invoke the runner for the first planned step, exactly once.
    fn execute(
        &mut self,
        inputs: &PlanInputs,
        plan: &RoutePlan,
        renderer: &Renderer,
    ) -> Result<KernelOutcome> {
        let step = plan
            .first_planned()
            .ok_or_else(|| anyhow!("planned route has no planned step"))?;
        let selected = step
            .selected
            .as_ref()
            .ok_or_else(|| anyhow!("planned step {} has no selection", step.step))?;
        let runner_spec = inputs
            .availability
            .runners
            .get(&selected.runner)
            .ok_or_else(|| anyhow!("selected runner {} is not declared", selected.runner))?;

        if runner_spec.command.is_empty() {
            advance(&mut self.trace, KernelState::Refused)?;
            let refusal = Refusal::new(
                RefusalCode::RunnerNotConfigured,
                format!(
                    "runner {} was selected for step {} but declares no command",
                    selected.runner, step.step
                ),
                format!(
                    "add `command = [...]` to [runners.{}] or run in manual mode",
                    selected.runner
                ),
            );
            self.write_refusal(plan, &refusal)?;
            return self.finish(KernelOutcome::Refused(refusal));
        }

        let prompt = renderer.runner_prompt(&inputs.packet, &step.step)?;
        self.writer.write_text(RUNNER_PROMPT, &prompt)?;
        advance(&mut self.trace, KernelState::Executing)?;

        let invocation = RunnerInvocation {
            runner: selected.runner.clone(),
            model: selected.model.clone(),
            step: step.step.clone(),
            command: runner_spec.command.clone(),
            workdir: self.root.to_path_buf(),
            prompt_path: self.writer.path_of(RUNNER_PROMPT),
            output_limit_bytes: self.config.runner_output_limit_bytes,
        };
        let result = self
            .runner
            .invoke(&invocation)
            .with_context(|| format!("invoke runner {}", selected.runner))?;
        self.writer.write_text(RUNNER_STDOUT, &result.stdout)?;
        self.writer.write_text(RUNNER_STDERR, &result.stderr)?;

        let outcome = if result.success() {
            advance(&mut self.trace, KernelState::Executed)?;
            KernelOutcome::Executed
        } else {
            warn!(exit_code = ?result.exit_code, "runner failed");
            advance(&mut self.trace, KernelState::ExecutionFailed)?;
            KernelOutcome::ExecutionFailed {
                exit_code: result.exit_code,
            }
        };
        self.write_run_report(inputs, plan, ExecutionMode::Auto, &outcome, result.exit_code)?;
        self.finish(outcome)
    }

    fn write_refusal(&mut self, plan: &RoutePlan, refusal: &Refusal) -> Result<()> {
        let report = RefusalReport {
            kernel_version: KERNEL_VERSION.to_string(),
            packet_id: Some(plan.packet_id.clone()),
            packet_sha256: plan.packet_sha256.clone(),
            refusal: refusal.clone(),
            defects: Vec::new(),
            step_refusals: plan.refusal_reasons.clone(),
            states: self.trace.history().to_vec(),
        };
        self.writer.write_json(REFUSAL_REPORT, &report)?;
        Ok(())
    }

    fn write_run_report(
        &mut self,
        inputs: &PlanInputs,
        plan: &RoutePlan,
        mode: ExecutionMode,
        outcome: &KernelOutcome,
        runner_exit_code: Option<i32>,
    ) -> Result<()> {
        let executed = match mode {
            ExecutionMode::Auto => plan.first_planned(),
            ExecutionMode::Manual => None,
        };
        let report = RunReport {
            kernel_version: KERNEL_VERSION,
            packet_id: &inputs.packet.id,
            packet_sha256: &inputs.packet_sha256,
            mode,
            outcome: outcome.label(),
            step: executed.map(|s| s.step.as_str()),
            runner: executed.and_then(|s| s.runner()),
            model: executed.and_then(|s| s.model()),
            runner_exit_code,
            states: self.trace.history(),
            timestamp: self.config.timestamp_mode.now(),
        };
        self.writer.write_json(RUN_REPORT, &report)?;
        Ok(())
    }

    /// Close the artifact set: index, then `ArtifactsWritten -> Exit`.
    fn finish(&mut self, outcome: KernelOutcome) -> Result<KernelOutcome> {
        self.writer.write_index()?;
        advance(&mut self.trace, KernelState::ArtifactsWritten)?;
        advance(&mut self.trace, KernelState::Exit)?;
        Ok(outcome)
    }
}

fn advance(trace: &mut StateTrace, to: KernelState) -> Result<()> {
    trace.advance(to).context("kernel state machine")
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::core::packet::{ROUTING_HINTS, SCOPE};
    use crate::io::artifacts::{ARTIFACT_INDEX, ArtifactIndex, read_json};
    use crate::test_support::{
        ScriptedRunner, packet_doc, packet_doc_with, single_pair_availability, write_availability,
    };

    struct Fixture {
        temp: tempfile::TempDir,
        request: KernelRequest,
    }

    fn fixture(doc: &str, mode: Option<ExecutionMode>) -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let packet_path = temp.path().join("TP_0001.md");
        fs::write(&packet_path, doc).expect("write packet");
        let availability_path = temp.path().join("availability.toml");
        write_availability(&availability_path, &single_pair_availability()).expect("availability");
        let request = KernelRequest {
            packet_path,
            availability_path,
            run_dir: Some(PathBuf::from("run")),
            mode,
        };
        Fixture { temp, request }
    }

    fn index(dir: &Path) -> ArtifactIndex {
        read_json(&dir.join(ARTIFACT_INDEX))
            .expect("read index")
            .expect("index present")
    }

    #[test]
    fn manual_mode_emits_handoff_without_invoking_runner() {
        let fx = fixture(&packet_doc(), None);
        let runner = ScriptedRunner::exiting(0, "");
        let report =
            run_kernel(fx.temp.path(), &KernelConfig::default(), &fx.request, &runner).expect("run");
        assert_eq!(report.outcome, KernelOutcome::HandoffEmitted);
        assert_eq!(report.outcome.exit_code(), exit_codes::OK);
        assert!(runner.invocations().is_empty());
        let names: Vec<String> = index(&report.run_dir).artifacts.into_keys().collect();
        assert_eq!(
            names,
            vec![HANDOFF, ROUTE_PLAN_JSON, ROUTE_PLAN_MD, RUN_REPORT]
        );
        assert_eq!(report.states.last(), Some(&KernelState::Exit));
    }

    #[test]
    fn auto_mode_invokes_exactly_one_runner_for_first_step() {
        let fx = fixture(&packet_doc(), Some(ExecutionMode::Auto));
        let runner = ScriptedRunner::exiting(0, "ok");
        let report =
            run_kernel(fx.temp.path(), &KernelConfig::default(), &fx.request, &runner).expect("run");
        assert_eq!(report.outcome, KernelOutcome::Executed);
        let calls = runner.invocations();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].step, "compile-tasks");
        assert_eq!(calls[0].runner, "claude_code");
        assert!(calls[0].prompt_path.exists());
        assert_eq!(
            fs::read_to_string(report.run_dir.join(RUNNER_STDOUT)).expect("stdout"),
            "ok"
        );
        assert!(
            report
                .states
                .windows(2)
                .any(|w| w == [KernelState::Executing, KernelState::Executed])
        );
    }

    #[test]
    fn failing_runner_is_not_retried_and_exits_one() {
        let fx = fixture(&packet_doc(), Some(ExecutionMode::Auto));
        let runner = ScriptedRunner::exiting(7, "");
        let report =
            run_kernel(fx.temp.path(), &KernelConfig::default(), &fx.request, &runner).expect("run");
        assert_eq!(
            report.outcome,
            KernelOutcome::ExecutionFailed { exit_code: Some(7) }
        );
        assert_eq!(report.outcome.exit_code(), exit_codes::ERROR);
        assert_eq!(runner.invocations().len(), 1);
        let run: serde_json::Value = read_json(&report.run_dir.join(RUN_REPORT))
            .expect("read")
            .expect("report");
        assert_eq!(run["outcome"], "execution_failed");
        assert_eq!(run["runner_exit_code"], 7);
    }

    #[test]
    fn routing_hint_selects_auto_mode() {
        let doc = packet_doc_with(ROUTING_HINTS, "- mode: auto\n- steps: run-task\n");
        let fx = fixture(&doc, None);
        let runner = ScriptedRunner::exiting(0, "");
        let report =
            run_kernel(fx.temp.path(), &KernelConfig::default(), &fx.request, &runner).expect("run");
        assert_eq!(report.outcome, KernelOutcome::Executed);
        assert_eq!(runner.invocations()[0].step, "run-task");
    }

    #[test]
    fn invalid_packet_refuses_with_exit_two_and_report() {
        let fx = fixture(&packet_doc_with(SCOPE, "\n"), Some(ExecutionMode::Auto));
        let runner = ScriptedRunner::exiting(0, "");
        let report =
            run_kernel(fx.temp.path(), &KernelConfig::default(), &fx.request, &runner).expect("run");
        let KernelOutcome::Refused(refusal) = &report.outcome else {
            panic!("expected refusal");
        };
        assert_eq!(refusal.code, RefusalCode::PacketFormat);
        assert_eq!(report.outcome.exit_code(), exit_codes::REFUSED);
        assert!(runner.invocations().is_empty());
        let names: Vec<String> = index(&report.run_dir).artifacts.into_keys().collect();
        assert_eq!(names, vec![REFUSAL_REPORT]);
        assert_eq!(
            report.states,
            vec![
                KernelState::Init,
                KernelState::Validating,
                KernelState::Refused,
                KernelState::ArtifactsWritten,
                KernelState::Exit
            ]
        );
    }

    #[test]
    fn runner_without_command_is_refused_not_skipped() {
        let fx = fixture(&packet_doc(), Some(ExecutionMode::Auto));
        let mut config = single_pair_availability();
        if let Some(runner) = config.runners.get_mut("claude_code") {
            runner.command.clear();
        }
        write_availability(&fx.request.availability_path, &config).expect("availability");
        let runner = ScriptedRunner::exiting(0, "");
        let report =
            run_kernel(fx.temp.path(), &KernelConfig::default(), &fx.request, &runner).expect("run");
        let KernelOutcome::Refused(refusal) = &report.outcome else {
            panic!("expected refusal");
        };
        assert_eq!(refusal.code, RefusalCode::RunnerNotConfigured);
        assert!(runner.invocations().is_empty());
    }

    #[test]
    fn identical_inputs_produce_identical_plan_bytes() {
        let fx = fixture(&packet_doc(), None);
        let runner = ScriptedRunner::exiting(0, "");
        let first =
            run_kernel(fx.temp.path(), &KernelConfig::default(), &fx.request, &runner).expect("first");
        let first_bytes = fs::read(first.run_dir.join(ROUTE_PLAN_JSON)).expect("read first");
        let mut second_request = fx.request.clone();
        second_request.run_dir = Some(PathBuf::from("run2"));
        let second = run_kernel(
            fx.temp.path(),
            &KernelConfig::default(),
            &second_request,
            &runner,
        )
        .expect("second");
        let second_bytes = fs::read(second.run_dir.join(ROUTE_PLAN_JSON)).expect("read second");
        assert_eq!(first_bytes, second_bytes);
        assert_eq!(
            index(&first.run_dir).artifacts,
            index(&second.run_dir).artifacts
        );
    }

    struct BrokenRunner;

    impl RunnerAdapter for BrokenRunner {
        fn invoke(&self, _request: &RunnerInvocation) -> Result<crate::io::runner::RunnerResult> {
            Err(anyhow!("runner binary vanished"))
        }
    }

    #[test]
    fn unexpected_failure_still_indexes_error_report() {
        let fx = fixture(&packet_doc(), Some(ExecutionMode::Auto));
        let err = run_kernel(
            fx.temp.path(),
            &KernelConfig::default(),
            &fx.request,
            &BrokenRunner,
        )
        .expect_err("runner failure is unexpected");
        assert!(format!("{err:#}").contains("runner binary vanished"));
        let run_dir = fx.temp.path().join("run");
        let report = fs::read_to_string(run_dir.join(ERROR_REPORT)).expect("error report");
        assert!(report.contains("runner binary vanished"));
        let names: Vec<String> = index(&run_dir).artifacts.into_keys().collect();
        assert!(names.iter().any(|name| name == ERROR_REPORT), "{names:?}");
        assert!(names.iter().any(|name| name == ROUTE_PLAN_JSON), "{names:?}");
    }
}
