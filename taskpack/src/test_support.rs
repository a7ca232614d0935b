//! Test-only helpers: packet documents, availability fixtures, scripted
//! command execution and throwaway git repositories.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::core::availability::{
    AvailabilityConfig, ContextSize, CostTier, ModelSpec, RoutePolicy, RunnerSpec,
};
use crate::core::hints::{DEFAULT_STEPS, StepSpec, normalize_tags};
use crate::core::packet::{
    COMMIT_PLAN, DEFINITION_OF_DONE, GOAL, NON_NEGOTIABLES, REQUIRED_CHANGES, SCOPE, SOURCES,
    VERIFICATION_COMMANDS,
};
use crate::io::exec::{CommandExec, CommandOutput, CommandSpec, SystemExec, run_checked};
use crate::io::runner::{RunnerAdapter, RunnerInvocation, RunnerResult};

const PACKET_HEADER: &str = "# TASK_PACKET TP_0001 — Add parser";

fn default_sections() -> Vec<(String, String)> {
    [
        (GOAL, "Add a parser for the settings format.\n".to_string()),
        (SCOPE, "- `src/a.py`\n".to_string()),
        (
            NON_NEGOTIABLES,
            "- Do not touch files outside the allowlist.\n".to_string(),
        ),
        (
            REQUIRED_CHANGES,
            "- Implement `parse` in the parser module.\n".to_string(),
        ),
        (VERIFICATION_COMMANDS, "```bash\npytest -q\n```\n".to_string()),
        (DEFINITION_OF_DONE, "- Tests pass.\n".to_string()),
        (SOURCES, "- `docs/design.md`\n".to_string()),
    ]
    .into_iter()
    .map(|(name, body)| (name.to_string(), body))
    .collect()
}

fn render_doc(sections: &[(String, String)]) -> String {
    let mut doc = format!("{PACKET_HEADER}\n");
    for (name, body) in sections {
        doc.push_str(&format!("\n## {name}\n{body}"));
    }
    doc
}

/// A valid `TP_0001` packet with allowlist `src/a.py` and one verification
/// command (`pytest -q`).
pub fn packet_doc() -> String {
    render_doc(&default_sections())
}

/// [`packet_doc`] with one section body replaced, or appended when the
/// section is not part of the default document.
pub fn packet_doc_with(section: &str, body: &str) -> String {
    let mut sections = default_sections();
    match sections.iter_mut().find(|(name, _)| *name == section) {
        Some(entry) => entry.1 = body.to_string(),
        None => sections.push((section.to_string(), body.to_string())),
    }
    render_doc(&sections)
}

/// A packet with the given allowlist, verification commands and commit plan
/// JSON (the value of the fenced block).
pub fn packet_doc_for(allowlist: &[&str], verify: &[&str], commit_plan: Option<&str>) -> String {
    let mut sections = default_sections();
    for (name, body) in &mut sections {
        if *name == SCOPE {
            *body = allowlist.iter().map(|p| format!("- `{p}`\n")).collect();
        } else if *name == VERIFICATION_COMMANDS {
            *body = format!("```bash\n{}\n```\n", verify.join("\n"));
        }
    }
    if let Some(plan) = commit_plan {
        sections.push((COMMIT_PLAN.to_string(), format!("```json\n{plan}\n```\n")));
    }
    render_doc(&sections)
}

/// Build an availability config from compact tuples.
///
/// `runners`: `(name, available, strengths)`; `models`: `(name, cost tier,
/// strengths)`. Runners launch `true`.
pub fn availability(
    runners: &[(&str, bool, &[&str])],
    models: &[(&str, &str, &[&str])],
    ladder: &[&str],
) -> AvailabilityConfig {
    let runners = runners
        .iter()
        .map(|(name, available, strengths)| {
            (
                (*name).to_string(),
                RunnerSpec {
                    available: *available,
                    strengths: owned(strengths),
                    command: vec!["true".to_string()],
                },
            )
        })
        .collect();
    let models = models
        .iter()
        .map(|(name, cost, strengths)| {
            (
                (*name).to_string(),
                ModelSpec {
                    strengths: owned(strengths),
                    cost_tier: cost.parse::<CostTier>().expect("cost tier"),
                    context: ContextSize::Medium,
                },
            )
        })
        .collect();
    AvailabilityConfig {
        models,
        runners,
        policy: RoutePolicy {
            escalation_ladder: owned(ladder),
            ..RoutePolicy::default()
        },
    }
}

/// One runner (`claude_code`) and one model (`sonnet`, medium) that both
/// hold every default step tag. Each default step scores 60.
pub fn single_pair_availability() -> AvailabilityConfig {
    let tags: Vec<&str> = DEFAULT_STEPS
        .iter()
        .flat_map(|(_, tags)| tags.iter().copied())
        .collect();
    availability(
        &[("claude_code", true, tags.as_slice())],
        &[("sonnet", "medium", tags.as_slice())],
        &["sonnet"],
    )
}

/// Serialize an availability config to TOML at `path`.
pub fn write_availability(path: &Path, config: &AvailabilityConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, toml::to_string(config)?)?;
    Ok(())
}

pub fn step(name: &str, tags: &[&str]) -> StepSpec {
    StepSpec {
        name: name.to_string(),
        required_tags: normalize_tags(owned(tags)),
    }
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

/// [`CommandExec`] that records calls and replays canned responses keyed by
/// [`CommandSpec::display`]. Queued responses are consumed in order; the last
/// one repeats. Unscripted commands succeed with empty output.
#[derive(Default)]
pub struct ScriptedExec {
    responses: RefCell<BTreeMap<String, VecDeque<CommandOutput>>>,
    calls: RefCell<Vec<CommandSpec>>,
}

impl ScriptedExec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, command: &str, code: i32, stdout: &str) {
        self.respond_output(
            command,
            CommandOutput {
                code: Some(code),
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        );
    }

    pub fn respond_output(&self, command: &str, output: CommandOutput) {
        self.responses
            .borrow_mut()
            .entry(command.to_string())
            .or_default()
            .push_back(output);
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.borrow().clone()
    }

    /// Display strings of every recorded call, in order.
    pub fn commands(&self) -> Vec<String> {
        self.calls.borrow().iter().map(CommandSpec::display).collect()
    }
}

impl CommandExec for ScriptedExec {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.calls.borrow_mut().push(spec.clone());
        let mut responses = self.responses.borrow_mut();
        let Some(queue) = responses.get_mut(&spec.display()) else {
            return Ok(CommandOutput {
                code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            });
        };
        let output = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        Ok(output.unwrap_or(CommandOutput {
            code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        }))
    }
}

/// [`RunnerAdapter`] that records invocations and returns a fixed result.
pub struct ScriptedRunner {
    result: RunnerResult,
    invocations: RefCell<Vec<RunnerInvocation>>,
}

impl ScriptedRunner {
    pub fn exiting(code: i32, stdout: &str) -> Self {
        Self {
            result: RunnerResult {
                exit_code: Some(code),
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
            invocations: RefCell::new(Vec::new()),
        }
    }

    pub fn invocations(&self) -> Vec<RunnerInvocation> {
        self.invocations.borrow().clone()
    }
}

impl RunnerAdapter for ScriptedRunner {
    fn invoke(&self, request: &RunnerInvocation) -> Result<RunnerResult> {
        self.invocations.borrow_mut().push(request.clone());
        Ok(self.result.clone())
    }
}

/// A real git repository on branch `main` with a bare `origin`, both inside
/// a temporary directory that is removed on drop.
pub struct TestRepo {
    temp: TempDir,
    root: PathBuf,
    origin: PathBuf,
}

impl TestRepo {
    /// Initialize the repository with one pushed commit (`README.md`).
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let root = temp.path().join("repo");
        let origin = temp.path().join("origin.git");
        fs::create_dir_all(&root)?;
        git_in(temp.path(), &["init", "--bare", "--quiet", "-b", "main", "origin.git"])?;
        git_in(&root, &["init", "--quiet", "-b", "main"])?;
        configure_identity(&root)?;
        git_in(&root, &["remote", "add", "origin", &origin.to_string_lossy()])?;
        let repo = Self { temp, root, origin };
        repo.write("README.md", "# fixture\n")?;
        repo.commit_all("initial")?;
        repo.git(&["push", "--quiet", "-u", "origin", "main"])?;
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn origin(&self) -> &Path {
        &self.origin
    }

    /// Write `contents` to `rel` under the repository root, creating parents.
    pub fn write(&self, rel: &str, contents: &str) -> Result<PathBuf> {
        write_file(&self.root, rel, contents)
    }

    /// Run git in the repository root and return stdout.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        git_in(&self.root, args)
    }

    /// Stage everything and commit; returns the new HEAD SHA.
    pub fn commit_all(&self, message: &str) -> Result<String> {
        self.git(&["add", "-A"])?;
        self.git(&["commit", "--quiet", "-m", message])?;
        self.head()
    }

    pub fn head(&self) -> Result<String> {
        Ok(self.git(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Advance `origin/<branch>` from a separate clone, as another
    /// contributor would.
    pub fn push_from_other_clone(
        &self,
        branch: &str,
        rel: &str,
        contents: &str,
        message: &str,
    ) -> Result<String> {
        let other = self.temp.path().join("other");
        if !other.exists() {
            git_in(
                self.temp.path(),
                &["clone", "--quiet", &self.origin.to_string_lossy(), "other"],
            )?;
            configure_identity(&other)?;
        }
        git_in(&other, &["fetch", "--quiet", "origin"])?;
        git_in(&other, &["checkout", "--quiet", "-B", branch, &format!("origin/{branch}")])?;
        write_file(&other, rel, contents)?;
        git_in(&other, &["add", "-A"])?;
        git_in(&other, &["commit", "--quiet", "-m", message])?;
        git_in(&other, &["push", "--quiet", "origin", branch])?;
        Ok(git_in(&other, &["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// SHA of `branch` on the bare origin.
    pub fn origin_head(&self, branch: &str) -> Result<String> {
        Ok(git_in(&self.origin, &["rev-parse", branch])?.trim().to_string())
    }
}

fn configure_identity(dir: &Path) -> Result<()> {
    git_in(dir, &["config", "user.email", "fixture@example.com"])?;
    git_in(dir, &["config", "user.name", "Fixture"])?;
    git_in(dir, &["config", "commit.gpgsign", "false"])?;
    Ok(())
}

fn write_file(base: &Path, rel: &str, contents: &str) -> Result<PathBuf> {
    let path = base.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

fn git_in(dir: &Path, args: &[&str]) -> Result<String> {
    let spec = CommandSpec::new("git", dir).args(args.iter().copied());
    Ok(run_checked(&SystemExec, &spec)?.stdout)
}
