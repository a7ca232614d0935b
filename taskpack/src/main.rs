//! Deterministic task-packet execution kernel.
//!
//! Validates a task packet, routes its steps to runner/model pairs, then runs
//! one step or emits a handoff. The `run` and `wt` command groups carry the
//! resulting changes through the allowlist gate and onto the base branch.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;

use taskpack::commit_run::commit_run;
use taskpack::commit_sequence::{SequenceRequest, commit_sequence};
use taskpack::core::types::{DirtyPolicy, ExecutionMode, Outcome};
use taskpack::envelope::{collect_evidence, init_run};
use taskpack::exit_codes;
use taskpack::finish::{FinishRequest, REBASE_FF, finish};
use taskpack::gate::{promote, run_gate};
use taskpack::io::availability::write_default_availability;
use taskpack::io::config::{KernelConfig, config_path, load_config, write_config};
use taskpack::io::exec::{SystemExec, resolve};
use taskpack::io::git::Git;
use taskpack::io::packet_store::load_packet;
use taskpack::io::run_dir::RunPaths;
use taskpack::io::runner::CommandRunner;
use taskpack::kernel::{KernelOutcome, KernelRequest, run_kernel};
use taskpack::logging;
use taskpack::route::{explain_route, plan_route, run_dir_for};
use taskpack::worktree::{StartRequest, start};

#[derive(Parser)]
#[command(
    name = "taskpack",
    version,
    about = "Deterministic task-packet execution kernel"
)]
struct Cli {
    /// Repository the command operates on.
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.taskpack/config.toml` and a default availability file if missing.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Task packet documents.
    Packet {
        #[command(subcommand)]
        command: PacketCommand,
    },
    /// Plan routes without executing anything.
    Route {
        #[command(subcommand)]
        command: RouteCommand,
    },
    /// Validate, plan, then run one step (`auto`) or emit a handoff (`manual`).
    Kernel {
        packet: PathBuf,
        /// Overrides the packet's `mode` routing hint.
        #[arg(long)]
        mode: Option<ExecutionMode>,
        #[arg(long)]
        availability: Option<PathBuf>,
        #[arg(long)]
        run_dir: Option<PathBuf>,
    },
    /// Run-directory lifecycle: init, evidence, gate, promote, commit.
    Run {
        #[command(subcommand)]
        command: RunCommand,
    },
    /// Worktree engine: start, commit-sequence, finish.
    Wt {
        #[command(subcommand)]
        command: WtCommand,
    },
}

#[derive(Subcommand)]
enum PacketCommand {
    /// Report every structural defect, or confirm the packet is valid.
    Validate { packet: PathBuf },
}

#[derive(Subcommand)]
enum RouteCommand {
    /// Write ROUTE_PLAN.json, ROUTE_PLAN.md and HANDOFF.md (or REFUSAL_REPORT.json).
    Plan {
        packet: PathBuf,
        #[arg(long)]
        availability: Option<PathBuf>,
        /// Output directory; defaults to the packet's run directory.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Print the score breakdown for one step.
    Explain {
        packet: PathBuf,
        #[arg(long)]
        step: String,
        #[arg(long)]
        availability: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum RunCommand {
    /// Snapshot the packet and write RUN_ENVELOPE.json.
    Init {
        packet: PathBuf,
        #[arg(long)]
        run_dir: Option<PathBuf>,
    },
    /// Run verification commands and write EVIDENCE.md.
    Evidence {
        #[arg(long)]
        run_dir: PathBuf,
    },
    /// Compare changed files with the allowlist.
    Gate {
        #[arg(long)]
        run_dir: PathBuf,
    },
    /// Write PROMOTION_TOKEN.json for a clean gate.
    Promote {
        #[arg(long)]
        run_dir: PathBuf,
    },
    /// Commit the allowlisted changes on the current branch.
    Commit {
        #[arg(long)]
        run_dir: PathBuf,
        #[arg(short, long)]
        message: Option<String>,
    },
}

#[derive(Subcommand)]
enum WtCommand {
    /// Create a fresh branch and worktree from `<remote>/<base>`.
    Start {
        #[arg(long)]
        run_dir: PathBuf,
        #[arg(long)]
        branch: Option<String>,
        #[arg(long)]
        base: Option<String>,
        #[arg(long)]
        remote: Option<String>,
        #[arg(long)]
        worktree_path: Option<PathBuf>,
        #[arg(long, default_value = "refuse")]
        dirty: DirtyPolicy,
    },
    /// One commit per commit plan step, in declared order.
    CommitSequence {
        #[arg(long)]
        run_dir: PathBuf,
        #[arg(long)]
        allow_unpromoted: bool,
        #[arg(long, default_value = "refuse")]
        dirty: DirtyPolicy,
    },
    /// Rebase, fast-forward the base branch, push and verify the remote head.
    Finish {
        #[arg(long)]
        run_dir: PathBuf,
        #[arg(long, default_value = REBASE_FF)]
        mode: String,
        /// Keep the worktree and local branch.
        #[arg(long)]
        no_cleanup: bool,
        #[arg(long, default_value = "refuse")]
        dirty: DirtyPolicy,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::ERROR);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = repo_root(&cli.repo)?;
    let config = load_config(&config_path(&root))?;
    match cli.command {
        Command::Init { force } => cmd_init(&root, &config, force),
        Command::Packet {
            command: PacketCommand::Validate { packet },
        } => cmd_packet_validate(&packet),
        Command::Route { command } => cmd_route(&root, &config, command),
        Command::Kernel {
            packet,
            mode,
            availability,
            run_dir,
        } => {
            let request = KernelRequest {
                packet_path: packet,
                availability_path: availability_path(&root, &config, availability),
                run_dir: run_dir.map(|dir| absolute(&dir)).transpose()?,
                mode,
            };
            cmd_kernel(&root, &config, &request)
        }
        Command::Run { command } => cmd_run(&root, &config, command),
        Command::Wt { command } => cmd_wt(&root, &config, command),
    }
}

/// The git top-level of `repo`, or `repo` itself outside a repository.
fn repo_root(repo: &Path) -> Result<PathBuf> {
    let repo = absolute(repo)?;
    match Git::new(&SystemExec, &repo).toplevel() {
        Ok(top) => Ok(top),
        Err(err) => {
            debug!(error = %format!("{err:#}"), "not a git repository; using --repo as root");
            Ok(repo)
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("resolve {}", path.display()))
}

fn availability_path(root: &Path, config: &KernelConfig, explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| resolve(root, &config.availability_path))
}

/// Print a refusal to stderr, or hand the value to `on_done`; returns the exit code.
fn report<T>(outcome: Outcome<T>, on_done: impl FnOnce(T)) -> i32 {
    match outcome {
        Outcome::Done(value) => {
            on_done(value);
            exit_codes::OK
        }
        Outcome::Refused(refusal) => {
            eprintln!("{refusal}");
            exit_codes::REFUSED
        }
    }
}

fn cmd_init(root: &Path, config: &KernelConfig, force: bool) -> Result<i32> {
    let path = config_path(root);
    if force || !path.exists() {
        write_config(&path, config).context("write kernel config")?;
        println!("wrote {}", path.display());
    }
    let availability = resolve(root, &config.availability_path);
    if write_default_availability(&availability, force)? {
        println!("wrote {}", availability.display());
    }
    Ok(exit_codes::OK)
}

fn cmd_packet_validate(packet: &Path) -> Result<i32> {
    let loaded = load_packet(packet)?;
    Ok(match loaded.parsed {
        Ok(packet) => {
            println!(
                "{} valid: {} allowlist entr(ies), {} verification command(s){}",
                packet.id,
                packet.allowlist.len(),
                packet.verification_commands.len(),
                if packet.commit_plan.is_some() {
                    ", commit plan"
                } else {
                    ""
                }
            );
            exit_codes::OK
        }
        Err(err) => {
            eprintln!("{}", err.to_refusal());
            exit_codes::REFUSED
        }
    })
}

fn cmd_route(root: &Path, config: &KernelConfig, command: RouteCommand) -> Result<i32> {
    match command {
        RouteCommand::Plan {
            packet,
            availability,
            out,
        } => {
            let out = out.map(|dir| absolute(&dir)).transpose()?;
            let outcome = plan_route(
                root,
                config,
                &packet,
                &availability_path(root, config, availability),
                out.as_deref(),
            )?;
            Ok(report(outcome, |route| {
                println!("{}", route.out_dir.display());
            }))
        }
        RouteCommand::Explain {
            packet,
            step,
            availability,
        } => {
            let outcome =
                explain_route(&packet, &availability_path(root, config, availability), &step)?;
            Ok(report(outcome, |text| print!("{text}")))
        }
    }
}

fn cmd_kernel(root: &Path, config: &KernelConfig, request: &KernelRequest) -> Result<i32> {
    let exec = SystemExec;
    let runner = CommandRunner::new(&exec);
    let report = run_kernel(root, config, request, &runner)?;
    match &report.outcome {
        KernelOutcome::Refused(refusal) => eprintln!("{refusal}"),
        KernelOutcome::ExecutionFailed { exit_code } => eprintln!(
            "runner failed ({}); see {}",
            exit_code.map_or_else(|| "signal".to_string(), |c| format!("exit {c}")),
            report.run_dir.display()
        ),
        KernelOutcome::Executed | KernelOutcome::HandoffEmitted => {}
    }
    println!("{}", report.run_dir.display());
    Ok(report.outcome.exit_code())
}

fn cmd_run(root: &Path, config: &KernelConfig, command: RunCommand) -> Result<i32> {
    let exec = SystemExec;
    let git = Git::new(&exec, root);
    match command {
        RunCommand::Init { packet, run_dir } => {
            let explicit = run_dir.map(|dir| absolute(&dir)).transpose()?;
            let loaded = load_packet(&packet)?;
            let packet_id = loaded.parsed.as_ref().ok().map(|p| p.id.clone());
            let dir = run_dir_for(
                root,
                config,
                packet_id.as_deref(),
                &loaded.sha256,
                explicit.as_deref(),
            );
            let paths = RunPaths::new(dir);
            let outcome = init_run(config, &packet, &paths)?;
            Ok(report(outcome, |_| println!("{}", paths.dir.display())))
        }
        RunCommand::Evidence { run_dir } => {
            let paths = RunPaths::new(absolute(&run_dir)?);
            let outcome = collect_evidence(&exec, root, config, &paths)?;
            Ok(report(outcome, |evidence| {
                println!("{} command(s) recorded", evidence.commands.len());
            }))
        }
        RunCommand::Gate { run_dir } => {
            let paths = RunPaths::new(absolute(&run_dir)?);
            let outcome = run_gate(&git, root, config, &paths)?;
            Ok(report(outcome, |diff| {
                println!("gate passed: {} allowed file(s)", diff.allowed_files.len());
            }))
        }
        RunCommand::Promote { run_dir } => {
            let paths = RunPaths::new(absolute(&run_dir)?);
            let outcome = promote(config, &paths)?;
            Ok(report(outcome, |token| println!("{}", token.token)))
        }
        RunCommand::Commit { run_dir, message } => {
            let paths = RunPaths::new(absolute(&run_dir)?);
            let outcome = commit_run(&git, root, config, &paths, message.as_deref())?;
            Ok(report(outcome, |record| println!("{}", record.commit)))
        }
    }
}

fn cmd_wt(root: &Path, config: &KernelConfig, command: WtCommand) -> Result<i32> {
    let exec = SystemExec;
    match command {
        WtCommand::Start {
            run_dir,
            branch,
            base,
            remote,
            worktree_path,
            dirty,
        } => {
            let paths = RunPaths::new(absolute(&run_dir)?);
            let request = StartRequest {
                branch,
                base,
                remote,
                worktree_path,
                dirty_policy: dirty,
            };
            let outcome = start(&exec, root, config, &paths, &request)?;
            Ok(report(outcome, |record| {
                println!("{} {}", record.branch, record.worktree_path);
            }))
        }
        WtCommand::CommitSequence {
            run_dir,
            allow_unpromoted,
            dirty,
        } => {
            let paths = RunPaths::new(absolute(&run_dir)?);
            let request = SequenceRequest {
                allow_unpromoted,
                dirty_policy: dirty,
            };
            let outcome = commit_sequence(&exec, root, config, &paths, request)?;
            Ok(report(outcome, |record| {
                for step in &record.steps {
                    println!(
                        "{} {}",
                        step.step_id,
                        step.commit.as_deref().unwrap_or_default()
                    );
                }
            }))
        }
        WtCommand::Finish {
            run_dir,
            mode,
            no_cleanup,
            dirty,
        } => {
            let paths = RunPaths::new(absolute(&run_dir)?);
            let request = FinishRequest {
                mode,
                cleanup: !no_cleanup,
                dirty_policy: dirty,
            };
            let outcome = finish(&exec, root, config, &paths, &request)?;
            Ok(report(outcome, |record| {
                println!(
                    "{} {}",
                    record.base,
                    record.base_head_after.as_deref().unwrap_or_default()
                );
            }))
        }
    }
}
