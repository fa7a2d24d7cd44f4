//! Conductor CLI: thin wiring over the library entry points.
//!
//! Exit codes: 0 on full success, 1 on any failure (including plan
//! validation), 130 on user interrupt.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use conductor::batch::{BatchOptions, BatchPlan, BatchScheduler};
use conductor::config::Config;
use conductor::lock::SessionLock;
use conductor::store::Store;
use conductor::types::SessionMode;
use conductor::workspace::{CreateSessionOptions, WorkspaceManager};

#[derive(Parser)]
#[command(name = "conductor", version, about = "Orchestrate AI coding-agent sessions")]
struct Cli {
    /// Explicit config file path
    #[arg(long, global = true)]
    config: Option<String>,

    /// Force debug-level logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage sessions
    #[command(subcommand)]
    Session(SessionCommands),

    /// Run batches of sessions
    #[command(subcommand)]
    Batch(BatchCommands),

    /// Sweep lock files whose owner process is gone
    LocksSweep,

    /// Check git/agent binaries, state paths, and agent auth
    Doctor,
}

#[derive(Subcommand)]
enum SessionCommands {
    /// Create a session (worktree + branch + record)
    New {
        /// Human name; also seeds the branch slug
        name: String,
        /// Initial prompt for the agent
        prompt: String,
        /// Repository to carve the workspace from
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        /// Base branch (default: repository default branch)
        #[arg(long)]
        base: Option<String>,
        /// Test command to run after committing iterations
        #[arg(long)]
        script: Option<String>,
        /// Model override forwarded to the agent
        #[arg(long)]
        model: Option<String>,
        /// Run the first iteration immediately
        #[arg(long)]
        iterate: bool,
    },
    /// Run one agent turn
    Iterate {
        session_id: String,
        /// Follow-up notes driving this turn
        #[arg(long)]
        notes: Option<String>,
    },
    /// Show merge readiness
    Preflight { session_id: String },
    /// Squash the session's commits onto the base
    Squash {
        session_id: String,
        #[arg(long, short)]
        message: String,
    },
    /// Rebase onto the base branch
    Rebase { session_id: String },
    /// Continue a conflicted rebase
    Continue { session_id: String },
    /// Abort a conflicted rebase
    Abort { session_id: String },
    /// Merge the session branch into the base
    Merge {
        session_id: String,
        #[arg(long)]
        no_ff: bool,
    },
    /// Remove workspace, branch, and record
    Cleanup {
        session_id: String,
        #[arg(long)]
        force: bool,
    },
    /// List sessions
    List,
    /// Export a session to JSON on stdout
    Export { session_id: String },
}

#[derive(Subcommand)]
enum BatchCommands {
    /// Execute a plan file (TOML or JSON)
    Run {
        plan: PathBuf,
        /// Explicit run id
        #[arg(long)]
        run_id: Option<String>,
        /// Print the resolved plan without executing
        #[arg(long)]
        dry_run: bool,
    },
    /// Show a run's items
    Status { run_id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::from(1);
        }
    };
    let _logging = match conductor::logging::init_logging(&config, cli.debug) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("error: failed to initialize logging: {e:#}");
            return ExitCode::from(1);
        }
    };

    match run(cli, config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli, config: Config) -> Result<ExitCode> {
    let store = Arc::new(Store::open(&Config::db_path())?);
    let manager = Arc::new(WorkspaceManager::new(config.clone(), store.clone())?);

    match cli.command {
        Commands::Session(cmd) => run_session_command(cmd, &manager).await,
        Commands::Batch(cmd) => run_batch_command(cmd, &manager).await,
        Commands::LocksSweep => {
            let lock = SessionLock::new(Config::locks_dir());
            let removed = lock.cleanup_stale()?;
            println!("removed {removed} stale lock file(s)");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Doctor => run_doctor(&config, &manager).await,
    }
}

async fn run_session_command(
    cmd: SessionCommands,
    manager: &Arc<WorkspaceManager>,
) -> Result<ExitCode> {
    match cmd {
        SessionCommands::New {
            name,
            prompt,
            repo,
            base,
            script,
            model,
            iterate,
        } => {
            let session = manager
                .create_session(CreateSessionOptions {
                    name,
                    prompt,
                    repo_root: repo,
                    base_branch: base,
                    mode: SessionMode::Async,
                    script_command: script,
                    model_override: model,
                    batch_run_id: None,
                    initial_iteration: iterate,
                })
                .await?;
            println!("created session {}", session.id);
            println!("  branch:    {}", session.branch_name);
            println!("  workspace: {}", session.worktree_path.display());
            println!("  status:    {}", session.status);
        }
        SessionCommands::Iterate { session_id, notes } => {
            let iteration = manager
                .run_iteration(&session_id, notes.as_deref())
                .await?;
            println!(
                "iteration {} finished: exit={} commit={} files={}",
                iteration.id,
                iteration.exit_code.unwrap_or(-1),
                iteration.commit_sha.as_deref().unwrap_or("none"),
                iteration.changed_files
            );
        }
        SessionCommands::Preflight { session_id } => {
            let report = manager.preflight(&session_id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.issues.is_empty() {
                return Ok(ExitCode::from(1));
            }
        }
        SessionCommands::Squash {
            session_id,
            message,
        } => {
            let sha = manager.squash_session(&session_id, &message, false).await?;
            println!("squashed to {sha}");
        }
        SessionCommands::Rebase { session_id } => {
            let outcome = manager.rebase_onto_base(&session_id).await?;
            print_rebase_outcome(&outcome);
            if outcome.status() == "conflict" {
                return Ok(ExitCode::from(1));
            }
        }
        SessionCommands::Continue { session_id } => {
            let outcome = manager.continue_merge(&session_id).await?;
            print_rebase_outcome(&outcome);
            if outcome.status() == "conflict" {
                return Ok(ExitCode::from(1));
            }
        }
        SessionCommands::Abort { session_id } => {
            manager.abort_merge(&session_id).await?;
            println!("rebase aborted");
        }
        SessionCommands::Merge { session_id, no_ff } => {
            manager.fast_forward_merge(&session_id, no_ff).await?;
            println!("merged into base");
        }
        SessionCommands::Cleanup { session_id, force } => {
            manager.cleanup(&session_id, force).await?;
            println!("cleaned up {session_id}");
        }
        SessionCommands::List => {
            for session in manager.store().list_sessions()? {
                println!(
                    "{}  {:<14} {:<12} {}",
                    session.id, session.status, session.mode.as_str(), session.name
                );
            }
        }
        SessionCommands::Export { session_id } => {
            let export = manager.store().export_session(&session_id)?;
            println!("{}", serde_json::to_string_pretty(&export)?);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_rebase_outcome(outcome: &conductor::git::RebaseOutcome) {
    match outcome {
        conductor::git::RebaseOutcome::Ok => println!("rebase ok"),
        conductor::git::RebaseOutcome::Conflict { files } => {
            println!("rebase stopped on conflicts:");
            for file in files {
                println!("  {file}");
            }
            println!("guidance written to AGENT_CONTEXT/REBASE_HELP.md");
        }
    }
}

async fn run_batch_command(
    cmd: BatchCommands,
    manager: &Arc<WorkspaceManager>,
) -> Result<ExitCode> {
    match cmd {
        BatchCommands::Run {
            plan,
            run_id,
            dry_run,
        } => {
            let plan = BatchPlan::load(&plan)?;
            let scheduler = BatchScheduler::new(manager.clone());

            // Ctrl-C triggers a cooperative abort; in-flight sessions
            // finish their iteration first.
            let handle = scheduler.abort_handle();
            let interrupt = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("interrupt: aborting batch after in-flight items finish");
                    handle.abort();
                    true
                } else {
                    false
                }
            });

            let summary = scheduler
                .execute(&plan, BatchOptions { run_id, dry_run })
                .await?;
            let interrupted = interrupt.is_finished() && interrupt.await.unwrap_or(false);

            println!(
                "run {}: {} — {} ok, {} fail, {} timeout, {} error",
                summary.run_id,
                summary.status,
                summary.succeeded,
                summary.failed,
                summary.timed_out,
                summary.errored
            );
            if interrupted {
                return Ok(ExitCode::from(130));
            }
            if summary.succeeded < summary.total && !summary.dry_run {
                return Ok(ExitCode::from(1));
            }
        }
        BatchCommands::Status { run_id } => {
            let run = manager
                .store()
                .get_batch_run(&run_id)?
                .context("unknown batch run")?;
            println!("run {} — {} (concurrency {})", run.id, run.status, run.concurrency);
            for item in manager.store().batch_items(&run_id, None)? {
                println!(
                    "  {}  {:<8} {}  {}",
                    item.id,
                    item.status,
                    item.repo_path,
                    item.error.as_deref().unwrap_or("")
                );
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_doctor(config: &Config, manager: &Arc<WorkspaceManager>) -> Result<ExitCode> {
    let mut healthy = true;

    let git_program = config.git_executable();
    match which::which(&git_program) {
        Ok(path) => println!("git:    {} ({})", git_program, path.display()),
        Err(_) => {
            println!("git:    {git_program} NOT FOUND");
            healthy = false;
        }
    }

    let agent_binary = config.agent.binary.clone();
    match which::which(&agent_binary) {
        Ok(path) => println!("agent:  {} ({})", agent_binary, path.display()),
        Err(_) => {
            println!("agent:  {agent_binary} NOT FOUND");
            healthy = false;
        }
    }

    let config_dir = Config::config_dir();
    let writable = std::fs::create_dir_all(&config_dir).is_ok();
    println!(
        "state:  {} ({})",
        config_dir.display(),
        if writable { "writable" } else { "NOT WRITABLE" }
    );
    healthy &= writable;

    let auth = manager.adapter().validate_auth().await;
    if auth.authenticated {
        println!(
            "auth:   ok{}",
            if auth.has_credits { "" } else { " (no credits)" }
        );
        healthy &= auth.has_credits;
    } else {
        println!(
            "auth:   FAILED — {}",
            auth.error.as_deref().unwrap_or("unknown")
        );
        if let Some(suggestion) = &auth.suggestion {
            println!("        hint: {suggestion}");
        }
        healthy = false;
    }

    Ok(if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}
