use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use cloudforge::config::Config;
use cloudforge::orchestrator::scheduler::{RunOutcome, Scheduler};
use cloudforge::orchestrator::state::{CreateOptions, WorkflowState};
use cloudforge::prompts::{self, PromptContext};
use cloudforge::recovery;
use cloudforge::ui::OrchestratorUI;
use cloudforge::workflow::{self, WorkflowDefinition};

#[derive(Parser)]
#[command(name = "cloudforge")]
#[command(version, about = "Autonomous workflow orchestrator for AI coding agents")]
pub struct Cli {
    /// Task description. Omit to auto-resume from .cloudforge state or
    /// artifacts in the working directory.
    pub task: Option<String>,

    /// Hard cap on total iterations across the run
    #[arg(long, default_value_t = 25)]
    pub max_iterations: u32,

    /// Retries allowed per phase before retry_exhausted transitions apply
    #[arg(long, default_value_t = 3)]
    pub max_phase_retries: u32,

    /// Model name forwarded to the agent CLI
    #[arg(long)]
    pub model: Option<String>,

    /// Directory the agent works in (defaults to the current directory)
    #[arg(long)]
    pub working_dir: Option<PathBuf>,

    /// Turn budget forwarded to the agent CLI per invocation
    #[arg(long, default_value_t = 50)]
    pub max_turns: u32,

    /// Resume the run recorded in .cloudforge with this agent session id
    #[arg(long)]
    pub continue_session: Option<String>,

    /// Resolve the launch mode and print the plan without spawning the agent
    #[arg(long)]
    pub dry_run: bool,

    /// Longest rate-limit wait tolerated, in seconds
    #[arg(long, default_value_t = 43200)]
    pub rate_limit_wait: u64,

    /// Path to the agent CLI binary
    #[arg(long)]
    pub cli_path: Option<String>,

    #[arg(short, long)]
    pub verbose: bool,
}

fn create_options(cli: &Cli, first_phase: &str) -> CreateOptions {
    CreateOptions {
        first_phase: first_phase.to_string(),
        iteration_cap: cli.max_iterations,
        max_phase_retries: cli.max_phase_retries,
        model: cli.model.clone(),
    }
}

/// Resolve the launch mode, in order: explicit session resume, fresh task,
/// auto-resume from state or artifacts. Errors are usage errors.
fn resolve_initial_state(
    cli: &Cli,
    config: &Config,
    workflow: &WorkflowDefinition,
) -> Result<WorkflowState, String> {
    let artifact_dir = config.artifact_dir();

    if let Some(session_id) = &cli.continue_session {
        let Some(mut state) = recovery::load_and_repair(&artifact_dir, workflow) else {
            return Err(format!(
                "--continue-session given but no usable state found in {}",
                artifact_dir.display()
            ));
        };
        state.session_id = Some(session_id.clone());
        return Ok(state);
    }

    if let Some(task) = &cli.task {
        return Ok(WorkflowState::create(
            task,
            &create_options(cli, workflow.first_phase()),
        ));
    }

    if recovery::has_artifact_dir(&config.working_dir) {
        if let Some(state) = recovery::load_and_repair(&artifact_dir, workflow) {
            return Ok(state);
        }
        if let Some(state) = recovery::recover_state_from_artifacts(
            &artifact_dir,
            workflow,
            &create_options(cli, workflow.first_phase()),
        ) {
            return Ok(state);
        }
        return Err(format!(
            "state in {} is unusable and no task could be inferred; pass a task description",
            artifact_dir.display()
        ));
    }

    Err("no task given and nothing to resume; usage: cloudforge [OPTIONS] <TASK>".to_string())
}

fn print_dry_run(config: &Config, workflow: &WorkflowDefinition, state: &WorkflowState) {
    println!("Task: {}", state.task);
    println!("Resume phase: {}", state.current_phase);
    if !state.completed_phases.is_empty() {
        println!("Completed phases: {}", state.completed_phases.join(", "));
    }
    println!("Workflow:");
    for name in workflow.ordered_phase_names() {
        let marker = if workflow.is_task_loop_phase(name) {
            "*"
        } else {
            " "
        };
        let here = if name == &state.current_phase { "→" } else { " " };
        println!("  {}{} {}", here, marker, name);
    }

    let context = PromptContext {
        sub_task_number: state.current_sub_task,
        total_sub_tasks: state.total_sub_tasks,
        working_dir: config.working_dir.clone(),
        retry_count: 0,
        max_retries: state.max_phase_retries,
    };
    match prompts::render_prompt(
        &config.prompts_dir(),
        &state.current_phase,
        &state.task,
        &context,
    ) {
        Ok(prompt) => {
            println!("\nFirst prompt:\n---\n{}---", prompt);
        }
        Err(e) => println!("\nFirst prompt unavailable: {}", e),
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let config = Config::new(
        cli.working_dir.clone(),
        cli.cli_path.clone(),
        cli.model.clone(),
        cli.max_iterations,
        cli.max_phase_retries,
        cli.max_turns,
        cli.rate_limit_wait,
        cli.verbose,
    )?;

    let workflow = match workflow::load_workflow(&config.prompts_dir()) {
        Ok(workflow) => workflow,
        Err(e) => {
            eprintln!("cloudforge: {}", e);
            return Ok(1);
        }
    };

    let state = match resolve_initial_state(&cli, &config, &workflow) {
        Ok(state) => state,
        Err(usage) => {
            eprintln!("cloudforge: {}", usage);
            return Ok(1);
        }
    };

    if cli.dry_run {
        print_dry_run(&config, &workflow, &state);
        return Ok(0);
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let active_pid = Arc::new(AtomicU32::new(0));
    spawn_signal_handler(shutdown.clone(), active_pid.clone());

    let ui = Arc::new(OrchestratorUI::new(
        workflow.ordered_phase_names().len() as u64,
        cli.verbose,
    ));

    let mut scheduler = Scheduler::new(config, workflow, state, ui, shutdown, active_pid);

    match scheduler.run().await? {
        RunOutcome::Completed => Ok(0),
        RunOutcome::Interrupted => {
            eprintln!("cloudforge: interrupted; state saved, re-run with no arguments to resume");
            Ok(0)
        }
        RunOutcome::Halted(reason) => {
            eprintln!(
                "cloudforge: halted: {} (state saved, re-run with no arguments to resume)",
                reason
            );
            Ok(1)
        }
    }
}

/// First SIGINT: raise the shutdown flag and forward SIGTERM to the active
/// child; the scheduler persists state and exits cleanly at its next
/// suspension point. Second SIGINT force-exits.
fn spawn_signal_handler(shutdown: Arc<AtomicBool>, active_pid: Arc<AtomicU32>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        shutdown.store(true, Ordering::SeqCst);
        terminate_child(active_pid.load(Ordering::SeqCst));
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
}

#[cfg(unix)]
fn terminate_child(pid: u32) {
    if pid != 0 {
        // SAFETY: plain kill(2) on a pid we spawned; no memory is touched.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn terminate_child(_pid: u32) {}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("cloudforge: {:#}", e);
            std::process::exit(1);
        }
    }
}
