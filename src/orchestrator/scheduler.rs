//! The phase scheduler: sole driver of the workflow state machine.
//!
//! Each iteration gates on the circuit breakers, renders the phase prompt,
//! runs the agent (waiting out rate limits and transient failures), parses
//! or synthesizes the status block, updates durable state, and picks the
//! next phase from the workflow definition. The loop is strictly
//! sequential: no two phases ever run concurrently.

use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Instant;

use crate::config::Config;
use crate::orchestrator::breakers::{DEFAULT_RETRY_BREAKER, check_breakers};
use crate::orchestrator::runner::{AgentRunner, RunnerResult};
use crate::orchestrator::state::{WorkflowState, save_state};
use crate::prompts::{self, PromptContext};
use crate::ratelimit::{
    RESET_BUFFER_SECS, compute_backoff, detect_rate_limit, detect_transient, wait_with_countdown,
};
use crate::recovery::{PLAN_FILE_NAME, PLANNING_PHASE, count_plan_sub_tasks};
use crate::status::{PhaseResult, Status, parse_status};
use crate::ui::OrchestratorUI;
use crate::workflow::{Target, WorkflowDefinition};

/// Rate-limit and transient waits tolerated within one phase attempt.
const MAX_WAIT_ATTEMPTS: u32 = 5;

/// How a finished run ended.
#[derive(Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The workflow reached a terminal transition.
    Completed,
    /// The user interrupted; state was persisted for resume.
    Interrupted,
    /// A breaker, crash, or exhausted wait stopped the run.
    Halted(String),
}

/// Where the state machine goes after an iteration.
#[derive(Debug, PartialEq, Eq)]
pub enum NextStep {
    Phase(String),
    Terminal,
    Halt(String),
}

/// Pure transition function for `(phase, result)`.
///
/// `BLOCKED` advances like `DONE`. A `NEEDS_RETRY` on a task-loop phase
/// advances the sub-task rather than spinning in place; elsewhere it takes
/// the retry transition, or `retry_exhausted` once the per-phase cap is
/// spent. A label with no transition defined ends the workflow.
pub fn resolve_next(
    workflow: &WorkflowDefinition,
    phase: &str,
    result: PhaseResult,
    current_sub_task: u32,
    total_sub_tasks: u32,
    phase_retry_count: u32,
    max_phase_retries: u32,
) -> NextStep {
    let Some(config) = workflow.phase_config(phase) else {
        return NextStep::Halt(format!("unknown phase: {}", phase));
    };
    let t = &config.transitions;

    let done_branch = || {
        if t.done_next_subtask.is_some() && current_sub_task < total_sub_tasks {
            t.done_next_subtask.clone()
        } else {
            t.done.clone()
        }
    };

    let chosen = match result {
        PhaseResult::Done | PhaseResult::Blocked => done_branch(),
        PhaseResult::NeedsRetry => {
            if t.retry_exhausted.is_some() && phase_retry_count >= max_phase_retries {
                t.retry_exhausted.clone()
            } else if t.done_next_subtask.is_some() {
                done_branch()
            } else {
                t.retry.clone()
            }
        }
        PhaseResult::Unknown => t.retry.clone(),
    };

    match chosen {
        Some(Target::Phase(next)) => NextStep::Phase(next),
        Some(Target::End) | None => NextStep::Terminal,
    }
}

/// Status synthesized when the agent produced no `CLOUDFORGE_STATUS:` block.
/// The summary distinguishes a crash from a clean exit that simply forgot
/// to report.
pub fn synthesize_status(phase: &str, exit_code: i32) -> Status {
    let summary = if exit_code != 0 {
        format!(
            "agent crashed without CLOUDFORGE_STATUS block (exit {})",
            exit_code
        )
    } else {
        "agent completed without CLOUDFORGE_STATUS block".to_string()
    };
    Status {
        phase: phase.to_string(),
        result: PhaseResult::NeedsRetry,
        tasks_remaining: None,
        summary,
    }
}

enum AttemptOutcome {
    Finished(RunnerResult),
    Halt(String),
    Interrupted,
}

pub struct Scheduler {
    config: Config,
    workflow: Arc<WorkflowDefinition>,
    state: WorkflowState,
    runner: AgentRunner,
    ui: Arc<OrchestratorUI>,
    shutdown: Arc<AtomicBool>,
    active_pid: Arc<AtomicU32>,
    phase_retry_count: u32,
    started: Instant,
}

impl Scheduler {
    pub fn new(
        config: Config,
        workflow: Arc<WorkflowDefinition>,
        state: WorkflowState,
        ui: Arc<OrchestratorUI>,
        shutdown: Arc<AtomicBool>,
        active_pid: Arc<AtomicU32>,
    ) -> Self {
        let runner = AgentRunner::new(config.clone());
        Self {
            config,
            workflow,
            state,
            runner,
            ui,
            shutdown,
            active_pid,
            phase_retry_count: 0,
            started: Instant::now(),
        }
    }

    /// Drive the workflow until a terminal transition, halt, or interrupt.
    /// State is persisted after every iteration and before every exit path.
    pub async fn run(&mut self) -> Result<RunOutcome> {
        self.config.ensure_artifact_dir()?;

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return self.persist_and(RunOutcome::Interrupted);
            }

            if let Some(reason) = check_breakers(&self.state, DEFAULT_RETRY_BREAKER) {
                self.ui.halt(&reason);
                return self.persist_and(RunOutcome::Halted(reason));
            }

            let phase = self.state.current_phase.clone();

            // Arriving fresh (not retrying) at the task-loop entry moves the
            // sub-task cursor forward.
            if self.workflow.task_loop_entry() == Some(phase.as_str())
                && self.phase_retry_count == 0
            {
                self.state.current_sub_task += 1;
            }

            let position = self.workflow.phase_index(&phase).unwrap_or(0) as u64;
            let sub_task = self
                .workflow
                .is_task_loop_phase(&phase)
                .then_some((self.state.current_sub_task, self.state.total_sub_tasks));
            self.ui.phase_banner(&phase, position, sub_task);
            self.ui
                .start_iteration(self.state.iteration + 1, self.state.iteration_cap);

            let context = PromptContext {
                sub_task_number: self.state.current_sub_task,
                total_sub_tasks: self.state.total_sub_tasks,
                working_dir: self.config.working_dir.clone(),
                retry_count: self.phase_retry_count,
                max_retries: self.state.max_phase_retries,
            };
            let prompt =
                prompts::render_prompt(&self.config.prompts_dir(), &phase, &self.state.task, &context)?;

            let result = match self.run_with_waits(&prompt).await {
                AttemptOutcome::Finished(result) => result,
                AttemptOutcome::Halt(reason) => {
                    self.ui.halt(&reason);
                    return self.persist_and(RunOutcome::Halted(reason));
                }
                AttemptOutcome::Interrupted => {
                    return self.persist_and(RunOutcome::Interrupted);
                }
            };

            if self.shutdown.load(Ordering::SeqCst) {
                return self.persist_and(RunOutcome::Interrupted);
            }

            if !result.success && result.output.is_empty() {
                let reason = format!(
                    "agent crashed with exit code {} and produced no output",
                    result.exit_code
                );
                self.ui.halt(&reason);
                return self.persist_and(RunOutcome::Halted(reason));
            }

            let status = match parse_status(&result.output) {
                Some(status) => status,
                None => {
                    let status = synthesize_status(&phase, result.exit_code);
                    self.ui.warn(&status.summary);
                    status
                }
            };

            self.state
                .record_iteration(&phase, Some(&status), Some(&result.tokens));
            self.ui
                .iteration_result(&phase, status.result.as_str(), &status.summary);

            // Planning just finished: size the sub-task loop from the plan.
            if phase == PLANNING_PHASE && status.result == PhaseResult::Done {
                let plan_path = self.config.artifact_dir().join(PLAN_FILE_NAME);
                if let Ok(plan) = std::fs::read_to_string(&plan_path) {
                    self.state.total_sub_tasks = count_plan_sub_tasks(&plan).max(1);
                    self.state.current_sub_task = 0;
                } else {
                    self.ui
                        .warn("planning reported DONE but plan.md is missing");
                }
            }

            if status.result == PhaseResult::NeedsRetry {
                self.phase_retry_count += 1;
                self.state.track_retry(Some(&status.summary));
            } else {
                self.phase_retry_count = 0;
            }

            let next = resolve_next(
                &self.workflow,
                &phase,
                status.result,
                self.state.current_sub_task,
                self.state.total_sub_tasks,
                self.phase_retry_count,
                self.state.max_phase_retries,
            );

            match next {
                NextStep::Halt(reason) => {
                    self.ui.halt(&reason);
                    return self.persist_and(RunOutcome::Halted(reason));
                }
                NextStep::Terminal => {
                    save_state(&self.config.artifact_dir(), &mut self.state)?;
                    self.ui.final_summary(&self.state, self.started.elapsed());
                    return Ok(RunOutcome::Completed);
                }
                NextStep::Phase(next_phase) => {
                    if status.result == PhaseResult::Done {
                        self.state.mark_phase_completed(&phase);
                        self.ui.phase_complete(&phase);
                    }
                    if next_phase != phase {
                        // Cross-phase noise must not trip the breakers on an
                        // unrelated later phase.
                        self.phase_retry_count = 0;
                        self.state.consecutive_retries = 0;
                        self.state.last_errors.clear();
                    }
                    self.state.current_phase = next_phase;
                    save_state(&self.config.artifact_dir(), &mut self.state)?;
                }
            }
        }
    }

    /// Invoke the agent, waiting out rate limits and transient failures.
    /// One attempt counter covers both; exceeding it halts the run.
    async fn run_with_waits(&mut self, prompt: &str) -> AttemptOutcome {
        let mut attempt: u32 = 0;
        loop {
            let result = self
                .runner
                .run(
                    prompt,
                    self.state.session_id.as_deref(),
                    Some(self.ui.clone()),
                    &self.active_pid,
                )
                .await;

            if let Some(sid) = &result.session_id {
                self.state.session_id = Some(sid.clone());
            }
            if self.shutdown.load(Ordering::SeqCst) {
                return AttemptOutcome::Interrupted;
            }

            let rate_limit = detect_rate_limit(result.exit_code, &result.stderr, &result.output);
            if rate_limit.is_rate_limit {
                attempt += 1;
                if attempt > MAX_WAIT_ATTEMPTS {
                    return AttemptOutcome::Halt(format!(
                        "rate limit persisted after {} wait attempts",
                        MAX_WAIT_ATTEMPTS
                    ));
                }
                let wait = if rate_limit.retry_after_seconds > 0 {
                    rate_limit.retry_after_seconds + RESET_BUFFER_SECS
                } else {
                    compute_backoff(attempt - 1, self.config.rate_limit_wait_secs)
                };
                if wait > self.config.rate_limit_wait_secs {
                    return AttemptOutcome::Halt(format!(
                        "rate-limit wait of {}s exceeds the {}s cap",
                        wait, self.config.rate_limit_wait_secs
                    ));
                }
                self.ui.warn(&format!(
                    "rate limited (attempt {}/{}), waiting {}s",
                    attempt, MAX_WAIT_ATTEMPTS, wait
                ));
                if !wait_with_countdown(wait, &self.shutdown, |remaining| {
                    self.ui.countdown_tick(remaining, "rate limited")
                })
                .await
                {
                    return AttemptOutcome::Interrupted;
                }
                continue;
            }

            if let Some(reason) = detect_transient(result.exit_code, &result.stderr, &result.output)
            {
                attempt += 1;
                if attempt > MAX_WAIT_ATTEMPTS {
                    return AttemptOutcome::Halt(format!(
                        "transient errors persisted after {} wait attempts ({})",
                        MAX_WAIT_ATTEMPTS, reason
                    ));
                }
                let wait = compute_backoff(attempt - 1, self.config.rate_limit_wait_secs);
                self.ui.warn(&format!(
                    "{} (attempt {}/{}), retrying in {}s",
                    reason, attempt, MAX_WAIT_ATTEMPTS, wait
                ));
                if !wait_with_countdown(wait, &self.shutdown, |remaining| {
                    self.ui.countdown_tick(remaining, &reason)
                })
                .await
                {
                    return AttemptOutcome::Interrupted;
                }
                continue;
            }

            return AttemptOutcome::Finished(result);
        }
    }

    fn persist_and(&mut self, outcome: RunOutcome) -> Result<RunOutcome> {
        save_state(&self.config.artifact_dir(), &mut self.state)?;
        Ok(outcome)
    }
}
