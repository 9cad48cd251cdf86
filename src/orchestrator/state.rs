//! Durable workflow state: the single record of a run, persisted as pretty
//! JSON after every iteration and on graceful shutdown.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::STATE_FILE_NAME;
use crate::errors::OrchestratorError;
use crate::status::Status;

/// History entries kept in the state file.
const HISTORY_LIMIT: usize = 50;

/// Capacity of the recent-errors ring.
pub const LAST_ERRORS_CAP: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub iteration: u32,
    pub phase: String,
    pub result: String,
    pub summary: String,
    /// Tokens consumed by this iteration (input + output).
    pub total_tokens: u64,
}

/// Durable record of one orchestrator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    /// Agent session identifier, assigned on the first iteration.
    pub session_id: Option<String>,
    pub task: String,
    pub current_phase: String,
    /// 0-based before the first entry into the task loop.
    pub current_sub_task: u32,
    /// 0 until planning completes.
    pub total_sub_tasks: u32,
    pub iteration: u32,
    pub iteration_cap: u32,
    pub max_phase_retries: u32,
    pub model: Option<String>,
    pub total_tokens: TokenTotals,
    pub history: Vec<HistoryEntry>,
    pub completed_phases: Vec<String>,
    pub consecutive_retries: u32,
    pub last_errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Options for creating a fresh state.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub first_phase: String,
    pub iteration_cap: u32,
    pub max_phase_retries: u32,
    pub model: Option<String>,
}

impl WorkflowState {
    pub fn create(task: &str, opts: &CreateOptions) -> Self {
        let now = Utc::now();
        Self {
            session_id: None,
            task: task.to_string(),
            current_phase: opts.first_phase.clone(),
            current_sub_task: 0,
            total_sub_tasks: 0,
            iteration: 0,
            iteration_cap: opts.iteration_cap,
            max_phase_retries: opts.max_phase_retries,
            model: opts.model.clone(),
            total_tokens: TokenTotals::default(),
            history: Vec::new(),
            completed_phases: Vec::new(),
            consecutive_retries: 0,
            last_errors: Vec::new(),
            started_at: now,
            last_activity: now,
        }
    }

    /// Record one finished iteration: bump the counter, append history,
    /// accumulate token totals. A `None` status records `UNKNOWN`.
    pub fn record_iteration(
        &mut self,
        phase: &str,
        status: Option<&Status>,
        tokens: Option<&TokenTotals>,
    ) {
        self.iteration += 1;
        let (result, summary) = match status {
            Some(s) => (s.result.as_str().to_string(), s.summary.clone()),
            None => ("UNKNOWN".to_string(), String::new()),
        };
        let delta = tokens.copied().unwrap_or_default();
        self.history.push(HistoryEntry {
            iteration: self.iteration,
            phase: phase.to_string(),
            result,
            summary,
            total_tokens: delta.input_tokens + delta.output_tokens,
        });
        if self.history.len() > HISTORY_LIMIT {
            self.history.remove(0);
        }
        self.total_tokens.input_tokens += delta.input_tokens;
        self.total_tokens.output_tokens += delta.output_tokens;
    }

    /// Track a retry outcome after `record_iteration`: consecutive retries
    /// count runs of `NEEDS_RETRY` at the tail of history. The error ring
    /// keeps the 5 most recent messages.
    pub fn track_retry(&mut self, error: Option<&str>) {
        let retried = self
            .history
            .last()
            .map(|h| h.result == "NEEDS_RETRY")
            .unwrap_or(false);
        self.consecutive_retries = if retried {
            self.consecutive_retries + 1
        } else {
            0
        };
        if let Some(err) = error {
            self.last_errors.push(err.to_string());
            while self.last_errors.len() > LAST_ERRORS_CAP {
                self.last_errors.remove(0);
            }
        }
    }

    /// Mark a phase as completed, preserving first-insertion order.
    /// Idempotent. Resets the consecutive-retry counter.
    pub fn mark_phase_completed(&mut self, phase: &str) {
        if !self.completed_phases.iter().any(|p| p == phase) {
            self.completed_phases.push(phase.to_string());
        }
        self.consecutive_retries = 0;
    }
}

/// Persist the state as pretty JSON under the artifact directory,
/// refreshing `lastActivity`. The directory is created if absent.
pub fn save_state(artifact_dir: &Path, state: &mut WorkflowState) -> Result<(), OrchestratorError> {
    state.last_activity = Utc::now();
    std::fs::create_dir_all(artifact_dir).map_err(|source| {
        OrchestratorError::StateWriteFailed {
            path: artifact_dir.to_path_buf(),
            source,
        }
    })?;
    let path = artifact_dir.join(STATE_FILE_NAME);
    let json = serde_json::to_string_pretty(state)
        .map_err(|e| OrchestratorError::Other(e.into()))?;
    std::fs::write(&path, json + "\n").map_err(|source| OrchestratorError::StateWriteFailed {
        path: path.clone(),
        source,
    })?;
    Ok(())
}

/// Load a state file verbatim. Returns `None` on any read or decode error;
/// lenient repair lives in the recovery module.
pub fn load_state(artifact_dir: &Path) -> Option<WorkflowState> {
    let text = std::fs::read_to_string(artifact_dir.join(STATE_FILE_NAME)).ok()?;
    serde_json::from_str(&text).ok()
}
