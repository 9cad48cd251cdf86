//! State recovery and repair from on-disk artifacts.
//!
//! The state file is the primary resume source, but phase-output artifacts
//! are a reliable secondary signal: they are written only on successful
//! phase completion, while a state file can be corrupted by a crash mid
//! write. When the state file is missing or unreadable the run is rebuilt
//! from whatever artifacts survive.

use regex::Regex;
use serde_json::Value;
use std::path::Path;
use std::sync::LazyLock;

use crate::config::{ARTIFACT_DIR_NAME, STATE_FILE_NAME};
use crate::orchestrator::state::{CreateOptions, HistoryEntry, TokenTotals, WorkflowState};
use crate::workflow::WorkflowDefinition;

/// Plan file produced by the planning phase.
pub const PLAN_FILE_NAME: &str = "plan.md";

/// Per-feature markdown directory produced by the first phase.
const PRD_DIR_NAME: &str = "prd";

/// Artifact basename → phase that produces it. Presence of a non-empty
/// artifact implies that phase ran to completion at least once.
const ARTIFACT_PHASES: &[(&str, &str)] = &[
    ("requirements.md", "REQUIREMENTS"),
    ("stories.md", "STORIES"),
    ("domain.md", "DOMAIN"),
    ("plan.md", "PLAN"),
    ("bdd-scenarios.md", "BDD"),
    ("quality-report.md", "QUALITY"),
    ("innovation-log.md", "INNOVATE"),
];

/// The phase whose completion produces `plan.md`.
pub const PLANNING_PHASE: &str = "PLAN";

static TASK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""task"\s*:\s*"((?:\\.|[^"\\])*)""#)
        .expect("task extraction regex is a valid static string")
});

static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^#[ \t]+(.+)$").expect("heading regex is a valid static string")
});

static SUB_TASK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^##\s+Sub-task\s+(\d+)").expect("sub-task regex is a valid static string")
});

/// Does the working directory contain a `.cloudforge` artifact directory?
pub fn has_artifact_dir(working_dir: &Path) -> bool {
    working_dir.join(ARTIFACT_DIR_NAME).is_dir()
}

/// Read and decode the state file. Returns `None` on any error, including
/// a missing or empty `task` field. Never panics or propagates.
pub fn try_load_state(artifact_dir: &Path) -> Option<Value> {
    let text = std::fs::read_to_string(artifact_dir.join(STATE_FILE_NAME)).ok()?;
    let value: Value = serde_json::from_str(&text).ok()?;
    let task = value.get("task")?.as_str()?;
    if task.is_empty() {
        return None;
    }
    Some(value)
}

/// Best-effort normalization of a loaded state before use.
///
/// Unknown phases fall back to the first phase, malformed numerics to zero
/// (the iteration cap to 25), malformed collections to empty, unparseable
/// timestamps to now. Resuming is an explicit "try again", so the
/// consecutive-retry counter and error ring are always cleared.
pub fn repair_state(raw: &Value, workflow: &WorkflowDefinition) -> WorkflowState {
    let str_field = |key: &str| raw.get(key).and_then(Value::as_str).map(str::to_string);
    let u32_field = |key: &str| {
        raw.get(key)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0)
    };
    let time_field = |key: &str| {
        str_field(key)
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(chrono::Utc::now)
    };

    let current_phase = str_field("currentPhase")
        .filter(|p| workflow.phase_index(p).is_some())
        .unwrap_or_else(|| workflow.first_phase().to_string());

    let iteration_cap = match raw.get("iterationCap").and_then(Value::as_u64) {
        Some(cap) if cap > 0 => u32::try_from(cap).unwrap_or(25),
        _ => 25,
    };
    let max_phase_retries = match raw.get("maxPhaseRetries").and_then(Value::as_u64) {
        Some(n) if n > 0 => u32::try_from(n).unwrap_or(3),
        _ => 3,
    };

    let history: Vec<HistoryEntry> = raw
        .get("history")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .collect()
        })
        .unwrap_or_default();

    let completed_phases = raw
        .get("completedPhases")
        .and_then(Value::as_array)
        .map(|arr| {
            let mut seen = Vec::new();
            for v in arr {
                if let Some(name) = v.as_str()
                    && workflow.phase_index(name).is_some()
                    && !seen.iter().any(|s: &String| s == name)
                {
                    seen.push(name.to_string());
                }
            }
            seen
        })
        .unwrap_or_default();

    let total_tokens = raw
        .get("totalTokens")
        .and_then(|v| serde_json::from_value::<TokenTotals>(v.clone()).ok())
        .unwrap_or_default();

    WorkflowState {
        session_id: str_field("sessionId"),
        task: str_field("task").unwrap_or_default(),
        current_phase,
        current_sub_task: u32_field("currentSubTask"),
        total_sub_tasks: u32_field("totalSubTasks"),
        iteration: u32_field("iteration"),
        iteration_cap,
        max_phase_retries,
        model: str_field("model"),
        total_tokens,
        history,
        completed_phases,
        // Cleared on every resume: stale retry noise must not trip the
        // breakers on the first fresh iteration.
        consecutive_retries: 0,
        last_errors: Vec::new(),
        started_at: time_field("startedAt"),
        last_activity: time_field("lastActivity"),
    }
}

/// Load and repair the state file in one step.
pub fn load_and_repair(artifact_dir: &Path, workflow: &WorkflowDefinition) -> Option<WorkflowState> {
    let raw = try_load_state(artifact_dir)?;
    Some(repair_state(&raw, workflow))
}

/// Infer the original task from artifacts, in priority order: the task
/// field of a (possibly corrupt) state file, then the first heading of
/// `requirements.md`, `stories.md`, or the first `prd/*.md`.
pub fn infer_task_from_artifacts(artifact_dir: &Path) -> Option<String> {
    if let Ok(text) = std::fs::read_to_string(artifact_dir.join(STATE_FILE_NAME))
        && let Some(caps) = TASK_RE.captures(&text)
    {
        let task = unescape_json_fragment(&caps[1]);
        if !task.is_empty() {
            return Some(task);
        }
    }

    for name in ["requirements.md", "stories.md"] {
        if let Some(heading) = first_heading(&artifact_dir.join(name)) {
            return Some(heading);
        }
    }

    let prd_dir = artifact_dir.join(PRD_DIR_NAME);
    if let Ok(entries) = std::fs::read_dir(&prd_dir) {
        let mut names: Vec<_> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "md"))
            .collect();
        names.sort();
        if let Some(first) = names.first()
            && let Some(heading) = first_heading(first)
        {
            return Some(heading);
        }
    }

    None
}

fn first_heading(path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    HEADING_RE
        .captures(&text)
        .map(|caps| caps[1].trim().to_string())
}

fn unescape_json_fragment(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('"') => out.push('"'),
                Some('\\') => out.push('\\'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn non_empty_file(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

/// Detect completed phases from artifact evidence.
///
/// Returns the phases strictly before the latest detected artifact (they
/// must have run for the later artifact to exist) and the latest detected
/// phase itself, which is re-run rather than skipped.
pub fn infer_completed_phases(
    artifact_dir: &Path,
    ordered: &[String],
) -> (Vec<String>, Option<String>) {
    let mut detected: Vec<usize> = Vec::new();

    for (file, phase) in ARTIFACT_PHASES {
        if non_empty_file(&artifact_dir.join(file))
            && let Some(idx) = ordered.iter().position(|p| p == phase)
        {
            detected.push(idx);
        }
    }

    // Per-feature PRDs are written by the first phase.
    let prd_dir = artifact_dir.join(PRD_DIR_NAME);
    if std::fs::read_dir(&prd_dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
        && !ordered.is_empty()
    {
        detected.push(0);
    }

    let Some(latest) = detected.into_iter().max() else {
        return (Vec::new(), None);
    };
    let completed = ordered[..latest].to_vec();
    (completed, Some(ordered[latest].clone()))
}

/// Pick the phase to resume at: the latest detected artifact phase, else
/// the phase after the furthest completed one (wrapping to the first when
/// everything is complete), else the first phase.
pub fn infer_resume_phase(
    completed: &[String],
    latest_detected: Option<&str>,
    ordered: &[String],
) -> String {
    if let Some(latest) = latest_detected {
        return latest.to_string();
    }
    let max_completed = completed
        .iter()
        .filter_map(|p| ordered.iter().position(|o| o == p))
        .max();
    match max_completed {
        Some(idx) if idx + 1 < ordered.len() => ordered[idx + 1].clone(),
        Some(_) => ordered[0].clone(),
        None => ordered[0].clone(),
    }
}

/// Count `## Sub-task N` headings in a plan document.
pub fn count_plan_sub_tasks(text: &str) -> u32 {
    SUB_TASK_RE.captures_iter(text).count() as u32
}

/// Rebuild a full workflow state from artifact evidence alone. Returns
/// `None` when no task can be inferred; the caller reports a usage error.
pub fn recover_state_from_artifacts(
    artifact_dir: &Path,
    workflow: &WorkflowDefinition,
    opts: &CreateOptions,
) -> Option<WorkflowState> {
    let task = infer_task_from_artifacts(artifact_dir)?;
    let ordered = workflow.ordered_phase_names();
    let (completed, latest) = infer_completed_phases(artifact_dir, ordered);
    let resume = infer_resume_phase(&completed, latest.as_deref(), ordered);

    let mut state = WorkflowState::create(
        &task,
        &CreateOptions {
            first_phase: resume,
            ..opts.clone()
        },
    );
    state.completed_phases = completed;

    if let Ok(plan) = std::fs::read_to_string(artifact_dir.join(PLAN_FILE_NAME)) {
        let count = count_plan_sub_tasks(&plan);
        if count > 0 {
            state.total_sub_tasks = count;
        }
    }

    Some(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::DEFAULT_WORKFLOW;
    use tempfile::tempdir;

    fn workflow() -> WorkflowDefinition {
        WorkflowDefinition::parse(DEFAULT_WORKFLOW).unwrap()
    }

    fn opts() -> CreateOptions {
        CreateOptions {
            first_phase: "DISCOVER".to_string(),
            iteration_cap: 25,
            max_phase_retries: 3,
            model: None,
        }
    }

    #[test]
    fn test_has_artifact_dir() {
        let dir = tempdir().unwrap();
        assert!(!has_artifact_dir(dir.path()));
        std::fs::create_dir(dir.path().join(".cloudforge")).unwrap();
        assert!(has_artifact_dir(dir.path()));
    }

    #[test]
    fn test_try_load_state_rejects_missing_task() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(STATE_FILE_NAME), r#"{"iteration": 3}"#).unwrap();
        assert!(try_load_state(dir.path()).is_none());

        std::fs::write(dir.path().join(STATE_FILE_NAME), r#"{"task": ""}"#).unwrap();
        assert!(try_load_state(dir.path()).is_none());

        std::fs::write(dir.path().join(STATE_FILE_NAME), r#"{"task": "x"}"#).unwrap();
        assert!(try_load_state(dir.path()).is_some());
    }

    #[test]
    fn test_try_load_state_never_panics_on_garbage() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(STATE_FILE_NAME), "}{ not json").unwrap();
        assert!(try_load_state(dir.path()).is_none());
    }

    #[test]
    fn test_infer_task_from_corrupt_state_file() {
        let dir = tempdir().unwrap();
        // Truncated JSON, but the task field survives
        std::fs::write(
            dir.path().join(STATE_FILE_NAME),
            r#"{"task": "add \"dark\" mode \\ theme", "iterat"#,
        )
        .unwrap();
        let task = infer_task_from_artifacts(dir.path()).unwrap();
        assert_eq!(task, r#"add "dark" mode \ theme"#);
    }

    #[test]
    fn test_infer_task_from_requirements_heading() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("requirements.md"),
            "# Add dark mode\n\n## Details\n",
        )
        .unwrap();
        assert_eq!(
            infer_task_from_artifacts(dir.path()).unwrap(),
            "Add dark mode"
        );
    }

    #[test]
    fn test_infer_task_prefers_state_over_headings() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(STATE_FILE_NAME), r#"{"task": "from state""#).unwrap();
        std::fs::write(dir.path().join("requirements.md"), "# from heading\n").unwrap();
        assert_eq!(
            infer_task_from_artifacts(dir.path()).unwrap(),
            "from state"
        );
    }

    #[test]
    fn test_infer_task_from_prd_lexicographic_first() {
        let dir = tempdir().unwrap();
        let prd = dir.path().join("prd");
        std::fs::create_dir(&prd).unwrap();
        std::fs::write(prd.join("b-feature.md"), "# Feature B\n").unwrap();
        std::fs::write(prd.join("a-feature.md"), "# Feature A\n").unwrap();
        assert_eq!(infer_task_from_artifacts(dir.path()).unwrap(), "Feature A");
    }

    #[test]
    fn test_infer_task_ignores_h2_headings() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("stories.md"), "## Not a title\n# Real title\n").unwrap();
        assert_eq!(infer_task_from_artifacts(dir.path()).unwrap(), "Real title");
    }

    #[test]
    fn test_infer_task_none_when_no_evidence() {
        let dir = tempdir().unwrap();
        assert!(infer_task_from_artifacts(dir.path()).is_none());
    }

    #[test]
    fn test_infer_completed_phases_from_single_artifact() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("requirements.md"), "# T\n").unwrap();
        let wf = workflow();
        let (completed, latest) =
            infer_completed_phases(dir.path(), wf.ordered_phase_names());
        assert_eq!(completed, vec!["DISCOVER"]);
        assert_eq!(latest.as_deref(), Some("REQUIREMENTS"));
    }

    #[test]
    fn test_infer_completed_phases_ignores_empty_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("requirements.md"), "").unwrap();
        let wf = workflow();
        let (completed, latest) =
            infer_completed_phases(dir.path(), wf.ordered_phase_names());
        assert!(completed.is_empty());
        assert!(latest.is_none());
    }

    #[test]
    fn test_infer_completed_phases_uses_latest_artifact() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("requirements.md"), "# T\n").unwrap();
        std::fs::write(dir.path().join("plan.md"), "## Sub-task 1: x\n").unwrap();
        let wf = workflow();
        let (completed, latest) =
            infer_completed_phases(dir.path(), wf.ordered_phase_names());
        assert_eq!(completed, vec!["DISCOVER", "REQUIREMENTS", "STORIES", "DOMAIN"]);
        assert_eq!(latest.as_deref(), Some("PLAN"));
    }

    #[test]
    fn test_prd_dir_counts_as_first_phase() {
        let dir = tempdir().unwrap();
        let prd = dir.path().join("prd");
        std::fs::create_dir(&prd).unwrap();
        std::fs::write(prd.join("feature.md"), "# F\n").unwrap();
        let wf = workflow();
        let (completed, latest) =
            infer_completed_phases(dir.path(), wf.ordered_phase_names());
        assert!(completed.is_empty());
        assert_eq!(latest.as_deref(), Some("DISCOVER"));
    }

    #[test]
    fn test_infer_resume_phase_prefers_latest_detected() {
        let wf = workflow();
        let resume = infer_resume_phase(
            &["DISCOVER".to_string()],
            Some("REQUIREMENTS"),
            wf.ordered_phase_names(),
        );
        assert_eq!(resume, "REQUIREMENTS");
    }

    #[test]
    fn test_infer_resume_phase_after_completed() {
        let wf = workflow();
        let resume = infer_resume_phase(
            &["DISCOVER".to_string(), "REQUIREMENTS".to_string()],
            None,
            wf.ordered_phase_names(),
        );
        assert_eq!(resume, "STORIES");
    }

    #[test]
    fn test_infer_resume_phase_wraps_when_all_complete() {
        let wf = workflow();
        let all: Vec<String> = wf.ordered_phase_names().to_vec();
        let resume = infer_resume_phase(&all, None, wf.ordered_phase_names());
        assert_eq!(resume, "DISCOVER");
    }

    #[test]
    fn test_infer_resume_phase_defaults_to_first() {
        let wf = workflow();
        assert_eq!(
            infer_resume_phase(&[], None, wf.ordered_phase_names()),
            "DISCOVER"
        );
    }

    #[test]
    fn test_count_plan_sub_tasks() {
        let plan = "## Sub-task 1: x\n## Sub-task 2: y\n## Sub-task 3: z";
        assert_eq!(count_plan_sub_tasks(plan), 3);
        assert_eq!(count_plan_sub_tasks("# Plan\nno tasks"), 0);
        // H3 and prose mentions do not count
        assert_eq!(count_plan_sub_tasks("### Sub-task 1\nsee Sub-task 2"), 0);
    }

    #[test]
    fn test_recover_state_from_artifacts_full() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("requirements.md"), "# Add dark mode\n").unwrap();
        let wf = workflow();
        let state = recover_state_from_artifacts(dir.path(), &wf, &opts()).unwrap();
        assert_eq!(state.task, "Add dark mode");
        assert_eq!(state.current_phase, "REQUIREMENTS");
        assert_eq!(state.completed_phases, vec!["DISCOVER"]);
        assert_eq!(state.iteration, 0);
        assert_eq!(state.total_sub_tasks, 0);
    }

    #[test]
    fn test_recover_seeds_sub_tasks_from_plan() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("requirements.md"), "# T\n").unwrap();
        std::fs::write(
            dir.path().join("plan.md"),
            "# Plan\n## Sub-task 1: a\n## Sub-task 2: b\n",
        )
        .unwrap();
        let wf = workflow();
        let state = recover_state_from_artifacts(dir.path(), &wf, &opts()).unwrap();
        assert_eq!(state.total_sub_tasks, 2);
        assert_eq!(state.current_phase, "PLAN");
    }

    #[test]
    fn test_recover_returns_none_without_task() {
        let dir = tempdir().unwrap();
        let wf = workflow();
        assert!(recover_state_from_artifacts(dir.path(), &wf, &opts()).is_none());
    }

    #[test]
    fn test_repair_state_fixes_malformed_fields() {
        let wf = workflow();
        let raw: Value = serde_json::json!({
            "task": "t",
            "currentPhase": "NOT_A_PHASE",
            "iteration": -5,
            "iterationCap": 0,
            "history": "not an array",
            "completedPhases": ["DISCOVER", "BOGUS", "DISCOVER", "REQUIREMENTS"],
            "lastErrors": ["a", "a", "a"],
            "consecutiveRetries": 7,
            "totalTokens": "garbage",
            "startedAt": "not a date"
        });
        let state = repair_state(&raw, &wf);
        assert_eq!(state.current_phase, "DISCOVER");
        assert_eq!(state.iteration, 0);
        assert_eq!(state.iteration_cap, 25);
        assert!(state.history.is_empty());
        assert_eq!(state.completed_phases, vec!["DISCOVER", "REQUIREMENTS"]);
        // Resume always clears retry noise
        assert_eq!(state.consecutive_retries, 0);
        assert!(state.last_errors.is_empty());
        assert_eq!(state.total_tokens, TokenTotals::default());
    }

    #[test]
    fn test_repair_state_is_stable() {
        let wf = workflow();
        let raw: Value = serde_json::json!({
            "task": "stability",
            "currentPhase": "PLAN",
            "iteration": 4,
            "iterationCap": 30,
            "completedPhases": ["DISCOVER", "REQUIREMENTS"],
            "totalTokens": {"inputTokens": 10, "outputTokens": 5},
            "startedAt": "2026-01-01T00:00:00Z",
            "lastActivity": "2026-01-02T00:00:00Z"
        });
        let once = repair_state(&raw, &wf);
        let round_tripped = serde_json::to_value(&once).unwrap();
        let twice = repair_state(&round_tripped, &wf);
        assert_eq!(once, twice);
    }
}
