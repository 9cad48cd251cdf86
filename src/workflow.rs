//! Workflow definition loading for the cloudforge orchestrator.
//!
//! The workflow is data, not code: a line-oriented text file describes the
//! phase graph and its labeled transitions. Each significant line matches
//! `NAME -> NAME [label]`, with a leading `*` marking the source phase as
//! part of the per-sub-task loop and the reserved target `END` terminating
//! the workflow. Everything else (comments, blank lines) is ignored.

use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, LazyLock, Mutex};

use crate::errors::WorkflowError;

/// Built-in workflow used when the working directory ships no override.
pub const DEFAULT_WORKFLOW: &str = include_str!("../prompts/workflow.dot");

/// File name looked up in the prompts directory.
pub const WORKFLOW_FILE_NAME: &str = "workflow.dot";

static LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\*?)(\w+)\s*->\s*(\w+)\s*\[(\w+)\]$")
        .expect("workflow line regex is a valid static string")
});

static CACHE: Mutex<Option<Arc<WorkflowDefinition>>> = Mutex::new(None);

/// Transition condition emitted by a phase iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Done,
    Retry,
    RetryExhausted,
    DoneNextSubtask,
}

impl Condition {
    fn from_label(label: &str) -> Option<Self> {
        match label {
            "done" => Some(Condition::Done),
            "retry" => Some(Condition::Retry),
            "retry_exhausted" => Some(Condition::RetryExhausted),
            "done_next_subtask" => Some(Condition::DoneNextSubtask),
            _ => None,
        }
    }
}

/// Where a transition leads: another phase, or the end of the workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Phase(String),
    End,
}

/// Labeled transitions out of one phase. Unset labels have no transition.
#[derive(Debug, Clone, Default)]
pub struct Transitions {
    pub done: Option<Target>,
    pub retry: Option<Target>,
    pub retry_exhausted: Option<Target>,
    pub done_next_subtask: Option<Target>,
}

impl Transitions {
    pub fn get(&self, condition: Condition) -> Option<&Target> {
        match condition {
            Condition::Done => self.done.as_ref(),
            Condition::Retry => self.retry.as_ref(),
            Condition::RetryExhausted => self.retry_exhausted.as_ref(),
            Condition::DoneNextSubtask => self.done_next_subtask.as_ref(),
        }
    }

    fn set(&mut self, condition: Condition, target: Target) {
        let slot = match condition {
            Condition::Done => &mut self.done,
            Condition::Retry => &mut self.retry,
            Condition::RetryExhausted => &mut self.retry_exhausted,
            Condition::DoneNextSubtask => &mut self.done_next_subtask,
        };
        // Last write wins when a (source, label) pair repeats.
        *slot = Some(target);
    }
}

/// One phase of the workflow graph.
#[derive(Debug, Clone)]
pub struct PhaseConfig {
    pub name: String,
    pub task_loop: bool,
    pub transitions: Transitions,
}

/// Immutable parsed workflow: phases in first-appearance order plus their
/// transition tables. Insertion order is the canonical progression used for
/// progress display and recovery inference.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    order: Vec<String>,
    phases: HashMap<String, PhaseConfig>,
}

impl WorkflowDefinition {
    /// Parse a workflow description. Fails if no phases are defined.
    pub fn parse(text: &str) -> Result<Self, WorkflowError> {
        let mut order: Vec<String> = Vec::new();
        let mut phases: HashMap<String, PhaseConfig> = HashMap::new();

        let ensure_phase = |order: &mut Vec<String>,
                            phases: &mut HashMap<String, PhaseConfig>,
                            name: &str| {
            if !phases.contains_key(name) {
                order.push(name.to_string());
                phases.insert(
                    name.to_string(),
                    PhaseConfig {
                        name: name.to_string(),
                        task_loop: false,
                        transitions: Transitions::default(),
                    },
                );
            }
        };

        for raw_line in text.lines() {
            let line = match raw_line.find('#') {
                Some(pos) => &raw_line[..pos],
                None => raw_line,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some(caps) = LINE_RE.captures(line) else {
                continue;
            };
            let Some(condition) = Condition::from_label(&caps[4]) else {
                continue;
            };
            let task_loop = !caps[1].is_empty();
            let source = &caps[2];
            let target_name = &caps[3];

            ensure_phase(&mut order, &mut phases, source);
            let target = if target_name == "END" {
                Target::End
            } else {
                ensure_phase(&mut order, &mut phases, target_name);
                Target::Phase(target_name.to_string())
            };

            let config = phases
                .get_mut(source)
                .expect("source phase was just inserted");
            if task_loop {
                config.task_loop = true;
            }
            config.transitions.set(condition, target);
        }

        if order.is_empty() {
            return Err(WorkflowError::Empty);
        }
        Ok(Self { order, phases })
    }

    /// The start phase: first phase in appearance order.
    pub fn first_phase(&self) -> &str {
        &self.order[0]
    }

    /// All phase names in canonical order.
    pub fn ordered_phase_names(&self) -> &[String] {
        &self.order
    }

    pub fn is_task_loop_phase(&self, name: &str) -> bool {
        self.phases.get(name).map(|p| p.task_loop).unwrap_or(false)
    }

    pub fn phase_config(&self, name: &str) -> Option<&PhaseConfig> {
        self.phases.get(name)
    }

    /// Index of a phase in canonical order.
    pub fn phase_index(&self, name: &str) -> Option<usize> {
        self.order.iter().position(|p| p == name)
    }

    /// First phase marked `taskLoop` — the entry of the sub-task loop.
    pub fn task_loop_entry(&self) -> Option<&str> {
        self.order
            .iter()
            .find(|name| self.is_task_loop_phase(name))
            .map(|s| s.as_str())
    }
}

/// Load the workflow, preferring `<prompts_dir>/workflow.dot` over the
/// compiled-in default. The parsed definition is cached for the process
/// lifetime; use [`clear_cache`] to force a re-read (tests).
pub fn load_workflow(prompts_dir: &Path) -> Result<Arc<WorkflowDefinition>, WorkflowError> {
    let mut cache = CACHE.lock().expect("workflow cache lock poisoned");
    if let Some(def) = cache.as_ref() {
        return Ok(def.clone());
    }

    let path = prompts_dir.join(WORKFLOW_FILE_NAME);
    let text = if path.is_file() {
        std::fs::read_to_string(&path).map_err(|source| WorkflowError::ReadFailed {
            path: path.clone(),
            source,
        })?
    } else {
        DEFAULT_WORKFLOW.to_string()
    };

    let def = Arc::new(WorkflowDefinition::parse(&text)?);
    *cache = Some(def.clone());
    Ok(def)
}

pub fn clear_cache() {
    let mut cache = CACHE.lock().expect("workflow cache lock poisoned");
    *cache = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# comment line
A -> B [done]
A -> A [retry]
B -> C [done]    # trailing comment
*C -> D [done]
*C -> C [done_next_subtask]
*C -> B [retry_exhausted]
D -> END [done]
"#;

    #[test]
    fn test_parse_discovers_phases_in_order() {
        let def = WorkflowDefinition::parse(SAMPLE).unwrap();
        assert_eq!(def.ordered_phase_names(), &["A", "B", "C", "D"]);
        assert_eq!(def.first_phase(), "A");
    }

    #[test]
    fn test_parse_task_loop_marker() {
        let def = WorkflowDefinition::parse(SAMPLE).unwrap();
        assert!(def.is_task_loop_phase("C"));
        assert!(!def.is_task_loop_phase("B"));
        assert_eq!(def.task_loop_entry(), Some("C"));
    }

    #[test]
    fn test_parse_end_target_is_terminal() {
        let def = WorkflowDefinition::parse(SAMPLE).unwrap();
        let d = def.phase_config("D").unwrap();
        assert_eq!(d.transitions.get(Condition::Done), Some(&Target::End));
    }

    #[test]
    fn test_parse_transition_targets() {
        let def = WorkflowDefinition::parse(SAMPLE).unwrap();
        let a = def.phase_config("A").unwrap();
        assert_eq!(
            a.transitions.get(Condition::Done),
            Some(&Target::Phase("B".to_string()))
        );
        assert_eq!(
            a.transitions.get(Condition::Retry),
            Some(&Target::Phase("A".to_string()))
        );
        assert_eq!(a.transitions.get(Condition::RetryExhausted), None);
    }

    #[test]
    fn test_parse_last_write_wins() {
        let text = "A -> B [done]\nB -> END [done]\nA -> C [done]\nC -> END [done]\n";
        let def = WorkflowDefinition::parse(text).unwrap();
        let a = def.phase_config("A").unwrap();
        assert_eq!(
            a.transitions.get(Condition::Done),
            Some(&Target::Phase("C".to_string()))
        );
        // First-appearance order is unaffected by the overwrite
        assert_eq!(def.ordered_phase_names(), &["A", "B", "C"]);
    }

    #[test]
    fn test_parse_star_anywhere_suffices() {
        let text = "C -> D [done]\n*C -> C [retry]\nD -> END [done]\n";
        let def = WorkflowDefinition::parse(text).unwrap();
        assert!(def.is_task_loop_phase("C"));
    }

    #[test]
    fn test_parse_ignores_malformed_lines() {
        let text = "garbage here\nA -> B [done]\nA => B [done]\nA -> B [bogus_label]\nB -> END [done]\n";
        let def = WorkflowDefinition::parse(text).unwrap();
        assert_eq!(def.ordered_phase_names(), &["A", "B"]);
    }

    #[test]
    fn test_parse_empty_file_is_error() {
        let err = WorkflowDefinition::parse("# only comments\n\n").unwrap_err();
        assert!(matches!(err, WorkflowError::Empty));
    }

    #[test]
    fn test_phase_index() {
        let def = WorkflowDefinition::parse(SAMPLE).unwrap();
        assert_eq!(def.phase_index("A"), Some(0));
        assert_eq!(def.phase_index("D"), Some(3));
        assert_eq!(def.phase_index("NOPE"), None);
    }

    #[test]
    fn test_default_workflow_parses() {
        let def = WorkflowDefinition::parse(DEFAULT_WORKFLOW).unwrap();
        assert_eq!(def.first_phase(), "DISCOVER");
        assert!(def.task_loop_entry().is_some());
        // Every non-END target must be a defined phase
        for name in def.ordered_phase_names() {
            let config = def.phase_config(name).unwrap();
            for condition in [
                Condition::Done,
                Condition::Retry,
                Condition::RetryExhausted,
                Condition::DoneNextSubtask,
            ] {
                if let Some(Target::Phase(target)) = config.transitions.get(condition) {
                    assert!(
                        def.phase_index(target).is_some(),
                        "undefined target {target} from {name}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_load_workflow_cache_and_clear() {
        clear_cache();
        let dir = tempfile::tempdir().unwrap();
        // No file on disk: falls back to the built-in default
        let def = load_workflow(dir.path()).unwrap();
        assert_eq!(def.first_phase(), "DISCOVER");

        // A file written after the first load is ignored until the cache clears
        std::fs::write(
            dir.path().join(WORKFLOW_FILE_NAME),
            "X -> END [done]\n",
        )
        .unwrap();
        let cached = load_workflow(dir.path()).unwrap();
        assert_eq!(cached.first_phase(), "DISCOVER");

        clear_cache();
        let fresh = load_workflow(dir.path()).unwrap();
        assert_eq!(fresh.first_phase(), "X");
        clear_cache();
    }
}
