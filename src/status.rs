//! Status block parsing from the agent's output.
//!
//! A well-behaved agent ends its output with a block introduced by the
//! literal sentinel line `CLOUDFORGE_STATUS:` followed by indented
//! `key: value` lines, terminated by a blank line or end of input:
//!
//! ```text
//! CLOUDFORGE_STATUS:
//!   phase: IMPLEMENT
//!   result: DONE
//!   tasks_remaining: 3
//!   summary: wired up the config loader
//! ```

/// Sentinel line introducing the status block.
pub const STATUS_SENTINEL: &str = "CLOUDFORGE_STATUS:";

/// Outcome reported by one phase iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseResult {
    Done,
    NeedsRetry,
    Blocked,
    /// Parse produced a token outside the closed set.
    Unknown,
}

impl PhaseResult {
    pub fn from_token(token: &str) -> Self {
        match token {
            "DONE" => PhaseResult::Done,
            "NEEDS_RETRY" => PhaseResult::NeedsRetry,
            "BLOCKED" => PhaseResult::Blocked,
            _ => PhaseResult::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseResult::Done => "DONE",
            PhaseResult::NeedsRetry => "NEEDS_RETRY",
            PhaseResult::Blocked => "BLOCKED",
            PhaseResult::Unknown => "UNKNOWN",
        }
    }
}

/// Parsed status block. One per iteration; synthesized by the scheduler
/// when the agent omits the sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// Phase the agent believes it worked on. Advisory only.
    pub phase: String,
    pub result: PhaseResult,
    pub tasks_remaining: Option<u32>,
    pub summary: String,
}

/// Extract the trailing status block from free-form agent output.
///
/// Returns `None` when no sentinel line is present; the caller synthesizes
/// a status in that case. Keys are case-insensitive and underscores are
/// not significant (`tasks_remaining` and `tasksremaining` both work).
/// A missing `result` defaults to `DONE`; a non-numeric `tasks_remaining`
/// becomes `None`.
pub fn parse_status(output: &str) -> Option<Status> {
    let lines: Vec<&str> = output.lines().collect();
    let sentinel_idx = lines.iter().rposition(|l| l.trim() == STATUS_SENTINEL)?;

    let mut status = Status {
        phase: String::new(),
        result: PhaseResult::Done,
        tasks_remaining: None,
        summary: String::new(),
    };

    for line in &lines[sentinel_idx + 1..] {
        if line.trim().is_empty() {
            break;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase().replace('_', "");
        let value = value.trim();
        match key.as_str() {
            "phase" => status.phase = value.to_string(),
            "result" => {
                status.result = PhaseResult::from_token(&value.to_ascii_uppercase());
            }
            "tasksremaining" => status.tasks_remaining = value.parse().ok(),
            "summary" => status.summary = value.to_string(),
            _ => {}
        }
    }

    Some(status)
}

/// Render a status back into its canonical block form.
pub fn render_status(status: &Status) -> String {
    let mut out = String::new();
    out.push_str(STATUS_SENTINEL);
    out.push('\n');
    out.push_str(&format!("  phase: {}\n", status.phase));
    out.push_str(&format!("  result: {}\n", status.result.as_str()));
    if let Some(n) = status.tasks_remaining {
        out.push_str(&format!("  tasks_remaining: {}\n", n));
    }
    out.push_str(&format!("  summary: {}\n", status.summary));
    out
}
