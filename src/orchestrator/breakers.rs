//! Circuit breakers: halt the run when progress has measurably stalled.

use super::state::WorkflowState;

/// Consecutive `NEEDS_RETRY` results tolerated before halting.
pub const DEFAULT_RETRY_BREAKER: u32 = 3;

/// Identical trailing errors tolerated before halting.
const REPEATED_ERROR_COUNT: usize = 3;

/// Evaluate the three breakers in order; the first tripped one wins.
/// Returns the halt reason, or `None` to keep running.
pub fn check_breakers(state: &WorkflowState, retry_threshold: u32) -> Option<String> {
    if state.iteration >= state.iteration_cap {
        return Some(format!(
            "iteration cap reached ({}/{})",
            state.iteration, state.iteration_cap
        ));
    }

    if state.consecutive_retries >= retry_threshold {
        return Some(format!(
            "{} consecutive retries without progress",
            state.consecutive_retries
        ));
    }

    if state.last_errors.len() >= REPEATED_ERROR_COUNT {
        let tail = &state.last_errors[state.last_errors.len() - REPEATED_ERROR_COUNT..];
        if tail.windows(2).all(|w| w[0] == w[1]) {
            return Some(format!("same error repeated {} times: {}", REPEATED_ERROR_COUNT, tail[0]));
        }
    }

    None
}
