//! Rate-limit and transient-error classification for finished agent runs.
//!
//! The agent surfaces provider throttling either on stderr with a non-zero
//! exit, or embedded in stream output while still exiting cleanly. Both are
//! scanned. When the provider names a wait ("retry after 60", "resets 1am")
//! that wins over exponential backoff, with a fixed buffer added so tokens
//! have actually replenished by the time we retry.

use chrono::{Local, Timelike};
use regex::Regex;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Extra seconds added when the wait came from provider text.
pub const RESET_BUFFER_SECS: u64 = 30;

static RATE_LIMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)rate.?limit|429|too many requests|overloaded|capacity|throttl|hit\s+(your|the)\s+limit|you've hit.*limit|limit.*resets?",
    )
    .expect("rate limit regex is a valid static string")
});

static RETRY_AFTER_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)retry.?after\D*(\d+)",
        r"(?i)try again in\s*(\d+)",
        r"(?i)wait\s*(\d+)\s*second",
        r"(?i)(\d+)\s*seconds?\s*(?:before|until)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("retry-after regex is a valid static string"))
    .collect()
});

static RESET_TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)resets?\s+(\d{1,2})(?::(\d{2}))?\s*(am|pm)")
        .expect("reset time regex is a valid static string")
});

static TRANSIENT_RES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?i)internal server error|\b500\b", "server error (HTTP 500)"),
        (r"(?i)bad gateway|\b502\b", "bad gateway (HTTP 502)"),
        (
            r"(?i)service unavailable|\b503\b",
            "service unavailable (HTTP 503)",
        ),
        (r"(?i)econnreset", "connection reset"),
        (r"(?i)etimedout", "connection timed out"),
        (r"(?i)econnrefused", "connection refused"),
    ]
    .iter()
    .map(|(p, reason)| {
        (
            Regex::new(p).expect("transient regex is a valid static string"),
            *reason,
        )
    })
    .collect()
});

/// Classification of a finished run with respect to provider throttling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitCheck {
    pub is_rate_limit: bool,
    /// Seconds the provider asked us to wait; 0 when none was named.
    pub retry_after_seconds: u64,
}

/// Scan a finished invocation for rate-limit evidence.
///
/// On a non-zero exit the combined stderr+stdout text is scanned; stdout
/// alone is scanned regardless of exit code, since the agent may embed a
/// rate-limit error event in stream output while exiting cleanly.
pub fn detect_rate_limit(exit_code: i32, stderr: &str, stdout: &str) -> RateLimitCheck {
    let combined = format!("{} {}", stderr, stdout);
    let matched =
        (exit_code != 0 && RATE_LIMIT_RE.is_match(&combined)) || RATE_LIMIT_RE.is_match(stdout);
    if !matched {
        return RateLimitCheck {
            is_rate_limit: false,
            retry_after_seconds: 0,
        };
    }
    RateLimitCheck {
        is_rate_limit: true,
        retry_after_seconds: extract_retry_after(&combined).unwrap_or(0),
    }
}

/// Classify a non-zero exit as a transient infrastructure failure.
/// Returns a short reason for the first matching pattern.
pub fn detect_transient(exit_code: i32, stderr: &str, stdout: &str) -> Option<String> {
    if exit_code == 0 {
        return None;
    }
    let combined = format!("{} {}", stderr, stdout);
    TRANSIENT_RES
        .iter()
        .find(|(re, _)| re.is_match(&combined))
        .map(|(_, reason)| reason.to_string())
}

/// Exponential backoff: `min(60 * 2^attempt, max_wait)` seconds.
pub fn compute_backoff(attempt: u32, max_wait_secs: u64) -> u64 {
    let base = 60u64.saturating_mul(2u64.saturating_pow(attempt));
    base.min(max_wait_secs)
}

fn extract_retry_after(text: &str) -> Option<u64> {
    for re in RETRY_AFTER_RES.iter() {
        if let Some(caps) = re.captures(text)
            && let Ok(secs) = caps[1].parse::<u64>()
        {
            return Some(secs);
        }
    }
    parse_absolute_reset_time(text)
}

/// Parse an absolute reset time ("resets 1am", "reset 10:30pm") into the
/// number of seconds until its next occurrence in the local timezone.
/// A time not yet reached today means today; a time already past means
/// tomorrow. The result is clamped to at least 1 second.
pub fn parse_absolute_reset_time(text: &str) -> Option<u64> {
    let caps = RESET_TIME_RE.captures(text)?;
    let hour12: u32 = caps[1].parse().ok()?;
    if !(1..=12).contains(&hour12) {
        return None;
    }
    let minute: u32 = caps
        .get(2)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);
    if minute > 59 {
        return None;
    }
    let pm = caps[3].eq_ignore_ascii_case("pm");

    // 12am -> 00:00, 12pm -> 12:00
    let hour = match (hour12, pm) {
        (12, false) => 0,
        (12, true) => 12,
        (h, false) => h,
        (h, true) => h + 12,
    };

    let now = Local::now();
    let now_secs = u64::from(now.num_seconds_from_midnight());
    let target_secs = u64::from(hour * 3600 + minute * 60);
    let wait = if target_secs > now_secs {
        target_secs - now_secs
    } else {
        86_400 - now_secs + target_secs
    };
    Some(wait.max(1))
}

/// Sleep for `total_secs`, invoking `on_tick` with the remaining seconds
/// once per second. Returns `false` if the shutdown flag was raised before
/// the countdown finished.
pub async fn wait_with_countdown<F>(total_secs: u64, shutdown: &AtomicBool, on_tick: F) -> bool
where
    F: Fn(u64),
{
    let mut remaining = total_secs;
    while remaining > 0 {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        on_tick(remaining);
        tokio::time::sleep(Duration::from_secs(1)).await;
        remaining -= 1;
    }
    !shutdown.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_plain_429() {
        let check = detect_rate_limit(1, "429", "");
        assert!(check.is_rate_limit);
        assert_eq!(check.retry_after_seconds, 0);
    }

    #[test]
    fn test_detects_rate_limit_exceeded() {
        let check = detect_rate_limit(1, "Rate limit exceeded", "");
        assert!(check.is_rate_limit);
    }

    #[test]
    fn test_detects_overloaded() {
        assert!(detect_rate_limit(1, "the API is overloaded", "").is_rate_limit);
    }

    #[test]
    fn test_detects_hit_limit_with_reset() {
        let check = detect_rate_limit(1, "you've hit your limit resets 1am", "");
        assert!(check.is_rate_limit);
        // An absolute reset time was named, so a concrete wait is extracted
        assert!(check.retry_after_seconds > 0);
        assert!(check.retry_after_seconds <= 86_400);
    }

    #[test]
    fn test_does_not_match_unrelated_errors() {
        let check = detect_rate_limit(1, "TypeError: undefined", "");
        assert!(!check.is_rate_limit);
    }

    #[test]
    fn test_stdout_match_triggers_on_clean_exit() {
        let check = detect_rate_limit(0, "", "stream event: rate limit reached");
        assert!(check.is_rate_limit);
    }

    #[test]
    fn test_stderr_match_ignored_on_clean_exit() {
        let check = detect_rate_limit(0, "rate limit reached", "normal output");
        assert!(!check.is_rate_limit);
    }

    #[test]
    fn test_retry_after_duration_extraction() {
        let check = detect_rate_limit(1, "429: retry after 90 seconds", "");
        assert_eq!(check.retry_after_seconds, 90);

        let check = detect_rate_limit(1, "throttled, try again in 45", "");
        assert_eq!(check.retry_after_seconds, 45);

        let check = detect_rate_limit(1, "overloaded; wait 30 seconds", "");
        assert_eq!(check.retry_after_seconds, 30);

        let check = detect_rate_limit(1, "capacity: 120 seconds until reset", "");
        assert_eq!(check.retry_after_seconds, 120);
    }

    #[test]
    fn test_compute_backoff_boundaries() {
        assert_eq!(compute_backoff(0, 600), 60);
        assert_eq!(compute_backoff(1, 600), 120);
        assert_eq!(compute_backoff(10, 300), 300);
    }

    #[test]
    fn test_backoff_does_not_overflow() {
        assert_eq!(compute_backoff(u32::MAX, 900), 900);
    }

    #[test]
    fn test_parse_absolute_reset_midnight() {
        let secs = parse_absolute_reset_time("resets 12am").unwrap();
        assert!(secs > 0);
        assert!(secs <= 86_400);
    }

    #[test]
    fn test_parse_absolute_reset_with_minutes() {
        let secs = parse_absolute_reset_time("limit resets 10:30pm").unwrap();
        assert!(secs >= 1);
        assert!(secs <= 86_400);
    }

    #[test]
    fn test_parse_absolute_reset_rejects_bad_hour() {
        assert_eq!(parse_absolute_reset_time("resets 0am"), None);
        assert_eq!(parse_absolute_reset_time("resets 13pm"), None);
    }

    #[test]
    fn test_parse_absolute_reset_requires_meridiem() {
        assert_eq!(parse_absolute_reset_time("resets 5"), None);
    }

    #[test]
    fn test_transient_500() {
        let reason = detect_transient(1, "HTTP 500 from upstream", "").unwrap();
        assert!(reason.contains("500"));
    }

    #[test]
    fn test_transient_phrases() {
        assert!(detect_transient(1, "internal server error", "").is_some());
        assert!(detect_transient(1, "Bad Gateway", "").is_some());
        assert!(detect_transient(1, "service unavailable", "").is_some());
    }

    #[test]
    fn test_transient_connection_errors() {
        assert_eq!(
            detect_transient(1, "read ECONNRESET", "").unwrap(),
            "connection reset"
        );
        assert_eq!(
            detect_transient(1, "", "connect ETIMEDOUT 1.2.3.4").unwrap(),
            "connection timed out"
        );
        assert_eq!(
            detect_transient(1, "connect ECONNREFUSED", "").unwrap(),
            "connection refused"
        );
    }

    #[test]
    fn test_transient_requires_nonzero_exit() {
        assert!(detect_transient(0, "internal server error", "").is_none());
    }

    #[test]
    fn test_transient_first_match_wins() {
        let reason = detect_transient(1, "502 bad gateway after ECONNRESET", "").unwrap();
        assert_eq!(reason, "bad gateway (HTTP 502)");
    }

    #[tokio::test]
    async fn test_countdown_cancellation() {
        let shutdown = AtomicBool::new(true);
        let finished = wait_with_countdown(5, &shutdown, |_| {}).await;
        assert!(!finished);
    }

    #[tokio::test]
    async fn test_countdown_ticks_down() {
        use std::sync::Mutex;
        let shutdown = AtomicBool::new(false);
        let seen = Mutex::new(Vec::new());
        let finished = wait_with_countdown(2, &shutdown, |remaining| {
            seen.lock().unwrap().push(remaining);
        })
        .await;
        assert!(finished);
        assert_eq!(*seen.lock().unwrap(), vec![2, 1]);
    }
}
